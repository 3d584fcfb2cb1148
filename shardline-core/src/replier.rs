//! Replier: read service on top of a listener
//!
//! Once a listener is streaming, a replier advertises it to the broadcaster
//! as readable. Masters route outdated reads to readable listeners; a replier
//! refuses them while its listener trails the broadcaster by more than the
//! configured freshness bound.

use crate::config::ReplicationConfig;
use crate::listener::Listener;
use crate::protocol::{Protocol, RegistrarMessage, ReplierCard, ReplierRequest};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Read service of one listener
pub struct Replier<P: Protocol> {
    listener: Arc<Listener<P>>,
    card: ReplierCard<P>,
    freshness_bound: u64,
    task: JoinHandle<()>,
}

impl<P: Protocol> Replier<P> {
    /// Start serving reads from `listener` and announce it to the broadcaster
    pub fn new(listener: Arc<Listener<P>>, config: &ReplicationConfig) -> Result<Self> {
        let mut requests = listener.mailbox().create::<ReplierRequest<P>>();
        let card = ReplierCard {
            peer: listener.peer_id(),
            reads: requests.address(),
        };
        let freshness_bound = config.freshness_bound;

        let serving = Arc::clone(&listener);
        let task = tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let listener = Arc::clone(&serving);
                tokio::spawn(async move {
                    let result = serve(&listener, &request.read, freshness_bound).await;
                    if let Err(e) = listener.mailbox().send(&request.reply, &result) {
                        tracing::debug!("Read reply not delivered: {}", e);
                    }
                });
            }
        });

        let upgrade = RegistrarMessage::UpgradeReadable {
            peer: listener.peer_id(),
            replier: card.clone(),
        };
        if let Err(e) = listener.mailbox().send(&listener.broadcaster().registrar, &upgrade) {
            task.abort();
            return Err(e);
        }
        tracing::info!(peer = %listener.peer_id(), "Replier started");

        Ok(Self {
            listener,
            card,
            freshness_bound,
            task,
        })
    }

    /// Card masters use to send reads
    pub fn get_business_card(&self) -> ReplierCard<P> {
        self.card.clone()
    }

    /// Check whether the listener is fresh enough to serve reads
    pub fn is_caught_up(&self) -> bool {
        self.listener.is_caught_up(self.freshness_bound)
    }

    /// Serve a read directly
    pub async fn read(&self, read: &P::Read) -> Result<P::ReadResponse> {
        serve(&self.listener, read, self.freshness_bound).await
    }
}

impl<P: Protocol> Drop for Replier<P> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<P: Protocol>(
    listener: &Listener<P>,
    read: &P::Read,
    freshness_bound: u64,
) -> Result<P::ReadResponse> {
    if !listener.is_caught_up(freshness_bound) {
        return Err(Error::cannot_perform_query(format!(
            "replier {} trails the broadcaster by {} versions",
            listener.peer_id(),
            listener.lag()
        )));
    }
    listener.read_local(read).await
}
