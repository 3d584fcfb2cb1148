//! Listener: a replica following a broadcaster's branch
//!
//! The listener:
//! - Verifies its store's history is a prefix of the branch before joining
//! - Registers with the broadcaster and installs a backfill if one is sent
//! - Applies streamed writes strictly in timestamp order
//! - Acknowledges every applied write back to the broadcaster
//! - Tracks how far it trails the broadcaster
//!
//! Duplicate deliveries are ignored. A gap in the stream, or a write the store
//! fails to apply, stops the listener; the broadcaster is unaffected.

use crate::branch::BranchHistoryStore;
use crate::config::ReplicationConfig;
use crate::directory::DirectoryView;
use crate::mailbox::{Mailbox, MailboxManager, PeerId};
use crate::protocol::{
    BroadcasterCard, ListenerCard, PROTOCOL_VERSION, Protocol, RegistrarMessage,
    RegistrationReply, StreamWrite, WriteAck,
};
use crate::store::ReplicaStore;
use crate::version::Version;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    /// Registering with the broadcaster
    Joining,
    /// Applying the write stream
    Streaming,
    /// No longer applying writes; carries the error that stopped it, if any
    Stopped(Option<Error>),
}

/// Listener statistics
#[derive(Debug, Clone, Default)]
pub struct ListenerStats {
    /// Writes received on the stream
    pub writes_received: u64,
    /// Writes applied to the store
    pub writes_applied: u64,
    /// Deliveries ignored because they were already applied
    pub duplicates_ignored: u64,
    /// Acks that could not be delivered
    pub acks_dropped: u64,
    /// Applied timestamp
    pub applied_timestamp: u64,
    /// Versions the listener trails the broadcaster by
    pub lag: u64,
    /// Whether the listener joined with a snapshot
    pub backfilled: bool,
}

struct ListenerInner<P: Protocol> {
    mailbox: MailboxManager,
    broadcaster: BroadcasterCard<P>,
    store: Arc<dyn ReplicaStore<P>>,
    card: ListenerCard<P>,
    applied: watch::Sender<Version>,
    state: watch::Sender<ListenerState>,
    /// Highest timestamp the broadcaster is known to have assigned
    broadcaster_timestamp: AtomicU64,
    stats: Mutex<ListenerStats>,
}

/// Replica following one branch
pub struct Listener<P: Protocol> {
    inner: Arc<ListenerInner<P>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Protocol> Listener<P> {
    /// Join the branch of the broadcaster published in `broadcaster`.
    ///
    /// Fails with [`Error::CannotPerformQuery`] when no broadcaster is
    /// available and with [`Error::BranchLineageRejected`] when the store's
    /// history is incompatible with the branch.
    pub async fn join(
        mailbox: MailboxManager,
        broadcaster: DirectoryView<BroadcasterCard<P>>,
        history: Arc<dyn BranchHistoryStore>,
        store: Arc<dyn ReplicaStore<P>>,
        config: &ReplicationConfig,
        interruptor: &CancellationToken,
    ) -> Result<Self> {
        let card = match tokio::time::timeout(
            config.registration_timeout,
            broadcaster.wait_known(interruptor),
        )
        .await
        {
            Ok(lookup) => lookup?.ok_or_else(|| Error::cannot_perform_query("broadcaster is gone"))?,
            Err(_) => {
                return Err(Error::cannot_perform_query(format!(
                    "no broadcaster published within {:?}",
                    config.registration_timeout
                )));
            }
        };

        let version = store.current_version();
        let region = store.region().clone();
        if region != card.region {
            return Err(Error::lineage_rejected(format!(
                "store region {} does not match branch region {}",
                region, card.region
            )));
        }
        if !history.version_is_ancestor(version, card.branch) {
            return Err(Error::lineage_rejected(format!(
                "store at {} is not a prefix of branch {}",
                version, card.branch
            )));
        }

        let stream = mailbox.create::<StreamWrite<P>>();
        let listener_card = ListenerCard {
            peer: mailbox.peer_id(),
            stream: stream.address(),
        };
        let (state_tx, _) = watch::channel(ListenerState::Joining);

        let mut reply_box = mailbox.create::<RegistrationReply>();
        mailbox.send(
            &card.registrar,
            &RegistrarMessage::Register {
                listener: listener_card.clone(),
                version,
                region,
                protocol_version: PROTOCOL_VERSION,
                reply: reply_box.address(),
            },
        )?;
        tracing::debug!(branch = %card.branch, version = %version, "Registering with broadcaster");

        let reply = tokio::select! {
            reply = reply_box.recv() => reply.ok_or_else(|| Error::transport("registration reply mailbox closed"))?,
            _ = tokio::time::sleep(config.registration_timeout) => {
                deregister(&mailbox, &card);
                return Err(Error::cannot_perform_query("broadcaster did not answer registration"));
            }
            _ = interruptor.cancelled() => {
                deregister(&mailbox, &card);
                return Err(Error::Interrupted);
            }
        };

        let (current, backfill) = match reply {
            RegistrationReply::Accepted { current, backfill } => (current, backfill),
            RegistrationReply::Rejected { error } => {
                tracing::warn!(branch = %card.branch, "Broadcaster rejected listener: {}", error);
                return Err(error);
            }
        };

        let mut applied = version;
        let backfilled = backfill.is_some();
        if let Some(backfill) = backfill {
            let installed = match backfill.verify() {
                Ok(()) => store.import_snapshot(&backfill.data, backfill.version).await,
                Err(e) => Err(e),
            };
            if let Err(e) = installed {
                deregister(&mailbox, &card);
                return Err(e);
            }
            applied = backfill.version;
            tracing::info!(version = %applied, bytes = backfill.data.len(), "Installed backfill");
        }

        let (applied_tx, _) = watch::channel(applied);
        state_tx.send_replace(ListenerState::Streaming);

        let inner = Arc::new(ListenerInner {
            mailbox,
            broadcaster: card,
            store,
            card: listener_card,
            applied: applied_tx,
            state: state_tx,
            broadcaster_timestamp: AtomicU64::new(current.timestamp),
            stats: Mutex::new(ListenerStats {
                applied_timestamp: applied.timestamp,
                backfilled,
                ..Default::default()
            }),
        });

        let task = tokio::spawn(run_stream(Arc::clone(&inner), stream));
        tracing::info!(
            peer = %inner.card.peer,
            branch = %inner.broadcaster.branch,
            applied = %applied,
            current = %current,
            "Listener joined branch"
        );

        Ok(Self {
            inner,
            task: Mutex::new(Some(task)),
        })
    }

    /// Card of the listener's write stream
    pub fn card(&self) -> ListenerCard<P> {
        self.inner.card.clone()
    }

    /// Peer hosting the listener
    pub fn peer_id(&self) -> PeerId {
        self.inner.card.peer
    }

    /// Broadcaster this listener follows
    pub fn broadcaster(&self) -> &BroadcasterCard<P> {
        &self.inner.broadcaster
    }

    /// Version of the last applied write
    pub fn applied_version(&self) -> Version {
        *self.inner.applied.borrow()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ListenerState {
        self.inner.state.borrow().clone()
    }

    /// Highest timestamp seen from the broadcaster
    pub fn broadcaster_timestamp(&self) -> u64 {
        self.inner.broadcaster_timestamp.load(Ordering::SeqCst)
    }

    /// Versions the listener trails the broadcaster by
    pub fn lag(&self) -> u64 {
        self.broadcaster_timestamp()
            .saturating_sub(self.applied_version().timestamp)
    }

    /// Streaming and no more than `freshness_bound` versions behind
    pub fn is_caught_up(&self, freshness_bound: u64) -> bool {
        self.state() == ListenerState::Streaming && self.lag() <= freshness_bound
    }

    /// Get statistics
    pub fn stats(&self) -> ListenerStats {
        let mut stats = self.inner.stats.lock().clone();
        stats.applied_timestamp = self.applied_version().timestamp;
        stats.lag = self.lag();
        stats
    }

    /// Wait until the listener has applied `timestamp`
    pub async fn wait_for_version(
        &self,
        timestamp: u64,
        interruptor: &CancellationToken,
    ) -> Result<Version> {
        let mut applied = self.inner.applied.subscribe();
        let mut state = self.inner.state.subscribe();

        tokio::select! {
            result = applied.wait_for(|v| v.timestamp >= timestamp) => {
                let version = result.map(|v| *v).map_err(|_| Error::internal("listener dropped"))?;
                Ok(version)
            }
            result = state.wait_for(|s| matches!(s, ListenerState::Stopped(_))) => {
                let reason = match result {
                    Ok(s) => match &*s {
                        ListenerState::Stopped(Some(e)) => e.to_string(),
                        _ => "shut down".to_string(),
                    },
                    Err(_) => "dropped".to_string(),
                };
                Err(Error::cannot_perform_query(format!(
                    "listener stopped before reaching timestamp {}: {}",
                    timestamp, reason
                )))
            }
            _ = interruptor.cancelled() => Err(Error::Interrupted),
        }
    }

    /// Stop applying writes and leave the branch
    pub fn shutdown(&self) {
        let Some(task) = self.task.lock().take() else {
            return;
        };
        task.abort();
        self.inner.state.send_if_modified(|state| {
            if matches!(state, ListenerState::Stopped(_)) {
                return false;
            }
            *state = ListenerState::Stopped(None);
            true
        });
        deregister(&self.inner.mailbox, &self.inner.broadcaster);
        tracing::info!(peer = %self.inner.card.peer, "Listener shut down");
    }

    pub(crate) fn mailbox(&self) -> &MailboxManager {
        &self.inner.mailbox
    }

    pub(crate) async fn read_local(&self, read: &P::Read) -> Result<P::ReadResponse> {
        self.inner.store.read(read).await
    }
}

impl<P: Protocol> fmt::Debug for Listener<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("peer", &self.inner.card.peer)
            .field("branch", &self.inner.broadcaster.branch)
            .field("applied", &self.applied_version())
            .field("state", &self.state())
            .finish()
    }
}

impl<P: Protocol> Drop for Listener<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn deregister<P: Protocol>(mailbox: &MailboxManager, broadcaster: &BroadcasterCard<P>) {
    let message = RegistrarMessage::Deregister {
        peer: mailbox.peer_id(),
    };
    if let Err(e) = mailbox.send(&broadcaster.registrar, &message) {
        tracing::debug!("Deregistration not delivered: {}", e);
    }
}

impl<P: Protocol> ListenerInner<P> {
    async fn handle_write(&self, message: StreamWrite<P>) -> Result<()> {
        let timestamp = message.version.timestamp;
        self.broadcaster_timestamp.fetch_max(timestamp, Ordering::SeqCst);
        self.stats.lock().writes_received += 1;

        let applied = *self.applied.borrow();
        if timestamp <= applied.timestamp {
            self.stats.lock().duplicates_ignored += 1;
            tracing::debug!(version = %message.version, applied = %applied, "Ignoring duplicate write");
            return Ok(());
        }
        if timestamp != applied.timestamp + 1 {
            return Err(Error::VersionGapDetected {
                expected: applied.timestamp + 1,
                actual: timestamp,
            });
        }

        let response = self.store.apply(&message.write, message.version).await?;
        self.applied.send_replace(message.version);
        self.stats.lock().writes_applied += 1;

        if let Some(ack_to) = message.ack_to {
            let ack = WriteAck {
                peer: self.card.peer,
                version: message.version,
                response,
            };
            if let Err(e) = self.mailbox.send(&ack_to, &ack) {
                self.stats.lock().acks_dropped += 1;
                tracing::debug!(version = %message.version, "Ack not delivered: {}", e);
            }
        }
        Ok(())
    }
}

async fn run_stream<P: Protocol>(inner: Arc<ListenerInner<P>>, mut stream: Mailbox<StreamWrite<P>>) {
    while let Some(message) = stream.recv().await {
        if let Err(e) = inner.handle_write(message).await {
            tracing::error!(
                peer = %inner.card.peer,
                branch = %inner.broadcaster.branch,
                "Listener stopped: {}",
                e
            );
            inner.state.send_replace(ListenerState::Stopped(Some(e)));
            deregister(&inner.mailbox, &inner.broadcaster);
            return;
        }
    }
}
