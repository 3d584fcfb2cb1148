//! Master: routing point between client proxies and a broadcaster
//!
//! The master:
//! - Keeps one FIFO sink per client session
//! - Admits each request once every earlier operation of its session exited
//! - Sends writes through the broadcaster under its ack policy
//! - Serves linearizable reads from the broadcaster and outdated reads from
//!   any caught-up replier
//! - Reports every failure to the client as [`Error::CannotPerformQuery`]

use crate::broadcaster::Broadcaster;
use crate::config::{ReadMode, ReplicationConfig};
use crate::fifo::{FifoSink, ReadTicket, SessionId, WriteTicket};
use crate::mailbox::{Mailbox, MailboxAddress, MailboxManager};
use crate::order::{OrderChecker, OrderToken};
use crate::policy::AckPolicy;
use crate::protocol::{MasterCard, MasterRequest, Protocol, ReplierCard, ReplierRequest};
use crate::region::Region;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Master statistics
#[derive(Debug, Clone, Default)]
pub struct MasterStats {
    /// Reads answered successfully
    pub reads: u64,
    /// Writes answered successfully
    pub writes: u64,
    /// Reads that failed
    pub failed_reads: u64,
    /// Writes that failed
    pub failed_writes: u64,
    /// Tickets consumed without an operation
    pub abandoned_tickets: u64,
    /// Admissions that contradicted their order token
    pub order_violations: u64,
    /// Sessions with a live FIFO sink
    pub sessions: usize,
    /// Client order sources the order checker tracks
    pub order_buckets: usize,
}

/// Per-session routing state
struct ClientSession {
    sink: FifoSink,
    /// Order sources seen on this session, forgotten with it
    order_buckets: HashSet<Uuid>,
}

#[derive(Debug, Clone, Copy)]
enum OpKind {
    Read,
    Write,
}

struct MasterInner<P: Protocol> {
    mailbox: MailboxManager,
    policy: AckPolicy,
    region: Region,
    config: ReplicationConfig,
    broadcaster: RwLock<Option<Arc<Broadcaster<P>>>>,
    sessions: Mutex<HashMap<SessionId, ClientSession>>,
    order_checker: OrderChecker,
    stats: Mutex<MasterStats>,
    card: MasterCard<P>,
    shutdown: CancellationToken,
}

/// Routing point for one region
pub struct Master<P: Protocol> {
    inner: Arc<MasterInner<P>>,
    task: JoinHandle<()>,
}

impl<P: Protocol> Master<P> {
    /// Start a master routing `region` through `broadcaster`
    pub fn new(
        mailbox: MailboxManager,
        policy: AckPolicy,
        region: Region,
        broadcaster: Arc<Broadcaster<P>>,
        config: ReplicationConfig,
    ) -> Result<Self> {
        config.validate()?;
        check_region(&region, &broadcaster)?;

        let requests = mailbox.create::<MasterRequest<P>>();
        let card = MasterCard {
            region: region.clone(),
            requests: requests.address(),
        };
        let inner = Arc::new(MasterInner {
            mailbox,
            policy,
            region,
            config,
            broadcaster: RwLock::new(Some(broadcaster)),
            sessions: Mutex::new(HashMap::new()),
            order_checker: OrderChecker::new(),
            stats: Mutex::new(MasterStats::default()),
            card,
            shutdown: CancellationToken::new(),
        });
        let task = tokio::spawn(serve(Arc::clone(&inner), requests));

        tracing::info!(region = %inner.region, policy = ?inner.policy, "Master started");
        Ok(Self { inner, task })
    }

    /// Card client proxies send requests to
    pub fn get_business_card(&self) -> MasterCard<P> {
        self.inner.card.clone()
    }

    /// Region this master routes for
    pub fn region(&self) -> &Region {
        &self.inner.region
    }

    /// Route through a different broadcaster, e.g. after failover
    pub fn set_broadcaster(&self, broadcaster: Arc<Broadcaster<P>>) -> Result<()> {
        check_region(&self.inner.region, &broadcaster)?;
        tracing::info!(branch = %broadcaster.branch_id(), "Master switched broadcaster");
        *self.inner.broadcaster.write() = Some(broadcaster);
        Ok(())
    }

    /// Stop routing; requests fail until a broadcaster is set again
    pub fn clear_broadcaster(&self) {
        if self.inner.broadcaster.write().take().is_some() {
            tracing::warn!(region = %self.inner.region, "Master lost its broadcaster");
        }
    }

    /// Get statistics
    pub fn stats(&self) -> MasterStats {
        let mut stats = self.inner.stats.lock().clone();
        stats.sessions = self.inner.sessions.lock().len();
        stats.order_buckets = self.inner.order_checker.len();
        stats
    }

    /// Run a read admitted by `ticket`
    pub async fn read(
        &self,
        read: P::Read,
        mode: ReadMode,
        order_token: OrderToken,
        ticket: ReadTicket,
        interruptor: &CancellationToken,
    ) -> Result<P::ReadResponse> {
        let sink = self.inner.sink(ticket.session);
        self.inner
            .read(sink, read, mode, order_token, ticket, interruptor)
            .await
    }

    /// Run a write admitted by `ticket`
    pub async fn write(
        &self,
        write: P::Write,
        order_token: OrderToken,
        ticket: WriteTicket,
        interruptor: &CancellationToken,
    ) -> Result<P::WriteResponse> {
        let sink = self.inner.sink(ticket.session);
        self.inner
            .write(sink, write, order_token, ticket, interruptor)
            .await
    }
}

impl<P: Protocol> Drop for Master<P> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.task.abort();
        tracing::info!(region = %self.inner.region, "Master stopped");
    }
}

fn check_region<P: Protocol>(region: &Region, broadcaster: &Broadcaster<P>) -> Result<()> {
    if region != broadcaster.region() {
        return Err(Error::config(format!(
            "master region {} does not match broadcaster region {}",
            region,
            broadcaster.region()
        )));
    }
    Ok(())
}

/// Failures reach clients as "cannot perform query"; interruption stays distinct
fn into_query_error(error: Error) -> Error {
    match error {
        Error::Interrupted | Error::CannotPerformQuery(_) => error,
        other => Error::cannot_perform_query(other.to_string()),
    }
}

impl<P: Protocol> MasterInner<P> {
    fn sink(&self, session: SessionId) -> FifoSink {
        self.sessions
            .lock()
            .entry(session)
            .or_insert_with(|| {
                tracing::debug!(session = %session, "New client session");
                ClientSession {
                    sink: FifoSink::new(session),
                    order_buckets: HashSet::new(),
                }
            })
            .sink
            .clone()
    }

    fn forget_session(&self, session: SessionId) {
        let mut sessions = self.sessions.lock();
        if let Some(client) = sessions.remove(&session) {
            for bucket in client.order_buckets {
                self.order_checker.forget(bucket);
            }
            tracing::debug!(session = %session, "Client session closed");
        }
    }

    fn current_broadcaster(&self) -> Result<Arc<Broadcaster<P>>> {
        self.broadcaster
            .read()
            .clone()
            .ok_or_else(|| Error::cannot_perform_query("master has no broadcaster"))
    }

    /// Check an admitted operation's token. Tokens of sessions already closed
    /// are not tracked.
    fn note_order(&self, session: SessionId, token: &OrderToken, kind: OpKind) {
        let result = {
            let mut sessions = self.sessions.lock();
            let Some(client) = sessions.get_mut(&session) else {
                return;
            };
            if !token.is_ignored() {
                client.order_buckets.insert(token.bucket());
            }
            match kind {
                OpKind::Read => self.order_checker.check_read(token),
                OpKind::Write => self.order_checker.check_write(token),
            }
        };
        if let Err(e) = result {
            self.stats.lock().order_violations += 1;
            tracing::warn!("Order violation: {}", e);
        }
    }

    async fn write(
        &self,
        sink: FifoSink,
        write: P::Write,
        order_token: OrderToken,
        ticket: WriteTicket,
        interruptor: &CancellationToken,
    ) -> Result<P::WriteResponse> {
        let exit = sink.enter_write(ticket, interruptor).await?;
        if interruptor.is_cancelled() {
            drop(exit);
            return Err(Error::Interrupted);
        }
        self.note_order(sink.session(), &order_token, OpKind::Write);

        let result = match self.current_broadcaster() {
            Ok(broadcaster) => broadcaster
                .write(write, order_token, &self.policy, Some(exit), interruptor)
                .await
                .map(|outcome| outcome.response),
            Err(e) => Err(e),
        };

        let mut stats = self.stats.lock();
        match result {
            Ok(response) => {
                stats.writes += 1;
                Ok(response)
            }
            Err(e) => {
                stats.failed_writes += 1;
                tracing::debug!("Write failed: {}", e);
                Err(into_query_error(e))
            }
        }
    }

    async fn read(
        &self,
        sink: FifoSink,
        read: P::Read,
        mode: ReadMode,
        order_token: OrderToken,
        ticket: ReadTicket,
        interruptor: &CancellationToken,
    ) -> Result<P::ReadResponse> {
        let exit = sink.enter_read(ticket, interruptor).await?;
        if interruptor.is_cancelled() {
            drop(exit);
            return Err(Error::Interrupted);
        }
        self.note_order(sink.session(), &order_token, OpKind::Read);

        let result = match self.current_broadcaster() {
            Ok(broadcaster) => match mode {
                ReadMode::Linearizable => {
                    broadcaster
                        .read(read, order_token, Some(exit), interruptor)
                        .await
                }
                // The exit is held until a replier answered or the fallback
                // is queued behind the session's earlier writes
                ReadMode::Outdated => {
                    match self.read_from_repliers(&broadcaster.readable_repliers(), &read).await {
                        Some(response) => Ok(response),
                        None => {
                            broadcaster
                                .read(read, order_token, Some(exit), interruptor)
                                .await
                        }
                    }
                }
            },
            Err(e) => Err(e),
        };

        let mut stats = self.stats.lock();
        match result {
            Ok(response) => {
                stats.reads += 1;
                Ok(response)
            }
            Err(e) => {
                stats.failed_reads += 1;
                tracing::debug!("Read failed: {}", e);
                Err(into_query_error(e))
            }
        }
    }

    /// First successful answer from a caught-up replier, if any
    async fn read_from_repliers(
        &self,
        repliers: &[ReplierCard<P>],
        read: &P::Read,
    ) -> Option<P::ReadResponse> {
        for replier in repliers {
            let mut reply_box = self.mailbox.create::<Result<P::ReadResponse>>();
            let request = ReplierRequest {
                read: read.clone(),
                reply: reply_box.address(),
            };
            if let Err(e) = self.mailbox.send(&replier.reads, &request) {
                tracing::debug!(replier = %replier.peer, "Replier unreachable: {}", e);
                continue;
            }
            match tokio::time::timeout(self.config.ack_timeout, reply_box.recv()).await {
                Ok(Some(Ok(response))) => return Some(response),
                Ok(Some(Err(e))) => {
                    tracing::debug!(replier = %replier.peer, "Replier refused read: {}", e);
                }
                Ok(None) | Err(_) => {
                    tracing::debug!(replier = %replier.peer, "Replier did not answer");
                }
            }
        }
        None
    }

    fn reply<T: Serialize>(&self, to: &MailboxAddress<Result<T>>, result: &Result<T>) {
        if let Err(e) = self.mailbox.send(to, result) {
            tracing::debug!("Reply not delivered: {}", e);
        }
    }
}

async fn serve<P: Protocol>(inner: Arc<MasterInner<P>>, mut requests: Mailbox<MasterRequest<P>>) {
    while let Some(request) = requests.recv().await {
        match request {
            MasterRequest::Read {
                read,
                mode,
                order_token,
                ticket,
                reply,
            } => {
                // Resolve the sink before spawning so a later disconnect
                // cannot race a fresh sink into existence
                let sink = inner.sink(ticket.session);
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    let result = inner
                        .read(sink, read, mode, order_token, ticket, &inner.shutdown)
                        .await;
                    inner.reply(&reply, &result);
                });
            }
            MasterRequest::Write {
                write,
                order_token,
                ticket,
                reply,
            } => {
                let sink = inner.sink(ticket.session);
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    let result = inner
                        .write(sink, write, order_token, ticket, &inner.shutdown)
                        .await;
                    inner.reply(&reply, &result);
                });
            }
            MasterRequest::Abandon { ticket } => {
                let sink = inner.sink(ticket.session());
                inner.stats.lock().abandoned_tickets += 1;
                tokio::spawn(async move {
                    if let Err(e) = sink.skip(ticket).await {
                        tracing::warn!("Failed to skip abandoned ticket: {}", e);
                    }
                });
            }
            MasterRequest::Disconnect { session } => inner.forget_session(session),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::InMemoryBranchHistory;
    use crate::fifo::FifoSource;
    use crate::mailbox::MailboxCluster;
    use crate::order::OrderSource;
    use crate::testing::kv::{KvProtocol, KvRead, KvWrite, MemoryStore};
    use crate::version::Version;

    fn broadcaster(cluster: &MailboxCluster, region: Region) -> Arc<Broadcaster<KvProtocol>> {
        Arc::new(
            Broadcaster::<KvProtocol>::new(
                cluster.join(),
                Arc::new(InMemoryBranchHistory::new()),
                Arc::new(MemoryStore::new(region)),
                ReplicationConfig::default(),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_region_mismatch_rejected() {
        let cluster = MailboxCluster::new();
        let result = Master::new(
            cluster.join(),
            AckPolicy::AtLeast(1),
            Region::range("a", "m"),
            broadcaster(&cluster, Region::universe()),
            ReplicationConfig::default(),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_direct_write_then_read() {
        let cluster = MailboxCluster::new();
        let master = Master::new(
            cluster.join(),
            AckPolicy::AtLeast(1),
            Region::universe(),
            broadcaster(&cluster, Region::universe()),
            ReplicationConfig::default(),
        )
        .unwrap();
        let source = FifoSource::new();
        let order = OrderSource::new();
        let never = CancellationToken::new();

        master
            .write(KvWrite::single("a", "1"), order.check_in("w"), source.enter_write(), &never)
            .await
            .unwrap();
        let response = master
            .read(
                KvRead::keys(["a"]),
                ReadMode::Linearizable,
                order.check_in("r"),
                source.enter_read(),
                &never,
            )
            .await
            .unwrap();
        assert_eq!(response.get("a"), Some("1"));

        let stats = master.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.order_violations, 0);
    }

    #[tokio::test]
    async fn test_quorum_failure_is_cannot_perform_query() {
        let cluster = MailboxCluster::new();
        let master = Master::new(
            cluster.join(),
            AckPolicy::Never,
            Region::universe(),
            broadcaster(&cluster, Region::universe()),
            ReplicationConfig::default(),
        )
        .unwrap();
        let source = FifoSource::new();
        let err = master
            .write(KvWrite::single("a", "b"), OrderToken::ignore(), source.enter_write(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CannotPerformQuery(_)));
        assert_eq!(master.stats().failed_writes, 1);
    }

    #[tokio::test]
    async fn test_cleared_broadcaster_fails_requests() {
        let cluster = MailboxCluster::new();
        let master = Master::new(
            cluster.join(),
            AckPolicy::AtLeast(1),
            Region::universe(),
            broadcaster(&cluster, Region::universe()),
            ReplicationConfig::default(),
        )
        .unwrap();
        master.clear_broadcaster();

        let source = FifoSource::new();
        let never = CancellationToken::new();
        let err = master
            .write(KvWrite::single("a", "1"), OrderToken::ignore(), source.enter_write(), &never)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CannotPerformQuery(_)));

        // the failed write still released its ticket
        master.set_broadcaster(broadcaster(&cluster, Region::universe())).unwrap();
        master
            .write(KvWrite::single("a", "2"), OrderToken::ignore(), source.enter_write(), &never)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_requests_commit_nothing() {
        let cluster = MailboxCluster::new();
        let store = Arc::new(MemoryStore::new(Region::universe()));
        let broadcaster = Arc::new(
            Broadcaster::<KvProtocol>::new(
                cluster.join(),
                Arc::new(InMemoryBranchHistory::new()),
                store.clone(),
                ReplicationConfig::default(),
            )
            .unwrap(),
        );
        let master = Master::new(
            cluster.join(),
            AckPolicy::AtLeast(1),
            Region::universe(),
            broadcaster.clone(),
            ReplicationConfig::default(),
        )
        .unwrap();
        let source = FifoSource::new();
        let cancelled = CancellationToken::new();
        cancelled.cancel();

        for i in 0..20 {
            let err = master
                .write(KvWrite::single("k", i.to_string()), OrderToken::ignore(), source.enter_write(), &cancelled)
                .await
                .unwrap_err();
            assert_eq!(err, Error::Interrupted);
        }
        let err = master
            .read(KvRead::keys(["k"]), ReadMode::Linearizable, OrderToken::ignore(), source.enter_read(), &cancelled)
            .await
            .unwrap_err();
        assert_eq!(err, Error::Interrupted);

        assert_eq!(store.get("k"), None);
        assert_eq!(broadcaster.latest_version(), Version::zero());

        // every interrupted ticket was still consumed
        master
            .write(KvWrite::single("k", "kept"), OrderToken::ignore(), source.enter_write(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(store.get("k").as_deref(), Some("kept"));
        assert_eq!(broadcaster.latest_version().timestamp, 1);
    }
}
