//! Broadcaster: the single writer of a branch
//!
//! The broadcaster:
//! - Mints a branch and records it in the branch history
//! - Assigns every write the next version of the branch
//! - Streams writes to joined listeners, in version order
//! - Applies writes and linearizable reads to its own store
//! - Collects acknowledgements and evaluates the caller's ack policy
//! - Brings joining listeners up to date from its write log or a snapshot
//!
//! Version assignment, logging, the local store queue and the fan-out to
//! listeners all happen under one lock, so every listener and the local store
//! observe writes in exactly the order versions were assigned.

use crate::branch::{BranchHistoryStore, BranchMetadata};
use crate::config::ReplicationConfig;
use crate::fifo::FifoExit;
use crate::mailbox::{Mailbox, MailboxManager, PeerId};
use crate::order::OrderToken;
use crate::policy::AckPolicy;
use crate::protocol::{
    Backfill, BroadcasterCard, ListenerCard, PROTOCOL_VERSION, Protocol, RegistrarMessage,
    RegistrationReply, ReplierCard, StreamWrite, WriteAck,
};
use crate::region::Region;
use crate::store::ReplicaStore;
use crate::version::{BranchId, Version};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Broadcaster statistics
#[derive(Debug, Clone, Default)]
pub struct BroadcasterStats {
    /// Writes assigned a version
    pub writes_dispatched: u64,
    /// Writes whose ack policy was met
    pub writes_acknowledged: u64,
    /// Writes whose ack policy was not met
    pub quorum_failures: u64,
    /// Listeners currently joined
    pub listeners: usize,
    /// Joined listeners that also serve reads
    pub readable_listeners: usize,
    /// Entries held in the write log
    pub log_size: usize,
    /// Latest assigned timestamp
    pub latest_timestamp: u64,
    /// Listeners brought up to date with a snapshot
    pub snapshot_transfers: u64,
}

/// Result of a successful write
#[derive(Debug, Clone)]
pub struct WriteOutcome<P: Protocol> {
    /// Version assigned to the write
    pub version: Version,
    /// Peers that acknowledged before the policy was met
    pub acks: BTreeSet<PeerId>,
    /// Store response
    pub response: P::WriteResponse,
}

#[derive(Debug, Clone)]
struct LogEntry<P: Protocol> {
    version: Version,
    write: P::Write,
    order_token: OrderToken,
}

#[derive(Debug, Clone)]
struct JoinedListener<P: Protocol> {
    card: ListenerCard<P>,
    replier: Option<ReplierCard<P>>,
}

struct DispatchState<P: Protocol> {
    latest: Version,
    log: VecDeque<LogEntry<P>>,
    listeners: BTreeMap<PeerId, JoinedListener<P>>,
}

enum LocalCommand<P: Protocol> {
    Write {
        version: Version,
        write: P::Write,
        reply: oneshot::Sender<Result<P::WriteResponse>>,
    },
    Read {
        read: P::Read,
        reply: oneshot::Sender<Result<P::ReadResponse>>,
    },
    Snapshot {
        reply: oneshot::Sender<Result<(Version, Vec<u8>)>>,
    },
}

/// How a joining listener will be brought up to date
enum CatchUp {
    Replayed(Version),
    Snapshot(oneshot::Receiver<Result<(Version, Vec<u8>)>>),
}

struct BroadcasterInner<P: Protocol> {
    mailbox: MailboxManager,
    branch: BranchId,
    region: Region,
    origin: Version,
    config: ReplicationConfig,
    history: Arc<dyn BranchHistoryStore>,
    state: Mutex<DispatchState<P>>,
    local: mpsc::UnboundedSender<LocalCommand<P>>,
    stats: Mutex<BroadcasterStats>,
    card: BroadcasterCard<P>,
}

/// Single writer of a branch
pub struct Broadcaster<P: Protocol> {
    inner: Arc<BroadcasterInner<P>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<P: Protocol> Broadcaster<P> {
    /// Start a broadcaster on top of `store`.
    ///
    /// A fresh branch rooted at the store's current version is recorded in
    /// `history` before anything else happens. Must be called within a
    /// tokio runtime.
    pub fn new(
        mailbox: MailboxManager,
        history: Arc<dyn BranchHistoryStore>,
        store: Arc<dyn ReplicaStore<P>>,
        config: ReplicationConfig,
    ) -> Result<Self> {
        config.validate()?;

        let branch = BranchId::new();
        let origin = store.current_version();
        let region = store.region().clone();
        if region.is_empty() {
            return Err(Error::config("broadcaster store covers an empty region"));
        }
        history.record(BranchMetadata::rooted_at(branch, region.clone(), origin))?;

        let registrar = mailbox.create::<RegistrarMessage<P>>();
        let card = BroadcasterCard {
            peer: mailbox.peer_id(),
            branch,
            region: region.clone(),
            registrar: registrar.address(),
        };

        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(BroadcasterInner {
            mailbox,
            branch,
            region,
            origin,
            config,
            history,
            state: Mutex::new(DispatchState {
                latest: origin,
                log: VecDeque::new(),
                listeners: BTreeMap::new(),
            }),
            local: local_tx,
            stats: Mutex::new(BroadcasterStats {
                latest_timestamp: origin.timestamp,
                ..Default::default()
            }),
            card,
        });

        let local_task = tokio::spawn(run_local_store(store, local_rx));
        let registrar_task = tokio::spawn(run_registrar(Arc::clone(&inner), registrar));

        tracing::info!(
            branch = %branch,
            origin = %origin,
            region = %inner.region,
            "Broadcaster started"
        );

        Ok(Self {
            inner,
            tasks: vec![local_task, registrar_task],
        })
    }

    /// Branch owned by this broadcaster
    pub fn branch_id(&self) -> BranchId {
        self.inner.branch
    }

    /// Region of the branch
    pub fn region(&self) -> &Region {
        &self.inner.region
    }

    /// Store version the branch was started from
    pub fn origin(&self) -> Version {
        self.inner.origin
    }

    /// Latest assigned version
    pub fn latest_version(&self) -> Version {
        self.inner.state.lock().latest
    }

    /// Card listeners use to register
    pub fn get_business_card(&self) -> BroadcasterCard<P> {
        self.inner.card.clone()
    }

    /// Peers of the joined listeners
    pub fn listeners(&self) -> Vec<PeerId> {
        self.inner.state.lock().listeners.keys().copied().collect()
    }

    /// Read services of joined listeners that upgraded to repliers
    pub fn readable_repliers(&self) -> Vec<ReplierCard<P>> {
        self.inner
            .state
            .lock()
            .listeners
            .values()
            .filter_map(|joined| joined.replier.clone())
            .collect()
    }

    /// Get statistics
    pub fn stats(&self) -> BroadcasterStats {
        let mut stats = self.inner.stats.lock().clone();
        let state = self.inner.state.lock();
        stats.listeners = state.listeners.len();
        stats.readable_listeners = state
            .listeners
            .values()
            .filter(|joined| joined.replier.is_some())
            .count();
        stats.log_size = state.log.len();
        stats.latest_timestamp = state.latest.timestamp;
        stats
    }

    /// Assign the next version to `write`, stream it to every listener and
    /// wait until `policy` accepts the acknowledgements.
    ///
    /// `fifo_exit` is released as soon as the write has been dispatched, so
    /// the next operation of the same client is ordered after this one
    /// without waiting for the acks. The write is never rolled back: on
    /// [`Error::QuorumUnreachable`] it may still be applied by the broadcaster
    /// and by any listener that received it.
    ///
    /// An interruptor that has already fired fails the call before a version
    /// is assigned, so nothing is committed. Interruption while waiting for
    /// acks leaves the dispatched write in place.
    pub async fn write(
        &self,
        write: P::Write,
        order_token: OrderToken,
        policy: &AckPolicy,
        fifo_exit: Option<FifoExit>,
        interruptor: &CancellationToken,
    ) -> Result<WriteOutcome<P>> {
        if interruptor.is_cancelled() {
            return Err(Error::Interrupted);
        }

        let own_peer = self.inner.mailbox.peer_id();
        let mut ack_box = self.inner.mailbox.create::<WriteAck<P>>();
        let (local_tx, mut local_rx) = oneshot::channel();

        let (version, dispatched, known) = {
            let mut state = self.inner.state.lock();
            let version = state.latest.successor_on(self.inner.branch);

            self.inner
                .local
                .send(LocalCommand::Write {
                    version,
                    write: write.clone(),
                    reply: local_tx,
                })
                .map_err(|_| Error::internal("broadcaster store task stopped"))?;

            state.latest = version;
            state.log.push_back(LogEntry {
                version,
                write: write.clone(),
                order_token: order_token.clone(),
            });
            while state.log.len() > self.inner.config.max_log_size {
                state.log.pop_front();
            }

            let message = StreamWrite {
                version,
                write,
                order_token,
                ack_to: Some(ack_box.address()),
            };

            // +1 for the broadcaster itself
            let known = state.listeners.len() + 1;
            let mut dispatched = BTreeSet::from([own_peer]);
            let mut unreachable = Vec::new();
            for (peer, joined) in &state.listeners {
                match self.inner.mailbox.send(&joined.card.stream, &message) {
                    Ok(()) => {
                        dispatched.insert(*peer);
                    }
                    Err(e) => {
                        tracing::warn!(listener = %peer, version = %version, "Dropping unreachable listener: {}", e);
                        unreachable.push(*peer);
                    }
                }
            }
            for peer in unreachable {
                state.listeners.remove(&peer);
            }

            (version, dispatched, known)
        };
        drop(fifo_exit);

        self.inner.stats.lock().writes_dispatched += 1;
        tracing::trace!(version = %version, listeners = dispatched.len() - 1, "Write dispatched");

        if !policy.is_acceptable(&dispatched, known) {
            // The local store still applies the write; wait for it so callers
            // observe a settled broadcaster.
            if let Ok(Err(e)) = local_rx.await {
                tracing::error!(version = %version, "Broadcaster store failed to apply write: {}", e);
            }
            self.inner.stats.lock().quorum_failures += 1;
            return Err(Error::quorum_unreachable(format!(
                "{} reachable peers cannot satisfy {:?}",
                dispatched.len(),
                policy
            )));
        }

        let deadline = Instant::now() + self.inner.config.ack_timeout;
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        let mut acks = BTreeSet::new();
        let mut response = None;
        let mut local_pending = true;

        loop {
            if response.is_some() && policy.is_acceptable(&acks, known) {
                break;
            }

            tokio::select! {
                result = &mut local_rx, if local_pending => {
                    local_pending = false;
                    match result {
                        Ok(Ok(local_response)) => {
                            acks.insert(own_peer);
                            response = Some(local_response);
                        }
                        Ok(Err(e)) => {
                            tracing::error!(version = %version, "Broadcaster store failed to apply write: {}", e);
                        }
                        Err(_) => {
                            tracing::error!(version = %version, "Broadcaster store task dropped write");
                        }
                    }
                }
                ack = ack_box.recv() => {
                    let Some(ack) = ack else { break };
                    if ack.version != version || !dispatched.contains(&ack.peer) {
                        tracing::debug!(peer = %ack.peer, version = %ack.version, "Ignoring stray ack");
                        continue;
                    }
                    acks.insert(ack.peer);
                    if response.is_none() {
                        response = Some(ack.response);
                    }
                }
                _ = &mut sleep => {
                    tracing::debug!(version = %version, acks = acks.len(), "Ack timeout");
                    break;
                }
                _ = interruptor.cancelled() => return Err(Error::Interrupted),
            }
        }

        match response {
            Some(response) if policy.is_acceptable(&acks, known) => {
                self.inner.stats.lock().writes_acknowledged += 1;
                Ok(WriteOutcome {
                    version,
                    acks,
                    response,
                })
            }
            _ => {
                self.inner.stats.lock().quorum_failures += 1;
                Err(Error::quorum_unreachable(format!(
                    "write {} got {} of {} possible acks, policy {:?}",
                    version,
                    acks.len(),
                    dispatched.len(),
                    policy
                )))
            }
        }
    }

    /// Read from the broadcaster's store.
    ///
    /// The read is queued behind every write already dispatched on the branch,
    /// which makes it linearizable. `fifo_exit` is released once the read is
    /// queued.
    pub async fn read(
        &self,
        read: P::Read,
        order_token: OrderToken,
        fifo_exit: Option<FifoExit>,
        interruptor: &CancellationToken,
    ) -> Result<P::ReadResponse> {
        if interruptor.is_cancelled() {
            return Err(Error::Interrupted);
        }

        let (tx, rx) = oneshot::channel();
        self.inner
            .local
            .send(LocalCommand::Read { read, reply: tx })
            .map_err(|_| Error::internal("broadcaster store task stopped"))?;
        drop(fifo_exit);
        tracing::trace!(order = %order_token, "Read queued");

        tokio::select! {
            result = rx => result.map_err(|_| Error::internal("broadcaster store task dropped read"))?,
            _ = interruptor.cancelled() => Err(Error::Interrupted),
        }
    }
}

impl<P: Protocol> Drop for Broadcaster<P> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        tracing::info!(branch = %self.inner.branch, "Broadcaster stopped");
    }
}

impl<P: Protocol> BroadcasterInner<P> {
    /// Admit a listener whose store is at `version`.
    ///
    /// Returns the version the listener will be at once it has installed the
    /// backfill (if any), plus the backfill itself.
    async fn attach_listener(
        &self,
        listener: ListenerCard<P>,
        version: Version,
        region: Region,
        protocol_version: u32,
    ) -> Result<(Version, Option<Backfill>)> {
        if protocol_version != PROTOCOL_VERSION {
            return Err(Error::transport(format!(
                "protocol version mismatch: listener speaks {}, broadcaster speaks {}",
                protocol_version, PROTOCOL_VERSION
            )));
        }
        if region != self.region {
            return Err(Error::lineage_rejected(format!(
                "listener region {} does not match branch region {}",
                region, self.region
            )));
        }
        if !self.history.version_is_ancestor(version, self.branch) {
            return Err(Error::lineage_rejected(format!(
                "listener at {} diverged from branch {}",
                version, self.branch
            )));
        }

        let peer = listener.peer;
        let plan = {
            let mut state = self.state.lock();
            if version.branch == self.branch && version.timestamp > state.latest.timestamp {
                return Err(Error::lineage_rejected(format!(
                    "listener at {} is ahead of branch at {}",
                    version, state.latest
                )));
            }

            let plan = self.plan_catch_up(&state, version, &listener)?;
            state.listeners.insert(
                peer,
                JoinedListener {
                    card: listener,
                    replier: None,
                },
            );
            plan
        };

        match plan {
            CatchUp::Replayed(current) => {
                tracing::info!(listener = %peer, from = %version, to = %current, "Listener joined");
                Ok((current, None))
            }
            CatchUp::Snapshot(rx) => {
                let snapshot = match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(Error::internal("broadcaster store task dropped snapshot")),
                };
                let (at, data) = match snapshot {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        self.state.lock().listeners.remove(&peer);
                        return Err(e);
                    }
                };
                self.stats.lock().snapshot_transfers += 1;
                tracing::info!(listener = %peer, from = %version, to = %at, bytes = data.len(), "Listener joined with backfill");
                Ok((at, Some(Backfill::new(at, data))))
            }
        }
    }

    /// Replay the write log to the listener when it covers the gap,
    /// otherwise queue a snapshot behind every dispatched write.
    fn plan_catch_up(
        &self,
        state: &DispatchState<P>,
        version: Version,
        listener: &ListenerCard<P>,
    ) -> Result<CatchUp> {
        let bridged = version.timestamp == state.latest.timestamp
            || (version.timestamp >= self.origin.timestamp
                && state
                    .log
                    .front()
                    .is_some_and(|front| front.version.timestamp <= version.timestamp + 1));

        if bridged {
            for entry in state.log.iter().filter(|e| e.version.timestamp > version.timestamp) {
                let replay = StreamWrite {
                    version: entry.version,
                    write: entry.write.clone(),
                    order_token: entry.order_token.clone(),
                    ack_to: None,
                };
                self.mailbox.send(&listener.stream, &replay)?;
            }
            return Ok(CatchUp::Replayed(state.latest));
        }

        let (tx, rx) = oneshot::channel();
        self.local
            .send(LocalCommand::Snapshot { reply: tx })
            .map_err(|_| Error::internal("broadcaster store task stopped"))?;
        Ok(CatchUp::Snapshot(rx))
    }
}

async fn run_local_store<P: Protocol>(
    store: Arc<dyn ReplicaStore<P>>,
    mut commands: mpsc::UnboundedReceiver<LocalCommand<P>>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            LocalCommand::Write {
                version,
                write,
                reply,
            } => {
                let _ = reply.send(store.apply(&write, version).await);
            }
            LocalCommand::Read { read, reply } => {
                let _ = reply.send(store.read(&read).await);
            }
            LocalCommand::Snapshot { reply } => {
                let result = store
                    .export_snapshot()
                    .await
                    .map(|data| (store.current_version(), data));
                let _ = reply.send(result);
            }
        }
    }
}

async fn run_registrar<P: Protocol>(
    inner: Arc<BroadcasterInner<P>>,
    mut registrar: Mailbox<RegistrarMessage<P>>,
) {
    while let Some(message) = registrar.recv().await {
        match message {
            RegistrarMessage::Register {
                listener,
                version,
                region,
                protocol_version,
                reply,
            } => {
                let peer = listener.peer;
                let answer = match inner
                    .attach_listener(listener, version, region, protocol_version)
                    .await
                {
                    Ok((current, backfill)) => RegistrationReply::Accepted { current, backfill },
                    Err(error) => {
                        tracing::warn!(listener = %peer, version = %version, "Registration rejected: {}", error);
                        RegistrationReply::Rejected { error }
                    }
                };
                if let Err(e) = inner.mailbox.send(&reply, &answer) {
                    tracing::warn!(listener = %peer, "Failed to answer registration: {}", e);
                    inner.state.lock().listeners.remove(&peer);
                }
            }
            RegistrarMessage::UpgradeReadable { peer, replier } => {
                match inner.state.lock().listeners.get_mut(&peer) {
                    Some(joined) => {
                        joined.replier = Some(replier);
                        tracing::info!(listener = %peer, "Listener now serves reads");
                    }
                    None => {
                        tracing::warn!(listener = %peer, "Read upgrade from unknown listener");
                    }
                }
            }
            RegistrarMessage::Deregister { peer } => {
                if inner.state.lock().listeners.remove(&peer).is_some() {
                    tracing::info!(listener = %peer, "Listener left");
                }
            }
        }
    }
}
