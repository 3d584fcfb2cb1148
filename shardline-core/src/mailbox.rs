//! In-process mailbox fabric
//!
//! Peers join a [`MailboxCluster`] and get a [`MailboxManager`]. A manager
//! creates typed [`Mailbox`]es whose [`MailboxAddress`] can be put in a
//! business card and sent anywhere. Delivery is best effort and FIFO per
//! sender and mailbox; every message is framed (see [`crate::protocol`]) as
//! it would be on a socket. Disconnecting a peer makes every send to or from
//! it fail, which is how tests simulate a crashed replica.

use crate::protocol::{decode_frame, encode_frame};
use crate::{Error, Result};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifier of a peer in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Fresh peer id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serializable address of a mailbox accepting `M`
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct MailboxAddress<M> {
    peer: PeerId,
    mailbox: u64,
    message: PhantomData<fn() -> M>,
}

impl<M> MailboxAddress<M> {
    /// Peer owning the mailbox
    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

impl<M> Clone for MailboxAddress<M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M> Copy for MailboxAddress<M> {}

impl<M> PartialEq for MailboxAddress<M> {
    fn eq(&self, other: &Self) -> bool {
        self.peer == other.peer && self.mailbox == other.mailbox
    }
}

impl<M> Eq for MailboxAddress<M> {}

impl<M> Hash for MailboxAddress<M> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.peer.hash(state);
        self.mailbox.hash(state);
    }
}

impl<M> fmt::Debug for MailboxAddress<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MailboxAddress({}/{})", self.peer, self.mailbox)
    }
}

#[derive(Debug)]
struct PeerEntry {
    connected: bool,
    mailboxes: HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>,
}

impl Default for PeerEntry {
    fn default() -> Self {
        Self {
            connected: true,
            mailboxes: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct ClusterInner {
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
}

/// Message fabric shared by every peer of a test or embedded cluster
#[derive(Debug, Clone, Default)]
pub struct MailboxCluster {
    inner: Arc<ClusterInner>,
}

impl MailboxCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer to the cluster
    pub fn join(&self) -> MailboxManager {
        let peer = PeerId::new();
        self.inner.peers.write().insert(peer, PeerEntry::default());
        MailboxManager {
            peer,
            cluster: Arc::clone(&self.inner),
            next_mailbox: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Cut a peer off; sends to and from it fail until reconnected
    pub fn disconnect(&self, peer: PeerId) {
        if let Some(entry) = self.inner.peers.write().get_mut(&peer) {
            entry.connected = false;
            tracing::info!(peer = %peer, "Peer disconnected");
        }
    }

    /// Bring a disconnected peer back
    pub fn reconnect(&self, peer: PeerId) {
        if let Some(entry) = self.inner.peers.write().get_mut(&peer) {
            entry.connected = true;
            tracing::info!(peer = %peer, "Peer reconnected");
        }
    }

    /// Check whether a peer is reachable
    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.inner
            .peers
            .read()
            .get(&peer)
            .is_some_and(|entry| entry.connected)
    }
}

/// One peer's handle on the cluster
#[derive(Debug, Clone)]
pub struct MailboxManager {
    peer: PeerId,
    cluster: Arc<ClusterInner>,
    next_mailbox: Arc<AtomicU64>,
}

impl MailboxManager {
    /// This peer's id
    pub fn peer_id(&self) -> PeerId {
        self.peer
    }

    /// Create a mailbox accepting `M`
    pub fn create<M: DeserializeOwned>(&self) -> Mailbox<M> {
        let mailbox = self.next_mailbox.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.cluster
            .peers
            .write()
            .entry(self.peer)
            .or_default()
            .mailboxes
            .insert(mailbox, tx);

        Mailbox {
            address: MailboxAddress {
                peer: self.peer,
                mailbox,
                message: PhantomData,
            },
            rx,
            cluster: Arc::clone(&self.cluster),
        }
    }

    /// Send a message; fails if either side is disconnected or the mailbox is gone
    pub fn send<M: Serialize>(&self, to: &MailboxAddress<M>, message: &M) -> Result<()> {
        let frame = encode_frame(message)?;

        let peers = self.cluster.peers.read();
        if !peers.get(&self.peer).is_some_and(|entry| entry.connected) {
            return Err(Error::transport(format!("peer {} is disconnected", self.peer)));
        }
        let target = peers
            .get(&to.peer)
            .filter(|entry| entry.connected)
            .ok_or_else(|| Error::transport(format!("peer {} is unreachable", to.peer)))?;
        let tx = target
            .mailboxes
            .get(&to.mailbox)
            .ok_or_else(|| Error::transport(format!("mailbox {:?} no longer exists", to)))?;
        tx.send(frame)
            .map_err(|_| Error::transport(format!("mailbox {:?} is closed", to)))
    }
}

/// Receiving end of a mailbox; unregisters itself on drop
#[derive(Debug)]
pub struct Mailbox<M> {
    address: MailboxAddress<M>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    cluster: Arc<ClusterInner>,
}

impl<M: DeserializeOwned> Mailbox<M> {
    /// Address to hand out
    pub fn address(&self) -> MailboxAddress<M> {
        self.address
    }

    /// Wait for the next message.
    ///
    /// Frames that fail validation are logged and skipped.
    pub async fn recv(&mut self) -> Option<M> {
        loop {
            let frame = self.rx.recv().await?;
            match decode_frame(&frame) {
                Ok(message) => return Some(message),
                Err(e) => {
                    tracing::warn!(mailbox = ?self.address, "Dropping invalid frame: {}", e);
                }
            }
        }
    }
}

impl<M> Drop for Mailbox<M> {
    fn drop(&mut self) {
        if let Some(entry) = self.cluster.peers.write().get_mut(&self.address.peer) {
            entry.mailboxes.remove(&self.address.mailbox);
        }
    }
}
