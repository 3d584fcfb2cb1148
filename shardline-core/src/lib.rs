//! Shardline Core - Region Replication Engine
//!
//! This crate provides the replication core for one region of a sharded
//! key space, implementing:
//! - Broadcaster: single writer of a branch, streams versioned writes
//! - Listener: replica that applies the stream in version order
//! - Replier: read service on top of a caught-up listener
//! - Master: per-client FIFO admission and ack-policy enforcement
//! - Master access: client proxy that issues FIFO tickets
//! - Branch history: lineage ledger used to admit replicas
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              MasterAccess                    │
//! │   (FIFO tickets, order tokens, sessions)    │
//! └──────────────┬──────────────────────────────┘
//!                │ mailbox
//! ┌──────────────┴──────────────────────────────┐
//! │               Master                         │
//! │   (FIFO sinks, order checks, ack policy)    │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │             Broadcaster                      │
//! │  (versions, write log, fan-out, acks)       │
//! └──────┬───────────────────────┬──────────────┘
//!        │ stream / acks         │ reads
//! ┌──────┴──────────┐   ┌────────┴─────────────┐
//! │    Listener     │◄──┤       Replier         │
//! │ (apply in order)│   │  (freshness-bounded)  │
//! └─────────────────┘   └──────────────────────┘
//! ```
//!
//! Every component talks over typed mailboxes (see [`mailbox`]) and finds its
//! peers through directory views (see [`directory`]).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod branch;
pub mod broadcaster;
pub mod config;
pub mod directory;
pub mod error;
pub mod fifo;
pub mod listener;
pub mod mailbox;
pub mod master;
pub mod master_access;
pub mod order;
pub mod policy;
pub mod protocol;
pub mod region;
pub mod replier;
pub mod store;
pub mod testing;
pub mod version;

pub use branch::{BranchHistoryStore, BranchMetadata, InMemoryBranchHistory};
pub use broadcaster::{Broadcaster, BroadcasterStats, WriteOutcome};
pub use config::{ReadMode, ReplicationConfig};
pub use directory::{DirectoryEntry, DirectoryView, Lookup};
pub use error::{Error, Result};
pub use listener::{Listener, ListenerState, ListenerStats};
pub use mailbox::{MailboxCluster, MailboxManager, PeerId};
pub use master::{Master, MasterStats};
pub use master_access::{MasterAccess, ReadToken, WriteToken};
pub use order::{OrderSource, OrderToken};
pub use policy::AckPolicy;
pub use protocol::{BroadcasterCard, MasterCard, Protocol};
pub use region::Region;
pub use replier::Replier;
pub use store::ReplicaStore;
pub use version::{BranchId, Version};
