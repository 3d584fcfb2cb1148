//! Error types for Shardline Core

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using Shardline Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the replication layer
///
/// Errors cross mailbox boundaries (a master answers a client with
/// `Result<Response, Error>`), so the enum is serializable and only carries
/// owned strings.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// The ack policy cannot be satisfied by the peers that can answer
    #[error("Quorum unreachable: {0}")]
    QuorumUnreachable(String),

    /// No master or broadcaster could serve the request, or quorum failed
    #[error("Cannot perform query: {0}")]
    CannotPerformQuery(String),

    /// A listener's history is incompatible with the branch it tried to join
    #[error("Branch lineage rejected: {0}")]
    BranchLineageRejected(String),

    /// A listener received a write that skips versions
    #[error("Version gap detected: expected timestamp {expected}, got {actual}")]
    VersionGapDetected {
        /// Timestamp the listener was waiting for
        expected: u64,
        /// Timestamp that actually arrived
        actual: u64,
    },

    /// The caller's interruptor fired
    #[error("Operation interrupted")]
    Interrupted,

    /// Branch history already holds different metadata for the same branch
    #[error("Branch history conflict: {0}")]
    Conflict(String),

    /// Replica store failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// Mailbox framing and delivery errors
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a quorum unreachable error
    pub fn quorum_unreachable(msg: impl Into<String>) -> Self {
        Self::QuorumUnreachable(msg.into())
    }

    /// Create a cannot perform query error
    pub fn cannot_perform_query(msg: impl Into<String>) -> Self {
        Self::CannotPerformQuery(msg.into())
    }

    /// Create a branch lineage rejection
    pub fn lineage_rejected(msg: impl Into<String>) -> Self {
        Self::BranchLineageRejected(msg.into())
    }

    /// Create a branch history conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
