//! Branch identifiers and versions

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one epoch of a region's write history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(Uuid);

impl BranchId {
    /// Mint a fresh branch id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The branch of a store that has never seen a write
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Check for the nil branch
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for BranchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a write in a branch
///
/// Timestamps keep counting across branches: the first write of a branch
/// follows its origin timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Branch that assigned this version
    pub branch: BranchId,
    /// Position within the branch lineage
    pub timestamp: u64,
}

impl Version {
    /// Create a version
    pub fn new(branch: BranchId, timestamp: u64) -> Self {
        Self { branch, timestamp }
    }

    /// Version of an empty store
    pub fn zero() -> Self {
        Self::new(BranchId::nil(), 0)
    }

    /// Check for the empty-store version
    pub fn is_zero(&self) -> bool {
        self.branch.is_nil() && self.timestamp == 0
    }

    /// Next version on `branch`
    pub fn successor_on(&self, branch: BranchId) -> Self {
        Self::new(branch, self.timestamp + 1)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.branch, self.timestamp)
    }
}
