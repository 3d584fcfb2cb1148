//! Branch history ledger
//!
//! Every broadcaster mints a branch and records its metadata here before it
//! accepts a single write. Entries are immutable and never removed: a replica
//! that was offline for a long time still needs the whole lineage to prove its
//! history is a prefix of the branch it wants to join.
//!
//! Parents are stored as ids, never as owning references, and lineage queries
//! walk them iteratively.

use crate::region::Region;
use crate::version::{BranchId, Version};
use crate::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Immutable description of one branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchMetadata {
    /// Branch id
    pub branch: BranchId,
    /// Region the branch is responsible for
    pub region: Region,
    /// Branch this one forked from, `None` for a branch started on an empty store
    pub parent: Option<BranchId>,
    /// Store version the branch was started from
    pub origin: Version,
}

impl BranchMetadata {
    /// Metadata for a branch started on a store at `origin`
    pub fn rooted_at(branch: BranchId, region: Region, origin: Version) -> Self {
        let parent = (!origin.branch.is_nil()).then_some(origin.branch);
        Self {
            branch,
            region,
            parent,
            origin,
        }
    }
}

/// Append-only branch lineage store
pub trait BranchHistoryStore: Send + Sync {
    /// Record branch metadata.
    ///
    /// Recording identical metadata twice is a no-op; recording different
    /// metadata under an existing id fails with [`Error::Conflict`].
    fn record(&self, metadata: BranchMetadata) -> Result<()>;

    /// Look up a branch
    fn get(&self, branch: BranchId) -> Option<BranchMetadata>;

    /// Check whether `candidate` is `branch` or one of its ancestors.
    ///
    /// The nil branch is an ancestor of every branch.
    fn is_ancestor(&self, candidate: BranchId, branch: BranchId) -> bool {
        if candidate.is_nil() || candidate == branch {
            return true;
        }
        self.lineage(branch)
            .iter()
            .any(|metadata| metadata.parent == Some(candidate))
    }

    /// Check whether a store at `version` holds a prefix of `branch`'s history.
    ///
    /// Unlike [`BranchHistoryStore::is_ancestor`] this also checks the
    /// timestamp: a replica that kept writing on a parent branch after the
    /// child forked from it has diverged.
    fn version_is_ancestor(&self, version: Version, branch: BranchId) -> bool {
        if version.is_zero() || version.branch == branch {
            return true;
        }
        for metadata in self.lineage(branch) {
            if metadata.origin.branch == version.branch {
                return version.timestamp <= metadata.origin.timestamp;
            }
        }
        false
    }

    /// `branch` followed by its ancestors, nearest first.
    ///
    /// Stops at the first branch whose metadata is unknown.
    fn lineage(&self, branch: BranchId) -> Vec<BranchMetadata> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(branch);
        while let Some(id) = cursor {
            if !seen.insert(id) {
                tracing::error!(branch = %id, "Cycle in branch lineage");
                break;
            }
            let Some(metadata) = self.get(id) else {
                break;
            };
            cursor = metadata.parent;
            chain.push(metadata);
        }
        chain
    }
}

/// Branch history kept in memory
#[derive(Debug, Default)]
pub struct InMemoryBranchHistory {
    branches: RwLock<HashMap<BranchId, BranchMetadata>>,
}

impl InMemoryBranchHistory {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded branches
    pub fn len(&self) -> usize {
        self.branches.read().len()
    }

    /// True when no branch has been recorded
    pub fn is_empty(&self) -> bool {
        self.branches.read().is_empty()
    }

    /// Export the ledger as JSON
    pub fn to_json(&self) -> Result<String> {
        let mut entries: Vec<BranchMetadata> = self.branches.read().values().cloned().collect();
        entries.sort_by_key(|m| m.origin.timestamp);
        serde_json::to_string(&entries)
            .map_err(|e| Error::internal(format!("Branch history serialization failed: {}", e)))
    }

    /// Rebuild a ledger from [`InMemoryBranchHistory::to_json`] output
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: Vec<BranchMetadata> = serde_json::from_str(json)
            .map_err(|e| Error::internal(format!("Branch history deserialization failed: {}", e)))?;
        let history = Self::new();
        for metadata in entries {
            history.record(metadata)?;
        }
        Ok(history)
    }
}

impl BranchHistoryStore for InMemoryBranchHistory {
    fn record(&self, metadata: BranchMetadata) -> Result<()> {
        let mut branches = self.branches.write();
        if let Some(existing) = branches.get(&metadata.branch) {
            if *existing == metadata {
                return Ok(());
            }
            return Err(Error::conflict(format!(
                "branch {} already recorded with parent {:?}, region {}",
                metadata.branch, existing.parent, existing.region
            )));
        }
        tracing::debug!(branch = %metadata.branch, origin = %metadata.origin, "Recorded branch");
        branches.insert(metadata.branch, metadata);
        Ok(())
    }

    fn get(&self, branch: BranchId) -> Option<BranchMetadata> {
        self.branches.read().get(&branch).cloned()
    }
}
