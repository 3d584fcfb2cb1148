//! Replica store boundary
//!
//! The replication core drives a store through this trait and never looks at
//! the data it holds. Writes arrive with the version the broadcaster assigned;
//! a store must apply them in timestamp order and report its own version so a
//! listener can resume after a restart.

use crate::Result;
use crate::protocol::Protocol;
use crate::region::Region;
use crate::version::Version;
use async_trait::async_trait;

/// Storage backing one replica of a region
#[async_trait]
pub trait ReplicaStore<P: Protocol>: Send + Sync {
    /// Region this store holds
    fn region(&self) -> &Region;

    /// Version of the last applied write
    fn current_version(&self) -> Version;

    /// Apply a write at `version`
    async fn apply(&self, write: &P::Write, version: Version) -> Result<P::WriteResponse>;

    /// Serve a read
    async fn read(&self, read: &P::Read) -> Result<P::ReadResponse>;

    /// Serialize the whole store
    async fn export_snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the store contents with a snapshot taken at `version`
    async fn import_snapshot(&self, data: &[u8], version: Version) -> Result<()>;
}
