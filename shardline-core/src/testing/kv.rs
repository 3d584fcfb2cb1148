//! Key/value protocol over an in-memory store

use crate::protocol::Protocol;
use crate::region::Region;
use crate::store::ReplicaStore;
use crate::version::Version;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

/// Key/value protocol
#[derive(Debug, Clone)]
pub struct KvProtocol;

impl Protocol for KvProtocol {
    type Read = KvRead;
    type ReadResponse = KvReadResponse;
    type Write = KvWrite;
    type WriteResponse = KvWriteResponse;
}

/// Point lookup of a set of keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvRead {
    /// Keys to fetch
    pub keys: BTreeSet<String>,
}

impl KvRead {
    /// Read the given keys
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

/// Values found; missing keys are left out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvReadResponse {
    /// Found values
    pub values: BTreeMap<String, String>,
}

impl KvReadResponse {
    /// Value of `key`, if present
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Insert or overwrite a set of keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvWrite {
    /// Values to store
    pub values: BTreeMap<String, String>,
}

impl KvWrite {
    /// Write one key
    pub fn single(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::pairs([(key, value)])
    }

    /// Write several keys
    pub fn pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Write result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvWriteResponse {
    /// Number of keys written
    pub written: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct MemoryState {
    values: BTreeMap<String, String>,
    version: Version,
    #[serde(skip)]
    applied: Vec<Version>,
}

/// In-memory replica store for [`KvProtocol`]
#[derive(Debug)]
pub struct MemoryStore {
    region: Region,
    state: RwLock<MemoryState>,
    fail_writes: AtomicBool,
    fail_snapshots: AtomicBool,
}

impl MemoryStore {
    /// Empty store at version zero
    pub fn new(region: Region) -> Self {
        Self {
            region,
            state: RwLock::new(MemoryState {
                values: BTreeMap::new(),
                version: Version::zero(),
                applied: Vec::new(),
            }),
            fail_writes: AtomicBool::new(false),
            fail_snapshots: AtomicBool::new(false),
        }
    }

    /// Store already holding `values` at `version`
    pub fn with_contents(region: Region, values: BTreeMap<String, String>, version: Version) -> Self {
        let store = Self::new(region);
        {
            let mut state = store.state.write();
            state.values = values;
            state.version = version;
        }
        store
    }

    /// Current value of a key
    pub fn get(&self, key: &str) -> Option<String> {
        self.state.read().values.get(key).cloned()
    }

    /// Every version applied through [`ReplicaStore::apply`], in order
    pub fn applied_versions(&self) -> Vec<Version> {
        self.state.read().applied.clone()
    }

    /// Make every subsequent write fail with a storage error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent snapshot export fail with a storage error
    pub fn set_fail_snapshots(&self, fail: bool) {
        self.fail_snapshots.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReplicaStore<KvProtocol> for MemoryStore {
    fn region(&self) -> &Region {
        &self.region
    }

    fn current_version(&self) -> Version {
        self.state.read().version
    }

    async fn apply(&self, write: &KvWrite, version: Version) -> Result<KvWriteResponse> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::storage("write failure injected"));
        }
        if let Some(key) = write.values.keys().find(|k| !self.region.contains_key(k)) {
            return Err(Error::storage(format!("key {:?} outside region {}", key, self.region)));
        }

        let mut state = self.state.write();
        if version.timestamp != state.version.timestamp + 1 {
            return Err(Error::storage(format!(
                "write at {} applied on store at {}",
                version, state.version
            )));
        }
        for (key, value) in &write.values {
            state.values.insert(key.clone(), value.clone());
        }
        state.version = version;
        state.applied.push(version);

        Ok(KvWriteResponse {
            written: write.values.len(),
        })
    }

    async fn read(&self, read: &KvRead) -> Result<KvReadResponse> {
        let state = self.state.read();
        let values = read
            .keys
            .iter()
            .filter_map(|key| state.values.get(key).map(|v| (key.clone(), v.clone())))
            .collect();
        Ok(KvReadResponse { values })
    }

    async fn export_snapshot(&self) -> Result<Vec<u8>> {
        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err(Error::storage("snapshot failure injected"));
        }
        let state = self.state.read();
        bincode::serialize(&*state).map_err(|e| Error::storage(format!("Snapshot export failed: {}", e)))
    }

    async fn import_snapshot(&self, data: &[u8], version: Version) -> Result<()> {
        let snapshot: MemoryState = bincode::deserialize(data)
            .map_err(|e| Error::storage(format!("Snapshot import failed: {}", e)))?;
        if snapshot.version != version {
            return Err(Error::storage(format!(
                "snapshot holds {}, expected {}",
                snapshot.version, version
            )));
        }
        let mut state = self.state.write();
        state.values = snapshot.values;
        state.version = snapshot.version;
        Ok(())
    }
}
