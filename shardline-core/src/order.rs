//! Causal order tokens
//!
//! An [`OrderSource`] stamps every operation a client issues with a strictly
//! increasing sequence number. The tokens do not gate execution (that is the
//! FIFO enforcer's job); they ride along with the operation so the routing
//! layer can check that admission really happened in issue order.

use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Position of an operation in one client's causal order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderToken {
    bucket: Uuid,
    sequence: u64,
    tag: String,
}

impl OrderToken {
    /// Token exempt from order checking
    pub fn ignore() -> Self {
        Self {
            bucket: Uuid::nil(),
            sequence: 0,
            tag: String::new(),
        }
    }

    /// Check for an exempt token
    pub fn is_ignored(&self) -> bool {
        self.bucket.is_nil()
    }

    /// Sequence number within the issuing source
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Free-form tag given at check-in
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Source the token was issued by
    pub fn bucket(&self) -> Uuid {
        self.bucket
    }
}

impl fmt::Display for OrderToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ignored() {
            return write!(f, "order(ignored)");
        }
        write!(f, "order({}#{} {})", self.bucket, self.sequence, self.tag)
    }
}

/// Issues order tokens for one client session
#[derive(Debug)]
pub struct OrderSource {
    bucket: Uuid,
    counter: AtomicU64,
}

impl OrderSource {
    /// Create a source with a fresh bucket
    pub fn new() -> Self {
        Self {
            bucket: Uuid::new_v4(),
            counter: AtomicU64::new(0),
        }
    }

    /// Issue the next token
    pub fn check_in(&self, tag: impl Into<String>) -> OrderToken {
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        OrderToken {
            bucket: self.bucket,
            sequence,
            tag: tag.into(),
        }
    }
}

impl Default for OrderSource {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BucketState {
    last_write: u64,
    highest: u64,
}

/// Verifies that admitted operations respect their tokens' order.
///
/// A write is admitted only after everything issued before it, so its token
/// must be newer than every token seen so far. Reads issued between two writes
/// may run concurrently, so a read only has to be newer than the last write.
#[derive(Debug, Default)]
pub struct OrderChecker {
    buckets: Mutex<HashMap<Uuid, BucketState>>,
}

impl OrderChecker {
    /// Create a checker
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sources being tracked
    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Check whether no source is tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop tracking a source
    pub fn forget(&self, bucket: Uuid) {
        self.buckets.lock().remove(&bucket);
    }

    /// Check a token of an admitted read
    pub fn check_read(&self, token: &OrderToken) -> Result<()> {
        if token.is_ignored() {
            return Ok(());
        }
        let mut buckets = self.buckets.lock();
        let state = buckets.entry(token.bucket).or_default();
        if token.sequence <= state.last_write {
            return Err(Error::internal(format!(
                "{} admitted after write #{}",
                token, state.last_write
            )));
        }
        state.highest = state.highest.max(token.sequence);
        Ok(())
    }

    /// Check a token of an admitted write
    pub fn check_write(&self, token: &OrderToken) -> Result<()> {
        if token.is_ignored() {
            return Ok(());
        }
        let mut buckets = self.buckets.lock();
        let state = buckets.entry(token.bucket).or_default();
        if token.sequence <= state.highest {
            return Err(Error::internal(format!(
                "{} admitted after #{}",
                token, state.highest
            )));
        }
        state.last_write = token.sequence;
        state.highest = token.sequence;
        Ok(())
    }
}
