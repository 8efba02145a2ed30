//! Counter store trait for abstracting the shared backend and local implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by a counter store.
///
/// Every backend failure is classified into one of these variants before it
/// leaves the store layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached after the configured connection attempts.
    #[error("store unavailable after {attempts} connection attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: Arc<redis::RedisError>,
    },

    /// A command did not complete within the configured timeout.
    #[error("store command timed out after {0:?}")]
    Timeout(Duration),

    /// The backend rejected or failed a command.
    #[error("store command failed: {0}")]
    Command(#[from] redis::RedisError),

    /// The backend returned a value that does not fit the counter model.
    #[error("unexpected value for key {key}: {detail}")]
    Protocol { key: String, detail: String },

    /// The store has been switched offline.
    #[error("store is offline")]
    Offline,
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A single write within a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Increment the integer at `key` by `by`, creating it at zero if absent.
    Incr { key: String, by: i64 },
    /// Set the time-to-live of `key`.
    Expire { key: String, ttl: Duration },
    /// Overwrite `key` with `value` and the given time-to-live.
    SetWithTtl { key: String, value: i64, ttl: Duration },
}

/// An ordered group of writes sent to the store in one round trip.
///
/// Stores apply the batch with the strongest grouping they offer (a
/// MULTI/EXEC pipeline for Redis), which is atomic in intent but not a
/// transaction across reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&mut self, key: impl Into<String>, by: i64) -> &mut Self {
        self.ops.push(WriteOp::Incr { key: key.into(), by });
        self
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.ops.push(WriteOp::Expire { key: key.into(), ttl });
        self
    }

    pub fn set_with_ttl(&mut self, key: impl Into<String>, value: i64, ttl: Duration) -> &mut Self {
        self.ops.push(WriteOp::SetWithTtl {
            key: key.into(),
            value,
            ttl,
        });
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Trait for counter store implementations.
///
/// This trait abstracts over the shared `RedisStore` and the in-process
/// `MemoryStore` so the rate limiter can work with either. Implementations
/// never panic on backend failure; they return a [`StoreError`].
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read the integer stored at `key`. An absent key yields `None`.
    async fn get(&self, key: &str) -> StoreResult<Option<i64>>;

    /// Remaining time-to-live of `key`.
    ///
    /// Returns `None` when the key is absent or has no expiry.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Apply all writes in `batch` in one round trip.
    async fn execute(&self, batch: WriteBatch) -> StoreResult<()>;

    /// Delete the given keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    /// Delete every key starting with `prefix`, returning how many existed.
    async fn delete_by_prefix(&self, prefix: &str) -> StoreResult<u64>;
}
