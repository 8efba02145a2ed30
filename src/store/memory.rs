//! In-process counter store.
//!
//! Keeps counters in a [`DashMap`] with per-key expiry measured on the tokio
//! clock. State is not shared across processes, so this store suits single
//! instance deployments and tests. Expired entries are dropped when read, and
//! every few hundred write batches a sweep drops the ones nobody reads
//! again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::backend::{CounterStore, StoreError, StoreResult, WriteBatch, WriteOp};

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Write batches between sweeps of expired entries.
const SWEEP_INTERVAL: u64 = 256;

/// A counter store held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    offline: AtomicBool,
    /// Calls left before the store goes offline, when armed
    calls_until_offline: Mutex<Option<usize>>,
    batches: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Offline`] until
    /// switched back. Switching back also disarms [`fail_after`](Self::fail_after).
    pub fn set_offline(&self, offline: bool) {
        if !offline {
            *self.calls_until_offline.lock() = None;
        }
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Serve `calls` more calls, then go offline.
    pub fn fail_after(&self, calls: usize) {
        *self.calls_until_offline.lock() = Some(calls);
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Purged expired counters from memory store");
        }
        removed
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.is_offline() {
            return Err(StoreError::Offline);
        }

        let mut budget = self.calls_until_offline.lock();
        match *budget {
            Some(0) => {
                *budget = None;
                self.offline.store(true, Ordering::SeqCst);
                Err(StoreError::Offline)
            }
            Some(left) => {
                *budget = Some(left - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn live_entry(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        let entry = *self.entries.get(key)?;
        if entry.is_expired(now) {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry)
    }

    fn apply(&self, op: &WriteOp, now: Instant) {
        match op {
            WriteOp::Incr { key, by } => {
                let mut entry = self.entries.entry(key.clone()).or_insert(Entry {
                    value: 0,
                    expires_at: None,
                });
                if entry.is_expired(now) {
                    *entry = Entry {
                        value: 0,
                        expires_at: None,
                    };
                }
                entry.value += *by;
            }
            WriteOp::Expire { key, ttl } => {
                if let Some(mut entry) = self.entries.get_mut(key) {
                    if !entry.is_expired(now) {
                        entry.expires_at = Some(now + *ttl);
                    }
                }
            }
            WriteOp::SetWithTtl { key, value, ttl } => {
                self.entries.insert(
                    key.clone(),
                    Entry {
                        value: *value,
                        expires_at: Some(now + *ttl),
                    },
                );
            }
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        self.ensure_online()?;
        Ok(self.live_entry(key).map(|e| e.value))
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.ensure_online()?;
        let now = Instant::now();
        Ok(self
            .live_entry(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn execute(&self, batch: WriteBatch) -> StoreResult<()> {
        self.ensure_online()?;
        let now = Instant::now();
        trace!(ops = batch.len(), "Applying write batch to memory store");
        for op in batch.ops() {
            self.apply(op, now);
        }

        if self.batches.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.purge_expired();
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        self.ensure_online()?;
        let now = Instant::now();
        let mut deleted = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(key) {
                if !entry.is_expired(now) {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    async fn delete_by_prefix(&self, prefix: &str) -> StoreResult<u64> {
        self.ensure_online()?;
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        self.delete(&keys).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_absent_key_reads_as_none() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
        assert_eq!(store.ttl("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_creates_and_accumulates() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.incr("k", 1).incr("k", 2);
        store.execute(batch).await.unwrap();

        assert_eq!(store.get("k").await.unwrap(), Some(3));
        // INCR alone does not set an expiry
        assert_eq!(store.ttl("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_drops_key() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.incr("k", 1).expire("k", Duration::from_secs(10));
        store.execute(batch).await.unwrap();

        assert_eq!(store.ttl("k").await.unwrap(), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(store.ttl("k").await.unwrap(), Some(Duration::from_secs(6)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_incr_after_expiry_restarts_at_zero() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.incr("k", 5).expire("k", Duration::from_secs(1));
        store.execute(batch).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        let mut batch = WriteBatch::new();
        batch.incr("k", 1);
        store.execute(batch).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_expire_on_absent_key_is_noop() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.expire("ghost", Duration::from_secs(5));
        store.execute(batch).await.unwrap();
        assert_eq!(store.get("ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_counts_existing_keys_only() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.set_with_ttl("a", 1, Duration::from_secs(60));
        store.execute(batch).await.unwrap();

        let deleted = store
            .delete(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        // Deleting again is a no-op
        assert_eq!(store.delete(&["a".to_string()]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_by_prefix() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch
            .incr("ratelimit:alice:x:hourly", 1)
            .incr("ratelimit:alice:y:daily", 1)
            .incr("ratelimit:alicia:x:hourly", 1);
        store.execute(batch).await.unwrap();

        let deleted = store.delete_by_prefix("ratelimit:alice:").await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.get("ratelimit:alicia:x:hourly").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_offline_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_offline(true);

        assert_err!(store.get("k").await);
        assert_err!(store.ttl("k").await);
        assert_err!(store.execute(WriteBatch::new()).await);
        assert_err!(store.delete_by_prefix("k").await);

        store.set_offline(false);
        assert_ok!(store.get("k").await);
    }

    #[tokio::test]
    async fn test_fail_after_serves_then_goes_offline() {
        let store = MemoryStore::new();
        store.fail_after(2);

        assert_ok!(store.get("a").await);
        assert_ok!(store.ttl("a").await);
        assert_err!(store.get("a").await);
        assert!(store.is_offline());

        store.set_offline(false);
        assert_ok!(store.get("a").await);
        assert_ok!(store.get("a").await);
        assert_ok!(store.get("a").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_drops_unread_keys() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch
            .set_with_ttl("short", 1, Duration::from_secs(1))
            .set_with_ttl("long", 1, Duration::from_secs(60))
            .incr("forever", 1);
        store.execute(batch).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.entries.len(), 2);
        assert_eq!(store.purge_expired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_sweep_expired_keys_periodically() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.set_with_ttl("ratelimit:gone:x:cooldown", 1, Duration::from_secs(1));
        store.execute(batch).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        for _ in 1..SWEEP_INTERVAL - 1 {
            let mut batch = WriteBatch::new();
            batch.incr("live", 1);
            store.execute(batch).await.unwrap();
        }
        // Never read, so still held until the sweep
        assert_eq!(store.entries.len(), 2);

        let mut batch = WriteBatch::new();
        batch.incr("live", 1);
        store.execute(batch).await.unwrap();
        assert_eq!(store.entries.len(), 1);
        assert_eq!(store.get("live").await.unwrap(), Some(i64::try_from(SWEEP_INTERVAL).unwrap() - 1));
    }
}
