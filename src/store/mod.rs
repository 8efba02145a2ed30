//! Counter store clients.
//!
//! This module holds the adapters over the key-value backend that keeps
//! per-user counters and cooldown markers. The shared `RedisStore` keeps
//! multiple service instances consistent with each other; the `MemoryStore`
//! offers the same TTL semantics inside a single process.

mod backend;
mod memory;
mod redis;

pub use self::backend::{CounterStore, StoreError, StoreResult, WriteBatch, WriteOp};
pub use self::memory::MemoryStore;
pub use self::redis::{RedisStore, RetryPolicy};
