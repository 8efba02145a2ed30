//! Redis-backed counter store.
//!
//! Connects lazily on first use and caches one multiplexed connection shared
//! by every caller. Connection attempts are retried with capped exponential
//! backoff. Callers that need a connection while one is being established
//! join that attempt instead of starting their own, so an outage costs each
//! of them at most one retry cycle. Once the attempts are exhausted every
//! waiter fails with [`StoreError::Unavailable`] and the next call starts
//! over. A command that fails with an I/O error drops the cached connection
//! so the following call reconnects.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, ErrorKind, RedisError, RedisResult};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::backend::{CounterStore, StoreError, StoreResult, WriteBatch, WriteOp};
use crate::config::StoreConfig;
use crate::error::{PacerError, Result};

/// Keys fetched per SCAN round trip when deleting by prefix.
const SCAN_BATCH: usize = 200;

/// Capped exponential backoff between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total connection attempts per call, including the first.
    pub attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

type ConnectAttempt = Shared<BoxFuture<'static, std::result::Result<MultiplexedConnection, Arc<RedisError>>>>;

enum Link {
    Idle,
    Ready(MultiplexedConnection),
    /// A connect cycle is in flight; `generation` tells its waiters apart
    /// from a later cycle.
    Connecting {
        generation: u64,
        attempt: ConnectAttempt,
    },
}

/// A counter store backed by a shared Redis server.
pub struct RedisStore {
    client: Client,
    link: Mutex<Link>,
    generations: AtomicU64,
    retry: RetryPolicy,
    command_timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("retry", &self.retry)
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Create a store for the configured server. No connection is opened
    /// until the first command.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| PacerError::Config(format!("Invalid store URL: {}", e)))?;

        Ok(Self {
            client,
            link: Mutex::new(Link::Idle),
            generations: AtomicU64::new(0),
            retry: config.retry_policy(),
            command_timeout: config.command_timeout(),
        })
    }

    /// Round-trip a PING to verify the server is reachable.
    pub async fn ping(&self) -> StoreResult<()> {
        self.run("PING", |mut conn| async move {
            let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
            debug!(reply = %reply, "Counter store health check passed");
            Ok::<_, RedisError>(())
        })
        .await
    }

    /// The cached connection, or the outcome of the connect cycle that is
    /// in flight (starting one if none is).
    async fn connection(&self) -> StoreResult<MultiplexedConnection> {
        let (generation, attempt) = {
            let mut link = self.link.lock();
            match &*link {
                Link::Ready(conn) => return Ok(conn.clone()),
                Link::Connecting {
                    generation,
                    attempt,
                } => (*generation, attempt.clone()),
                Link::Idle => {
                    let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                    let attempt =
                        connect_with_retry(self.client.clone(), self.retry, self.command_timeout)
                            .boxed()
                            .shared();
                    *link = Link::Connecting {
                        generation,
                        attempt: attempt.clone(),
                    };
                    (generation, attempt)
                }
            }
        };

        let outcome = attempt.await;

        {
            let mut link = self.link.lock();
            let current = matches!(
                &*link,
                Link::Connecting { generation: g, .. } if *g == generation
            );
            if current {
                *link = match &outcome {
                    Ok(conn) => Link::Ready(conn.clone()),
                    Err(_) => Link::Idle,
                };
            }
        }

        outcome.map_err(|source| StoreError::Unavailable {
            attempts: self.retry.attempts,
            source,
        })
    }

    fn invalidate(&self) {
        let mut link = self.link.lock();
        if matches!(*link, Link::Ready(_)) {
            *link = Link::Idle;
            debug!("Dropped cached counter store connection");
        }
    }

    /// Run one command (or pipeline) against the shared connection with the
    /// command timeout applied.
    async fn run<T, F, Fut>(&self, target: &str, op: F) -> StoreResult<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.connection().await?;
        trace!(target_key = %target, "Running counter store command");

        match timeout(self.command_timeout, op(conn)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
                    self.invalidate();
                }
                Err(classify(target, e))
            }
            Err(_) => {
                self.invalidate();
                Err(StoreError::Timeout(self.command_timeout))
            }
        }
    }
}

/// One connect cycle: up to `retry.attempts` tries with backoff between them.
async fn connect_with_retry(
    client: Client,
    retry: RetryPolicy,
    attempt_timeout: Duration,
) -> std::result::Result<MultiplexedConnection, Arc<RedisError>> {
    let mut last_error = None;

    for attempt in 0..retry.attempts {
        if attempt > 0 {
            tokio::time::sleep(retry.delay_for(attempt - 1)).await;
        }

        match timeout(attempt_timeout, client.get_multiplexed_async_connection()).await {
            Ok(Ok(conn)) => {
                info!(attempt = attempt + 1, "Connected to counter store");
                return Ok(conn);
            }
            Ok(Err(e)) => {
                warn!(attempt = attempt + 1, error = %e, "Counter store connection attempt failed");
                last_error = Some(e);
            }
            Err(_) => {
                warn!(
                    attempt = attempt + 1,
                    timeout = ?attempt_timeout,
                    "Counter store connection attempt timed out"
                );
                last_error = Some(RedisError::from((
                    ErrorKind::IoError,
                    "connection attempt timed out",
                )));
            }
        }
    }

    Err(Arc::new(last_error.unwrap_or_else(|| {
        RedisError::from((ErrorKind::ClientError, "no connection attempts configured"))
    })))
}

/// Map a command error onto the store error taxonomy.
fn classify(target: &str, err: RedisError) -> StoreError {
    if err.kind() == ErrorKind::TypeError {
        StoreError::Protocol {
            key: target.to_string(),
            detail: err.to_string(),
        }
    } else {
        StoreError::Command(err)
    }
}

/// Decode a PTTL reply: `-2` means the key is absent, `-1` means it has no
/// expiry.
fn decode_pttl(ms: i64) -> Option<Duration> {
    u64::try_from(ms).ok().map(Duration::from_millis)
}

/// PEXPIRE and SET PX reject a zero TTL, so round up to one millisecond.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Escape glob metacharacters so a key prefix matches literally in SCAN.
fn escape_glob(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn build_pipeline(batch: &WriteBatch) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();

    for op in batch.ops() {
        match op {
            WriteOp::Incr { key, by } => {
                pipe.incr(key, *by).ignore();
            }
            WriteOp::Expire { key, ttl } => {
                let ms = i64::try_from(ttl_millis(*ttl)).unwrap_or(i64::MAX);
                pipe.pexpire(key, ms).ignore();
            }
            WriteOp::SetWithTtl { key, value, ttl } => {
                pipe.pset_ex(key, *value, ttl_millis(*ttl)).ignore();
            }
        }
    }

    pipe
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<i64>> {
        self.run(key, |mut conn| async move {
            let value: Option<i64> = conn.get(key).await?;
            Ok::<_, RedisError>(value)
        })
        .await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.run(key, |mut conn| async move {
            let ms: i64 = conn.pttl(key).await?;
            Ok::<_, RedisError>(decode_pttl(ms))
        })
        .await
    }

    async fn execute(&self, batch: WriteBatch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let pipe = build_pipeline(&batch);
        self.run("<batch>", |mut conn| async move {
            let result: RedisResult<()> = pipe.query_async(&mut conn).await;
            result
        })
        .await
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        self.run("<delete>", |mut conn| async move {
            let deleted: u64 = conn.del(keys).await?;
            Ok::<_, RedisError>(deleted)
        })
        .await
    }

    async fn delete_by_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let pattern = format!("{}*", escape_glob(prefix));

        self.run(prefix, |mut conn| async move {
            let mut cursor: u64 = 0;
            let mut deleted: u64 = 0;

            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await?;

                if !keys.is_empty() {
                    let removed: u64 = conn.del(keys.as_slice()).await?;
                    deleted += removed;
                }

                if next == 0 {
                    break;
                }
                cursor = next;
            }

            Ok::<_, RedisError>(deleted)
        })
        .await
    }
}
