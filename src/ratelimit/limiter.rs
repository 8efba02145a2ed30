//! Core rate limiter: admission checks and request recording.
//!
//! Checks are read-only and advisory; recording happens separately once the
//! caller has performed the gated action. Neither path ever fails the
//! caller: a store error turns a check into an allow and a record into a
//! logged no-op.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tracing::{debug, trace, warn};

use super::counter::CounterKey;
use super::rules::{LimitOverride, PlatformLimits, RateLimitConfig, DAILY_WINDOW};
use crate::config::{LimiterOptions, PacerConfig};
use crate::store::{CounterStore, StoreResult, WriteBatch};

/// Why a check did not grant a plain allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    CooldownActive,
    HourlyLimitReached,
    DailyLimitReached,
    /// The store could not be read; the check was allowed anyway.
    StoreUnavailable,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::CooldownActive => "cooldown active",
            Reason::HourlyLimitReached => "hourly limit reached",
            Reason::DailyLimitReached => "daily limit reached",
            Reason::StoreUnavailable => "store unavailable, fail-open",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Reason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Actions left in the current window after the one being checked
    pub remaining: u64,
    /// When the governing window or cooldown ends
    pub reset_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
}

impl RateLimitResult {
    fn denied(reason: Reason, retry_after: Duration, now: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_time: after(now, retry_after),
            retry_after_ms: Some(millis(retry_after)),
            daily_remaining: None,
            reason: Some(reason),
        }
    }

    /// The verdict used when the store could not be consulted.
    fn fail_open(limits: &RateLimitConfig, now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            remaining: limits.max_requests.saturating_sub(1),
            reset_time: after(now, limits.window()),
            retry_after_ms: None,
            daily_remaining: limits.daily_limit.map(|d| d.saturating_sub(1)),
            reason: Some(Reason::StoreUnavailable),
        }
    }
}

/// `now + duration`, saturating at `now` if the sum is unrepresentable.
pub(crate) fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(now)
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Stored counts are never negative; treat anything else as absent.
pub(crate) fn count(value: Option<i64>) -> u64 {
    value.and_then(|v| u64::try_from(v).ok()).unwrap_or(0)
}

/// Resolve a store read to a neutral default on error.
///
/// This is the single place where read failures on the steady-state paths
/// are converted into fail-open values.
pub(crate) fn or_fail_open<T>(result: StoreResult<T>, fallback: T, key: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!(key = %key, error = %e, "Counter store read failed, using neutral default");
            fallback
        }
    }
}

/// Per-user, per-platform rate limiter over a shared counter store.
///
/// This struct is cheap to clone and safe to share across tasks. It keeps no
/// counts in process: every check and record round-trips to the store.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    limits: Arc<PlatformLimits>,
    options: LimiterOptions,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("limits", &self.limits)
            .field("options", &self.options)
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter with default options.
    pub fn new(store: Arc<dyn CounterStore>, limits: Arc<PlatformLimits>) -> Self {
        Self::with_options(store, limits, LimiterOptions::default())
    }

    pub fn with_options(
        store: Arc<dyn CounterStore>,
        limits: Arc<PlatformLimits>,
        options: LimiterOptions,
    ) -> Self {
        Self {
            store,
            limits,
            options,
        }
    }

    /// Create a rate limiter seeded from loaded configuration.
    pub fn from_config(config: &PacerConfig, store: Arc<dyn CounterStore>) -> Self {
        let limits = Arc::new(PlatformLimits::new(config.platforms.clone()));
        Self::with_options(store, limits, config.limiter.clone())
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn limits(&self) -> &Arc<PlatformLimits> {
        &self.limits
    }

    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    /// Resolve the limits for a platform, falling back to `default`.
    pub fn get_platform_limits(&self, platform: &str) -> RateLimitConfig {
        self.limits.get(platform)
    }

    /// Merge a partial config into a seeded platform until restart.
    pub fn update_platform_limits(&self, platform: &str, partial: LimitOverride) -> bool {
        self.limits.update(platform, partial)
    }

    /// Decide whether `user_id` may act against `platform` now.
    ///
    /// Cooldown is evaluated first, then the hourly window, then the daily
    /// window when one is configured. If the store cannot be read the check
    /// is allowed with [`Reason::StoreUnavailable`].
    pub async fn check_rate_limit(&self, user_id: &str, platform: &str) -> RateLimitResult {
        let limits = self.limits.get(platform);
        let now = Utc::now();

        trace!(user_id = %user_id, platform = %platform, "Checking rate limit");

        match self.evaluate(user_id, platform, &limits, now).await {
            Ok(result) => {
                if let Some(reason) = result.reason.filter(|_| !result.allowed) {
                    debug!(
                        user_id = %user_id,
                        platform = %platform,
                        reason = %reason,
                        retry_after_ms = ?result.retry_after_ms,
                        "Rate limit check denied"
                    );
                }
                result
            }
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    platform = %platform,
                    error = %e,
                    "Counter store unavailable, failing open"
                );
                RateLimitResult::fail_open(&limits, now)
            }
        }
    }

    async fn evaluate(
        &self,
        user_id: &str,
        platform: &str,
        limits: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> StoreResult<RateLimitResult> {
        let now_ms = now.timestamp_millis();

        let cooldown_key = CounterKey::cooldown(user_id, platform).to_string();
        if let Some(until_ms) = self.store.get(&cooldown_key).await? {
            if until_ms > now_ms {
                let wait = Duration::from_millis(until_ms.abs_diff(now_ms));
                return Ok(RateLimitResult::denied(Reason::CooldownActive, wait, now));
            }
        }

        let hourly_key = CounterKey::hourly(user_id, platform).to_string();
        let hourly = count(self.store.get(&hourly_key).await?);
        if hourly >= limits.max_requests {
            let wait = self
                .store
                .ttl(&hourly_key)
                .await?
                .unwrap_or_else(|| limits.window());
            return Ok(RateLimitResult::denied(Reason::HourlyLimitReached, wait, now));
        }

        let mut daily_remaining = None;
        if let Some(daily_limit) = limits.daily_limit {
            let daily_key = CounterKey::daily(user_id, platform).to_string();
            let daily = count(self.store.get(&daily_key).await?);
            if daily >= daily_limit {
                let wait = self.store.ttl(&daily_key).await?.unwrap_or(DAILY_WINDOW);
                let mut result = RateLimitResult::denied(Reason::DailyLimitReached, wait, now);
                result.daily_remaining = Some(0);
                return Ok(result);
            }
            daily_remaining = Some(daily_limit - daily - 1);
        }

        // An absent hourly key means the window starts with the next action.
        let window_left = if hourly == 0 {
            limits.window()
        } else {
            self.store
                .ttl(&hourly_key)
                .await?
                .unwrap_or_else(|| limits.window())
        };

        Ok(RateLimitResult {
            allowed: true,
            remaining: limits.max_requests - hourly - 1,
            reset_time: after(now, window_left),
            retry_after_ms: None,
            daily_remaining,
            reason: None,
        })
    }

    /// Record that `user_id` performed one gated action against `platform`.
    ///
    /// Increments both windows, refreshing their TTLs so each window rolls
    /// forward from the latest action, and starts a new cooldown when the
    /// platform has one. Store errors are logged and swallowed.
    pub async fn record_request(&self, user_id: &str, platform: &str) {
        let limits = self.limits.get(platform);
        let batch = record_batch(user_id, platform, &limits, Utc::now());

        match self.store.execute(batch).await {
            Ok(()) => trace!(user_id = %user_id, platform = %platform, "Recorded request"),
            Err(e) => warn!(
                user_id = %user_id,
                platform = %platform,
                error = %e,
                "Failed to record request, counters not updated"
            ),
        }
    }
}

/// Writes for one recorded action.
///
/// The daily counter is maintained even when the platform has no daily
/// limit so that status reports always carry a daily count.
fn record_batch(
    user_id: &str,
    platform: &str,
    limits: &RateLimitConfig,
    now: DateTime<Utc>,
) -> WriteBatch {
    let hourly_key = CounterKey::hourly(user_id, platform).to_string();
    let daily_key = CounterKey::daily(user_id, platform).to_string();

    let mut batch = WriteBatch::new();
    batch
        .incr(hourly_key.as_str(), 1)
        .expire(hourly_key, limits.window())
        .incr(daily_key.as_str(), 1)
        .expire(daily_key, DAILY_WINDOW);

    if let Some(cooldown) = limits.cooldown() {
        let until = after(now, cooldown).timestamp_millis();
        batch.set_with_ttl(
            CounterKey::cooldown(user_id, platform).to_string(),
            until,
            cooldown,
        );
    }

    batch
}
