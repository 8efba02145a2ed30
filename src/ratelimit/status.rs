//! Read-only status snapshots and administrative resets.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use super::counter::CounterKey;
use super::limiter::{after, count, or_fail_open, RateLimiter};
use super::rules::{normalize_platform, DAILY_WINDOW};
use crate::error::Result;

/// Snapshot of one user's usage against one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRateLimitStatus {
    pub platform: String,
    pub hourly_count: u64,
    pub daily_count: u64,
    pub max_requests: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<u64>,
    pub window_reset_at: DateTime<Utc>,
    pub daily_reset_at: DateTime<Utc>,
    /// Whether a quota window (not a cooldown) is exhausted
    pub is_limited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl RateLimiter {
    /// Report current usage for `user_id` on `platform`.
    ///
    /// All reads run concurrently. Any read that fails resolves to its
    /// neutral default (zero count, full window, no cooldown).
    pub async fn get_user_status(&self, user_id: &str, platform: &str) -> UserRateLimitStatus {
        let limits = self.limits().get(platform);
        let now = Utc::now();
        let store = self.store();

        let hourly_key = CounterKey::hourly(user_id, platform).to_string();
        let daily_key = CounterKey::daily(user_id, platform).to_string();
        let cooldown_key = CounterKey::cooldown(user_id, platform).to_string();

        let (hourly, daily, cooldown, hourly_ttl, daily_ttl) = tokio::join!(
            store.get(&hourly_key),
            store.get(&daily_key),
            store.get(&cooldown_key),
            store.ttl(&hourly_key),
            store.ttl(&daily_key)
        );

        let hourly_count = count(or_fail_open(hourly, None, &hourly_key));
        let daily_count = count(or_fail_open(daily, None, &daily_key));
        let hourly_ttl = or_fail_open(hourly_ttl, None, &hourly_key).unwrap_or_else(|| limits.window());
        let daily_ttl = or_fail_open(daily_ttl, None, &daily_key).unwrap_or(DAILY_WINDOW);

        let now_ms = now.timestamp_millis();
        let cooldown_until = or_fail_open(cooldown, None, &cooldown_key)
            .filter(|until_ms| *until_ms > now_ms)
            .and_then(DateTime::<Utc>::from_timestamp_millis);

        let is_limited = hourly_count >= limits.max_requests
            || limits
                .daily_limit
                .is_some_and(|daily_limit| daily_count >= daily_limit);

        UserRateLimitStatus {
            platform: normalize_platform(platform),
            hourly_count,
            daily_count,
            max_requests: limits.max_requests,
            daily_limit: limits.daily_limit,
            window_reset_at: after(now, hourly_ttl),
            daily_reset_at: after(now, daily_ttl),
            is_limited,
            cooldown_until,
        }
    }

    /// Report usage for `user_id` on every registered platform except
    /// `default`, keyed by platform name.
    pub async fn get_all_platform_status(
        &self,
        user_id: &str,
    ) -> BTreeMap<String, UserRateLimitStatus> {
        let platforms = self.limits().platforms();
        let statuses = join_all(
            platforms
                .iter()
                .map(|platform| self.get_user_status(user_id, platform)),
        )
        .await;

        platforms.into_iter().zip(statuses).collect()
    }

    /// Delete the counters and cooldown for one user and platform.
    ///
    /// Store errors are returned, not swallowed. Returns how many keys
    /// existed.
    pub async fn reset_user_limits(&self, user_id: &str, platform: &str) -> Result<u64> {
        let keys: Vec<String> = CounterKey::all(user_id, platform)
            .iter()
            .map(ToString::to_string)
            .collect();

        let deleted = self.store().delete(&keys).await.map_err(|e| {
            warn!(user_id = %user_id, platform = %platform, error = %e, "Failed to reset user limits");
            e
        })?;

        info!(user_id = %user_id, platform = %platform, deleted, "Reset user limits");
        Ok(deleted)
    }

    /// Delete every counter and cooldown for one user across all platforms.
    ///
    /// Store errors are returned, not swallowed. Returns how many keys
    /// existed.
    pub async fn reset_all_user_limits(&self, user_id: &str) -> Result<u64> {
        let prefix = CounterKey::user_prefix(user_id);

        let deleted = self.store().delete_by_prefix(&prefix).await.map_err(|e| {
            warn!(user_id = %user_id, error = %e, "Failed to reset all user limits");
            e
        })?;

        info!(user_id = %user_id, deleted, "Reset all user limits");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PacerError;
    use crate::ratelimit::{PlatformLimits, Reason};
    use crate::store::{CounterStore, MemoryStore};
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    fn limiter() -> (RateLimiter, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone(), Arc::new(PlatformLimits::default()));
        (limiter, store)
    }

    #[tokio::test]
    async fn test_status_for_new_user() {
        let (limiter, _) = limiter();

        let status = limiter.get_user_status("u1", "LinkedIn").await;
        assert_eq!(status.platform, "linkedin");
        assert_eq!(status.hourly_count, 0);
        assert_eq!(status.daily_count, 0);
        assert_eq!(status.max_requests, 10);
        assert_eq!(status.daily_limit, Some(50));
        assert!(!status.is_limited);
        assert_eq!(status.cooldown_until, None);
    }

    #[tokio::test]
    async fn test_status_after_records() {
        let (limiter, _) = limiter();
        let before = Utc::now();

        limiter.record_request("u1", "linkedin").await;
        limiter.record_request("u1", "linkedin").await;

        let status = limiter.get_user_status("u1", "linkedin").await;
        assert_eq!(status.hourly_count, 2);
        assert_eq!(status.daily_count, 2);
        assert!(!status.is_limited);

        let cooldown_until = status.cooldown_until.unwrap();
        assert!(cooldown_until > before + chrono::Duration::minutes(4));
        assert!(status.window_reset_at > before + chrono::Duration::minutes(59));
        assert!(status.daily_reset_at > before + chrono::Duration::hours(23));
    }

    #[tokio::test]
    async fn test_status_is_limited_by_hourly_window() {
        let (limiter, _) = limiter();

        for _ in 0..30 {
            limiter.record_request("u1", "reddit").await;
        }

        let status = limiter.get_user_status("u1", "reddit").await;
        assert!(status.is_limited);
        assert_eq!(status.hourly_count, 30);
    }

    #[tokio::test]
    async fn test_cooldown_alone_is_not_limited() {
        let (limiter, _) = limiter();

        limiter.record_request("u1", "twitter").await;

        let status = limiter.get_user_status("u1", "twitter").await;
        assert!(status.cooldown_until.is_some());
        assert!(!status.is_limited);
    }

    #[tokio::test]
    async fn test_status_with_store_down_uses_defaults() {
        let (limiter, store) = limiter();
        limiter.record_request("u1", "linkedin").await;
        store.set_offline(true);

        let before = Utc::now();
        let status = limiter.get_user_status("u1", "linkedin").await;
        assert_eq!(status.hourly_count, 0);
        assert_eq!(status.daily_count, 0);
        assert_eq!(status.cooldown_until, None);
        assert!(!status.is_limited);
        assert!(status.window_reset_at >= before + chrono::Duration::hours(1));
    }

    #[tokio::test]
    async fn test_all_platform_status_excludes_default() {
        let (limiter, _) = limiter();
        limiter.record_request("u1", "reddit").await;

        let statuses = limiter.get_all_platform_status("u1").await;
        assert_eq!(statuses.len(), 5);
        assert!(!statuses.contains_key("default"));
        assert_eq!(statuses["reddit"].hourly_count, 1);
        assert_eq!(statuses["linkedin"].hourly_count, 0);
    }

    #[tokio::test]
    async fn test_reset_restores_new_user_state() {
        let (limiter, _) = limiter();

        limiter.record_request("u1", "linkedin").await;
        assert!(!limiter.check_rate_limit("u1", "linkedin").await.allowed);

        let deleted = assert_ok!(limiter.reset_user_limits("u1", "linkedin").await);
        assert_eq!(deleted, 3);

        let result = limiter.check_rate_limit("u1", "linkedin").await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 9);
        assert_eq!(result.daily_remaining, Some(49));
        assert_eq!(result.reason, None);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let (limiter, _) = limiter();

        assert_eq!(assert_ok!(limiter.reset_user_limits("ghost", "reddit").await), 0);
        assert_eq!(assert_ok!(limiter.reset_user_limits("ghost", "reddit").await), 0);
        assert_eq!(assert_ok!(limiter.reset_all_user_limits("ghost").await), 0);
    }

    #[tokio::test]
    async fn test_reset_only_touches_one_platform() {
        let (limiter, _) = limiter();

        limiter.record_request("u1", "reddit").await;
        limiter.record_request("u1", "twitter").await;

        limiter.reset_user_limits("u1", "reddit").await.unwrap();

        assert_eq!(limiter.get_user_status("u1", "reddit").await.hourly_count, 0);
        assert_eq!(limiter.get_user_status("u1", "twitter").await.hourly_count, 1);
    }

    #[tokio::test]
    async fn test_reset_all_clears_every_platform_for_user() {
        let (limiter, store) = limiter();

        limiter.record_request("u1", "reddit").await;
        limiter.record_request("u1", "linkedin").await;
        limiter.record_request("u2", "reddit").await;

        let deleted = limiter.reset_all_user_limits("u1").await.unwrap();
        // reddit: hourly + daily; linkedin: hourly + daily + cooldown
        assert_eq!(deleted, 5);

        let statuses = limiter.get_all_platform_status("u1").await;
        assert!(statuses.values().all(|s| s.hourly_count == 0));
        assert_eq!(
            store.get("ratelimit:u2:reddit:hourly").await.unwrap(),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_reset_surfaces_store_errors() {
        let (limiter, store) = limiter();
        store.set_offline(true);

        let err = assert_err!(limiter.reset_user_limits("u1", "reddit").await);
        assert!(matches!(err, PacerError::Store(_)));
        assert_err!(limiter.reset_all_user_limits("u1").await);
    }

    #[tokio::test]
    async fn test_check_after_reset_all_is_fresh() {
        let (limiter, _) = limiter();

        limiter.record_request("u1", "instagram").await;
        assert_eq!(
            limiter.check_rate_limit("u1", "instagram").await.reason,
            Some(Reason::CooldownActive)
        );

        limiter.reset_all_user_limits("u1").await.unwrap();
        let result = limiter.check_rate_limit("u1", "instagram").await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 19);
        assert!(result.reset_time <= Utc::now() + chrono::Duration::hours(1));
    }
}
