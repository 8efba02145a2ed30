//! Request spacing recommendations and bounded waiting.

use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, Instant};
use tracing::debug;

use super::limiter::{millis, RateLimiter};
use super::rules::RateLimitConfig;

/// Shortest sleep between availability polls.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Spacing that spreads `max_requests` evenly across the window, jittered by
/// up to `±jitter_ratio` of itself and never below the platform's cooldown.
pub(crate) fn optimal_delay<R: Rng + ?Sized>(
    limits: &RateLimitConfig,
    jitter_ratio: f64,
    rng: &mut R,
) -> u64 {
    let base = limits.window_ms as f64 / limits.max_requests as f64;
    let jitter = if jitter_ratio > 0.0 {
        rng.gen_range(-jitter_ratio..=jitter_ratio)
    } else {
        0.0
    };

    let delay = (base * (1.0 + jitter)).max(0.0).round() as u64;
    let floor = limits.cooldown().map(millis).unwrap_or(0);
    delay.max(floor)
}

impl RateLimiter {
    /// Recommended pause in milliseconds before the next action on
    /// `platform`.
    pub fn get_optimal_delay(&self, platform: &str) -> u64 {
        let limits = self.limits().get(platform);
        optimal_delay(&limits, self.options().jitter_ratio, &mut rand::thread_rng())
    }

    /// Poll until `user_id` may act on `platform`, or until `max_wait`
    /// (default from [`LimiterOptions`](crate::config::LimiterOptions))
    /// has elapsed.
    ///
    /// Sleeps for the reported retry delay between polls, capped at the
    /// configured poll interval and at whatever is left of `max_wait`, so the
    /// call never outlives its bound. Returns `false` on timeout. To cancel
    /// earlier, drop the returned future.
    pub async fn wait_for_availability(
        &self,
        user_id: &str,
        platform: &str,
        max_wait: Option<Duration>,
    ) -> bool {
        let max_wait = max_wait.unwrap_or_else(|| self.options().max_wait());
        let max_poll = self.options().max_poll_interval().max(MIN_POLL_INTERVAL);
        let started = Instant::now();

        loop {
            let result = self.check_rate_limit(user_id, platform).await;
            if result.allowed {
                return true;
            }

            let budget = max_wait.saturating_sub(started.elapsed());
            if budget.is_zero() {
                debug!(user_id = %user_id, platform = %platform, "Gave up waiting for availability");
                return false;
            }

            let pause = result
                .retry_after_ms
                .map(Duration::from_millis)
                .unwrap_or(MIN_POLL_INTERVAL)
                .clamp(MIN_POLL_INTERVAL, max_poll)
                .min(budget);

            debug!(
                user_id = %user_id,
                platform = %platform,
                pause_ms = millis(pause),
                elapsed_ms = millis(started.elapsed()),
                "Waiting for rate limit availability"
            );
            sleep(pause).await;

            if started.elapsed() >= max_wait {
                debug!(user_id = %user_id, platform = %platform, "Gave up waiting for availability");
                return false;
            }
        }
    }
}
