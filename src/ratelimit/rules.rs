//! Per-platform limit configuration and lookup.
//!
//! Seed limits are fixed when the registry is built. Runtime changes go into
//! a separate override layer that is merged over the seed on every lookup, so
//! the seed table itself is never mutated and a restart reverts to it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the entry used for any platform that is not registered.
pub const DEFAULT_PLATFORM: &str = "default";

/// Length of the daily window.
pub const DAILY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Limits applied to one platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RateLimitConfig {
    /// Maximum recorded actions within one rolling window
    pub max_requests: u64,
    /// Length of the rolling window in milliseconds
    pub window_ms: u64,
    /// Optional cap on actions per rolling day
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<u64>,
    /// Optional minimum spacing between consecutive actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_minutes: Option<u64>,
}

impl RateLimitConfig {
    pub const fn new(max_requests: u64, window_ms: u64) -> Self {
        Self {
            max_requests,
            window_ms,
            daily_limit: None,
            cooldown_minutes: None,
        }
    }

    pub const fn with_daily_limit(mut self, daily_limit: u64) -> Self {
        self.daily_limit = Some(daily_limit);
        self
    }

    pub const fn with_cooldown_minutes(mut self, minutes: u64) -> Self {
        self.cooldown_minutes = Some(minutes);
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// The configured cooldown, if any. A zero cooldown counts as none.
    pub fn cooldown(&self) -> Option<Duration> {
        self.cooldown_minutes
            .filter(|m| *m > 0)
            .map(|m| Duration::from_secs(m * 60))
    }

    /// Apply the set fields of `partial` over this config.
    pub fn merged(&self, partial: &LimitOverride) -> Self {
        Self {
            max_requests: partial.max_requests.unwrap_or(self.max_requests),
            window_ms: partial.window_ms.unwrap_or(self.window_ms),
            daily_limit: partial.daily_limit.or(self.daily_limit),
            cooldown_minutes: partial.cooldown_minutes.or(self.cooldown_minutes),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(60, HOUR_MS)
    }
}

const HOUR_MS: u64 = 60 * 60 * 1000;

/// Built-in seed limits.
pub fn default_platforms() -> BTreeMap<String, RateLimitConfig> {
    [
        (
            "linkedin",
            RateLimitConfig::new(10, HOUR_MS)
                .with_daily_limit(50)
                .with_cooldown_minutes(5),
        ),
        (
            "twitter",
            RateLimitConfig::new(50, HOUR_MS)
                .with_daily_limit(300)
                .with_cooldown_minutes(1),
        ),
        (
            "instagram",
            RateLimitConfig::new(20, HOUR_MS)
                .with_daily_limit(100)
                .with_cooldown_minutes(3),
        ),
        (
            "facebook",
            RateLimitConfig::new(25, HOUR_MS)
                .with_daily_limit(150)
                .with_cooldown_minutes(2),
        ),
        ("reddit", RateLimitConfig::new(30, HOUR_MS).with_daily_limit(200)),
        (DEFAULT_PLATFORM, RateLimitConfig::default()),
    ]
    .into_iter()
    .map(|(name, limits)| (name.to_string(), limits))
    .collect()
}

/// A partial config merged over a platform's seed limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverride {
    #[serde(default)]
    pub max_requests: Option<u64>,
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub daily_limit: Option<u64>,
    #[serde(default)]
    pub cooldown_minutes: Option<u64>,
}

impl LimitOverride {
    /// Combine two overrides; fields set in `newer` win.
    fn overlaid_with(self, newer: LimitOverride) -> Self {
        Self {
            max_requests: newer.max_requests.or(self.max_requests),
            window_ms: newer.window_ms.or(self.window_ms),
            daily_limit: newer.daily_limit.or(self.daily_limit),
            cooldown_minutes: newer.cooldown_minutes.or(self.cooldown_minutes),
        }
    }

    /// Drop fields that would break the strictly-positive invariant.
    fn sanitized(mut self, platform: &str) -> Self {
        if self.max_requests == Some(0) {
            warn!(platform = %platform, "Ignoring override with zero max_requests");
            self.max_requests = None;
        }
        if self.window_ms == Some(0) {
            warn!(platform = %platform, "Ignoring override with zero window_ms");
            self.window_ms = None;
        }
        self
    }
}

/// Canonical form of a platform name.
pub fn normalize_platform(platform: &str) -> String {
    platform.trim().to_lowercase()
}

/// Registry of per-platform limits with a `default` fallback.
#[derive(Debug)]
pub struct PlatformLimits {
    seed: BTreeMap<String, RateLimitConfig>,
    overrides: RwLock<HashMap<String, LimitOverride>>,
}

impl PlatformLimits {
    /// Build a registry from seed limits. Names are lowercased and a missing
    /// `default` entry is filled from the built-in table.
    pub fn new(seed: BTreeMap<String, RateLimitConfig>) -> Self {
        let mut seed: BTreeMap<String, RateLimitConfig> = seed
            .into_iter()
            .map(|(name, limits)| (normalize_platform(&name), limits))
            .collect();
        seed.entry(DEFAULT_PLATFORM.to_string()).or_default();

        Self {
            seed,
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve the limits for a platform, case-insensitively.
    ///
    /// Unregistered platforms resolve to the `default` entry.
    pub fn get(&self, platform: &str) -> RateLimitConfig {
        let name = normalize_platform(platform);
        let (resolved, seed) = match self.seed.get(&name) {
            Some(seed) => (name, *seed),
            None => {
                debug!(platform = %platform, "Unregistered platform, using default limits");
                let seed = self
                    .seed
                    .get(DEFAULT_PLATFORM)
                    .copied()
                    .unwrap_or_default();
                (DEFAULT_PLATFORM.to_string(), seed)
            }
        };

        match self.overrides.read().get(&resolved) {
            Some(partial) => seed.merged(partial),
            None => seed,
        }
    }

    /// Merge a partial config into a seeded platform for the lifetime of
    /// this process.
    ///
    /// Returns `false` and changes nothing if the platform was never seeded.
    pub fn update(&self, platform: &str, partial: LimitOverride) -> bool {
        let name = normalize_platform(platform);
        if !self.seed.contains_key(&name) {
            debug!(platform = %platform, "Ignoring override for unregistered platform");
            return false;
        }

        let partial = partial.sanitized(&name);
        let mut overrides = self.overrides.write();
        let merged = overrides
            .get(&name)
            .copied()
            .unwrap_or_default()
            .overlaid_with(partial);
        overrides.insert(name.clone(), merged);

        info!(platform = %name, overrides = ?merged, "Updated platform limits");
        true
    }

    /// Registered platform names, excluding `default`.
    pub fn platforms(&self) -> Vec<String> {
        self.seed
            .keys()
            .filter(|name| name.as_str() != DEFAULT_PLATFORM)
            .cloned()
            .collect()
    }

    pub fn is_registered(&self, platform: &str) -> bool {
        self.seed.contains_key(&normalize_platform(platform))
    }
}

impl Default for PlatformLimits {
    fn default() -> Self {
        Self::new(default_platforms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let limits = PlatformLimits::default();
        let expected = limits.get("linkedin");
        assert_eq!(limits.get("LinkedIn"), expected);
        assert_eq!(limits.get("  LINKEDIN "), expected);
        assert_eq!(expected.max_requests, 10);
        assert_eq!(expected.daily_limit, Some(50));
    }

    #[test]
    fn test_unknown_platform_uses_default() {
        let limits = PlatformLimits::default();
        let default = limits.get(DEFAULT_PLATFORM);
        assert_eq!(limits.get("mastodon"), default);
        assert_eq!(limits.get("MASTODON"), default);
        assert_eq!(limits.get(""), default);
    }

    #[test]
    fn test_missing_default_seed_is_filled() {
        let mut seed = BTreeMap::new();
        seed.insert("Reddit".to_string(), RateLimitConfig::new(5, 1000));
        let limits = PlatformLimits::new(seed);

        assert!(limits.is_registered("reddit"));
        assert!(limits.is_registered(DEFAULT_PLATFORM));
        assert_eq!(limits.get("unknown"), RateLimitConfig::default());
    }

    #[test]
    fn test_update_merges_partial_config() {
        let limits = PlatformLimits::default();
        let applied = limits.update(
            "LinkedIn",
            LimitOverride {
                max_requests: Some(3),
                ..Default::default()
            },
        );
        assert!(applied);

        let updated = limits.get("linkedin");
        assert_eq!(updated.max_requests, 3);
        // Untouched fields keep their seed values
        assert_eq!(updated.window_ms, HOUR_MS);
        assert_eq!(updated.daily_limit, Some(50));
        assert_eq!(updated.cooldown_minutes, Some(5));
    }

    #[test]
    fn test_successive_updates_accumulate() {
        let limits = PlatformLimits::default();
        limits.update(
            "twitter",
            LimitOverride {
                max_requests: Some(7),
                ..Default::default()
            },
        );
        limits.update(
            "twitter",
            LimitOverride {
                cooldown_minutes: Some(0),
                ..Default::default()
            },
        );

        let updated = limits.get("twitter");
        assert_eq!(updated.max_requests, 7);
        assert_eq!(updated.cooldown_minutes, Some(0));
        assert_eq!(updated.cooldown(), None);
    }

    #[test]
    fn test_update_unregistered_platform_is_noop() {
        let limits = PlatformLimits::default();
        let applied = limits.update(
            "mastodon",
            LimitOverride {
                max_requests: Some(1),
                ..Default::default()
            },
        );
        assert!(!applied);
        assert_eq!(limits.get("mastodon"), RateLimitConfig::default());
    }

    #[test]
    fn test_zero_override_fields_are_ignored() {
        let limits = PlatformLimits::default();
        limits.update(
            "reddit",
            LimitOverride {
                max_requests: Some(0),
                window_ms: Some(0),
                daily_limit: Some(0),
                ..Default::default()
            },
        );

        let updated = limits.get("reddit");
        assert_eq!(updated.max_requests, 30);
        assert_eq!(updated.window_ms, HOUR_MS);
        assert_eq!(updated.daily_limit, Some(0));
    }

    #[test]
    fn test_platforms_excludes_default() {
        let limits = PlatformLimits::default();
        let platforms = limits.platforms();
        assert!(platforms.contains(&"linkedin".to_string()));
        assert!(!platforms.contains(&DEFAULT_PLATFORM.to_string()));
        assert_eq!(platforms.len(), 5);
    }

    #[test]
    fn test_cooldown_duration() {
        let limits = RateLimitConfig::new(10, HOUR_MS).with_cooldown_minutes(5);
        assert_eq!(limits.cooldown(), Some(Duration::from_secs(300)));
        assert_eq!(RateLimitConfig::new(10, HOUR_MS).cooldown(), None);
    }

    #[test]
    fn test_parse_platform_yaml() {
        let yaml = r#"
max_requests: 10
window_ms: 3600000
cooldown_minutes: 5
"#;
        let limits: RateLimitConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(limits.max_requests, 10);
        assert_eq!(limits.daily_limit, None);
        assert_eq!(limits.cooldown_minutes, Some(5));
    }
}
