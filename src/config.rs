//! Configuration management for Pacer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{PacerError, Result};
use crate::ratelimit::{default_platforms, RateLimitConfig, DEFAULT_PLATFORM};
use crate::store::RetryPolicy;

/// Prefix for environment variable overrides, e.g. `PACER_STORE__URL`.
const ENV_PREFIX: &str = "PACER";

/// Main configuration for the Pacer service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacerConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Limiter behaviour shared by all platforms
    #[serde(default)]
    pub limiter: LimiterOptions,

    /// Seed limits per platform, including the mandatory `default` entry
    #[serde(default = "default_platforms")]
    pub platforms: BTreeMap<String, RateLimitConfig>,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            limiter: LimiterOptions::default(),
            platforms: default_platforms(),
        }
    }
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Connection attempts per call before giving up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Delay before the first reconnect, doubled per attempt
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound for a single reconnect delay
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Timeout applied to connection attempts and commands
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            connect_attempts: default_connect_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.connect_attempts,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    2000
}

fn default_command_timeout_ms() -> u64 {
    1000
}

/// Limiter behaviour shared by all platforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterOptions {
    /// Symmetric jitter applied to recommended delays, as a fraction of the base spacing
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,

    /// Default upper bound for `wait_for_availability`
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    /// Longest single sleep between availability polls
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u64,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            jitter_ratio: default_jitter_ratio(),
            max_wait_ms: default_max_wait_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
        }
    }
}

impl LimiterOptions {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }
}

fn default_jitter_ratio() -> f64 {
    0.3
}

fn default_max_wait_ms() -> u64 {
    5 * 60 * 1000
}

fn default_max_poll_interval_ms() -> u64 {
    30 * 1000
}

impl PacerConfig {
    /// Load configuration from an optional file, overlaid with `PACER_*`
    /// environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: PacerConfig = builder.build()?.try_deserialize()?;
        config.normalized().validated()
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PacerConfig = serde_yaml::from_str(yaml)
            .map_err(|e| PacerError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.normalized().validated()
    }

    /// Lowercase platform names and make sure a `default` entry exists.
    fn normalized(mut self) -> Self {
        self.platforms = self
            .platforms
            .into_iter()
            .map(|(name, limits)| (name.to_lowercase(), limits))
            .collect();

        if !self.platforms.contains_key(DEFAULT_PLATFORM) {
            let fallback = default_platforms()
                .remove(DEFAULT_PLATFORM)
                .unwrap_or_default();
            self.platforms.insert(DEFAULT_PLATFORM.to_string(), fallback);
        }

        self
    }

    fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }

    /// Check that every value the limiter divides by or sleeps on is usable.
    pub fn validate(&self) -> Result<()> {
        if self.store.connect_attempts == 0 {
            return Err(PacerError::Config(
                "store.connect_attempts must be at least 1".to_string(),
            ));
        }

        if !(0.0..1.0).contains(&self.limiter.jitter_ratio) {
            return Err(PacerError::Config(format!(
                "limiter.jitter_ratio must be in [0, 1), got {}",
                self.limiter.jitter_ratio
            )));
        }

        for (name, limits) in &self.platforms {
            if limits.max_requests == 0 {
                return Err(PacerError::Config(format!(
                    "platforms.{}.max_requests must be greater than zero",
                    name
                )));
            }
            if limits.window_ms == 0 {
                return Err(PacerError::Config(format!(
                    "platforms.{}.window_ms must be greater than zero",
                    name
                )));
            }
        }

        Ok(())
    }
}
