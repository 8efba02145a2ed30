//! Counter keys and the windows they track.

use std::fmt;

use super::rules::normalize_platform;

/// Namespace shared by every key this crate writes.
pub const KEY_NAMESPACE: &str = "ratelimit";

/// What a stored key tracks for one user and platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowKind {
    /// Actions within the platform's rolling window
    Hourly,
    /// Actions within a rolling day
    Daily,
    /// Absolute timestamp (epoch milliseconds) until which actions are paused
    Cooldown,
}

impl WindowKind {
    pub const ALL: [WindowKind; 3] = [WindowKind::Hourly, WindowKind::Daily, WindowKind::Cooldown];

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Hourly => "hourly",
            WindowKind::Daily => "daily",
            WindowKind::Cooldown => "cooldown",
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key identifying one counter or cooldown marker in the store.
///
/// Format: `ratelimit:{user_id}:{platform}:{kind}`, with the platform
/// lowercased so that lookups are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub user_id: String,
    pub platform: String,
    pub kind: WindowKind,
}

impl CounterKey {
    pub fn new(user_id: &str, platform: &str, kind: WindowKind) -> Self {
        Self {
            user_id: user_id.to_string(),
            platform: normalize_platform(platform),
            kind,
        }
    }

    pub fn hourly(user_id: &str, platform: &str) -> Self {
        Self::new(user_id, platform, WindowKind::Hourly)
    }

    pub fn daily(user_id: &str, platform: &str) -> Self {
        Self::new(user_id, platform, WindowKind::Daily)
    }

    pub fn cooldown(user_id: &str, platform: &str) -> Self {
        Self::new(user_id, platform, WindowKind::Cooldown)
    }

    /// All three keys for a user and platform.
    pub fn all(user_id: &str, platform: &str) -> [CounterKey; 3] {
        WindowKind::ALL.map(|kind| Self::new(user_id, platform, kind))
    }

    /// Prefix shared by every key belonging to `user_id`.
    pub fn user_prefix(user_id: &str) -> String {
        format!("{}:{}:", KEY_NAMESPACE, user_id)
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            KEY_NAMESPACE, self.user_id, self.platform, self.kind
        )
    }
}
