//! Rate limiting logic: platform limits, counter keys, admission checks,
//! status reporting and request pacing.

mod counter;
mod limiter;
mod rules;
mod scheduler;
mod status;

pub use counter::{CounterKey, WindowKind, KEY_NAMESPACE};
pub use limiter::{RateLimitResult, RateLimiter, Reason};
pub use rules::{
    default_platforms, normalize_platform, LimitOverride, PlatformLimits, RateLimitConfig,
    DAILY_WINDOW, DEFAULT_PLATFORM,
};
pub use status::UserRateLimitStatus;
