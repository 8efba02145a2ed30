//! Pacer - per-user, per-platform admission control
//!
//! This crate decides whether a user may perform another outbound action
//! against a third-party platform right now, recommends pacing between
//! actions, and reports usage. Counters live in a shared store (Redis in
//! production) so that every process sees the same quotas. Store outages
//! never block callers: checks fail open.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
