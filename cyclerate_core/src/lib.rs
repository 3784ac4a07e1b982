//! Core admission-control primitives for cyclerate.
//!
//! This crate holds everything that decides *when* an operation may run:
//! unit-suffixed count parsing, rate specifications, nanosecond token pools and
//! the [`RateLimiter`] façade that workers block on. It has no notion of
//! activities or threads of work; see the `cyclerate` crate for that.

/// Errors raised while parsing configuration
pub mod error;
/// Token pools, fillers and rate limiters
pub mod ratelimit;
/// Counts with metric suffixes (`5K`, `2E6`, `10^3`)
pub mod unit;

pub use error::ConfigError;
pub use ratelimit::{
    InlineTokenPool, LimiterState, PoolConfig, PoolSnapshot, PoolStrategy, RateLimiter, RateSpec,
    ThreadDrivenTokenPool, TokenFiller, TokenPool, Verb,
};
