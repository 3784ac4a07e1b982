//! Rate limiting — token pools, their filler and the limiter façade
//!
//! A [`RateLimiter`] owns exactly one [`TokenPool`]. Which pool it gets is decided
//! by the [`PoolConfig`] passed at construction:
//!
//! - [`PoolStrategy::Threaded`] builds a [`ThreadDrivenTokenPool`], refilled by a
//!   [`TokenFiller`] thread once the limiter starts.
//! - [`PoolStrategy::Inline`] builds an [`InlineTokenPool`], refilled by whichever
//!   blocked caller wins its refill lock.
//!
//! Rates are described by a [`RateSpec`], usually parsed from strings such as
//! `"200"`, `"3.6,2"` or `"1000,1.05,restart"`.
mod filler;
mod inline;
mod limiter;
mod pool;
mod spec;
mod threaded;

pub use filler::TokenFiller;
pub use inline::InlineTokenPool;
pub use limiter::{LimiterState, RateLimiter};
pub use pool::{
    DEFAULT_REFILL_INTERVAL, INLINE_MIN_CONCURRENT_OPS, MIN_ACTIVE_POOL, PoolConfig, PoolSnapshot,
    PoolStrategy, THREADED_MIN_CONCURRENT_OPS, TokenPool,
};
#[cfg(feature = "internals")]
pub use pool::PoolState;
pub use spec::{DEFAULT_BURST_RATIO, RateSpec, Verb};
pub use threaded::ThreadDrivenTokenPool;
