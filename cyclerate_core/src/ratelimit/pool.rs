//! Token pools — nanosecond-denominated admission control
//!
//! A token pool holds two reservoirs of time entitlement, both measured in
//! nanoseconds:
//!
//! - the **active** pool, from which callers draw `nanos_per_op` per operation,
//! - the **waiting** pool, which collects entitlement that arrived while the active
//!   pool was already full. It is the time callers fell behind schedule, and is
//!   reported as wait time so that coordinated omission stays visible.
//!
//! # High-level flow
//! 1. Elapsed time is deposited with `refill`. Tokens go to the active pool until it
//!    reaches `max_active`; the rest overflows into the waiting pool.
//! 2. A share of the waiting pool is moved back into the active pool (backfill),
//!    bounded by the burst headroom `max_active_and_burst - active` and proportional
//!    to how large the refill was relative to `max_active`.
//! 3. Callers block in `block_and_take` until the active pool holds at least one
//!    operation's worth of tokens, then deduct it.
//!
//! # Sizing
//!
//! ```text
//! max_active           = max(1_000_000, nanos_per_op * min_concurrent_ops)
//! max_active_and_burst = max_active * burst_ratio
//! max_burst            = max_active_and_burst - max_active
//! ```
//!
//! # Strategies
//! - [`ThreadDrivenTokenPool`](super::ThreadDrivenTokenPool): a background filler
//!   thread deposits elapsed time at a fixed interval.
//! - [`InlineTokenPool`](super::InlineTokenPool): a blocked caller that wins the
//!   refill lock deposits elapsed time itself while the others wait.

use std::{fmt, time::Duration};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use typed_builder::TypedBuilder;

use super::{InlineTokenPool, RateSpec, ThreadDrivenTokenPool};

pub const DEFAULT_REFILL_INTERVAL: Duration = Duration::from_micros(100);
/// Smallest active pool, regardless of rate.
pub const MIN_ACTIVE_POOL: i64 = 1_000_000;

/// Operations a thread-driven pool can hold before it overflows.
pub const THREADED_MIN_CONCURRENT_OPS: f64 = 2.0;
/// Operations an inline pool can hold before it overflows.
pub const INLINE_MIN_CONCURRENT_OPS: f64 = 5.0;

/// The admission-control capability shared by every pool strategy.
///
/// All amounts are nanoseconds of entitlement. Every mutating call returns the
/// remaining `active + waiting` sum unless stated otherwise.
pub trait TokenPool: Send + Sync + fmt::Debug {
    /// Re-derives the pool sizes from `spec`, keeping accrued tokens.
    fn apply(&self, spec: RateSpec);

    /// Takes at most `amount` from the active pool without blocking and returns
    /// how much was taken.
    fn take_up_to(&self, amount: i64) -> i64;

    /// Blocks until one operation's worth of tokens is available and takes it.
    fn block_and_take(&self) -> i64;

    /// Blocks until `tokens` are available and takes them.
    fn block_and_take_n(&self, tokens: i64) -> i64;

    /// Deposits `new_tokens` into the pool.
    fn refill(&self, new_tokens: i64) -> i64;

    /// Zeroes both pools and returns what they held.
    fn restart(&self) -> i64;

    /// Begins time-based refilling.
    fn start(&self);

    /// Empties the waiting pool and returns what it held.
    fn drain_waiting(&self) -> i64;

    fn snapshot(&self) -> PoolSnapshot;

    fn rate_spec(&self) -> RateSpec {
        self.snapshot().spec
    }

    fn active_pool(&self) -> i64 {
        self.snapshot().active
    }

    fn waiting_pool(&self) -> i64 {
        self.snapshot().waiting
    }

    /// Entitlement currently accrued but not consumed.
    fn wait_time(&self) -> i64 {
        let snap = self.snapshot();
        snap.active + snap.waiting
    }
}

/// Which party deposits elapsed time into a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PoolStrategy {
    /// A dedicated filler thread refills at `refill_interval`.
    #[default]
    Threaded,
    /// Blocked callers refill the pool themselves.
    Inline,
}

impl PoolStrategy {
    pub fn min_concurrent_ops(self) -> f64 {
        match self {
            PoolStrategy::Threaded => THREADED_MIN_CONCURRENT_OPS,
            PoolStrategy::Inline => INLINE_MIN_CONCURRENT_OPS,
        }
    }
}

/// Timing configuration handed to each rate limiter when it is built.
///
/// ```
/// use std::time::Duration;
/// use cyclerate_core::{PoolConfig, PoolStrategy};
///
/// let config = PoolConfig::builder()
///     .strategy(PoolStrategy::Inline)
///     .refill_interval(Duration::from_millis(1))
///     .build();
/// assert_eq!(config.effective_min_concurrent_ops(), 5.0);
/// ```
#[derive(Debug, Clone, TypedBuilder)]
pub struct PoolConfig {
    #[builder(default)]
    pub strategy: PoolStrategy,
    /// How often elapsed time is deposited.
    #[builder(default = DEFAULT_REFILL_INTERVAL)]
    pub refill_interval: Duration,
    /// Overrides the per-strategy buffer of concurrent operations.
    #[builder(default, setter(strip_option))]
    pub min_concurrent_ops: Option<f64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl PoolConfig {
    pub fn effective_min_concurrent_ops(&self) -> f64 {
        self.min_concurrent_ops
            .filter(|ops| ops.is_finite() && *ops > 0.0)
            .unwrap_or_else(|| self.strategy.min_concurrent_ops())
    }

    /// Builds a pool of the configured strategy for `spec`. `label` names the
    /// filler thread and the emitted metrics.
    pub fn build_pool(&self, label: &str, spec: RateSpec) -> Box<dyn TokenPool> {
        let min_ops = self.effective_min_concurrent_ops();
        match self.strategy {
            PoolStrategy::Threaded => Box::new(ThreadDrivenTokenPool::new(
                label,
                spec,
                min_ops,
                self.refill_interval,
            )),
            PoolStrategy::Inline => Box::new(InlineTokenPool::new(spec, min_ops, self.refill_interval)),
        }
    }
}

/// A point-in-time copy of a pool's accounting.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolSnapshot {
    pub spec: RateSpec,
    pub active: i64,
    pub waiting: i64,
    pub max_active: i64,
    pub max_burst: i64,
    pub max_active_and_burst: i64,
    pub nanos_per_op: i64,
    pub blocks: u64,
}

impl fmt::Display for PoolSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ active:{}, max:{}, fill:'({:.1}%)A ({:.1}%)B', wait_ns:{}, blocks:{} }}",
            self.active,
            self.max_active,
            self.active as f64 / self.max_active as f64 * 100.0,
            self.active as f64 / self.max_active_and_burst as f64 * 100.0,
            self.waiting,
            self.blocks,
        )
    }
}

#[cfg(feature = "internals")]
pub use internals::PoolState;
#[cfg(not(feature = "internals"))]
pub(crate) use internals::PoolState;

/// The lock-free arithmetic of a pool, kept apart from the synchronization so it
/// can be tested on its own.
mod internals {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct PoolState {
        spec: RateSpec,
        min_concurrent_ops: f64,
        pub(crate) active: i64,
        pub(crate) waiting: i64,
        pub(crate) max_active: i64,
        pub(crate) max_burst: i64,
        pub(crate) max_active_and_burst: i64,
        pub(crate) nanos_per_op: i64,
        pub(crate) blocks: u64,
    }

    impl PoolState {
        pub fn new(spec: RateSpec, min_concurrent_ops: f64) -> Self {
            let mut state = Self {
                spec,
                min_concurrent_ops,
                active: 0,
                waiting: 0,
                max_active: 0,
                max_burst: 0,
                max_active_and_burst: 0,
                nanos_per_op: 0,
                blocks: 0,
            };
            state.apply(spec);
            state
        }

        /// Re-derives the pool sizes. Active tokens beyond a shrunk ceiling are
        /// moved to the waiting pool.
        pub fn apply(&mut self, spec: RateSpec) {
            self.spec = spec;
            self.nanos_per_op = spec.nanos_per_op();
            self.max_active = MIN_ACTIVE_POOL
                .max((self.nanos_per_op as f64 * self.min_concurrent_ops) as i64);
            self.max_active_and_burst = (self.max_active as f64 * spec.burst_ratio()) as i64;
            self.max_burst = self.max_active_and_burst - self.max_active;

            if self.active > self.max_active_and_burst {
                let excess = self.active - self.max_active_and_burst;
                self.active -= excess;
                self.waiting += excess;
            }
        }

        pub fn refill(&mut self, new_tokens: i64) -> i64 {
            let new_tokens = new_tokens.max(0);

            let needed = (self.max_active - self.active).max(0);
            let to_active = new_tokens.min(needed);
            self.active += to_active;
            self.waiting += new_tokens - to_active;

            // backfill
            let refill_factor = (new_tokens as f64 / self.max_active as f64).min(1.0);
            let burst_allowed = ((refill_factor * self.max_burst as f64) as i64)
                .min(self.max_active_and_burst - self.active)
                .max(0);
            let burst_fill = burst_allowed.min(self.waiting);
            self.waiting -= burst_fill;
            self.active += burst_fill;

            self.total()
        }

        /// Takes `tokens` if the active pool holds them.
        pub fn try_take(&mut self, tokens: i64) -> bool {
            if self.active >= tokens {
                self.active -= tokens;
                true
            } else {
                false
            }
        }

        pub fn take_up_to(&mut self, amount: i64) -> i64 {
            let take = amount.clamp(0, self.active);
            self.active -= take;
            take
        }

        pub fn restart(&mut self) -> i64 {
            let prior = self.total();
            self.active = 0;
            self.waiting = 0;
            prior
        }

        pub fn drain_waiting(&mut self) -> i64 {
            std::mem::take(&mut self.waiting)
        }

        pub fn total(&self) -> i64 {
            self.active + self.waiting
        }

        pub fn active(&self) -> i64 {
            self.active
        }

        pub fn waiting(&self) -> i64 {
            self.waiting
        }

        pub fn nanos_per_op(&self) -> i64 {
            self.nanos_per_op
        }

        pub fn max_active_and_burst(&self) -> i64 {
            self.max_active_and_burst
        }

        pub fn snapshot(&self) -> PoolSnapshot {
            PoolSnapshot {
                spec: self.spec,
                active: self.active,
                waiting: self.waiting,
                max_active: self.max_active,
                max_burst: self.max_burst,
                max_active_and_burst: self.max_active_and_burst,
                nanos_per_op: self.nanos_per_op,
                blocks: self.blocks,
            }
        }
    }
}

/// A [`PoolState`] behind a mutex, with a condition signalled on every refill.
#[derive(Debug)]
pub(crate) struct PoolCore {
    pub(crate) state: Mutex<PoolState>,
    pub(crate) refilled: Condvar,
}

impl PoolCore {
    pub(crate) fn new(spec: RateSpec, min_concurrent_ops: f64) -> Self {
        Self {
            state: Mutex::new(PoolState::new(spec, min_concurrent_ops)),
            refilled: Condvar::new(),
        }
    }

    pub(crate) fn apply(&self, spec: RateSpec) {
        self.state.lock().apply(spec);
        self.refilled.notify_all();
    }

    pub(crate) fn refill(&self, new_tokens: i64) -> i64 {
        let total = self.state.lock().refill(new_tokens);
        self.refilled.notify_all();
        total
    }

    /// Waits on the refill condition until `tokens` can be taken. Each wait is
    /// bounded by the active pool size in nanoseconds and then re-checked.
    pub(crate) fn block_and_take_n(&self, tokens: i64) -> i64 {
        let mut state = self.state.lock();
        let tokens = clamp_request(tokens, state.max_active_and_burst);
        while !state.try_take(tokens) {
            state.blocks += 1;
            let timeout = Duration::from_nanos(state.max_active.max(1) as u64);
            self.refilled.wait_for(&mut state, timeout);
        }
        state.total()
    }

    pub(crate) fn take_up_to(&self, amount: i64) -> i64 {
        self.state.lock().take_up_to(amount)
    }

    pub(crate) fn restart(&self) -> i64 {
        self.state.lock().restart()
    }

    pub(crate) fn drain_waiting(&self) -> i64 {
        self.state.lock().drain_waiting()
    }

    pub(crate) fn snapshot(&self) -> PoolSnapshot {
        self.state.lock().snapshot()
    }

    pub(crate) fn nanos_per_op(&self) -> i64 {
        self.state.lock().nanos_per_op
    }
}

/// Requests above the burst ceiling could never be satisfied; they are capped.
pub(crate) fn clamp_request(tokens: i64, max_active_and_burst: i64) -> i64 {
    if tokens > max_active_and_burst {
        tracing::debug!(
            tokens,
            max_active_and_burst,
            "token request exceeds pool capacity, capping"
        );
    }
    tokens.clamp(0, max_active_and_burst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn spec(ops: f64, burst: f64) -> RateSpec {
        RateSpec::new(ops, burst, Default::default()).unwrap()
    }

    mod sizing {
        use super::*;

        #[test]
        fn slow_rates_size_by_ops() {
            // 100 ops/s -> 10ms per op, two ops buffered
            let state = PoolState::new(spec(100.0, 1.1), THREADED_MIN_CONCURRENT_OPS);
            let snap = state.snapshot();
            assert_eq!(snap.nanos_per_op, 10_000_000);
            assert_eq!(snap.max_active, 20_000_000);
            assert_eq!(snap.max_active_and_burst, 22_000_000);
            assert_eq!(snap.max_burst, 2_000_000);
        }

        #[test]
        fn fast_rates_floor_at_one_millisecond() {
            let state = PoolState::new(spec(1e6, 1.5), INLINE_MIN_CONCURRENT_OPS);
            let snap = state.snapshot();
            assert_eq!(snap.max_active, MIN_ACTIVE_POOL);
            assert_eq!(snap.max_active_and_burst, 1_500_000);
        }

        #[test]
        fn shrinking_moves_excess_to_waiting() {
            let mut state = PoolState::new(spec(10.0, 2.0), THREADED_MIN_CONCURRENT_OPS);
            state.refill(400_000_000);
            state.refill(400_000_000);
            let before = state.total();
            state.apply(spec(1_000.0, 1.0));
            assert_eq!(state.total(), before);
            assert!(state.active() <= state.max_active_and_burst());
        }
    }

    mod refill {
        use super::*;

        #[test]
        fn fills_active_first() {
            let mut state = PoolState::new(spec(100.0, 1.1), THREADED_MIN_CONCURRENT_OPS);
            assert_eq!(state.refill(5_000_000), 5_000_000);
            assert_eq!(state.active(), 5_000_000);
            assert_eq!(state.waiting(), 0);
        }

        #[test]
        fn overflow_goes_to_waiting_then_backfills() {
            let mut state = PoolState::new(spec(100.0, 1.1), THREADED_MIN_CONCURRENT_OPS);
            // 30ms into a 20ms pool: 10ms overflow, factor 1.0 lets the full
            // 2ms burst back into active.
            let total = state.refill(30_000_000);
            assert_eq!(total, 30_000_000);
            assert_eq!(state.active(), 22_000_000);
            assert_eq!(state.waiting(), 8_000_000);
        }

        #[test]
        fn backfill_is_proportional_to_refill_size() {
            let mut state = PoolState::new(spec(100.0, 1.1), THREADED_MIN_CONCURRENT_OPS);
            state.refill(20_000_000);
            state.waiting = 10_000_000;
            // a 2ms tick is a tenth of max_active, so a tenth of max_burst moves.
            state.refill(2_000_000);
            assert_eq!(state.active(), 20_200_000);
            assert_eq!(state.waiting(), 11_800_000);
        }

        #[test]
        fn negative_refill_is_ignored() {
            let mut state = PoolState::new(spec(100.0, 1.1), THREADED_MIN_CONCURRENT_OPS);
            state.refill(1_000);
            assert_eq!(state.refill(-5_000), 1_000);
        }
    }

    #[test]
    fn restart_returns_prior_sum() {
        let mut state = PoolState::new(spec(100.0, 1.1), THREADED_MIN_CONCURRENT_OPS);
        state.refill(35_000_000);
        let prior = state.total();
        assert_eq!(state.restart(), prior);
        assert_eq!(state.active(), 0);
        assert_eq!(state.waiting(), 0);
    }

    #[test]
    fn take_up_to_is_bounded_by_active() {
        let mut state = PoolState::new(spec(100.0, 1.1), THREADED_MIN_CONCURRENT_OPS);
        state.refill(3_000);
        assert_eq!(state.take_up_to(10_000), 3_000);
        assert_eq!(state.take_up_to(10_000), 0);
    }

    #[test]
    fn core_blocks_until_refilled() {
        let core = std::sync::Arc::new(PoolCore::new(spec(1_000.0, 1.1), 2.0));
        let filler = {
            let core = core.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                core.refill(1_000_000);
            })
        };
        let remaining = core.block_and_take_n(core.nanos_per_op());
        filler.join().unwrap();
        assert_eq!(remaining, 0);
        assert!(core.snapshot().blocks >= 1);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Refill(i64),
        Take,
        TakeUpTo(i64),
        Apply(f64, f64),
        Restart,
    }

    fn ops() -> impl Strategy<Value = Vec<Op>> {
        prop::collection::vec(
            prop_oneof![
                (0..500_000_000i64).prop_map(Op::Refill),
                Just(Op::Take),
                (0..50_000_000i64).prop_map(Op::TakeUpTo),
                (1.0..100_000.0f64, 1.0..4.0f64).prop_map(|(r, b)| Op::Apply(r, b)),
                Just(Op::Restart),
            ],
            1..500,
        )
    }

    // Active tokens stay within [0, max_active_and_burst] and waiting never
    // goes negative, whatever the sequence of calls.
    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 512,
            .. ProptestConfig::default()
        })]
        #[test]
        fn pool_bounds_hold(rate in 1.0..100_000.0f64, burst in 1.0..4.0f64, ops in ops()) {
            let mut state = PoolState::new(spec(rate, burst), THREADED_MIN_CONCURRENT_OPS);
            for op in ops {
                let before = state.total();
                match op {
                    Op::Refill(n) => {
                        let after = state.refill(n);
                        prop_assert_eq!(after, before + n);
                    }
                    Op::Take => {
                        let npo = state.nanos_per_op();
                        if state.try_take(npo) {
                            prop_assert_eq!(state.total(), before - npo);
                        }
                    }
                    Op::TakeUpTo(n) => {
                        let taken = state.take_up_to(n);
                        prop_assert!(taken <= n);
                    }
                    Op::Apply(r, b) => {
                        state.apply(spec(r, b));
                        prop_assert_eq!(state.total(), before);
                    }
                    Op::Restart => {
                        prop_assert_eq!(state.restart(), before);
                        prop_assert_eq!(state.total(), 0);
                    }
                }
                prop_assert!(state.active() >= 0);
                prop_assert!(state.active() <= state.max_active_and_burst());
                prop_assert!(state.waiting() >= 0);
            }
        }
    }
}
