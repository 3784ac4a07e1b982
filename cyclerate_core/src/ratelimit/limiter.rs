use std::{
    fmt,
    sync::atomic::{AtomicI64, Ordering},
    time::Instant,
};

use metrics::gauge;
use parking_lot::Mutex;
use serde::Serialize;

use super::{PoolConfig, PoolSnapshot, RateSpec, TokenPool};

/// Two-state life-cycle of a [`RateLimiter`]. Once started it stays started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LimiterState {
    Idle,
    Started,
}

/// Blocking admission control over a [`TokenPool`].
///
/// Workers call [`maybe_wait_for_op`](Self::maybe_wait_for_op) before each
/// operation. Time that could not be spent on schedule accumulates in the pool's
/// waiting reservoir and is reported by [`total_wait_time`](Self::total_wait_time),
/// together with backlog checkpointed across rate changes.
///
/// ```
/// use cyclerate_core::{PoolConfig, RateLimiter, LimiterState};
///
/// let limiter = RateLimiter::new("cycles", "1000,1.1,configure".parse().unwrap(), &PoolConfig::default());
/// assert_eq!(limiter.state(), LimiterState::Idle);
///
/// limiter.apply_rate_spec("1000,1.1,start".parse().unwrap());
/// // Equal rate and burst: nothing to do, the limiter stays idle.
/// assert_eq!(limiter.state(), LimiterState::Idle);
///
/// limiter.start();
/// assert_eq!(limiter.state(), LimiterState::Started);
/// ```
pub struct RateLimiter {
    label: String,
    pool: Box<dyn TokenPool>,
    inner: Mutex<Inner>,
    cumulative_wait: AtomicI64,
}

struct Inner {
    spec: RateSpec,
    state: LimiterState,
    started_at: Option<Instant>,
}

impl RateLimiter {
    /// Builds the pool for `spec` and applies the spec's verb.
    pub fn new(label: impl Into<String>, spec: RateSpec, config: &PoolConfig) -> Self {
        let label = label.into();
        let pool = config.build_pool(&label, spec);
        let limiter = Self {
            label,
            pool,
            inner: Mutex::new(Inner {
                spec,
                state: LimiterState::Idle,
                started_at: None,
            }),
            cumulative_wait: AtomicI64::new(0),
        };
        {
            let mut inner = limiter.inner.lock();
            limiter.follow_verb(&mut inner, spec);
        }
        limiter.record_metrics();
        tracing::debug!("Created {limiter}");
        limiter
    }

    /// Blocks until one operation is admitted. Returns the entitlement still
    /// accrued in the pool.
    pub fn maybe_wait_for_op(&self) -> i64 {
        self.pool.block_and_take()
    }

    /// Reconfigures the limiter.
    ///
    /// An equal spec without the `restart` verb is ignored. Otherwise the pool is
    /// resized (keeping its tokens), an idle limiter with an auto-start verb is
    /// started, and a `restart` verb resets all timing state.
    pub fn apply_rate_spec(&self, spec: RateSpec) {
        let mut inner = self.inner.lock();
        if spec == inner.spec && !spec.is_restart() {
            tracing::trace!("{} already at {spec}, nothing to apply", self.label);
            return;
        }

        let previous = inner.spec;
        inner.spec = spec;
        if inner.state == LimiterState::Started && previous != spec {
            // Backlog accrued at the old rate is kept as wait time.
            let drained = self.pool.drain_waiting();
            self.cumulative_wait.fetch_add(drained, Ordering::AcqRel);
        }
        self.pool.apply(spec);
        self.follow_verb(&mut inner, spec);
        drop(inner);

        self.record_metrics();
        tracing::info!("Applied rate to '{}': {spec}", self.label);
    }

    /// Starts refilling. Starting a started limiter only moves its start time.
    pub fn start(&self) {
        let mut inner = self.inner.lock();
        self.start_locked(&mut inner);
    }

    /// Discards accrued wait time and returns how much was discarded. An idle
    /// limiter is started instead and reports zero.
    pub fn restart(&self) -> i64 {
        let mut inner = self.inner.lock();
        self.restart_locked(&mut inner)
    }

    /// Checkpointed wait time plus whatever the pool currently holds.
    pub fn total_wait_time(&self) -> i64 {
        self.cumulative_wait.load(Ordering::Acquire) + self.pool.wait_time()
    }

    pub fn wait_time(&self) -> i64 {
        self.pool.wait_time()
    }

    pub fn rate_spec(&self) -> RateSpec {
        self.inner.lock().spec
    }

    pub fn state(&self) -> LimiterState {
        self.inner.lock().state
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.inner.lock().started_at
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pool(&self) -> &dyn TokenPool {
        self.pool.as_ref()
    }

    pub fn pool_snapshot(&self) -> PoolSnapshot {
        self.pool.snapshot()
    }

    /// Publishes the configured rates and current wait time as gauges.
    pub fn record_metrics(&self) {
        let spec = self.rate_spec();
        gauge!(
            "cyclerate_limiter_rate",
            spec.ops_per_sec(),
            "limiter" => self.label.clone()
        );
        gauge!(
            "cyclerate_limiter_burst_rate",
            spec.ops_per_sec() * spec.burst_ratio(),
            "limiter" => self.label.clone()
        );
        gauge!(
            "cyclerate_limiter_wait_ns",
            self.total_wait_time() as f64,
            "limiter" => self.label.clone()
        );
    }

    fn follow_verb(&self, inner: &mut Inner, spec: RateSpec) {
        if inner.state == LimiterState::Idle && spec.is_auto_start() {
            self.start_locked(inner);
        } else if spec.is_restart() {
            self.restart_locked(inner);
        }
    }

    fn start_locked(&self, inner: &mut Inner) {
        inner.started_at = Some(Instant::now());
        self.pool.start();
        if inner.state == LimiterState::Idle {
            tracing::debug!("Started rate limiter '{}'", self.label);
        }
        inner.state = LimiterState::Started;
    }

    fn restart_locked(&self, inner: &mut Inner) -> i64 {
        match inner.state {
            LimiterState::Idle => {
                self.start_locked(inner);
                0
            }
            LimiterState::Started => {
                inner.started_at = Some(Instant::now());
                let checkpointed = self.cumulative_wait.swap(0, Ordering::AcqRel);
                let forfeited = self.pool.restart() + checkpointed;
                tracing::debug!(
                    "Restarted rate limiter '{}', discarding {forfeited}ns of wait time",
                    self.label
                );
                forfeited
            }
        }
    }
}

impl fmt::Display for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (spec, state) = {
            let inner = self.inner.lock();
            (inner.spec, inner.state)
        };
        write!(
            f,
            "RateLimiter '{}' spec={spec} state={state:?} pool={}",
            self.label,
            self.pool.snapshot()
        )
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{PoolStrategy, Verb};

    fn inline() -> PoolConfig {
        PoolConfig::builder().strategy(PoolStrategy::Inline).build()
    }

    fn spec(s: &str) -> RateSpec {
        s.parse().unwrap()
    }

    #[test]
    fn start_verb_starts_on_creation() {
        let limiter = RateLimiter::new("l", spec("100"), &inline());
        assert_eq!(limiter.state(), LimiterState::Started);
        assert!(limiter.started_at().is_some());

        let limiter = RateLimiter::new("l", spec("100,1.1,configure"), &inline());
        assert_eq!(limiter.state(), LimiterState::Idle);
    }

    #[test]
    fn equal_spec_is_a_no_op() {
        let limiter = RateLimiter::new("l", spec("100,1.1,configure"), &inline());
        limiter.pool().refill(5_000);

        limiter.apply_rate_spec(spec("100,1.1,configure"));
        limiter.apply_rate_spec(spec("100,1.1,start"));

        assert_eq!(limiter.state(), LimiterState::Idle);
        assert_eq!(limiter.wait_time(), 5_000);
        assert_eq!(limiter.pool_snapshot().active, 5_000);
    }

    #[test]
    fn configure_then_start() {
        let limiter = RateLimiter::new("l", spec("100,1.1,configure"), &inline());
        limiter.apply_rate_spec(spec("200,1.1,start"));
        assert_eq!(limiter.state(), LimiterState::Started);
        assert_eq!(limiter.rate_spec().ops_per_sec(), 200.0);
        assert_eq!(limiter.pool_snapshot().nanos_per_op, 5_000_000);
    }

    #[test]
    fn rate_change_keeps_total_wait() {
        let limiter = RateLimiter::new("l", spec("10"), &inline());
        limiter.pool().refill(1_000_000_000);
        let before = limiter.total_wait_time();
        assert_eq!(before, 1_000_000_000);

        limiter.apply_rate_spec(spec("20"));
        assert_eq!(limiter.total_wait_time(), before);
        assert_eq!(limiter.wait_time(), limiter.pool_snapshot().active + limiter.pool_snapshot().waiting);
        assert!(limiter.wait_time() < before);
    }

    #[test]
    fn restart_returns_everything_accrued() {
        let limiter = RateLimiter::new("l", spec("10"), &inline());
        limiter.pool().refill(1_000_000_000);
        limiter.apply_rate_spec(spec("20"));

        assert_eq!(limiter.restart(), 1_000_000_000);
        assert_eq!(limiter.total_wait_time(), 0);
    }

    #[test]
    fn restart_verb_resets_even_when_equal() {
        let limiter = RateLimiter::new("l", spec("10"), &inline());
        limiter.pool().refill(3_000);
        limiter.apply_rate_spec(spec("10").with_verb(Verb::Restart));
        assert_eq!(limiter.total_wait_time(), 0);
        assert_eq!(limiter.state(), LimiterState::Started);
    }

    #[test]
    fn restart_on_idle_starts() {
        let limiter = RateLimiter::new("l", spec("10,1.1,configure"), &inline());
        assert_eq!(limiter.restart(), 0);
        assert_eq!(limiter.state(), LimiterState::Started);
    }

    #[test]
    fn admits_at_the_configured_rate() {
        let limiter = RateLimiter::new("cycles", spec("200"), &PoolConfig::default());
        let started = Instant::now();
        for _ in 0..10 {
            limiter.maybe_wait_for_op();
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(40), "took {elapsed:?}");
        assert!(limiter.total_wait_time() < 5 * spec("200").nanos_per_op());
    }

    #[test]
    fn display_names_the_limiter() {
        let limiter = RateLimiter::new("cycles", spec("100,1.1,configure"), &inline());
        let shown = limiter.to_string();
        assert!(shown.starts_with("RateLimiter 'cycles' spec=rate=100"));
        assert!(shown.contains("state=Idle"));
    }
}
