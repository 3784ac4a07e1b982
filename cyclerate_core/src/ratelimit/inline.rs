use std::{
    fmt, thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use super::{
    RateSpec,
    pool::{PoolCore, PoolSnapshot, TokenPool, clamp_request},
};

/// A pool refilled by its own consumers.
///
/// A caller that finds too few tokens tries to become the refiller. The winner
/// sleeps out the rest of the current interval, deposits the elapsed time and
/// repeats until it can take its share. Everyone else waits on the refill
/// condition and retries once woken. No background thread is involved.
pub struct InlineTokenPool {
    core: PoolCore,
    interval: Duration,
    /// Held by whichever caller is refilling; guards the refill anchor.
    refiller: Mutex<Instant>,
}

impl InlineTokenPool {
    pub fn new(spec: RateSpec, min_concurrent_ops: f64, interval: Duration) -> Self {
        let pool = Self {
            core: PoolCore::new(spec, min_concurrent_ops),
            interval: interval.max(Duration::from_micros(1)),
            refiller: Mutex::new(Instant::now()),
        };
        tracing::debug!("initialized inline token pool {} for {}", pool.snapshot(), spec);
        pool
    }

    fn take_or_refill(&self, tokens: i64) -> i64 {
        loop {
            {
                let mut state = self.core.state.lock();
                let tokens = clamp_request(tokens, state.max_active_and_burst());
                if state.try_take(tokens) {
                    return state.total();
                }
            }

            if let Some(mut last) = self.refiller.try_lock() {
                loop {
                    let due = *last + self.interval;
                    let now = Instant::now();
                    if now < due {
                        thread::sleep(due - now);
                    }
                    let now = Instant::now();
                    let elapsed = now.saturating_duration_since(*last);
                    *last = now;

                    let mut state = self.core.state.lock();
                    state.refill(elapsed.as_nanos().min(i64::MAX as u128) as i64);
                    self.core.refilled.notify_all();
                    let tokens = clamp_request(tokens, state.max_active_and_burst());
                    if state.try_take(tokens) {
                        return state.total();
                    }
                }
            }

            let mut state = self.core.state.lock();
            if state.active() < tokens {
                state.blocks += 1;
                self.core.refilled.wait_for(&mut state, self.interval);
            }
        }
    }
}

impl TokenPool for InlineTokenPool {
    fn apply(&self, spec: RateSpec) {
        self.core.apply(spec);
    }

    fn take_up_to(&self, amount: i64) -> i64 {
        self.core.take_up_to(amount)
    }

    fn block_and_take(&self) -> i64 {
        self.take_or_refill(self.core.nanos_per_op())
    }

    fn block_and_take_n(&self, tokens: i64) -> i64 {
        self.take_or_refill(tokens)
    }

    fn refill(&self, new_tokens: i64) -> i64 {
        self.core.refill(new_tokens)
    }

    fn restart(&self) -> i64 {
        let mut last = self.refiller.lock();
        *last = Instant::now();
        self.core.restart()
    }

    /// Moves the refill anchor to now so idle time before the start is not
    /// credited.
    fn start(&self) {
        *self.refiller.lock() = Instant::now();
    }

    fn drain_waiting(&self) -> i64 {
        self.core.drain_waiting()
    }

    fn snapshot(&self) -> PoolSnapshot {
        self.core.snapshot()
    }
}

impl fmt::Debug for InlineTokenPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InlineTokenPool {}", self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn single_caller_refills_for_itself() {
        let pool = InlineTokenPool::new(
            RateSpec::with_ops(500.0).unwrap(),
            5.0,
            Duration::from_millis(1),
        );
        pool.start();
        let started = Instant::now();
        for _ in 0..20 {
            pool.block_and_take();
        }
        // 20 ops at 2ms each
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(35), "took {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
    }

    #[test]
    fn contending_callers_all_progress() {
        let pool = Arc::new(InlineTokenPool::new(
            RateSpec::with_ops(2_000.0).unwrap(),
            5.0,
            Duration::from_micros(200),
        ));
        pool.start();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        pool.block_and_take();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(pool.snapshot().active <= pool.snapshot().max_active_and_burst);
    }

    #[test]
    fn restart_reports_prior_sum() {
        let pool = InlineTokenPool::new(
            RateSpec::with_ops(10.0).unwrap(),
            5.0,
            Duration::from_millis(1),
        );
        pool.refill(1_234);
        assert_eq!(pool.restart(), 1_234);
        assert_eq!(pool.wait_time(), 0);
    }
}
