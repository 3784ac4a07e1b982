use std::{fmt, sync::Arc, time::Duration};

use super::{
    RateSpec, TokenFiller,
    pool::{PoolCore, PoolSnapshot, TokenPool},
};

/// A pool refilled by its own [`TokenFiller`] thread.
///
/// Callers only ever consume: `block_and_take` waits on the pool's refill
/// condition, which the filler signals after every deposit. Until [`start`] is
/// called nothing is deposited, so consumers block.
///
/// [`start`]: TokenPool::start
pub struct ThreadDrivenTokenPool {
    core: Arc<PoolCore>,
    filler: TokenFiller,
}

impl ThreadDrivenTokenPool {
    pub fn new(label: &str, spec: RateSpec, min_concurrent_ops: f64, interval: Duration) -> Self {
        let core = Arc::new(PoolCore::new(spec, min_concurrent_ops));
        let filler = TokenFiller::new(label, core.clone(), interval);
        let pool = Self { core, filler };
        tracing::debug!("initialized token pool {} for {}", pool.snapshot(), spec);
        pool
    }

    pub fn filler(&self) -> &TokenFiller {
        &self.filler
    }
}

impl TokenPool for ThreadDrivenTokenPool {
    fn apply(&self, spec: RateSpec) {
        self.core.apply(spec);
    }

    fn take_up_to(&self, amount: i64) -> i64 {
        self.core.take_up_to(amount)
    }

    fn block_and_take(&self) -> i64 {
        self.core.block_and_take_n(self.core.nanos_per_op())
    }

    fn block_and_take_n(&self, tokens: i64) -> i64 {
        self.core.block_and_take_n(tokens)
    }

    fn refill(&self, new_tokens: i64) -> i64 {
        self.core.refill(new_tokens)
    }

    fn restart(&self) -> i64 {
        self.filler.restart()
    }

    fn start(&self) {
        self.filler.start();
    }

    fn drain_waiting(&self) -> i64 {
        self.core.drain_waiting()
    }

    fn snapshot(&self) -> PoolSnapshot {
        self.core.snapshot()
    }
}

impl fmt::Debug for ThreadDrivenTokenPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadDrivenTokenPool {}", self.snapshot())
    }
}
