use std::{
    ops::Range,
    sync::atomic::{AtomicU64, Ordering},
};

/// Source of cycle numbers shared by all motors of an activity.
pub trait Input: Send + Sync {
    /// The next cycle to run, or `None` once the input is exhausted.
    fn next_cycle(&self) -> Option<u64>;
}

/// Hands out each cycle of a range exactly once, across any number of threads.
///
/// The range may be changed while motors are running: a larger end extends the
/// run, a later start skips ahead.
#[derive(Debug)]
pub struct AtomicInput {
    next: AtomicU64,
    end: AtomicU64,
}

impl AtomicInput {
    pub fn new(cycles: Range<u64>) -> Self {
        Self {
            next: AtomicU64::new(cycles.start),
            end: AtomicU64::new(cycles.end),
        }
    }

    pub fn set_range(&self, cycles: Range<u64>) {
        self.end.store(cycles.end, Ordering::Release);
        self.next.fetch_max(cycles.start, Ordering::AcqRel);
    }

    /// Restarts the range from its beginning.
    pub fn reset(&self, cycles: Range<u64>) {
        self.end.store(cycles.end, Ordering::Release);
        self.next.store(cycles.start, Ordering::Release);
    }

    pub fn remaining(&self) -> u64 {
        self.end
            .load(Ordering::Acquire)
            .saturating_sub(self.next.load(Ordering::Acquire))
    }
}

impl Input for AtomicInput {
    fn next_cycle(&self) -> Option<u64> {
        let end = self.end.load(Ordering::Acquire);
        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < end).then_some(n + 1)
            })
            .ok()
    }
}
