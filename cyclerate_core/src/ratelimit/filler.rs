use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use metrics::histogram;
use parking_lot::Mutex;

use super::pool::PoolCore;

/// Background thread that deposits elapsed time into a pool.
///
/// The thread wakes every `interval`, measures the time since the previous
/// deposit and refills the pool by exactly that many nanoseconds, so a late
/// wakeup never loses time. How late each wakeup was is recorded to the
/// `cyclerate_filler_jitter_ns` histogram.
#[derive(Debug)]
pub struct TokenFiller {
    shared: Arc<FillerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct FillerShared {
    label: String,
    pool: Arc<PoolCore>,
    interval: Duration,
    running: AtomicBool,
    /// Anchor for the next deposit. Refills happen while it is held.
    last_refill: Mutex<Instant>,
}

impl TokenFiller {
    pub(crate) fn new(label: &str, pool: Arc<PoolCore>, interval: Duration) -> Self {
        Self {
            shared: Arc::new(FillerShared {
                label: label.to_string(),
                pool,
                interval: interval.max(Duration::from_micros(1)),
                running: AtomicBool::new(false),
                last_refill: Mutex::new(Instant::now()),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawns the filler thread. Later calls do nothing.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        *self.shared.last_refill.lock() = Instant::now();
        self.shared.running.store(true, Ordering::Release);

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-filler", self.shared.label))
            .spawn(move || shared.run());
        match spawned {
            Ok(h) => {
                tracing::debug!(
                    "Started token filler for '{}' every {:?}",
                    self.shared.label,
                    self.shared.interval
                );
                *handle = Some(h);
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                tracing::error!("Unable to spawn token filler for '{}': {e}", self.shared.label);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Resets the refill clock and zeroes the pool, returning what it held.
    pub fn restart(&self) -> i64 {
        let mut last = self.shared.last_refill.lock();
        *last = Instant::now();
        self.shared.pool.restart()
    }

    pub fn interval(&self) -> Duration {
        self.shared.interval
    }

    fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::warn!("Token filler for '{}' panicked", self.shared.label);
            }
        }
    }
}

impl Drop for TokenFiller {
    fn drop(&mut self) {
        self.stop();
    }
}

impl FillerShared {
    fn run(&self) {
        while self.running.load(Ordering::Acquire) {
            let due = *self.last_refill.lock() + self.interval;
            // park may return early, so keep parking for whatever is left
            loop {
                let now = Instant::now();
                if now >= due {
                    break;
                }
                thread::park_timeout(due - now);
                if !self.running.load(Ordering::Acquire) {
                    return;
                }
            }

            let mut last = self.last_refill.lock();
            let now = Instant::now();
            let elapsed = now.saturating_duration_since(*last);
            *last = now;
            self.pool.refill(elapsed.as_nanos().min(i64::MAX as u128) as i64);
            drop(last);

            let jitter = elapsed.saturating_sub(self.interval);
            histogram!(
                "cyclerate_filler_jitter_ns",
                jitter.as_nanos() as f64,
                "limiter" => self.label.clone()
            );
        }
        tracing::trace!("Token filler for '{}' exiting", self.label);
    }
}
