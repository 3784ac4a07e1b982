//! Motors — the threads that actually run cycles
//!
//! A motor owns one slot of an activity. Once launched it loops on its own OS
//! thread:
//!
//! 1. checks whether it has been asked to stop,
//! 2. waits for admission from the activity's rate limiter, if one is set,
//! 3. takes the next cycle from the shared [`Input`], finishing when there is none,
//! 4. runs the [`Action`] for that cycle and folds the outcome into a thread-local
//!    [`CycleTally`].
//!
//! The motor publishes its [`RunState`] through its [`SlotState`] and returns the
//! tally when the thread ends. Actions steer the loop through [`CycleStatus`]
//! values rather than panics; a panic is still caught, moves the slot to
//! `Errored` and is reported to the executor.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use cyclerate_core::RateLimiter;
use parking_lot::RwLock;

use crate::{
    Aggregate, CycleTally, Input, RunState, SlotState,
    metric::{CycleSample, Outcome},
};

/// Result of running one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleStatus {
    /// The cycle ran. Zero means success, anything else is counted as a failure.
    Done(i32),
    /// Stop this motor after the current cycle.
    Halt,
    /// Stop the whole activity, for the given reason.
    Abort(String),
}

impl CycleStatus {
    pub const OK: CycleStatus = CycleStatus::Done(0);
}

/// The per-cycle workload. Any `Fn(u64) -> CycleStatus` is an action.
///
/// ```
/// use cyclerate::{Action, CycleStatus};
///
/// let action = |cycle: u64| if cycle % 2 == 0 { CycleStatus::OK } else { CycleStatus::Done(1) };
/// assert_eq!(action.run_cycle(4), CycleStatus::OK);
/// ```
pub trait Action: Send + Sync {
    fn run_cycle(&self, cycle: u64) -> CycleStatus;
}

impl<F> Action for F
where
    F: Fn(u64) -> CycleStatus + Send + Sync,
{
    fn run_cycle(&self, cycle: u64) -> CycleStatus {
        self(cycle)
    }
}

/// The limiter currently pacing an activity. Swapped when the rate is changed.
pub(crate) type Pacing = Arc<RwLock<Option<Arc<RateLimiter>>>>;

/// Things a motor reports back outside its run state.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MotorEvent {
    Aborted { slot: usize, reason: String },
    Panicked { slot: usize, message: String },
}

/// What every motor of an activity shares.
#[derive(Clone)]
pub(crate) struct MotorContext {
    pub alias: Arc<str>,
    pub input: Arc<dyn Input>,
    pub pacing: Pacing,
    /// Raised once the whole activity is stopping.
    pub stopping: Arc<AtomicBool>,
    pub on_event: Arc<dyn Fn(MotorEvent) + Send + Sync>,
}

pub(crate) struct Motor {
    slot: usize,
    state: Arc<SlotState>,
    action: Arc<dyn Action>,
    ctx: MotorContext,
}

enum LoopEnd {
    Exhausted,
    Stopped,
    Aborted(String),
}

impl Motor {
    pub(crate) fn new(
        slot: usize,
        state: Arc<SlotState>,
        action: Arc<dyn Action>,
        ctx: MotorContext,
    ) -> Self {
        Self {
            slot,
            state,
            action,
            ctx,
        }
    }

    /// Runs cycles until the input is exhausted or a stop is observed.
    pub(crate) fn run(self) -> CycleTally {
        let mut tally = CycleTally::new();
        self.state.transition(RunState::Running);
        tracing::trace!(target: "activity", "Motor {}:{} running", self.ctx.alias, self.slot);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.cycle_loop(&mut tally)));
        match outcome {
            Ok(LoopEnd::Exhausted) => {
                self.state.transition(RunState::Finished);
            }
            Ok(LoopEnd::Stopped) => {
                self.state.transition(RunState::Stopping);
                self.state.transition(RunState::Stopped);
            }
            // report before settling; waiters on the slot state expect the failure recorded
            Ok(LoopEnd::Aborted(reason)) => {
                self.state.transition(RunState::Stopping);
                (self.ctx.on_event)(MotorEvent::Aborted {
                    slot: self.slot,
                    reason,
                });
                self.state.transition(RunState::Stopped);
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(
                    target: "activity",
                    "Motor {}:{} panicked: {message}", self.ctx.alias, self.slot
                );
                (self.ctx.on_event)(MotorEvent::Panicked {
                    slot: self.slot,
                    message,
                });
                self.state.transition(RunState::Errored);
            }
        }
        tracing::trace!(
            target: "activity",
            "Motor {}:{} ended as {} after {} cycles",
            self.ctx.alias,
            self.slot,
            self.state.get(),
            tally.cycles
        );
        tally
    }

    fn stop_requested(&self) -> bool {
        self.state.stop_requested() || self.ctx.stopping.load(Ordering::Acquire)
    }

    fn cycle_loop(&self, tally: &mut CycleTally) -> LoopEnd {
        loop {
            if self.stop_requested() {
                return LoopEnd::Stopped;
            }

            let mut admission_wait = Duration::ZERO;
            let limiter = self.ctx.pacing.read().clone();
            if let Some(limiter) = limiter {
                let blocked_at = Instant::now();
                limiter.maybe_wait_for_op();
                admission_wait = blocked_at.elapsed();
                // admission may have taken a while
                if self.stop_requested() {
                    return LoopEnd::Stopped;
                }
            }

            let Some(cycle) = self.ctx.input.next_cycle() else {
                return LoopEnd::Exhausted;
            };

            let started = Instant::now();
            let status = self.action.run_cycle(cycle);
            let service_time = started.elapsed();

            let (outcome, end) = match status {
                CycleStatus::Done(0) => (Outcome::Success, None),
                CycleStatus::Done(code) => (Outcome::Failure(code), None),
                CycleStatus::Halt => (Outcome::Halted, Some(LoopEnd::Stopped)),
                CycleStatus::Abort(reason) => (Outcome::Aborted, Some(LoopEnd::Aborted(reason))),
            };
            tally.consume(&CycleSample {
                cycle,
                service_time,
                admission_wait,
                outcome,
            });
            if let Some(end) = end {
                return end;
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
