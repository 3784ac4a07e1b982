use std::{sync::Arc, task::Poll, thread};

use tokio::{
    sync::oneshot::{self, error::TryRecvError},
    time::{Instant, timeout_at},
};

use crate::{
    Action, CycleTally, RunState, SlotState,
    motor::{Motor, MotorContext},
};

/// States a slot may be in once it has been asked to run.
pub(crate) const STARTED: &[RunState] = &[
    RunState::Running,
    RunState::Finished,
    RunState::Stopped,
    RunState::Errored,
];

/// States a slot may be in once it has been asked to stop.
pub(crate) const STOPPED: &[RunState] = &[RunState::Stopped, RunState::Finished, RunState::Errored];

/// One slot of an activity: its published state, its action and, while a motor
/// thread is attached, the channel its tally comes back on.
pub(crate) struct MotorSlot {
    pub slot: usize,
    pub state: Arc<SlotState>,
    action: Arc<dyn Action>,
    tally: Option<oneshot::Receiver<CycleTally>>,
}

impl MotorSlot {
    pub fn new(slot: usize, action: Arc<dyn Action>) -> Self {
        Self {
            slot,
            state: Arc::new(SlotState::new()),
            action,
            tally: None,
        }
    }

    pub fn get(&self) -> RunState {
        self.state.get()
    }

    /// Whether the slot has no motor thread and can be given one.
    pub fn is_launchable(&self) -> bool {
        matches!(self.get(), RunState::Uninitialized | RunState::Stopped)
    }

    /// Spawns a motor thread for this slot.
    pub fn launch(&mut self, ctx: &MotorContext) -> std::io::Result<()> {
        self.state.clear_stop();
        self.state.transition(RunState::Starting);

        let (tx, rx) = oneshot::channel();
        let motor = Motor::new(self.slot, self.state.clone(), self.action.clone(), ctx.clone());
        let spawned = thread::Builder::new()
            .name(format!("{}:{}", ctx.alias, self.slot))
            .spawn(move || {
                let tally = motor.run();
                // nobody listening means the slot was abandoned
                let _ = tx.send(tally);
            });

        match spawned {
            Ok(_) => {
                self.tally = Some(rx);
                Ok(())
            }
            Err(e) => {
                self.state.transition(RunState::Stopped);
                Err(e)
            }
        }
    }

    /// Asks the motor to stop at its next cycle boundary. A slot that never ran
    /// goes straight to `Stopped`.
    pub fn request_stop(&self) {
        self.state.request_stop();
        self.state
            .transition_from(RunState::Uninitialized, RunState::Stopped);
    }

    /// Waits until the slot is in one of `expected`. On timeout returns the state
    /// it was stuck in.
    pub async fn await_state(&self, expected: &[RunState], deadline: Instant) -> Result<(), RunState> {
        let mut rx = self.state.subscribe();
        let reached = matches!(
            timeout_at(deadline, rx.wait_for(|s| expected.contains(s))).await,
            Ok(Ok(_))
        );
        if reached { Ok(()) } else { Err(self.get()) }
    }

    /// Waits for the motor thread's tally. `None` if there is no thread attached
    /// or it did not report before `deadline`.
    pub async fn collect(&mut self, deadline: Instant) -> Option<CycleTally> {
        let rx = self.tally.take()?;
        match timeout_at(deadline, rx).await {
            Ok(Ok(tally)) => Some(tally),
            Ok(Err(_)) => {
                tracing::warn!(target: "activity", "slot {} ended without a tally", self.slot);
                None
            }
            Err(_) => None,
        }
    }

    /// Takes the motor thread's tally if it has already reported. `Pending`
    /// while the thread has yet to send it.
    pub fn try_collect(&mut self) -> Poll<Option<CycleTally>> {
        let Some(rx) = self.tally.as_mut() else {
            return Poll::Ready(None);
        };
        let received = match rx.try_recv() {
            Ok(tally) => Some(tally),
            Err(TryRecvError::Empty) => return Poll::Pending,
            Err(TryRecvError::Closed) => {
                tracing::warn!(target: "activity", "slot {} ended without a tally", self.slot);
                None
            }
        };
        self.tally = None;
        Poll::Ready(received)
    }

    pub fn has_thread(&self) -> bool {
        self.tally.is_some()
    }
}
