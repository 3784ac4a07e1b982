use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use serde::Serialize;
use tokio::sync::watch;

/// The life-cycle vocabulary shared by activities and their motors.
///
/// ```text
/// Uninitialized -> Starting -> Running -> Stopping -> Stopped
///                                    \-> Finished
///                                    \-> Errored
/// ```
///
/// `Stopped`, `Finished` and `Errored` are terminal for a motor. A stopped motor
/// may be started again; the other two never leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RunState {
    Uninitialized,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// The input ran out of cycles.
    Finished,
    /// The motor's thread panicked.
    Errored,
}

impl RunState {
    /// One-character code used in compact status lines.
    pub fn code(self) -> char {
        match self {
            RunState::Uninitialized => '_',
            RunState::Starting => 'S',
            RunState::Running => 'R',
            RunState::Stopping => 's',
            RunState::Stopped => 'X',
            RunState::Finished => 'F',
            RunState::Errored => 'E',
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Stopped | RunState::Finished | RunState::Errored)
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            RunState::Starting | RunState::Running | RunState::Stopping
        )
    }

    /// Whether a coordinator may ask for this state. `Stopping` and `Finished`
    /// are only ever reached by the motor itself.
    pub fn is_requestable(self) -> bool {
        matches!(
            self,
            RunState::Starting | RunState::Running | RunState::Stopped
        )
    }

    pub fn can_transition_to(self, to: RunState) -> bool {
        use RunState::*;
        match (self, to) {
            (Uninitialized | Stopped, Starting) => true,
            (Starting, Running | Stopping | Stopped | Finished | Errored) => true,
            (Running, Stopping | Stopped | Finished | Errored) => true,
            (Stopping, Stopped | Finished | Errored) => true,
            (Uninitialized, Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The published state of one motor slot.
///
/// The motor writes, everyone else reads through [`watch`] receivers so that
/// coordinators can wait for a state change without polling. The stop flag is
/// read by the motor between cycles.
#[derive(Debug)]
pub struct SlotState {
    tx: watch::Sender<RunState>,
    stop: AtomicBool,
}

impl SlotState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RunState::Uninitialized);
        Self {
            tx,
            stop: AtomicBool::new(false),
        }
    }

    pub fn get(&self) -> RunState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.tx.subscribe()
    }

    /// Moves to `to` if the transition is legal, returning whether it happened.
    pub fn transition(&self, to: RunState) -> bool {
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(to) {
                tracing::trace!("slot {current} -> {to}");
                *current = to;
                true
            } else {
                false
            }
        })
    }

    /// Moves to `to` only from `from`.
    pub fn transition_from(&self, from: RunState, to: RunState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == from && from.can_transition_to(to) {
                *current = to;
                true
            } else {
                false
            }
        })
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn clear_stop(&self) {
        self.stop.store(false, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

impl Default for SlotState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_three_states_are_requestable() {
        use RunState::*;
        let requestable: Vec<_> = [
            Uninitialized,
            Starting,
            Running,
            Stopping,
            Stopped,
            Finished,
            Errored,
        ]
        .into_iter()
        .filter(|s| s.is_requestable())
        .collect();
        assert_eq!(requestable, vec![Starting, Running, Stopped]);
    }

    #[test]
    fn terminal_states_do_not_move_backwards() {
        let slot = SlotState::new();
        assert!(slot.transition(RunState::Starting));
        assert!(slot.transition(RunState::Running));
        assert!(slot.transition(RunState::Finished));
        assert!(!slot.transition(RunState::Running));
        assert!(!slot.transition(RunState::Starting));
        assert_eq!(slot.get(), RunState::Finished);
    }

    #[test]
    fn stopped_slots_can_restart() {
        let slot = SlotState::new();
        slot.transition(RunState::Starting);
        slot.transition(RunState::Stopping);
        slot.transition(RunState::Stopped);
        assert!(slot.transition(RunState::Starting));
    }

    #[test]
    fn transition_from_checks_current() {
        let slot = SlotState::new();
        assert!(!slot.transition_from(RunState::Running, RunState::Stopping));
        assert!(slot.transition_from(RunState::Uninitialized, RunState::Starting));
    }

    #[tokio::test]
    async fn receivers_observe_changes() {
        let slot = SlotState::new();
        let mut rx = slot.subscribe();
        slot.transition(RunState::Starting);
        let seen = rx.wait_for(|s| *s == RunState::Starting).await.map(|s| *s);
        assert_eq!(seen.unwrap(), RunState::Starting);
    }

    #[test]
    fn codes_are_distinct() {
        use RunState::*;
        let codes: std::collections::HashSet<char> = [
            Uninitialized,
            Starting,
            Running,
            Stopping,
            Stopped,
            Finished,
            Errored,
        ]
        .into_iter()
        .map(RunState::code)
        .collect();
        assert_eq!(codes.len(), 7);
    }
}
