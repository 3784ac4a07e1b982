//! ActivityExecutor — owns the motors of one activity
//!
//! An activity is a named stream of cycles run by a resizable set of motor
//! threads that share one cycle input and, optionally, one rate limiter. The
//! [`ActivityExecutor`] is the only party that creates, resizes or tears down
//! those motors.
//!
//! # High-level flow
//! 1. `start_activity` initializes the [`Activity`] once, resets the cycle
//!    input, builds or reconfigures the rate limiter from the `cyclerate`
//!    parameter and aligns the motors to `Running`.
//! 2. Aligning (`adjust_to_activity_def`) reconciles the live motor count with
//!    the `threads` parameter. Surplus motors are asked to stop and retired,
//!    retired motors that have stopped are dropped after their tallies are
//!    kept, and missing ones are created. Every motor not yet in the intended state is
//!    then started or stopped, and the executor waits, bounded by
//!    `align_timeout`, until each one reports a matching state.
//! 3. Motors run until the input is exhausted, a stop is requested or their
//!    action halts or aborts.
//! 4. `await_finish`, `stop_activity` or `force_stop` collect the motors'
//!    tallies and run the activity's shutdown hook.
//!
//! # Shutdown
//! - **Graceful** (`stop_activity`): every motor is asked to stop and the
//!   executor waits up to `stop_timeout` for all of them. A failing shutdown
//!   hook is returned as an error. On a timeout the stragglers are abandoned as
//!   in a forced stop, the activity still ends `Stopped` and the timeout is
//!   returned.
//! - **Forced** (`force_stop`): every motor is asked to stop, the executor waits
//!   up to the given grace period, then up to `forced_bound` more for tallies.
//!   Motors still running after that are abandoned; their threads exit on their
//!   own once they observe the stop. Errors are logged, never returned, and the
//!   activity always ends `Stopped`.
//!
//! # Failures
//! A motor whose action aborts, or whose thread panics, records the activity's
//! terminal error and triggers a forced stop in the background. The error is
//! returned by the next `await_finish`. A resize of a running activity that
//! fails is handled the same way, except the forced stop runs before `modify`
//! returns.
//!
//! # Tuning knobs
//! - `align_timeout`: how long a resize may take before it is an error.
//! - `stop_timeout`: graceful stop budget.
//! - `forced_bound`: extra time a forced stop spends collecting motors.
//! - `failure_grace`: grace period of the forced stop triggered by a failing motor.
//! - `pool`: token pool strategy and timing for the activity's rate limiter.
//! - `max_motors`: ceiling on the motor count of a single activity.

mod slots;

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    task::Poll,
    time::Duration,
};

use cyclerate_core::{LimiterState, PoolConfig, RateLimiter, RateSpec};
use parking_lot::RwLock;
use tokio::{
    runtime::Handle,
    sync::{Mutex, watch},
    time::Instant,
};
use typed_builder::TypedBuilder;

use crate::{
    Action, ActivityDef, ActivityReport, Aggregate, AtomicInput, CycleTally, ExecutorError, Result,
    RunState, SlotState,
    motor::{MotorContext, MotorEvent, Pacing},
};
use slots::{MotorSlot, STARTED, STOPPED};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The workload behind an activity.
///
/// `init` runs once before the first start, `action_for_slot` once for every
/// motor slot created, and `shutdown` after every stop.
pub trait Activity: Send + Sync {
    fn init(&self, _def: &ActivityDef) -> Result<(), BoxError> {
        Ok(())
    }

    fn action_for_slot(&self, slot: usize) -> Result<Arc<dyn Action>, BoxError>;

    /// Called before a changed definition takes effect. Returning an error
    /// rejects the change.
    fn on_def_update(&self, _def: &ActivityDef) -> Result<(), BoxError> {
        Ok(())
    }

    fn shutdown(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// An activity whose motors all share a single action.
pub struct SharedAction(Arc<dyn Action>);

impl SharedAction {
    pub fn new(action: impl Action + 'static) -> Self {
        Self(Arc::new(action))
    }
}

impl Activity for SharedAction {
    fn action_for_slot(&self, _slot: usize) -> Result<Arc<dyn Action>, BoxError> {
        Ok(self.0.clone())
    }
}

/// Timeouts and limits applied to every activity an executor runs.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ExecutorConfig {
    #[builder(default = Duration::from_secs(30))]
    pub align_timeout: Duration,
    #[builder(default = Duration::from_secs(60))]
    pub stop_timeout: Duration,
    #[builder(default = Duration::from_secs(5))]
    pub forced_bound: Duration,
    #[builder(default = Duration::from_secs(5))]
    pub failure_grace: Duration,
    #[builder(default)]
    pub pool: PoolConfig,
    // one OS thread per motor, so keep this sane
    #[builder(default = 4096)]
    pub max_motors: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Runs one activity. Cheap to clone; clones share the same activity.
#[derive(Clone)]
pub struct ActivityExecutor {
    shared: Arc<ExecutorShared>,
}

impl std::fmt::Debug for ActivityExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityExecutor")
            .field("alias", &self.shared.alias)
            .finish_non_exhaustive()
    }
}

struct ExecutorShared {
    alias: String,
    activity: Arc<dyn Activity>,
    config: ExecutorConfig,
    /// Held for the whole of every reconfiguration.
    control: Mutex<Control>,
    state: watch::Sender<RunState>,
    /// Read-only view of the live slots, refreshed under `control`.
    slots: watch::Sender<Vec<Arc<SlotState>>>,
    pacing: Pacing,
    input: Arc<AtomicInput>,
    failure: parking_lot::Mutex<Option<Arc<ExecutorError>>>,
}

struct Control {
    def: ActivityDef,
    motors: Vec<MotorSlot>,
    /// Shrunk-away slots whose motors may still be draining.
    retired: Vec<MotorSlot>,
    tally: CycleTally,
    initialized: bool,
    /// Stop flag of the current generation of motors.
    stopping: Arc<AtomicBool>,
    runtime: Option<Handle>,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
}

impl ActivityExecutor {
    pub fn new(def: ActivityDef, activity: Arc<dyn Activity>, config: ExecutorConfig) -> Self {
        let (state, _) = watch::channel(RunState::Uninitialized);
        let (slots, _) = watch::channel(Vec::new());
        let input = def.cycles().unwrap_or(0..1);
        Self {
            shared: Arc::new(ExecutorShared {
                alias: def.alias(),
                activity,
                config,
                control: Mutex::new(Control {
                    def,
                    motors: Vec::new(),
                    retired: Vec::new(),
                    tally: CycleTally::new(),
                    initialized: false,
                    stopping: Arc::new(AtomicBool::new(false)),
                    runtime: None,
                    started_at: None,
                    ended_at: None,
                }),
                state,
                slots,
                pacing: Arc::new(RwLock::new(None)),
                input: Arc::new(AtomicInput::new(input)),
                failure: parking_lot::Mutex::new(None),
            }),
        }
    }

    pub fn alias(&self) -> &str {
        &self.shared.alias
    }

    pub fn run_state(&self) -> RunState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.shared.state.subscribe()
    }

    /// Whether any motor is still working.
    pub fn is_running(&self) -> bool {
        match self.run_state() {
            RunState::Starting => true,
            RunState::Running | RunState::Stopping => {
                self.shared.slots.borrow().iter().any(|s| s.get().is_active())
            }
            _ => false,
        }
    }

    /// One state code per live slot, e.g. `RRRF`.
    pub fn slot_status(&self) -> String {
        self.shared.slots.borrow().iter().map(|s| s.get().code()).collect()
    }

    pub fn live_motors(&self) -> usize {
        self.shared.slots.borrow().len()
    }

    /// Shrunk-away motors that have not yet stopped and reported.
    pub async fn retired_motors(&self) -> usize {
        let mut control = self.shared.control.lock().await;
        Self::prune_retired(&mut control);
        control.retired.len()
    }

    pub fn limiter(&self) -> Option<Arc<RateLimiter>> {
        self.shared.pacing.read().clone()
    }

    /// The terminal error of the activity, if one was recorded.
    pub fn failure(&self) -> Option<Arc<ExecutorError>> {
        self.shared.failure.lock().clone()
    }

    pub async fn activity_def(&self) -> ActivityDef {
        self.shared.control.lock().await.def.clone()
    }

    /// Starts the activity and waits until every motor is running.
    ///
    /// On failure the activity is forced down, the error is recorded as its
    /// terminal error and returned.
    pub async fn start_activity(&self) -> Result<()> {
        let mut control = self.shared.control.lock().await;
        let state = self.run_state();
        if !matches!(
            state,
            RunState::Uninitialized | RunState::Stopped | RunState::Finished
        ) {
            return Err(ExecutorError::NotStartable {
                alias: self.shared.alias.clone(),
                state,
            });
        }

        tracing::info!(target: "activity", "Starting activity '{}': {}", self.shared.alias, control.def);
        self.shared.set_state(RunState::Starting);
        *self.shared.failure.lock() = None;
        control.runtime = Handle::try_current().ok();
        control.stopping = Arc::new(AtomicBool::new(false));

        let resume = state == RunState::Stopped;
        match self.launch(&mut control, resume).await {
            Ok(()) => {
                control.started_at = Some(Instant::now());
                control.ended_at = None;
                self.shared.set_state(RunState::Running);
                tracing::info!(
                    target: "activity",
                    "Activity '{}' running with {} motors",
                    self.shared.alias,
                    control.motors.len()
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(target: "activity", "Unable to start '{}': {e}", self.shared.alias);
                let failure = self.shared.record_failure(e);
                self.teardown(&mut control, Duration::ZERO).await;
                Err(ExecutorError::Failed {
                    alias: self.shared.alias.clone(),
                    source: failure,
                })
            }
        }
    }

    async fn launch(&self, control: &mut Control, resume: bool) -> Result<()> {
        let def = control.def.clone();
        if !control.initialized {
            self.shared
                .activity
                .init(&def)
                .map_err(|e| ExecutorError::ActivityInit {
                    alias: self.shared.alias.clone(),
                    reason: e.to_string(),
                })?;
            control.initialized = true;
        }

        let cycles = def.cycles()?;
        if resume {
            self.shared.input.set_range(cycles);
        } else {
            self.shared.input.reset(cycles);
        }
        self.shared.apply_pacing(def.rate_spec()?, &self.shared.config.pool);
        // a `configure` limiter waits for its activity to start
        if let Some(limiter) = self.limiter() {
            if limiter.state() == LimiterState::Idle {
                limiter.start();
            }
        }
        self.adjust_to_activity_def(control, RunState::Running).await
    }

    /// Reconciles the motors with the `threads` parameter and drives them all to
    /// `target`, waiting until they get there.
    async fn adjust_to_activity_def(&self, control: &mut Control, target: RunState) -> Result<()> {
        let alias = &self.shared.alias;
        if !target.is_requestable() {
            return Err(ExecutorError::InvalidRequestedState {
                alias: alias.clone(),
                requested: target,
            });
        }

        let mut desired = control.def.threads()?;
        if desired > self.shared.config.max_motors {
            tracing::warn!(
                target: "activity",
                "Activity '{alias}' asked for {desired} motors, capping at {}",
                self.shared.config.max_motors
            );
            desired = self.shared.config.max_motors;
        }

        Self::prune_retired(control);
        while control.motors.len() > desired {
            if let Some(motor) = control.motors.pop() {
                tracing::debug!(target: "activity", "Retiring motor {alias}:{}", motor.slot);
                motor.request_stop();
                control.retired.push(motor);
            }
        }
        let mut added = Vec::new();
        for slot in control.motors.len()..desired {
            let action = self
                .shared
                .activity
                .action_for_slot(slot)
                .map_err(|source| ExecutorError::MotorActivation {
                    alias: alias.clone(),
                    slot,
                    source,
                })?;
            added.push(MotorSlot::new(slot, action));
        }
        control.motors.extend(added);
        self.shared.publish_slots(control);

        let ctx = self.motor_context(control);
        let Control { motors, tally, .. } = control;
        for motor in motors.iter_mut() {
            match target {
                RunState::Starting | RunState::Running => {
                    if motor.is_launchable() {
                        let deadline = Instant::now() + self.shared.config.forced_bound;
                        if let Some(previous) = motor.collect(deadline).await {
                            tally.merge(previous);
                        }
                        motor.launch(&ctx).map_err(|e| ExecutorError::MotorActivation {
                            alias: alias.clone(),
                            slot: motor.slot,
                            source: Box::new(e),
                        })?;
                    }
                }
                _ => motor.request_stop(),
            }
        }

        let expected: Vec<RunState> = match target {
            RunState::Stopped => STOPPED.to_vec(),
            RunState::Starting => {
                let mut states = STARTED.to_vec();
                states.push(RunState::Starting);
                states
            }
            _ => STARTED.to_vec(),
        };
        let deadline = Instant::now() + self.shared.config.align_timeout;
        for motor in control.motors.iter() {
            motor.await_state(&expected, deadline).await.map_err(|from| {
                ExecutorError::AlignmentTimeout {
                    alias: alias.clone(),
                    slot: motor.slot,
                    from,
                    expected: expected.clone(),
                    timeout: self.shared.config.align_timeout,
                }
            })?;
        }
        tracing::debug!(
            target: "activity",
            "Activity '{alias}' aligned to {target}: {}",
            self.slot_status()
        );
        Ok(())
    }

    /// Drops retired slots whose motors have stopped, keeping their tallies.
    fn prune_retired(control: &mut Control) {
        let Control { retired, tally, .. } = control;
        retired.retain_mut(|motor| {
            if !motor.get().is_terminal() {
                return true;
            }
            match motor.try_collect() {
                Poll::Ready(Some(t)) => {
                    tally.merge(t);
                    false
                }
                Poll::Ready(None) => false,
                Poll::Pending => true,
            }
        });
    }

    fn motor_context(&self, control: &Control) -> MotorContext {
        let weak: Weak<ExecutorShared> = Arc::downgrade(&self.shared);
        let runtime = control.runtime.clone();
        let stopping = control.stopping.clone();
        let grace = self.shared.config.failure_grace;
        let on_event = {
            let stopping = stopping.clone();
            move |event: MotorEvent| {
                stopping.store(true, Ordering::Release);
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let error = match event {
                    MotorEvent::Aborted { slot, reason } => ExecutorError::Aborted {
                        alias: shared.alias.clone(),
                        slot,
                        reason,
                    },
                    MotorEvent::Panicked { slot, message } => ExecutorError::MotorPanicked {
                        alias: shared.alias.clone(),
                        slot,
                        message,
                    },
                };
                tracing::error!(target: "activity", "{error}");
                shared.record_failure(error);
                if let Some(runtime) = &runtime {
                    let executor = ActivityExecutor { shared };
                    runtime.spawn(async move { executor.force_stop(grace).await });
                }
            }
        };
        MotorContext {
            alias: Arc::from(self.shared.alias.as_str()),
            input: self.shared.input.clone(),
            pacing: self.shared.pacing.clone(),
            stopping,
            on_event: Arc::new(on_event),
        }
    }

    /// Applies a changed definition. While running, the rate, cycle range and
    /// motor count take effect immediately.
    ///
    /// A running activity that cannot be resized is forced down and the error
    /// becomes its terminal error.
    pub async fn modify(&self, def: ActivityDef) -> Result<()> {
        let alias = &self.shared.alias;
        if def.alias() != *alias {
            return Err(ExecutorError::AliasChange(alias.clone()));
        }
        // validate before anything changes
        def.threads()?;
        let cycles = def.cycles()?;
        let spec = def.rate_spec()?;

        let mut control = self.shared.control.lock().await;
        self.shared
            .activity
            .on_def_update(&def)
            .map_err(|e| ExecutorError::ActivityUpdate {
                alias: alias.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!(target: "activity", "Updating activity '{alias}': {def}");
        control.def = def;

        if self.run_state() == RunState::Running {
            self.shared.input.set_range(cycles);
            self.shared.apply_pacing(spec, &self.shared.config.pool);
            if let Err(e) = self.adjust_to_activity_def(&mut control, RunState::Running).await {
                tracing::error!(target: "activity", "Unable to resize '{alias}': {e}");
                let failure = self.shared.record_failure(e);
                self.teardown(&mut control, self.shared.config.failure_grace)
                    .await;
                return Err(ExecutorError::Failed {
                    alias: alias.clone(),
                    source: failure,
                });
            }
        }
        Ok(())
    }

    /// Sets a single parameter, then behaves like [`modify`](Self::modify).
    pub async fn set_param(&self, name: &str, value: &str) -> Result<()> {
        let mut def = self.activity_def().await;
        def.set(name, value);
        self.modify(def).await
    }

    /// Stops every motor and waits up to `stop_timeout` for them. Motors still
    /// running after that are abandoned as in [`force_stop`](Self::force_stop)
    /// and the timeout is returned; the activity ends `Stopped` either way.
    pub async fn stop_activity(&self) -> Result<()> {
        let mut control = self.shared.control.lock().await;
        if !self.run_state().is_active() {
            tracing::debug!(target: "activity", "Activity '{}' is not running", self.shared.alias);
            return Ok(());
        }
        tracing::info!(target: "activity", "Stopping activity '{}'", self.shared.alias);
        self.shared.set_state(RunState::Stopping);
        control.stopping.store(true, Ordering::Release);
        for motor in control.motors.iter().chain(control.retired.iter()) {
            motor.request_stop();
        }

        let timeout = self.shared.config.stop_timeout;
        let deadline = Instant::now() + timeout;
        let mut stopped = true;
        for motor in control.motors.iter().chain(control.retired.iter()) {
            if let Err(stuck) = motor.await_state(STOPPED, deadline).await {
                tracing::warn!(
                    target: "activity",
                    "Motor {}:{} still {stuck} after {timeout:?}",
                    self.shared.alias,
                    motor.slot
                );
                stopped = false;
                break;
            }
        }
        if !stopped {
            self.teardown(&mut control, Duration::ZERO).await;
            return Err(ExecutorError::StopTimeout {
                alias: self.shared.alias.clone(),
                timeout,
            });
        }

        self.finalize(&mut control, deadline, RunState::Stopped).await
    }

    /// Stops the activity no matter what. Waits `grace` for motors to stop and
    /// `forced_bound` for their tallies, then abandons the rest.
    pub async fn force_stop(&self, grace: Duration) {
        let mut control = self.shared.control.lock().await;
        self.teardown(&mut control, grace).await;
    }

    async fn teardown(&self, control: &mut Control, grace: Duration) {
        let alias = &self.shared.alias;
        let state = self.run_state();
        if matches!(state, RunState::Stopped | RunState::Finished)
            && control.motors.is_empty()
            && control.retired.is_empty()
        {
            return;
        }
        tracing::info!(target: "activity", "Force stopping activity '{alias}' with {grace:?} grace");
        self.shared.set_state(RunState::Stopping);
        control.stopping.store(true, Ordering::Release);
        for motor in control.motors.iter().chain(control.retired.iter()) {
            motor.request_stop();
        }

        let grace_deadline = Instant::now() + grace;
        for motor in control.motors.iter().chain(control.retired.iter()) {
            if let Err(stuck) = motor.await_state(STOPPED, grace_deadline).await {
                tracing::debug!(target: "activity", "Motor {alias}:{} still {stuck} after grace", motor.slot);
            }
        }

        let forced_deadline = Instant::now() + self.shared.config.forced_bound;
        let mut abandoned = 0;
        let Control {
            motors,
            retired,
            tally,
            ..
        } = control;
        for motor in motors.iter_mut().chain(retired.iter_mut()) {
            if !motor.has_thread() {
                continue;
            }
            match motor.collect(forced_deadline).await {
                Some(t) => tally.merge(t),
                None => abandoned += 1,
            }
        }
        if abandoned > 0 {
            tracing::warn!(target: "activity", "Abandoning {abandoned} unresponsive motors of '{alias}'");
        }
        control.motors.clear();
        control.retired.clear();
        self.shared.publish_slots(control);

        if let Err(e) = self.shared.activity.shutdown() {
            tracing::warn!(target: "activity", "Shutdown of '{alias}' failed: {e}");
        }
        control.ended_at = Some(Instant::now());
        self.shared.set_state(RunState::Stopped);
        tracing::info!(target: "activity", "Activity '{alias}' stopped");
    }

    /// Waits for every motor to finish, then completes the activity.
    ///
    /// Returns the activity's terminal error if one was recorded, and an error if
    /// the motors do not finish within `timeout`.
    pub async fn await_finish(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut published = self.shared.slots.subscribe();
        loop {
            if self.run_state() == RunState::Uninitialized {
                return Ok(());
            }
            let receivers: Vec<_> = published
                .borrow_and_update()
                .iter()
                .map(|s| s.subscribe())
                .collect();
            for mut rx in receivers {
                let timed_out = tokio::time::timeout_at(deadline, rx.wait_for(|s| s.is_terminal()))
                    .await
                    .is_err();
                if timed_out {
                    return Err(ExecutorError::AwaitTimeout {
                        alias: self.shared.alias.clone(),
                        timeout,
                    });
                }
            }

            let mut control = self.shared.control.lock().await;
            if control.motors.iter().all(|m| m.get().is_terminal()) {
                if self.run_state().is_active() {
                    let finished = control.motors.iter().all(|m| m.get() == RunState::Finished);
                    let end = if finished {
                        RunState::Finished
                    } else {
                        RunState::Stopped
                    };
                    let collect_deadline = Instant::now() + self.shared.config.stop_timeout;
                    self.finalize(&mut control, collect_deadline, end).await?;
                }
                return match self.failure() {
                    Some(source) => Err(ExecutorError::Failed {
                        alias: self.shared.alias.clone(),
                        source,
                    }),
                    None => Ok(()),
                };
            }
            // motors were added or relaunched while waiting
            drop(control);
            if tokio::time::timeout_at(deadline, published.changed())
                .await
                .is_err()
            {
                return Err(ExecutorError::AwaitTimeout {
                    alias: self.shared.alias.clone(),
                    timeout,
                });
            }
        }
    }

    /// Collects tallies, runs the shutdown hook and records the final state.
    async fn finalize(&self, control: &mut Control, deadline: Instant, end: RunState) -> Result<()> {
        let Control {
            motors,
            retired,
            tally,
            ..
        } = control;
        for motor in motors.iter_mut().chain(retired.iter_mut()) {
            if let Some(t) = motor.collect(deadline).await {
                tally.merge(t);
            }
        }
        control.motors.clear();
        control.retired.clear();
        self.shared.publish_slots(control);
        control.ended_at = Some(Instant::now());
        self.shared.set_state(end);

        let shutdown = self.shared.activity.shutdown();
        tracing::info!(
            target: "activity",
            "Activity '{}' {} after {} cycles",
            self.shared.alias,
            end,
            control.tally.cycles
        );
        shutdown.map_err(|e| ExecutorError::ActivityShutdown {
            alias: self.shared.alias.clone(),
            reason: e.to_string(),
        })
    }

    /// The cycles tallied so far. Motors report when they end, so the figures
    /// are complete once the activity has stopped or finished.
    pub async fn tally(&self) -> CycleTally {
        self.shared.control.lock().await.tally.clone()
    }

    pub async fn report(&self) -> ActivityReport {
        let control = self.shared.control.lock().await;
        let elapsed = match control.started_at {
            Some(start) => control.ended_at.unwrap_or_else(Instant::now) - start,
            None => Duration::ZERO,
        };
        let total_wait = self.limiter().map(|l| l.total_wait_time()).unwrap_or(0);
        ActivityReport::from(control.tally.clone()).for_activity(
            &self.shared.alias,
            elapsed,
            total_wait,
        )
    }
}

impl ExecutorShared {
    fn set_state(&self, state: RunState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(target: "activity", "Activity '{}' {previous} -> {state}", self.alias);
        }
    }

    fn publish_slots(&self, control: &Control) {
        self.slots
            .send_replace(control.motors.iter().map(|m| m.state.clone()).collect());
    }

    /// Keeps the first failure; later ones are only logged.
    fn record_failure(&self, error: ExecutorError) -> Arc<ExecutorError> {
        let mut failure = self.failure.lock();
        match failure.as_ref() {
            Some(first) => first.clone(),
            None => {
                let error = Arc::new(error);
                *failure = Some(error.clone());
                error
            }
        }
    }

    fn apply_pacing(&self, spec: Option<RateSpec>, pool: &PoolConfig) {
        let current = self.pacing.read().clone();
        match (current, spec) {
            (Some(limiter), Some(spec)) => limiter.apply_rate_spec(spec),
            (None, Some(spec)) => {
                let limiter = RateLimiter::new(format!("{}.cycles", self.alias), spec, pool);
                *self.pacing.write() = Some(Arc::new(limiter));
            }
            (Some(_), None) => {
                tracing::info!(target: "activity", "Removing rate limit from '{}'", self.alias);
                *self.pacing.write() = None;
            }
            (None, None) => {}
        }
    }
}

impl Drop for ExecutorShared {
    fn drop(&mut self) {
        let control = self.control.get_mut();
        control.stopping.store(true, Ordering::Release);
        for motor in control.motors.iter().chain(control.retired.iter()) {
            motor.request_stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU64, AtomicUsize},
        thread,
    };

    use super::*;
    use crate::CycleStatus;

    fn executor(def: &str, action: impl Action + 'static) -> ActivityExecutor {
        let config = ExecutorConfig::builder()
            .align_timeout(Duration::from_secs(5))
            .stop_timeout(Duration::from_secs(5))
            .forced_bound(Duration::from_millis(200))
            .failure_grace(Duration::from_millis(200))
            .build();
        ActivityExecutor::new(
            def.parse().unwrap(),
            Arc::new(SharedAction::new(action)),
            config,
        )
    }

    struct CountingActivity {
        inits: AtomicUsize,
        shutdowns: AtomicUsize,
        reject_updates: bool,
    }

    impl Activity for CountingActivity {
        fn init(&self, _def: &ActivityDef) -> Result<(), BoxError> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn action_for_slot(&self, _slot: usize) -> Result<Arc<dyn Action>, BoxError> {
            Ok(Arc::new(|_: u64| CycleStatus::OK))
        }

        fn on_def_update(&self, _def: &ActivityDef) -> Result<(), BoxError> {
            if self.reject_updates {
                return Err("read only".into());
            }
            Ok(())
        }

        fn shutdown(&self) -> Result<(), BoxError> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_every_cycle_once() {
        let executor = executor("alias=count;threads=4;cycles=1000", |_: u64| CycleStatus::OK);
        executor.start_activity().await.unwrap();
        executor.await_finish(Duration::from_secs(5)).await.unwrap();

        assert_eq!(executor.run_state(), RunState::Finished);
        let tally = executor.tally().await;
        assert_eq!(tally.cycles, 1000);
        assert_eq!(tally.successes, 1000);
        assert_eq!(executor.live_motors(), 0);
    }

    #[tokio::test]
    async fn await_before_start_returns_at_once() {
        let executor = executor("alias=idle", |_: u64| CycleStatus::OK);
        executor.await_finish(Duration::from_millis(10)).await.unwrap();
        assert_eq!(executor.run_state(), RunState::Uninitialized);
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let executor = executor("alias=twice;cycles=1E", |_: u64| CycleStatus::OK);
        executor.start_activity().await.unwrap();
        assert!(matches!(
            executor.start_activity().await,
            Err(ExecutorError::NotStartable { .. })
        ));
        executor.stop_activity().await.unwrap();
    }

    #[tokio::test]
    async fn resizes_while_running() {
        let executor = executor("alias=resize;threads=2;cycles=1E", |_: u64| CycleStatus::OK);
        executor.start_activity().await.unwrap();
        assert_eq!(executor.slot_status(), "RR");

        executor.set_param("threads", "5").await.unwrap();
        assert_eq!(executor.slot_status(), "RRRRR");

        executor.set_param("threads", "1").await.unwrap();
        assert_eq!(executor.slot_status(), "R");

        executor.stop_activity().await.unwrap();
        assert_eq!(executor.run_state(), RunState::Stopped);
        assert!(!executor.is_running());
    }

    /// Slot 0 halts once told to; later slots take a while to build and halt
    /// after 100 cycles.
    struct LateSlots {
        halt: Arc<AtomicBool>,
    }

    impl Activity for LateSlots {
        fn action_for_slot(&self, slot: usize) -> Result<Arc<dyn Action>, BoxError> {
            if slot == 0 {
                let halt = self.halt.clone();
                return Ok(Arc::new(move |_: u64| {
                    if halt.load(Ordering::Acquire) {
                        return CycleStatus::Halt;
                    }
                    thread::sleep(Duration::from_millis(1));
                    CycleStatus::OK
                }));
            }
            thread::sleep(Duration::from_millis(100));
            let done = AtomicU64::new(0);
            Ok(Arc::new(move |_: u64| {
                if done.fetch_add(1, Ordering::Relaxed) == 99 {
                    return CycleStatus::Halt;
                }
                thread::sleep(Duration::from_millis(1));
                CycleStatus::OK
            }))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn await_follows_motors_added_while_waiting() {
        let halt = Arc::new(AtomicBool::new(false));
        let executor = ActivityExecutor::new(
            "alias=late;threads=1;cycles=1E".parse().unwrap(),
            Arc::new(LateSlots { halt: halt.clone() }),
            ExecutorConfig::default(),
        );
        executor.start_activity().await.unwrap();

        let resizer = executor.clone();
        let grow = tokio::spawn(async move { resizer.set_param("threads", "2").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        // slot 0 ends while the resize still holds the activity
        halt.store(true, Ordering::Release);

        let begun = Instant::now();
        executor.await_finish(Duration::from_secs(5)).await.unwrap();
        grow.await.unwrap().unwrap();
        assert!(begun.elapsed() < Duration::from_secs(2));
        assert_eq!(executor.run_state(), RunState::Stopped);
        assert_eq!(executor.live_motors(), 0);
        // slot 0 halted twice, slot 1 once after its 100 cycles
        let tally = executor.tally().await;
        assert_eq!(tally.halts, 3);
        assert!(tally.cycles >= 100);
    }

    #[tokio::test]
    async fn await_times_out_while_motors_run() {
        let executor = executor("alias=endless;cycles=1E", |_: u64| CycleStatus::OK);
        executor.start_activity().await.unwrap();
        assert!(matches!(
            executor.await_finish(Duration::from_millis(50)).await,
            Err(ExecutorError::AwaitTimeout { .. })
        ));
        assert_eq!(executor.run_state(), RunState::Running);
        executor.stop_activity().await.unwrap();
    }

    #[tokio::test]
    async fn stop_then_resume_keeps_position() {
        let executor = executor("alias=resume;cycles=1E", |_: u64| CycleStatus::OK);
        executor.start_activity().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        executor.stop_activity().await.unwrap();
        let first = executor.tally().await.cycles;
        assert!(first > 0);

        executor.start_activity().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        executor.stop_activity().await.unwrap();
        assert!(executor.tally().await.cycles > first);
    }

    #[tokio::test]
    async fn lifecycle_hooks_run() {
        let activity = Arc::new(CountingActivity {
            inits: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            reject_updates: false,
        });
        let executor = ActivityExecutor::new(
            "alias=hooks;cycles=10".parse().unwrap(),
            activity.clone(),
            ExecutorConfig::default(),
        );
        for _ in 0..2 {
            executor.start_activity().await.unwrap();
            executor.await_finish(Duration::from_secs(5)).await.unwrap();
        }
        assert_eq!(activity.inits.load(Ordering::SeqCst), 1);
        assert_eq!(activity.shutdowns.load(Ordering::SeqCst), 2);
        assert_eq!(executor.tally().await.cycles, 20);
    }

    #[tokio::test]
    async fn rejected_update_leaves_def_alone() {
        let activity = Arc::new(CountingActivity {
            inits: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            reject_updates: true,
        });
        let executor = ActivityExecutor::new(
            "alias=fixed;threads=1".parse().unwrap(),
            activity,
            ExecutorConfig::default(),
        );
        let err = executor.set_param("threads", "3").await.unwrap_err();
        assert!(matches!(err, ExecutorError::ActivityUpdate { .. }));
        assert_eq!(executor.activity_def().await.get("threads"), Some("1"));
    }

    #[tokio::test]
    async fn alias_cannot_change() {
        let executor = executor("alias=named", |_: u64| CycleStatus::OK);
        let err = executor
            .modify("alias=renamed".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::AliasChange(_)));
    }

    #[tokio::test]
    async fn abort_fails_the_activity() {
        let executor = executor("alias=abort;threads=2;cycles=1E", |c: u64| {
            if c == 100 {
                CycleStatus::Abort("poisoned row".into())
            } else {
                CycleStatus::OK
            }
        });
        executor.start_activity().await.unwrap();
        let err = executor.await_finish(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(
            &err,
            ExecutorError::Failed { source, .. } if matches!(source.as_ref(), ExecutorError::Aborted { .. })
        ));
        assert_eq!(executor.run_state(), RunState::Stopped);
        assert!(executor.failure().is_some());
    }

    #[tokio::test]
    async fn rate_limit_is_applied_and_removed() {
        let executor = executor("alias=paced;cycles=1E;cyclerate=200", |_: u64| CycleStatus::OK);
        executor.start_activity().await.unwrap();
        let limiter = executor.limiter().unwrap();
        assert_eq!(limiter.state(), LimiterState::Started);
        assert_eq!(limiter.rate_spec().ops_per_sec(), 200.0);

        executor.set_param("cyclerate", "400").await.unwrap();
        assert!(Arc::ptr_eq(&limiter, &executor.limiter().unwrap()));
        assert_eq!(limiter.rate_spec().ops_per_sec(), 400.0);

        let mut def = executor.activity_def().await;
        def.remove("cyclerate");
        executor.modify(def).await.unwrap();
        assert!(executor.limiter().is_none());
        executor.stop_activity().await.unwrap();
    }

    #[tokio::test]
    async fn configured_limiter_starts_with_the_activity() {
        let executor = executor("alias=later;cycles=20;cyclerate=10000,1.1,configure", |_: u64| {
            CycleStatus::OK
        });
        executor.start_activity().await.unwrap();
        executor.await_finish(Duration::from_secs(5)).await.unwrap();
        assert_eq!(executor.tally().await.cycles, 20);
    }
}
