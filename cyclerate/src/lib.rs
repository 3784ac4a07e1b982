//! Cyclerate — cycle-driven load generation with precise rate control.
//!
//! An *activity* is a numbered range of cycles executed by a pool of motor
//! threads. Each cycle is one call of a user supplied [`Action`]. Activities can
//! be paced by a token-pool [`RateLimiter`], resized and re-rated while they
//! run, stopped gracefully or forcibly, and summarized into reports.
//!
//! # Architecture
//!
//! - [`ScenarioController`]: registry of named activities and the drivers that
//!   build them. Start, modify, stop and await activities by alias.
//! - [`ActivityExecutor`]: owns the motors of one activity, keeps their number
//!   aligned with the `threads` parameter and drives them through their
//!   [`RunState`]s.
//! - [`Action`]: the per-cycle workload, any `Fn(u64) -> CycleStatus`.
//! - [`RateLimiter`]: admits cycles at the configured rate, with a burst
//!   allowance to recover from stalls. Lives in `cyclerate_core`.
//! - [`Metric`] / [`Aggregate`]: every cycle produces a [`CycleSample`] that
//!   motors fold into a [`CycleTally`].
//! - [`Report`] / [`Reporter`]: turn tallies into [`ActivityReport`]s and send
//!   them somewhere.
//!
//! # Example
//!
//! ```rust
//! use std::{sync::Arc, time::Duration};
//!
//! use cyclerate::{Activity, CycleStatus, ScenarioController, SharedAction};
//!
//! #[tokio::main]
//! async fn main() {
//!     let controller = ScenarioController::default();
//!     controller.register("noop", |_def| {
//!         let activity: Arc<dyn Activity> = Arc::new(SharedAction::new(|_cycle: u64| CycleStatus::OK));
//!         Ok(activity)
//!     });
//!
//!     // 200 cycles on two threads, paced at 1000 cycles per second
//!     let report = controller
//!         .run(
//!             "alias=noop_demo;threads=2;cycles=200;cyclerate=1000".parse().unwrap(),
//!             Duration::from_secs(10),
//!         )
//!         .await
//!         .unwrap();
//!     assert_eq!(report.cycles, 200);
//! }
//! ```
//!
//! # Feature flags
//!
//! - `builtins`: ready-made reporters (`StdoutReporter`, `JsonReporter`) for quick
//!   experiments and demos. (Enabled by default)

/// Activity parameters
pub mod activity_def;
/// Metric aggregators
pub mod aggregate;
pub mod error;
/// Activity executors and their motors
pub mod executor;
/// Cycle sources
pub mod input;
/// Single metrics
pub mod metric;
mod motor;
/// Reports and Reporters
pub mod report;
pub mod run_state;
/// Named activities and their drivers
pub mod scenario;

pub use activity_def::ActivityDef;
pub use aggregate::{Aggregate, CycleTally};
pub use error::{ExecutorError, ParamError, ReportError, Result};
pub use executor::{Activity, ActivityExecutor, BoxError, ExecutorConfig, SharedAction};
pub use input::{AtomicInput, Input};
pub use metric::{CycleSample, Metric, Outcome};
pub use motor::{Action, CycleStatus};
pub use report::{ActivityReport, Report, Reporter};
pub use run_state::{RunState, SlotState};
pub use scenario::{ActivityFactory, ScenarioController};

pub use cyclerate_core::{
    ConfigError, LimiterState, PoolConfig, PoolStrategy, RateLimiter, RateSpec, Verb, unit,
};
