use std::{sync::Arc, time::Duration};

use cyclerate_core::ConfigError;
use thiserror::Error;

use crate::RunState;

/// Errors raised while parsing activity parameters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamError {
    #[error("parameter '{0}' has no '=' separator")]
    MissingValue(String),
    #[error("invalid value '{value}' for parameter '{name}': {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors surfaced by activity executors and the scenario controller.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(
        "activity '{alias}': slot {slot} did not move from {from} to one of {expected:?} within {timeout:?}"
    )]
    AlignmentTimeout {
        alias: String,
        slot: usize,
        from: RunState,
        expected: Vec<RunState>,
        timeout: Duration,
    },

    #[error("activity '{alias}': unable to activate slot {slot}: {source}")]
    MotorActivation {
        alias: String,
        slot: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("activity '{alias}' failed to initialize: {reason}")]
    ActivityInit { alias: String, reason: String },

    #[error("activity '{alias}' rejected its new definition: {reason}")]
    ActivityUpdate { alias: String, reason: String },

    #[error("activity '{alias}' failed during shutdown: {reason}")]
    ActivityShutdown { alias: String, reason: String },

    #[error("activity '{alias}' was aborted by slot {slot}: {reason}")]
    Aborted {
        alias: String,
        slot: usize,
        reason: String,
    },

    #[error("activity '{alias}': slot {slot} panicked: {message}")]
    MotorPanicked {
        alias: String,
        slot: usize,
        message: String,
    },

    #[error("no activity named '{0}'")]
    UnknownActivity(String),

    #[error("an activity named '{0}' is already running")]
    AlreadyRunning(String),

    #[error("no driver '{driver}' registered for activity '{alias}'")]
    UnknownDriver { alias: String, driver: String },

    #[error("activity '{alias}' names no driver and none could be inferred")]
    MissingDriver { alias: String },

    #[error("the alias of activity '{0}' cannot be changed")]
    AliasChange(String),

    #[error("activity '{alias}' cannot be requested to enter {requested}")]
    InvalidRequestedState { alias: String, requested: RunState },

    #[error("activity '{alias}' cannot be started from {state}")]
    NotStartable { alias: String, state: RunState },

    #[error("activity '{alias}' did not finish within {timeout:?}")]
    AwaitTimeout { alias: String, timeout: Duration },

    #[error("activity '{alias}' did not stop within {timeout:?}")]
    StopTimeout { alias: String, timeout: Duration },

    /// The stored terminal error of an activity, shared with every caller that
    /// asks for it.
    #[error("activity '{alias}' failed: {source}")]
    Failed {
        alias: String,
        #[source]
        source: Arc<ExecutorError>,
    },
}

pub type Result<T, E = ExecutorError> = std::result::Result<T, E>;

/// Errors raised while emitting a report.
#[derive(Error, Debug)]
pub enum ReportError {
    #[error("unable to write report: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to serialize report: {0}")]
    Json(#[from] serde_json::Error),
}
