use std::{fmt::Debug, time::Duration};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// A single sample produced by a motor for one cycle.
pub trait Metric
where
    Self: Serialize + DeserializeOwned + PartialEq + Send + Sync + Debug + Clone,
{
}

/// What happened to one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    /// The action reported a non-zero result code.
    Failure(i32),
    /// The action asked to stop; the cycle still counts.
    Halted,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSample {
    pub cycle: u64,
    /// Time spent inside the action.
    pub service_time: Duration,
    /// Time spent blocked on the rate limiter before the cycle was admitted.
    pub admission_wait: Duration,
    pub outcome: Outcome,
}

impl Metric for CycleSample {}
