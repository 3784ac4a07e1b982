use serde::{Serialize, de::DeserializeOwned};
use std::{fmt::Debug, time::Duration};

use crate::metric::{CycleSample, Metric, Outcome};

/// Collects [`Metric`]s into a compact, mergeable form.
///
/// Every motor keeps its own aggregate and hands it back when its thread ends;
/// the executor merges them in whatever order the motors finish. Final statistics
/// such as means and ratios are derived later by a report.
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative**.
/// - Keep raw sums and counts here. Derived values belong in the report.
pub trait Aggregate
where
    Self: Serialize + DeserializeOwned + PartialEq + Send + Sync + Debug + Clone,
{
    type Metric: Metric;

    fn new() -> Self;

    /// Calls [`consume`](Aggregate::consume) for each metric.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    fn consume(&mut self, metric: &Self::Metric);

    fn merge(&mut self, other: Self);
}

/// Per-activity cycle counters.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CycleTally {
    pub cycles: u64,
    pub successes: u64,
    pub failures: u64,
    pub halts: u64,
    pub aborts: u64,
    pub total_service_time: Duration,
    pub max_service_time: Duration,
    pub total_admission_wait: Duration,
    pub max_admission_wait: Duration,
}

impl Aggregate for CycleTally {
    type Metric = CycleSample;

    fn new() -> Self {
        CycleTally::default()
    }

    fn consume(&mut self, sample: &Self::Metric) {
        self.cycles += 1;
        match sample.outcome {
            Outcome::Success => self.successes += 1,
            Outcome::Failure(_) => self.failures += 1,
            Outcome::Halted => self.halts += 1,
            Outcome::Aborted => self.aborts += 1,
        }
        self.total_service_time += sample.service_time;
        self.max_service_time = self.max_service_time.max(sample.service_time);
        self.total_admission_wait += sample.admission_wait;
        self.max_admission_wait = self.max_admission_wait.max(sample.admission_wait);
    }

    fn merge(&mut self, other: Self) {
        self.cycles += other.cycles;
        self.successes += other.successes;
        self.failures += other.failures;
        self.halts += other.halts;
        self.aborts += other.aborts;
        self.total_service_time += other.total_service_time;
        self.max_service_time = self.max_service_time.max(other.max_service_time);
        self.total_admission_wait += other.total_admission_wait;
        self.max_admission_wait = self.max_admission_wait.max(other.max_admission_wait);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cycle: u64, micros: u64, outcome: Outcome) -> CycleSample {
        CycleSample {
            cycle,
            service_time: Duration::from_micros(micros),
            admission_wait: Duration::from_micros(cycle),
            outcome,
        }
    }

    #[test]
    fn consume_counts_outcomes() {
        let mut tally = CycleTally::new();
        tally.aggregate(&[
            sample(1, 10, Outcome::Success),
            sample(2, 30, Outcome::Failure(2)),
            sample(3, 20, Outcome::Halted),
        ]);
        assert_eq!(tally.cycles, 3);
        assert_eq!(tally.successes, 1);
        assert_eq!(tally.failures, 1);
        assert_eq!(tally.halts, 1);
        assert_eq!(tally.total_service_time, Duration::from_micros(60));
        assert_eq!(tally.max_service_time, Duration::from_micros(30));
        assert_eq!(tally.max_admission_wait, Duration::from_micros(3));
    }

    #[test]
    fn merge_is_order_independent() {
        let mut a = CycleTally::new();
        a.consume(&sample(1, 5, Outcome::Success));
        let mut b = CycleTally::new();
        b.consume(&sample(2, 50, Outcome::Aborted));
        let mut c = CycleTally::new();
        c.consume(&sample(3, 7, Outcome::Failure(1)));

        let mut left = a.clone();
        left.merge(b.clone());
        left.merge(c.clone());

        let mut right = c;
        right.merge(a);
        right.merge(b);

        assert_eq!(left, right);
        assert_eq!(left.cycles, 3);
        assert_eq!(left.aborts, 1);
    }
}
