use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::{fmt::Debug, future::Future, time::Duration};

use crate::{Aggregate, CycleTally, ReportError};

/// Human- or machine-friendly view of an [`Aggregate`].
pub trait Report<A>
where
    Self: Send + Sync + Debug + From<A> + Serialize + DeserializeOwned,
    A: Aggregate,
{
}

/// Sends reports somewhere: stdout, a file, a database.
pub trait Reporter<A: Aggregate, R: Report<A>> {
    fn report(&self, report: R) -> impl Future<Output = Result<(), ReportError>> + Send;
}

/// Summary of one activity run.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ActivityReport {
    pub alias: String,
    pub cycles: u64,
    pub successes: u64,
    pub failures: u64,
    pub halts: u64,
    pub aborts: u64,
    /// Percentage of cycles that succeeded.
    pub success_ratio: f64,
    pub mean_service_time: Duration,
    pub max_service_time: Duration,
    pub mean_admission_wait: Duration,
    pub max_admission_wait: Duration,
    /// How far the limiter's schedule is behind, in nanoseconds.
    pub total_wait_ns: i64,
    pub elapsed: Duration,
    pub ops_per_sec: f64,
}

impl From<CycleTally> for ActivityReport {
    fn from(value: CycleTally) -> Self {
        let (success_ratio, mean_service_time, mean_admission_wait) = match value.cycles {
            0 => (0.0, Duration::ZERO, Duration::ZERO),
            n => (
                value.successes as f64 / n as f64 * 100.0,
                value.total_service_time.div_f64(n as f64),
                value.total_admission_wait.div_f64(n as f64),
            ),
        };
        Self {
            alias: String::new(),
            cycles: value.cycles,
            successes: value.successes,
            failures: value.failures,
            halts: value.halts,
            aborts: value.aborts,
            success_ratio,
            mean_service_time,
            max_service_time: value.max_service_time,
            mean_admission_wait,
            max_admission_wait: value.max_admission_wait,
            total_wait_ns: 0,
            elapsed: Duration::ZERO,
            ops_per_sec: 0.0,
        }
    }
}

impl Report<CycleTally> for ActivityReport {}

impl ActivityReport {
    /// Fills in what the tally alone does not know.
    pub fn for_activity(mut self, alias: &str, elapsed: Duration, total_wait_ns: i64) -> Self {
        self.alias = alias.to_string();
        self.elapsed = elapsed;
        self.total_wait_ns = total_wait_ns;
        self.ops_per_sec = match elapsed.as_secs_f64() {
            s if s > 0.0 => self.cycles as f64 / s,
            _ => 0.0,
        };
        self
    }
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::io::Write;

    use parking_lot::Mutex;

    use super::*;

    pub struct StdoutReporter;

    impl Reporter<CycleTally, ActivityReport> for StdoutReporter {
        async fn report(&self, report: ActivityReport) -> Result<(), ReportError> {
            println!("{report:#?}");
            Ok(())
        }
    }

    /// Writes each report as one pretty-printed JSON document.
    pub struct JsonReporter<W> {
        out: Mutex<W>,
    }

    impl<W: Write + Send> JsonReporter<W> {
        pub fn new(out: W) -> Self {
            Self {
                out: Mutex::new(out),
            }
        }

        pub fn into_inner(self) -> W {
            self.out.into_inner()
        }
    }

    impl<W: Write + Send> Reporter<CycleTally, ActivityReport> for JsonReporter<W> {
        async fn report(&self, report: ActivityReport) -> Result<(), ReportError> {
            let mut out = self.out.lock();
            serde_json::to_writer_pretty(&mut *out, &report)?;
            writeln!(out)?;
            out.flush()?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tally() -> CycleTally {
        CycleTally {
            cycles: 4,
            successes: 3,
            failures: 1,
            total_service_time: Duration::from_millis(8),
            max_service_time: Duration::from_millis(5),
            ..CycleTally::default()
        }
    }

    #[test]
    fn derives_ratios_and_means() {
        let report = ActivityReport::from(tally());
        assert_eq!(report.success_ratio, 75.0);
        assert_eq!(report.mean_service_time, Duration::from_millis(2));
        assert_eq!(report.max_service_time, Duration::from_millis(5));
    }

    #[test]
    fn empty_tally_has_no_nan() {
        let report = ActivityReport::from(CycleTally::default());
        assert_eq!(report.success_ratio, 0.0);
        assert_eq!(report.mean_service_time, Duration::ZERO);
    }

    #[test]
    fn throughput_from_elapsed() {
        let report =
            ActivityReport::from(tally()).for_activity("reads", Duration::from_secs(2), 1_500);
        assert_eq!(report.alias, "reads");
        assert_eq!(report.ops_per_sec, 2.0);
        assert_eq!(report.total_wait_ns, 1_500);
    }

    #[cfg(feature = "builtins")]
    #[tokio::test]
    async fn json_reporter_writes_a_document() {
        let reporter = JsonReporter::new(Vec::new());
        let report = ActivityReport::from(tally()).for_activity("reads", Duration::from_secs(1), 0);
        reporter.report(report.clone()).await.unwrap();

        let written = reporter.into_inner();
        let parsed: ActivityReport = serde_json::from_slice(&written).unwrap();
        assert_eq!(parsed, report);
    }
}
