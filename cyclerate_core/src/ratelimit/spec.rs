use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{ConfigError, unit};

pub const DEFAULT_BURST_RATIO: f64 = 1.1;

/// Life-cycle intent that travels with a [`RateSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    /// Reconfigure the limiter without starting it.
    Configure,
    /// Start the limiter if it is idle.
    #[default]
    Start,
    /// Discard accrued timing state and start over.
    Restart,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verb::Configure => "configure",
            Verb::Start => "start",
            Verb::Restart => "restart",
        })
    }
}

impl FromStr for Verb {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "configure" => Ok(Verb::Configure),
            "start" => Ok(Verb::Start),
            "restart" => Ok(Verb::Restart),
            _ => Err(ConfigError::UnknownVerb(s.to_string())),
        }
    }
}

/// A target rate, the burst ratio above it and what to do when it is applied.
///
/// Parsed from `<rate>[,<burstRatio>[,<verb>]]`, where `,`, `:` and `;` are all
/// accepted as separators:
///
/// ```
/// use cyclerate_core::{RateSpec, Verb};
///
/// let spec: RateSpec = "1000,1.05,restart".parse().unwrap();
/// assert_eq!(spec.ops_per_sec(), 1000.0);
/// assert_eq!(spec.burst_ratio(), 1.05);
/// assert_eq!(spec.verb(), Verb::Restart);
/// assert_eq!(spec.nanos_per_op(), 1_000_000);
/// ```
///
/// Two specs are equal when rate and burst ratio match; the verb is ignored so that
/// re-applying the same numbers can be detected as a no-op.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateSpec {
    ops_per_sec: f64,
    burst_ratio: f64,
    verb: Verb,
}

impl RateSpec {
    pub fn new(ops_per_sec: f64, burst_ratio: f64, verb: Verb) -> Result<Self, ConfigError> {
        if !ops_per_sec.is_finite() || ops_per_sec <= 0.0 {
            return Err(ConfigError::InvalidRate(ops_per_sec));
        }
        if burst_ratio.is_nan() || burst_ratio < 1.0 {
            return Err(ConfigError::BurstRatio(burst_ratio));
        }
        Ok(Self {
            ops_per_sec,
            burst_ratio,
            verb,
        })
    }

    /// A spec with the default burst ratio and the `start` verb.
    pub fn with_ops(ops_per_sec: f64) -> Result<Self, ConfigError> {
        Self::new(ops_per_sec, DEFAULT_BURST_RATIO, Verb::Start)
    }

    pub fn with_rate(&self, ops_per_sec: f64) -> Result<Self, ConfigError> {
        Self::new(ops_per_sec, self.burst_ratio, self.verb)
    }

    pub fn with_burst_ratio(&self, burst_ratio: f64) -> Result<Self, ConfigError> {
        Self::new(self.ops_per_sec, burst_ratio, self.verb)
    }

    pub fn with_verb(&self, verb: Verb) -> Self {
        Self { verb, ..*self }
    }

    pub fn ops_per_sec(&self) -> f64 {
        self.ops_per_sec
    }

    pub fn burst_ratio(&self) -> f64 {
        self.burst_ratio
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    /// Nanoseconds of entitlement one operation costs.
    pub fn nanos_per_op(&self) -> i64 {
        (1e9 / self.ops_per_sec).round() as i64
    }

    pub fn is_auto_start(&self) -> bool {
        matches!(self.verb, Verb::Start | Verb::Restart)
    }

    pub fn is_restart(&self) -> bool {
        self.verb == Verb::Restart
    }
}

impl PartialEq for RateSpec {
    fn eq(&self, other: &Self) -> bool {
        self.ops_per_sec.to_bits() == other.ops_per_sec.to_bits()
            && self.burst_ratio.to_bits() == other.burst_ratio.to_bits()
    }
}

impl FromStr for RateSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split([',', ':', ';']).collect();
        if fields.len() > 3 {
            return Err(ConfigError::MalformedRateSpec(s.to_string()));
        }

        let ops_per_sec = unit::count(fields[0])?;
        let burst_ratio = match fields.get(1) {
            Some(field) => field
                .trim()
                .parse::<f64>()
                .map_err(|_| ConfigError::UnparsableBurstRatio(field.to_string()))?,
            None => DEFAULT_BURST_RATIO,
        };
        let verb = match fields.get(2) {
            Some(field) => field.parse()?,
            None => Verb::default(),
        };
        tracing::trace!(ops_per_sec, burst_ratio, %verb, "parsed rate spec '{s}'");

        Self::new(ops_per_sec, burst_ratio, verb)
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rate = format_ops(self.ops_per_sec);
        let burst = format_ops(self.ops_per_sec * self.burst_ratio);
        write!(
            f,
            "rate={rate} burstRatio={:.3} ({rate} SOPSS {burst} BOPSS) [{}]",
            self.burst_ratio, self.verb
        )
    }
}

/// Whole rates print without decimals, fractional ones with three.
fn format_ops(ops: f64) -> String {
    if (ops - ops.trunc()).abs() > 0.001 {
        format!("{ops:.3}")
    } else {
        format!("{}", ops.trunc() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod parse {
        use super::*;

        #[test]
        fn rate_only() {
            let spec: RateSpec = "200".parse().unwrap();
            assert_eq!(spec.ops_per_sec(), 200.0);
            assert_eq!(spec.burst_ratio(), 1.1);
            assert_eq!(spec.verb(), Verb::Start);
        }

        #[test]
        fn rate_and_burst() {
            let spec: RateSpec = "3.6,2".parse().unwrap();
            assert_eq!(spec.ops_per_sec(), 3.6);
            assert_eq!(spec.burst_ratio(), 2.0);
            assert_eq!(spec.verb(), Verb::Start);
        }

        #[test]
        fn rate_burst_and_verb() {
            let spec: RateSpec = "1000,1.05,restart".parse().unwrap();
            assert_eq!(spec.ops_per_sec(), 1000.0);
            assert_eq!(spec.burst_ratio(), 1.05);
            assert_eq!(spec.verb(), Verb::Restart);
        }

        #[test]
        fn alternate_separators_and_units() {
            let spec: RateSpec = "5K:1.5;Configure".parse().unwrap();
            assert_eq!(spec.ops_per_sec(), 5_000.0);
            assert_eq!(spec.burst_ratio(), 1.5);
            assert_eq!(spec.verb(), Verb::Configure);
        }

        #[test]
        fn burst_below_one_fails() {
            assert_eq!(
                "100,0.9".parse::<RateSpec>(),
                Err(ConfigError::BurstRatio(0.9))
            );
        }

        #[test]
        fn too_many_fields_fails() {
            assert!(matches!(
                "1,2,start,4".parse::<RateSpec>(),
                Err(ConfigError::MalformedRateSpec(_))
            ));
        }

        #[test]
        fn bad_fields_fail() {
            assert!("fast".parse::<RateSpec>().is_err());
            assert!(matches!(
                "10,wide".parse::<RateSpec>(),
                Err(ConfigError::UnparsableBurstRatio(_))
            ));
            assert!(matches!(
                "10,1.2,go".parse::<RateSpec>(),
                Err(ConfigError::UnknownVerb(_))
            ));
            assert!(matches!(
                "0".parse::<RateSpec>(),
                Err(ConfigError::InvalidRate(_))
            ));
        }
    }

    #[test]
    fn nanos_per_op_is_rounded() {
        for ops in [1.0, 3.0, 3.6, 7.0, 100.0, 333.3, 1e6, 2.5e8] {
            let spec = RateSpec::with_ops(ops).unwrap();
            assert_eq!(spec.nanos_per_op(), (1e9 / ops).round() as i64);
        }
        assert_eq!(RateSpec::with_ops(3.0).unwrap().nanos_per_op(), 333_333_333);
    }

    #[test]
    fn equality_ignores_verb() {
        let a = RateSpec::new(10.0, 1.1, Verb::Start).unwrap();
        let b = a.with_verb(Verb::Restart);
        assert_eq!(a, b);
        assert_ne!(a, a.with_burst_ratio(2.0).unwrap());
        assert_ne!(a, a.with_rate(11.0).unwrap());
    }

    #[test]
    fn copy_helpers_validate() {
        let spec = RateSpec::with_ops(10.0).unwrap();
        assert!(spec.with_burst_ratio(0.5).is_err());
        assert!(spec.with_rate(-1.0).is_err());
        assert_eq!(spec.with_verb(Verb::Configure).verb(), Verb::Configure);
    }

    #[test]
    fn auto_start_verbs() {
        let spec = RateSpec::with_ops(1.0).unwrap();
        assert!(spec.is_auto_start());
        assert!(spec.with_verb(Verb::Restart).is_auto_start());
        assert!(spec.with_verb(Verb::Restart).is_restart());
        assert!(!spec.with_verb(Verb::Configure).is_auto_start());
    }

    #[test]
    fn display() {
        let spec: RateSpec = "200".parse().unwrap();
        assert_eq!(
            spec.to_string(),
            "rate=200 burstRatio=1.100 (200 SOPSS 220 BOPSS) [start]"
        );
        let spec: RateSpec = "3.6,2,configure".parse().unwrap();
        assert_eq!(
            spec.to_string(),
            "rate=3.600 burstRatio=2.000 (3.600 SOPSS 7.200 BOPSS) [configure]"
        );
    }
}
