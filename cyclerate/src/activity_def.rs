use std::{collections::BTreeMap, fmt, ops::Range, str::FromStr};

use cyclerate_core::{RateSpec, unit};
use serde::{Deserialize, Serialize};

use crate::ParamError;

pub const ALIAS: &str = "alias";
pub const DRIVER: &str = "driver";
pub const TYPE: &str = "type";
pub const THREADS: &str = "threads";
pub const CYCLES: &str = "cycles";
pub const CYCLERATE: &str = "cyclerate";
pub const RATE: &str = "rate";

/// The parameters of one activity, parsed from `key=value;key=value`.
///
/// A handful of keys are understood here; everything else is passed through to
/// the activity's driver untouched.
///
/// | key                 | meaning                                              | default       |
/// |---------------------|------------------------------------------------------|---------------|
/// | `alias`             | name of the activity                                 | driver name   |
/// | `driver` / `type`   | registered driver that builds the activity           | inferred      |
/// | `threads`           | `N`, `auto` (one per cpu) or `Nx` (N per cpu)        | `1`           |
/// | `cycles`            | `N` for `0..N` or `M..N`, unit suffixes allowed      | `0..1`        |
/// | `cyclerate`/`rate`  | a rate spec such as `1000,1.1,start`                 | unlimited     |
///
/// ```
/// use cyclerate::ActivityDef;
///
/// let def: ActivityDef = "alias=writes;threads=4;cycles=1K..2K;cyclerate=500".parse().unwrap();
/// assert_eq!(def.alias(), "writes");
/// assert_eq!(def.threads().unwrap(), 4);
/// assert_eq!(def.cycles().unwrap(), 1_000..2_000);
/// assert_eq!(def.rate_spec().unwrap().unwrap().ops_per_sec(), 500.0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityDef {
    params: BTreeMap<String, String>,
}

impl ActivityDef {
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            params: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Sets a parameter, returning the previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.params.insert(name.into(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.params.remove(name)
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn alias(&self) -> String {
        self.get(ALIAS)
            .or_else(|| self.driver())
            .unwrap_or("unnamed")
            .to_string()
    }

    pub fn driver(&self) -> Option<&str> {
        self.get(DRIVER).or_else(|| self.get(TYPE))
    }

    pub fn threads(&self) -> Result<usize, ParamError> {
        match self.get(THREADS) {
            None => Ok(1),
            Some(value) => parse_threads(value),
        }
    }

    pub fn cycles(&self) -> Result<Range<u64>, ParamError> {
        match self.get(CYCLES) {
            None => Ok(0..1),
            Some(value) => parse_cycles(value),
        }
    }

    /// The configured cycle rate, if any.
    pub fn rate_spec(&self) -> Result<Option<RateSpec>, ParamError> {
        self.get(CYCLERATE)
            .or_else(|| self.get(RATE))
            .map(|value| value.parse::<RateSpec>().map_err(ParamError::from))
            .transpose()
    }
}

impl FromStr for ActivityDef {
    type Err = ParamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut params = BTreeMap::new();
        for field in s.split([';', '\n']).map(str::trim).filter(|f| !f.is_empty()) {
            let (name, value) = field
                .split_once('=')
                .ok_or_else(|| ParamError::MissingValue(field.to_string()))?;
            params.insert(name.trim().to_string(), value.trim().to_string());
        }
        Ok(Self { params })
    }
}

impl fmt::Display for ActivityDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in &self.params {
            if !first {
                f.write_str(";")?;
            }
            write!(f, "{name}={value}")?;
            first = false;
        }
        Ok(())
    }
}

fn invalid(name: &str, value: &str, reason: impl ToString) -> ParamError {
    ParamError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_threads(value: &str) -> Result<usize, ParamError> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("auto") {
        return Ok(num_cpus::get());
    }
    if let Some(per_cpu) = value.strip_suffix(['x', 'X']) {
        let n = unit::count_u64(per_cpu).map_err(|e| invalid(THREADS, value, e))?;
        return usize::try_from(n)
            .ok()
            .and_then(|n| n.checked_mul(num_cpus::get()))
            .ok_or_else(|| invalid(THREADS, value, "thread count overflows"));
    }
    let n = unit::count_u64(value).map_err(|e| invalid(THREADS, value, e))?;
    usize::try_from(n).map_err(|e| invalid(THREADS, value, e))
}

fn parse_cycles(value: &str) -> Result<Range<u64>, ParamError> {
    let (start, end) = match value.split_once("..") {
        Some((start, end)) => (
            unit::count_u64(start).map_err(|e| invalid(CYCLES, value, e))?,
            unit::count_u64(end).map_err(|e| invalid(CYCLES, value, e))?,
        ),
        None => (0, unit::count_u64(value).map_err(|e| invalid(CYCLES, value, e))?),
    };
    if start > end {
        return Err(invalid(CYCLES, value, "start of range is after its end"));
    }
    Ok(start..end)
}
