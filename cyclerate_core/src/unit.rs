//! Count parsing with metric-style suffixes.
//!
//! Rates, cycle counts and similar knobs are frequently written in a short-hand
//! form such as `5K`, `1.5M` or `2E6`. This module turns those strings into plain
//! numbers.
//!
//! # Accepted forms
//!
//! ```text
//! <whole>[.<fraction>][E<exponent>][ <unit>]
//! <base>^<exponent>
//! ```
//!
//! where `<unit>` matches (case-insensitively) either the label or the name of a
//! [`Count`]. An `E` followed by digits is a power of ten, a bare trailing `E` is
//! the exa unit.

use crate::ConfigError;

/// Count multipliers understood by [`count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Count {
    Unit,
    Kilo,
    Mega,
    Billion,
    Giga,
    Tera,
    Peta,
    Exa,
}

impl Count {
    pub const ALL: [Count; 8] = [
        Count::Unit,
        Count::Kilo,
        Count::Mega,
        Count::Billion,
        Count::Giga,
        Count::Tera,
        Count::Peta,
        Count::Exa,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Count::Unit => "U",
            Count::Kilo => "K",
            Count::Mega => "M",
            Count::Billion => "B",
            Count::Giga => "G",
            Count::Tera => "T",
            Count::Peta => "P",
            Count::Exa => "E",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Count::Unit => "unit",
            Count::Kilo => "kilo",
            Count::Mega => "mega",
            Count::Billion => "billion",
            Count::Giga => "giga",
            Count::Tera => "tera",
            Count::Peta => "peta",
            Count::Exa => "exa",
        }
    }

    pub fn multiplier(self) -> f64 {
        match self {
            Count::Unit => 1.0,
            Count::Kilo => 1e3,
            Count::Mega => 1e6,
            Count::Billion | Count::Giga => 1e9,
            Count::Tera => 1e12,
            Count::Peta => 1e15,
            Count::Exa => 1e18,
        }
    }

    /// Looks up a unit by label or name, ignoring case.
    pub fn from_suffix(suffix: &str) -> Option<Count> {
        Count::ALL.into_iter().find(|c| {
            c.label().eq_ignore_ascii_case(suffix) || c.name().eq_ignore_ascii_case(suffix)
        })
    }
}

/// Parses a possibly unit-suffixed count into a floating point value.
///
/// ```
/// use cyclerate_core::unit::count;
///
/// assert_eq!(count("5K").unwrap(), 5_000.0);
/// assert_eq!(count("2E3").unwrap(), 2_000.0);
/// assert_eq!(count("10^3").unwrap(), 1_000.0);
/// ```
pub fn count(spec: &str) -> Result<f64, ConfigError> {
    let trimmed = spec.trim();

    if let Some((base, exponent)) = trimmed.split_once('^') {
        let base: f64 = base
            .trim()
            .parse()
            .map_err(|_| ConfigError::UnparsableCount(spec.to_string()))?;
        let exponent: u32 = exponent
            .trim()
            .parse()
            .map_err(|_| ConfigError::UnparsableCount(spec.to_string()))?;
        return Ok(base.powi(exponent as i32));
    }

    let (number, rest) = split_number(trimmed);
    if number.is_empty() {
        return Err(ConfigError::UnparsableCount(spec.to_string()));
    }
    let base = parse_scientific(number).ok_or_else(|| ConfigError::UnparsableCount(spec.to_string()))?;

    let suffix = rest.trim();
    if suffix.is_empty() {
        return Ok(base);
    }
    match Count::from_suffix(suffix) {
        Some(unit) => Ok(base * unit.multiplier()),
        None => Err(ConfigError::UnknownUnit {
            input: spec.to_string(),
            unit: suffix.to_string(),
        }),
    }
}

/// Parses a count into an integer. `MAX` stands for `u64::MAX`.
pub fn count_u64(spec: &str) -> Result<u64, ConfigError> {
    let trimmed = spec.trim();
    if trimmed.eq_ignore_ascii_case("max") {
        return Ok(u64::MAX);
    }
    // Plain integers skip the float path so large values keep full precision.
    if let Ok(value) = trimmed.parse::<u64>() {
        return Ok(value);
    }
    let value = count(trimmed)?;
    if !value.is_finite() || value < 0.0 {
        return Err(ConfigError::UnparsableCount(spec.to_string()));
    }
    if value >= u64::MAX as f64 {
        return Ok(u64::MAX);
    }
    Ok(value.round() as u64)
}

/// Splits `<whole>[.<fraction>][E<digits>]` off the front of `s`.
fn split_number(s: &str) -> (&str, &str) {
    let bytes = s.as_bytes();
    let mut end = 0;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == 0 {
        return ("", s);
    }
    if end < bytes.len() && bytes[end] == b'.' {
        let mut frac = end + 1;
        while frac < bytes.len() && bytes[frac].is_ascii_digit() {
            frac += 1;
        }
        if frac > end + 1 {
            end = frac;
        }
    }
    if end < bytes.len() && bytes[end] == b'E' {
        let mut exp = end + 1;
        while exp < bytes.len() && bytes[exp].is_ascii_digit() {
            exp += 1;
        }
        if exp > end + 1 {
            end = exp;
        }
    }
    s.split_at(end)
}

fn parse_scientific(number: &str) -> Option<f64> {
    match number.split_once('E') {
        Some((mantissa, exponent)) => {
            let mantissa: f64 = mantissa.parse().ok()?;
            let exponent: i32 = exponent.parse().ok()?;
            Some(mantissa * 10f64.powi(exponent))
        }
        None => number.parse().ok(),
    }
}
