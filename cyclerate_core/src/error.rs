use thiserror::Error;

/// Errors produced while parsing or validating rate configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The count portion of a value could not be read as a number.
    #[error("unparsable count: '{0}'")]
    UnparsableCount(String),
    /// A unit suffix was given that is not one of the known count units.
    #[error("unknown unit '{unit}' in '{input}'")]
    UnknownUnit { input: String, unit: String },
    /// Rates must be finite and strictly positive.
    #[error("rate must be a positive, finite number of ops/s, got {0}")]
    InvalidRate(f64),
    /// Burst ratios below one would make the burst pool negative.
    #[error("burst ratios less than 1.0 are invalid, got {0}")]
    BurstRatio(f64),
    #[error("unparsable burst ratio: '{0}'")]
    UnparsableBurstRatio(String),
    #[error("unknown rate verb '{0}', expected one of configure, start, restart")]
    UnknownVerb(String),
    /// More fields than `<rate>[,<burst>[,<verb>]]` allows.
    #[error("rate specs must be '<rate>', '<rate>,<burstRatio>' or '<rate>,<burstRatio>,<verb>', got '{0}'")]
    MalformedRateSpec(String),
}
