//! Inference Error Taxonomy
//!
//! One error enum per layer, with a single umbrella `InferenceError` used by
//! the driver and the binaries. Policies follow a strict split:
//!
//! - `ConfigError` / `ObservationError` / `ResumeError`: fatal at startup.
//! - `SimulatorError`: per-iteration rejection, counted; fatal only past the
//!   configured failure limit.
//! - `NumericError`: per-iteration rejection, never fatal on its own.
//! - `PersistenceError`: fatal for the slot. No silent data loss.

use std::path::PathBuf;

/// Configuration is missing a required section or has an invalid shape.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
    MissingSection(&'static str),
    InvalidField { field: String, reason: String },
    UnknownSubpop { context: String, subpop: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config read failed: {}", e),
            Self::Parse(e) => write!(f, "config parse failed: {}", e),
            Self::MissingSection(s) => write!(f, "missing required config section: {}", s),
            Self::InvalidField { field, reason } => {
                write!(f, "invalid config field `{}`: {}", field, reason)
            }
            Self::UnknownSubpop { context, subpop } => {
                write!(f, "{} references unknown subpopulation `{}`", context, subpop)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

/// Ground-truth observation file is missing or contains unusable rows.
#[derive(Debug)]
pub enum ObservationError {
    Io { path: PathBuf, source: std::io::Error },
    Malformed { path: PathBuf, detail: String },
    UnknownSubpop { row: usize, subpop: String },
    DuplicateRow { date: String, subpop: String },
}

impl std::fmt::Display for ObservationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "observation file {} unreadable: {}", path.display(), source)
            }
            Self::Malformed { path, detail } => {
                write!(f, "observation file {} malformed: {}", path.display(), detail)
            }
            Self::UnknownSubpop { row, subpop } => {
                write!(f, "observation row {} names unknown subpopulation `{}`", row, subpop)
            }
            Self::DuplicateRow { date, subpop } => {
                write!(f, "duplicate observation row for ({}, {})", date, subpop)
            }
        }
    }
}

impl std::error::Error for ObservationError {}

/// The simulator raised, or returned a trajectory the core cannot use.
#[derive(Debug)]
pub enum SimulatorError {
    Failed(String),
    MalformedTrajectory { detail: String },
}

impl std::fmt::Display for SimulatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(msg) => write!(f, "simulator failed: {}", msg),
            Self::MalformedTrajectory { detail } => {
                write!(f, "simulator returned malformed trajectory: {}", detail)
            }
        }
    }
}

impl std::error::Error for SimulatorError {}

/// A parameter-group replacement did not match the declared schema.
#[derive(Debug)]
pub enum ParamError {
    InvalidParameterShape { group: &'static str, detail: String },
}

impl std::fmt::Display for ParamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidParameterShape { group, detail } => {
                write!(f, "invalid parameter shape for group {}: {}", group, detail)
            }
        }
    }
}

impl std::error::Error for ParamError {}

/// Artifact write or read failed. Always fatal for the slot.
#[derive(Debug)]
pub enum PersistenceError {
    Io { path: PathBuf, source: std::io::Error },
    Csv { path: PathBuf, detail: String },
    Archive(String),
}

impl std::fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "artifact I/O failed at {}: {}", path.display(), source)
            }
            Self::Csv { path, detail } => {
                write!(f, "artifact table {} unusable: {}", path.display(), detail)
            }
            Self::Archive(detail) => write!(f, "ensemble archive error: {}", detail),
        }
    }
}

impl std::error::Error for PersistenceError {}

/// Prior artifacts absent or inconsistent with the configuration.
#[derive(Debug)]
pub enum ResumeError {
    MissingArtifact { path: PathBuf },
    Inconsistent { detail: String },
}

impl std::fmt::Display for ResumeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingArtifact { path } => {
                write!(f, "resume artifact missing: {}", path.display())
            }
            Self::Inconsistent { detail } => write!(f, "resume state inconsistent: {}", detail),
        }
    }
}

impl std::error::Error for ResumeError {}

/// Umbrella error for the driver and binaries.
#[derive(Debug)]
pub enum InferenceError {
    Config(ConfigError),
    Observation(ObservationError),
    /// Simulator failures exceeded the configured limit for the slot.
    SimulatorLimit { slot: usize, iteration: u64, failures: u32, last: SimulatorError },
    /// The initial simulation failed; there is no previous state to fall back to.
    SimulatorAtInit { slot: usize, source: SimulatorError },
    /// Likelihood or prior evaluated to NaN where a finite or -inf value was required.
    Numeric { slot: usize, iteration: u64, detail: String },
    Param(ParamError),
    Persistence { slot: usize, source: PersistenceError },
    Resume { slot: usize, source: ResumeError },
}

impl InferenceError {
    /// Short kind name used in log records and the CLI summary line.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigurationError",
            Self::Observation(_) => "ObservationError",
            Self::SimulatorLimit { .. } | Self::SimulatorAtInit { .. } => "SimulatorError",
            Self::Numeric { .. } => "NumericError",
            Self::Param(_) => "ParameterError",
            Self::Persistence { .. } => "PersistenceError",
            Self::Resume { .. } => "ResumeError",
        }
    }

    /// Process exit code for the CLI: 2 for startup (config/observation)
    /// errors, 3 for runtime errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Observation(_) => 2,
            _ => 3,
        }
    }
}

impl std::fmt::Display for InferenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{}", e),
            Self::Observation(e) => write!(f, "{}", e),
            Self::SimulatorLimit { slot, iteration, failures, last } => write!(
                f,
                "slot {} aborted at iteration {}: {} simulator failures (last: {})",
                slot, iteration, failures, last
            ),
            Self::SimulatorAtInit { slot, source } => {
                write!(f, "slot {} failed to simulate the initial sample: {}", slot, source)
            }
            Self::Numeric { slot, iteration, detail } => {
                write!(f, "slot {} iteration {}: {}", slot, iteration, detail)
            }
            Self::Param(e) => write!(f, "{}", e),
            Self::Persistence { slot, source } => write!(f, "slot {}: {}", slot, source),
            Self::Resume { slot, source } => write!(f, "slot {}: {}", slot, source),
        }
    }
}

impl std::error::Error for InferenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Observation(e) => Some(e),
            Self::SimulatorLimit { last, .. } => Some(last),
            Self::SimulatorAtInit { source, .. } => Some(source),
            Self::Numeric { .. } => None,
            Self::Param(e) => Some(e),
            Self::Persistence { source, .. } => Some(source),
            Self::Resume { source, .. } => Some(source),
        }
    }
}

impl From<ConfigError> for InferenceError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<ObservationError> for InferenceError {
    fn from(e: ObservationError) -> Self {
        Self::Observation(e)
    }
}

impl From<ParamError> for InferenceError {
    fn from(e: ParamError) -> Self {
        Self::Param(e)
    }
}
