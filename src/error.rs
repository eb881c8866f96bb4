//! Error taxonomy for a single replicate run.
//!
//! Every fatal error terminates only the replicate that raised it. Errors
//! carry the simulated time of the last completed macro-step boundary so a
//! caller can report where the run stopped without dumping the full state.

use cell_common::{ConfigError, RunStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Which engine currently holds the authoritative value of dual species.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Stochastic,
    Deterministic,
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::Stochastic => f.write_str("stochastic"),
            Engine::Deterministic => f.write_str("deterministic"),
        }
    }
}

/// Broken state invariants. Always fatal; values are never clamped to hide them.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Violation {
    #[error("count of '{species}' would go negative applying '{reaction}'")]
    NegativeCount { species: String, reaction: String },
    #[error("cell volume decreased from {previous_l:e} L to {current_l:e} L")]
    DecreasingVolume { previous_l: f64, current_l: f64 },
    #[error("{attempted} engine touched dual species while {owner} engine owns them")]
    OwnershipConflict { owner: Engine, attempted: Engine },
    #[error("concentration of '{species}' is {value_mm} mM after integration")]
    NegativeConcentration { species: String, value_mm: f64 },
}

/// Serializable error category, for structured failure reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    InvariantViolation,
    NumericalNonConvergence,
    IoFailure,
    InactiveRun,
}

#[derive(Debug, Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("invariant violation at t={time_sec:.1} s: {violation}")]
    InvariantViolation { time_sec: f64, violation: Violation },

    #[error(
        "metabolic integrator did not converge in macro-step {macro_step} (t={time_sec:.1} s) after {attempts} attempts: {reason} [species: {}]",
        .species.join(", ")
    )]
    NumericalNonConvergence {
        time_sec: f64,
        macro_step: u64,
        attempts: u32,
        reason: String,
        species: Vec<String>,
    },

    #[error("checkpoint {operation} failed for '{}': {source}", .path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        /// Simulated time of the checkpoint being written; unknown while reading.
        time_sec: Option<f64>,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot {operation}: run is {status}")]
    InactiveRun { operation: &'static str, status: RunStatus },
}

/// What a caller sees when a replicate fails: kind, time and a one-line message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: ErrorKind,
    pub time_sec: Option<f64>,
    pub message: String,
}

impl SimError {
    pub fn invariant(time_sec: f64, violation: Violation) -> Self {
        SimError::InvariantViolation { time_sec, violation }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SimError::Configuration(_) => ErrorKind::Configuration,
            SimError::InvariantViolation { .. } => ErrorKind::InvariantViolation,
            SimError::NumericalNonConvergence { .. } => ErrorKind::NumericalNonConvergence,
            SimError::Io { .. } => ErrorKind::IoFailure,
            SimError::InactiveRun { .. } => ErrorKind::InactiveRun,
        }
    }

    /// Simulated time of the last completed boundary, when the error arose while stepping.
    pub fn time_sec(&self) -> Option<f64> {
        match self {
            SimError::InvariantViolation { time_sec, .. }
            | SimError::NumericalNonConvergence { time_sec, .. } => Some(*time_sec),
            SimError::Io { time_sec, .. } => *time_sec,
            _ => None,
        }
    }

    /// Errors that end the run. Configuration and inactive-run errors leave it untouched.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SimError::InvariantViolation { .. } | SimError::NumericalNonConvergence { .. } | SimError::Io { .. }
        )
    }

    pub fn report(&self) -> FailureReport {
        FailureReport {
            kind: self.kind(),
            time_sec: self.time_sec(),
            message: self.to_string(),
        }
    }
}

pub type SimResult<T> = Result<T, SimError>;
