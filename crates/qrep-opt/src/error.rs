//! Optimizer error types.

use qrep_sim::SimError;
use thiserror::Error;

/// Result type for optimizer operations.
pub type OptResult<T> = Result<T, OptError>;

/// Errors that can occur while searching for a cut-off policy.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OptError {
    /// The protocol has no node a cut-off could act on.
    #[error("search space has no tunable dimensions")]
    EmptySearchSpace,

    /// A dimension's bounds are empty, non-finite or out of range.
    #[error("invalid bounds for dimension `{dimension}`: {reason}")]
    InvalidBounds {
        /// Name of the offending dimension.
        dimension: String,
        /// Constraint that was violated.
        reason: String,
    },

    /// An optimizer setting is out of range.
    #[error("invalid optimizer setting `{name}`: {reason}")]
    InvalidConfig { name: &'static str, reason: String },

    /// The Gaussian-process surrogate could not be fitted.
    #[error("surrogate model failed: {0}")]
    Surrogate(String),

    /// Reading or writing the trial log failed.
    #[error("trial log error: {0}")]
    Log(String),

    /// A non-recoverable simulation error.
    #[error(transparent)]
    Sim(#[from] SimError),
}

impl From<std::io::Error> for OptError {
    fn from(e: std::io::Error) -> Self {
        OptError::Log(e.to_string())
    }
}

impl From<serde_json::Error> for OptError {
    fn from(e: serde_json::Error) -> Self {
        OptError::Log(e.to_string())
    }
}
