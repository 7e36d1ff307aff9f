//! Error types for the sim crate.

use thiserror::Error;

/// Errors produced while building or evaluating a repeater protocol.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SimError {
    /// A physical, engine or cut-off parameter is outside its valid range.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        /// Name of the offending parameter.
        name: &'static str,
        /// Human-readable constraint that was violated.
        reason: String,
    },

    /// The protocol tree is malformed (dangling id, cycle, bad nesting).
    #[error("malformed protocol: {0}")]
    InvalidProtocol(String),

    /// The truncation horizon lost more probability mass than tolerated.
    ///
    /// Recoverable: re-run with a larger horizon.
    #[error(
        "truncation horizon T={truncation} covers only {coverage:.6} of the distribution \
         (lost mass {lost_mass:.3e} exceeds tolerance {tolerance:.1e})"
    )]
    Truncation {
        /// Probability mass inside the horizon.
        coverage: f64,
        /// Probability mass beyond the horizon.
        lost_mass: f64,
        /// Largest lost mass that would have been accepted.
        tolerance: f64,
        /// The horizon that was used.
        truncation: usize,
    },
}

impl SimError {
    /// Shorthand for [`SimError::InvalidParameter`].
    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    /// True if the caller can retry with different engine settings.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Truncation { .. })
    }
}

/// Result type for repeater simulation operations.
pub type SimResult<T> = Result<T, SimError>;
