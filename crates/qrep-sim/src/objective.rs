//! Secret-key-rate objective.
//!
//! The figure of merit is the asymptotic BB84 key rate: the key fraction of
//! the mean delivered Werner state divided by the mean waiting time.

use serde::{Deserialize, Serialize};

use crate::distribution::WaitingTimeDistribution;
use crate::params::werner_to_fidelity;

/// Knobs of the scoring function.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringParams {
    /// Offset added to the (non-positive) key fraction of infeasible
    /// distributions, keeping them below every feasible score.
    #[serde(default = "default_penalty")]
    pub infeasible_penalty: f64,
    /// Include the lost mass in the mean waiting time, assuming a geometric
    /// tail.
    #[serde(default)]
    pub tail_extrapolation: bool,
}

fn default_penalty() -> f64 {
    -1.0
}

impl Default for ScoringParams {
    fn default() -> Self {
        Self {
            infeasible_penalty: default_penalty(),
            tail_extrapolation: false,
        }
    }
}

/// Every quantity that enters the score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyRate {
    /// BB84 key fraction `1 - 2 h((1 - w̄) / 2)`.
    pub key_fraction: f64,
    pub mean_werner: f64,
    pub mean_fidelity: f64,
    pub mean_waiting_time: f64,
    /// Key bits per time step, 0 when infeasible.
    pub rate: f64,
    /// True when the key fraction is positive.
    pub feasible: bool,
}

/// Binary entropy in bits.
pub fn binary_entropy(p: f64) -> f64 {
    if p <= 0.0 || p >= 1.0 {
        return 0.0;
    }
    -p * p.log2() - (1.0 - p) * (1.0 - p).log2()
}

/// BB84 key fraction of a Werner state with parameter `w`.
pub fn key_fraction(w: f64) -> f64 {
    1.0 - 2.0 * binary_entropy((1.0 - w) / 2.0)
}

/// Break the score down into its ingredients.
pub fn key_rate_breakdown(dist: &WaitingTimeDistribution, params: &ScoringParams) -> KeyRate {
    let mean_werner = dist.mean_werner();
    let mean_waiting_time = if params.tail_extrapolation {
        dist.mean_waiting_time_extrapolated()
    } else {
        dist.mean_waiting_time()
    };
    let r = key_fraction(mean_werner);
    let feasible = r > 0.0 && mean_waiting_time.is_finite() && mean_waiting_time > 0.0;
    KeyRate {
        key_fraction: r,
        mean_werner,
        mean_fidelity: werner_to_fidelity(mean_werner),
        mean_waiting_time,
        rate: if feasible { r / mean_waiting_time } else { 0.0 },
        feasible,
    }
}

/// Scalar objective, larger is better.
///
/// Feasible distributions score their key rate. Infeasible ones score
/// `infeasible_penalty + key_fraction`, which keeps decreasing as the
/// fidelity drops.
pub fn score(dist: &WaitingTimeDistribution, params: &ScoringParams) -> f64 {
    let k = key_rate_breakdown(dist, params);
    if k.feasible {
        k.rate
    } else {
        params.infeasible_penalty + k.key_fraction.min(0.0)
    }
}
