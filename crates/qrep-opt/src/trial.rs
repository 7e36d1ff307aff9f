//! Scored policy evaluations.

use qrep_sim::{
    CutoffPolicy, Engine, EngineConfig, KeyRate, PhysicalParams, ProtocolSpec, ScoringParams, SimError,
    key_rate_breakdown, score,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::OptResult;

/// How a trial ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    /// Positive key fraction.
    Scored,
    /// Evaluated, but the delivered pairs yield no key.
    BelowThreshold,
    /// The horizon lost more mass than tolerated.
    Truncated,
    /// Backends disagreed during the evaluation; the result is discarded.
    Diverged,
}

impl TrialStatus {
    pub fn is_feasible(self) -> bool {
        self == Self::Scored
    }
}

/// Figures reported alongside the score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialMetrics {
    pub key_rate: KeyRate,
    pub coverage: f64,
    pub lost_mass: f64,
    pub truncation: usize,
    /// Number of backend divergences observed.
    pub warnings: usize,
}

/// One evaluated point of the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    /// Position in the run, starting at 0.
    pub index: usize,
    pub point: Vec<f64>,
    pub policy: CutoffPolicy,
    pub score: f64,
    pub feasible: bool,
    pub status: TrialStatus,
    #[serde(default)]
    pub metrics: Option<TrialMetrics>,
    /// Score reused from an earlier trial at the same point.
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub elapsed_ms: f64,
}

/// Status, score and figures of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assessment {
    pub status: TrialStatus,
    pub score: f64,
    pub metrics: Option<TrialMetrics>,
}

/// Evaluate `spec` under `policy` and score the result.
///
/// Recoverable simulation failures become infeasible assessments scored
/// below the infeasible penalty; anything else is an error.
pub fn assess(
    engine: &EngineConfig,
    scoring: &ScoringParams,
    spec: &ProtocolSpec,
    policy: &CutoffPolicy,
    params: &PhysicalParams,
) -> OptResult<Assessment> {
    let failed = scoring.infeasible_penalty - 1.0;
    let infeasible = |status| Assessment {
        status,
        score: failed,
        metrics: None,
    };

    let eval = match Engine::new(engine.clone()).evaluate(spec, policy, params) {
        Ok(eval) => eval,
        Err(e @ SimError::Truncation { .. }) => {
            warn!(error = %e, "evaluation under-covered");
            return Ok(infeasible(TrialStatus::Truncated));
        }
        Err(e) => return Err(e.into()),
    };
    let root = eval.root();
    if root.coverage() <= 0.0 {
        warn!("no delivery inside the horizon");
        return Ok(infeasible(TrialStatus::Truncated));
    }

    let key_rate = key_rate_breakdown(root, scoring);
    let metrics = Some(TrialMetrics {
        key_rate,
        coverage: root.coverage(),
        lost_mass: root.lost_mass(),
        truncation: eval.truncation,
        warnings: eval.warnings.len(),
    });
    let value = score(root, scoring);
    let (status, value) = if !eval.warnings.is_empty() {
        warn!(warnings = eval.warnings.len(), "discarding evaluation with backend divergences");
        (TrialStatus::Diverged, failed)
    } else if !value.is_finite() {
        (TrialStatus::Diverged, failed)
    } else if key_rate.feasible {
        (TrialStatus::Scored, value)
    } else {
        (TrialStatus::BelowThreshold, value)
    };
    Ok(Assessment {
        status,
        score: value,
        metrics,
    })
}

/// Best feasible trial, first one on ties.
pub fn best_trial<'a>(trials: impl IntoIterator<Item = &'a Trial>) -> Option<&'a Trial> {
    trials
        .into_iter()
        .filter(|t| t.feasible)
        .fold(None, |best: Option<&Trial>, t| match best {
            Some(b) if b.score >= t.score => Some(b),
            _ => Some(t),
        })
}
