//! Proposal strategies.
//!
//! A [`Proposer`] turns the trial history into new points to evaluate. Every
//! strategy is deterministic for a fixed seed.

use std::fmt;

use ndarray::{Array1, Array2};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::gp::{GaussianProcess, LENGTH_SCALES, RbfKernel};
use crate::space::SearchSpace;
use crate::trial::Trial;

/// Source of candidate points.
pub trait Proposer: Send {
    fn name(&self) -> &'static str;

    /// Up to `max` new points given every trial so far. An empty result
    /// means the strategy is exhausted.
    fn propose(&mut self, space: &SearchSpace, history: &[Trial], max: usize) -> Vec<Vec<f64>>;
}

/// Strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Exhaustive grid.
    Grid,
    /// Uniform random sampling.
    Random,
    /// Gaussian-process surrogate with a confidence-bound acquisition.
    #[default]
    Bayesian,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grid => write!(f, "grid"),
            Self::Random => write!(f, "random"),
            Self::Bayesian => write!(f, "gp"),
        }
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "grid" | "bf" | "brute-force" => Ok(Self::Grid),
            "random" | "rand" => Ok(Self::Random),
            "gp" | "bayesian" => Ok(Self::Bayesian),
            other => Err(format!("unknown optimizer '{other}' (expected grid, random or gp)")),
        }
    }
}

// ---------------------------------------------------------------------------
// Grid
// ---------------------------------------------------------------------------

/// Walks the Cartesian grid in order.
#[derive(Debug, Clone)]
pub struct GridSearch {
    steps: usize,
    points: Option<Vec<Vec<f64>>>,
    cursor: usize,
}

impl GridSearch {
    pub fn new(steps: usize) -> Self {
        Self {
            steps,
            points: None,
            cursor: 0,
        }
    }
}

impl Proposer for GridSearch {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn propose(&mut self, space: &SearchSpace, _history: &[Trial], max: usize) -> Vec<Vec<f64>> {
        let points = self.points.get_or_insert_with(|| space.grid(self.steps));
        let end = (self.cursor + max).min(points.len());
        let batch = points[self.cursor..end].to_vec();
        self.cursor = end;
        batch
    }
}

// ---------------------------------------------------------------------------
// Random
// ---------------------------------------------------------------------------

/// Independent uniform samples.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    rng: StdRng,
}

impl RandomSearch {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Proposer for RandomSearch {
    fn name(&self) -> &'static str {
        "random"
    }

    fn propose(&mut self, space: &SearchSpace, _history: &[Trial], max: usize) -> Vec<Vec<f64>> {
        (0..max).map(|_| space.sample(&mut self.rng)).collect()
    }
}

// ---------------------------------------------------------------------------
// Bayesian
// ---------------------------------------------------------------------------

/// Gaussian-process search.
///
/// The first `initial_points` proposals are random. After that every call
/// fits a GP to the normalized history and returns the candidate with the
/// largest upper confidence bound `μ + κσ` on the score. Maximizing the
/// upper bound of the score is minimizing the lower bound of its negation.
#[derive(Debug, Clone)]
pub struct BayesianSearch {
    rng: StdRng,
    initial_points: usize,
    kappa: f64,
    candidates: usize,
}

impl BayesianSearch {
    pub fn new(seed: u64, initial_points: usize, kappa: f64, candidates: usize) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            initial_points: initial_points.max(1),
            kappa,
            candidates: candidates.max(1),
        }
    }

    fn acquire(&mut self, space: &SearchSpace, history: &[Trial]) -> Option<Vec<f64>> {
        let dims = space.len();
        let mut x = Array2::zeros((history.len(), dims));
        for (i, trial) in history.iter().enumerate() {
            for (j, u) in space.normalize(&trial.point).into_iter().enumerate() {
                x[[i, j]] = u;
            }
        }
        let y: Vec<f64> = history.iter().map(|t| t.score).collect();
        let gp = match GaussianProcess::fit_best(x, &y, RbfKernel::default(), &LENGTH_SCALES) {
            Ok(gp) => gp,
            Err(e) => {
                warn!(error = %e, "surrogate fit failed, falling back to a random point");
                return None;
            }
        };
        debug!(
            length_scale = gp.kernel().length_scale,
            log_likelihood = gp.log_likelihood(),
            "fitted surrogate"
        );

        let seen: FxHashSet<Vec<u64>> = history.iter().map(|t| point_key(&t.point)).collect();
        let mut best: Option<(f64, Vec<f64>)> = None;
        for _ in 0..self.candidates {
            let point = space.sample(&mut self.rng);
            if seen.contains(&point_key(&point)) {
                continue;
            }
            let unit = Array1::from(space.normalize(&point));
            let (mean, std) = gp.predict(unit.view());
            let ucb = mean + self.kappa * std;
            if best.as_ref().is_none_or(|(b, _)| ucb > *b) {
                best = Some((ucb, point));
            }
        }
        best.map(|(_, p)| p)
    }
}

impl Proposer for BayesianSearch {
    fn name(&self) -> &'static str {
        "gp"
    }

    fn propose(&mut self, space: &SearchSpace, history: &[Trial], max: usize) -> Vec<Vec<f64>> {
        if max == 0 {
            return Vec::new();
        }
        if history.len() < self.initial_points {
            let n = (self.initial_points - history.len()).min(max);
            return (0..n).map(|_| space.sample(&mut self.rng)).collect();
        }
        // One point per call: the next fit needs its score.
        let point = self
            .acquire(space, history)
            .unwrap_or_else(|| space.sample(&mut self.rng));
        vec![point]
    }
}

/// Bit-exact key of a point, for duplicate detection.
pub fn point_key(point: &[f64]) -> Vec<u64> {
    point.iter().map(|v| v.to_bits()).collect()
}
