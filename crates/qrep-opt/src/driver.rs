//! The optimization loop.
//!
//! propose → build policy → evaluate → score → record, until the trial
//! budget, the time budget or the strategy runs out. Each batch of fresh
//! points is evaluated in parallel; every trial builds its own engine, so
//! trials share no state.

use std::time::{Duration, Instant};

use qrep_sim::{EngineConfig, PhysicalParams, ProtocolSpec, ScoringParams};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{OptError, OptResult};
use crate::space::SearchSpace;
use crate::strategy::{BayesianSearch, GridSearch, Proposer, RandomSearch, StrategyKind, point_key};
use crate::trial::{Trial, assess, best_trial};

/// Optimizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Maximum number of trials, cached ones included.
    pub trials: usize,
    #[serde(default)]
    pub seed: u64,
    /// Random points before the surrogate takes over.
    pub initial_points: usize,
    /// Values per dimension for grid search.
    pub grid_steps: usize,
    /// Exploration weight of the confidence bound.
    pub kappa: f64,
    /// Random candidates scored by the acquisition function.
    pub candidates: usize,
    /// Wall-clock budget, checked between batches.
    #[serde(default)]
    pub time_budget_secs: Option<f64>,
    /// Points proposed per batch.
    pub batch_size: usize,
    /// Evaluate each batch on the rayon pool.
    pub parallel: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            trials: 50,
            seed: 0,
            initial_points: 10,
            grid_steps: 8,
            kappa: 1.96,
            candidates: 1000,
            time_budget_secs: None,
            batch_size: 8,
            parallel: true,
        }
    }
}

impl OptimizerConfig {
    pub fn new(strategy: StrategyKind, trials: usize) -> Self {
        Self {
            strategy,
            trials,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_time_budget(mut self, secs: f64) -> Self {
        self.time_budget_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn with_grid_steps(mut self, steps: usize) -> Self {
        self.grid_steps = steps;
        self
    }

    #[must_use]
    pub fn with_initial_points(mut self, n: usize) -> Self {
        self.initial_points = n;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn validate(&self) -> OptResult<()> {
        let invalid = |name: &'static str, reason: String| Err(OptError::InvalidConfig { name, reason });
        if self.trials == 0 {
            return invalid("trials", "must be at least 1".into());
        }
        if self.batch_size == 0 {
            return invalid("batch_size", "must be at least 1".into());
        }
        if self.grid_steps == 0 {
            return invalid("grid_steps", "must be at least 1".into());
        }
        if !self.kappa.is_finite() || self.kappa < 0.0 {
            return invalid("kappa", format!("must be finite and non-negative, got {}", self.kappa));
        }
        if let Some(t) = self.time_budget_secs {
            if !t.is_finite() || t < 0.0 {
                return invalid("time_budget_secs", format!("must be finite and non-negative, got {t}"));
            }
        }
        Ok(())
    }

    /// Fresh proposer for this configuration.
    pub fn proposer(&self) -> Box<dyn Proposer> {
        match self.strategy {
            StrategyKind::Grid => Box::new(GridSearch::new(self.grid_steps)),
            StrategyKind::Random => Box::new(RandomSearch::new(self.seed)),
            StrategyKind::Bayesian => Box::new(BayesianSearch::new(
                self.seed,
                self.initial_points,
                self.kappa,
                self.candidates,
            )),
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OptimizationStatus {
    /// At least one trial was feasible; `best` is the highest-scoring one.
    Optimal { best: Trial },
    /// Every trial was infeasible, truncated or discarded.
    NoFeasiblePolicy,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub status: OptimizationStatus,
    pub trials: Vec<Trial>,
    pub elapsed: Duration,
}

impl OptimizationReport {
    pub fn best(&self) -> Option<&Trial> {
        match &self.status {
            OptimizationStatus::Optimal { best } => Some(best),
            OptimizationStatus::NoFeasiblePolicy => None,
        }
    }

    pub fn feasible_count(&self) -> usize {
        self.trials.iter().filter(|t| t.feasible).count()
    }
}

/// Drives one search.
#[derive(Debug, Clone)]
pub struct Optimizer {
    config: OptimizerConfig,
    engine: EngineConfig,
    scoring: ScoringParams,
}

enum Slot {
    Cached(usize),
    Fresh(usize),
    Repeat(usize),
}

impl Optimizer {
    pub fn new(config: OptimizerConfig, engine: EngineConfig, scoring: ScoringParams) -> Self {
        Self {
            config,
            engine,
            scoring,
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Evaluate and score one point. Recoverable simulation failures become
    /// infeasible trials; anything else is an error.
    pub fn evaluate_point(
        &self,
        spec: &ProtocolSpec,
        params: &PhysicalParams,
        space: &SearchSpace,
        point: &[f64],
    ) -> OptResult<Trial> {
        let started = Instant::now();
        let point = space.snap(point);
        let policy = space.policy(&point);
        let assessment = assess(&self.engine, &self.scoring, spec, &policy, params)?;
        if !assessment.status.is_feasible() {
            debug!(?point, status = ?assessment.status, "infeasible point");
        }

        Ok(Trial {
            index: 0,
            point,
            policy,
            score: assessment.score,
            feasible: assessment.status.is_feasible(),
            status: assessment.status,
            metrics: assessment.metrics,
            cached: false,
            elapsed_ms: started.elapsed().as_secs_f64() * 1e3,
        })
    }

    /// Run to completion and keep every trial in memory.
    pub fn run(&self, spec: &ProtocolSpec, params: &PhysicalParams, space: &SearchSpace) -> OptResult<OptimizationReport> {
        self.run_with(spec, params, space, &mut |_| Ok(()))
    }

    /// Run to completion, handing every trial to `sink` as soon as it is
    /// recorded.
    pub fn run_with(
        &self,
        spec: &ProtocolSpec,
        params: &PhysicalParams,
        space: &SearchSpace,
        sink: &mut dyn FnMut(&Trial) -> OptResult<()>,
    ) -> OptResult<OptimizationReport> {
        self.config.validate()?;
        self.engine.validate()?;
        params.validate()?;
        spec.validate()?;
        for dim in space.dimensions() {
            if let Some(node) = dim.nodes.iter().find(|n| spec.unit(**n).is_none()) {
                return Err(OptError::InvalidBounds {
                    dimension: dim.name.clone(),
                    reason: format!("node {node} is not part of the protocol"),
                });
            }
        }

        let started = Instant::now();
        let budget = self.config.time_budget_secs.map(Duration::from_secs_f64);
        let mut proposer = self.config.proposer();
        let mut trials: Vec<Trial> = Vec::new();
        let mut cache: FxHashMap<Vec<u64>, usize> = FxHashMap::default();

        info!(
            strategy = proposer.name(),
            dimensions = space.len(),
            trials = self.config.trials,
            seed = self.config.seed,
            "starting optimization"
        );

        while trials.len() < self.config.trials {
            if let Some(budget) = budget {
                if !trials.is_empty() && started.elapsed() >= budget {
                    info!(completed = trials.len(), "time budget exhausted");
                    break;
                }
            }
            let want = self.config.batch_size.min(self.config.trials - trials.len());
            let points = proposer.propose(space, &trials, want);
            if points.is_empty() {
                info!(completed = trials.len(), "strategy exhausted");
                break;
            }

            let mut slots = Vec::with_capacity(points.len());
            let mut fresh: Vec<Vec<f64>> = Vec::new();
            let mut in_batch: FxHashMap<Vec<u64>, usize> = FxHashMap::default();
            for point in points {
                let point = space.snap(&point);
                let key = point_key(&point);
                if let Some(&i) = cache.get(&key) {
                    slots.push(Slot::Cached(i));
                } else if let Some(&j) = in_batch.get(&key) {
                    slots.push(Slot::Repeat(j));
                } else {
                    in_batch.insert(key, fresh.len());
                    slots.push(Slot::Fresh(fresh.len()));
                    fresh.push(point);
                }
            }

            let evaluated: Vec<Trial> = if self.config.parallel {
                fresh
                    .par_iter()
                    .map(|p| self.evaluate_point(spec, params, space, p))
                    .collect::<OptResult<_>>()?
            } else {
                fresh
                    .iter()
                    .map(|p| self.evaluate_point(spec, params, space, p))
                    .collect::<OptResult<_>>()?
            };

            for slot in slots {
                let mut trial = match slot {
                    Slot::Fresh(j) => evaluated[j].clone(),
                    Slot::Cached(i) => reuse(&trials[i]),
                    Slot::Repeat(j) => reuse(&evaluated[j]),
                };
                trial.index = trials.len();
                if !trial.cached {
                    cache.insert(point_key(&trial.point), trial.index);
                }
                info!(
                    trial = trial.index,
                    score = trial.score,
                    status = ?trial.status,
                    cached = trial.cached,
                    "trial recorded"
                );
                sink(&trial)?;
                trials.push(trial);
            }
        }

        let status = match best_trial(&trials) {
            Some(best) => OptimizationStatus::Optimal { best: best.clone() },
            None => OptimizationStatus::NoFeasiblePolicy,
        };
        let elapsed = started.elapsed();
        match &status {
            OptimizationStatus::Optimal { best } => info!(
                trials = trials.len(),
                best = best.index,
                score = best.score,
                elapsed_ms = elapsed.as_millis() as u64,
                "optimization finished"
            ),
            OptimizationStatus::NoFeasiblePolicy => warn!(
                trials = trials.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "no feasible policy found"
            ),
        }
        Ok(OptimizationReport {
            status,
            trials,
            elapsed,
        })
    }
}

fn reuse(trial: &Trial) -> Trial {
    Trial {
        cached: true,
        elapsed_ms: 0.0,
        ..trial.clone()
    }
}
