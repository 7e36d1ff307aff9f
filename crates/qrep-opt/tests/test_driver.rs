//! Tests for the optimization loop.

use qrep_opt::{
    CutoffKind, Dimension, OptError, OptimizationStatus, Optimizer, OptimizerConfig, SearchSpace, StrategyKind,
    TrialStatus,
};
use qrep_sim::{EngineConfig, NodeId, PhysicalParams, ProtocolSpec, ScoringParams};

fn chain() -> (ProtocolSpec, PhysicalParams) {
    let spec = ProtocolSpec::swap_chain(3, 0).unwrap();
    let params = PhysicalParams::new(0.5, 0.9, 0.95).with_coherence_time(400.0);
    (spec, params)
}

fn optimizer(config: OptimizerConfig) -> Optimizer {
    Optimizer::new(config, EngineConfig::new(100), ScoringParams::default())
}

fn points(report: &qrep_opt::OptimizationReport) -> Vec<Vec<f64>> {
    report.trials.iter().map(|t| t.point.clone()).collect()
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

#[test]
fn grid_search_exhausts_the_grid() {
    let (spec, params) = chain();
    let space = SearchSpace::per_level(&spec, CutoffKind::MemoryTime, 0.0, 20.0).unwrap();
    let report = optimizer(OptimizerConfig::new(StrategyKind::Grid, 100).with_grid_steps(8))
        .run(&spec, &params, &space)
        .unwrap();
    assert_eq!(report.trials.len(), 8);
    for (i, t) in report.trials.iter().enumerate() {
        assert_eq!(t.index, i);
        assert_eq!(t.status, TrialStatus::Scored);
        assert!(!t.cached);
    }
    let best = report.best().unwrap();
    assert!(report.trials.iter().all(|t| t.score <= best.score));
}

#[test]
fn random_search_is_reproducible() {
    let (spec, params) = chain();
    let space = SearchSpace::per_level(&spec, CutoffKind::Fidelity, 0.5, 0.94).unwrap();
    let config = OptimizerConfig::new(StrategyKind::Random, 12).with_seed(3);
    let a = optimizer(config.clone()).run(&spec, &params, &space).unwrap();
    let b = optimizer(config).run(&spec, &params, &space).unwrap();
    assert_eq!(points(&a), points(&b));
    let scores = |r: &qrep_opt::OptimizationReport| r.trials.iter().map(|t| t.score).collect::<Vec<_>>();
    assert_eq!(scores(&a), scores(&b));

    let c = optimizer(OptimizerConfig::new(StrategyKind::Random, 12).with_seed(4))
        .run(&spec, &params, &space)
        .unwrap();
    assert_ne!(points(&a), points(&c));
}

#[test]
fn bayesian_search_is_reproducible() {
    let spec = ProtocolSpec::swap_chain(5, 0).unwrap();
    let params = PhysicalParams::new(0.3, 0.8, 0.97).with_coherence_time(60.0);
    let space = SearchSpace::per_level(&spec, CutoffKind::Fidelity, 0.6, 0.96).unwrap();
    let config = OptimizerConfig::new(StrategyKind::Bayesian, 12)
        .with_seed(7)
        .with_initial_points(4);
    let engine = EngineConfig::new(400);
    let a = Optimizer::new(config.clone(), engine.clone(), ScoringParams::default())
        .run(&spec, &params, &space)
        .unwrap();
    let b = Optimizer::new(config, engine, ScoringParams::default())
        .run(&spec, &params, &space)
        .unwrap();
    assert_eq!(a.trials.len(), 12);
    assert_eq!(points(&a), points(&b));
}

#[test]
fn sequential_and_parallel_runs_agree() {
    let (spec, params) = chain();
    let space = SearchSpace::per_level(&spec, CutoffKind::MemoryTime, 0.0, 15.0).unwrap();
    let config = OptimizerConfig::new(StrategyKind::Random, 10).with_seed(11);
    let par = optimizer(config.clone()).run(&spec, &params, &space).unwrap();
    let seq = optimizer(config.with_parallel(false)).run(&spec, &params, &space).unwrap();
    assert_eq!(points(&par), points(&seq));
    assert_eq!(par.best().map(|t| t.index), seq.best().map(|t| t.index));
}

// ---------------------------------------------------------------------------
// Caching and budgets
// ---------------------------------------------------------------------------

#[test]
fn duplicate_points_reuse_cached_scores() {
    let (spec, params) = chain();
    let space = SearchSpace::per_level(&spec, CutoffKind::MemoryTime, 0.0, 1.0).unwrap();
    let report = optimizer(OptimizerConfig::new(StrategyKind::Random, 10).with_batch_size(4))
        .run(&spec, &params, &space)
        .unwrap();
    assert_eq!(report.trials.len(), 10);
    let cached = report.trials.iter().filter(|t| t.cached).count();
    assert!(cached >= 8, "only {cached} cached trials");
    for a in &report.trials {
        for b in &report.trials {
            if a.point == b.point {
                assert_eq!(a.score, b.score);
            }
        }
    }
}

#[test]
fn time_budget_stops_between_batches() {
    let (spec, params) = chain();
    let space = SearchSpace::per_level(&spec, CutoffKind::MemoryTime, 0.0, 20.0).unwrap();
    let config = OptimizerConfig::new(StrategyKind::Random, 50)
        .with_batch_size(1)
        .with_time_budget(0.0);
    let report = optimizer(config).run(&spec, &params, &space).unwrap();
    assert_eq!(report.trials.len(), 1);
}

#[test]
fn sink_sees_every_trial_and_can_abort() {
    let (spec, params) = chain();
    let space = SearchSpace::per_level(&spec, CutoffKind::MemoryTime, 0.0, 20.0).unwrap();
    let opt = optimizer(OptimizerConfig::new(StrategyKind::Grid, 5));

    let mut seen = Vec::new();
    let report = opt
        .run_with(&spec, &params, &space, &mut |t| {
            seen.push(t.index);
            Ok(())
        })
        .unwrap();
    assert_eq!(seen, (0..report.trials.len()).collect::<Vec<_>>());

    let result = opt.run_with(&spec, &params, &space, &mut |_| Err(OptError::Log("disk full".into())));
    assert!(matches!(result, Err(OptError::Log(msg)) if msg == "disk full"));
}

// ---------------------------------------------------------------------------
// Infeasibility
// ---------------------------------------------------------------------------

#[test]
fn poor_links_yield_no_feasible_policy() {
    let spec = ProtocolSpec::swap_chain(3, 0).unwrap();
    let params = PhysicalParams::new(0.5, 0.9, 0.6).with_coherence_time(400.0);
    let space = SearchSpace::per_level(&spec, CutoffKind::MemoryTime, 0.0, 20.0).unwrap();
    let report = optimizer(OptimizerConfig::new(StrategyKind::Grid, 20).with_grid_steps(4))
        .run(&spec, &params, &space)
        .unwrap();
    assert_eq!(report.status, OptimizationStatus::NoFeasiblePolicy);
    assert!(report.best().is_none());
    assert_eq!(report.feasible_count(), 0);
    for t in &report.trials {
        assert_eq!(t.status, TrialStatus::BelowThreshold);
        // Penalized scores stay below every possible key rate.
        assert!(t.score < -1.0 + 1e-12);
    }
}

#[test]
fn truncated_trials_are_infeasible() {
    let spec = ProtocolSpec::swap_chain(3, 0).unwrap();
    let params = PhysicalParams::new(0.05, 0.9, 0.95).with_coherence_time(400.0);
    let space = SearchSpace::per_level(&spec, CutoffKind::MemoryTime, 0.0, 5.0).unwrap();
    let report = Optimizer::new(
        OptimizerConfig::new(StrategyKind::Grid, 3),
        EngineConfig::new(8),
        ScoringParams::default(),
    )
    .run(&spec, &params, &space)
    .unwrap();
    assert_eq!(report.status, OptimizationStatus::NoFeasiblePolicy);
    for t in &report.trials {
        assert_eq!(t.status, TrialStatus::Truncated);
        assert_eq!(t.score, -2.0);
        assert!(t.metrics.is_none());
    }
}

#[test]
fn foreign_nodes_and_bad_settings_are_rejected() {
    let (spec, params) = chain();
    let space = SearchSpace::new(vec![Dimension::new(
        "ghost",
        vec![NodeId(99)],
        CutoffKind::MemoryTime,
        0.0,
        5.0,
    )])
    .unwrap();
    let result = optimizer(OptimizerConfig::new(StrategyKind::Grid, 3)).run(&spec, &params, &space);
    assert!(matches!(result, Err(OptError::InvalidBounds { .. })));

    let space = SearchSpace::per_level(&spec, CutoffKind::MemoryTime, 0.0, 5.0).unwrap();
    let result = optimizer(OptimizerConfig::new(StrategyKind::Grid, 0)).run(&spec, &params, &space);
    assert!(matches!(result, Err(OptError::InvalidConfig { name: "trials", .. })));

    let bad_params = PhysicalParams::new(1.5, 0.9, 0.95);
    let result = optimizer(OptimizerConfig::new(StrategyKind::Grid, 3)).run(&spec, &bad_params, &space);
    assert!(matches!(result, Err(OptError::Sim(_))));
}
