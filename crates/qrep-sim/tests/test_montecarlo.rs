//! Statistical cross-validation of the engine against the Monte-Carlo sampler.
//!
//! Engine and sampler agree in distribution for memory-time and run-time cut-offs and
//! for fidelity cut-offs that judge elementary links. A fidelity cut-off over
//! swapped or distilled inputs is only checked for closeness.

use qrep_sim::{
    CutoffPolicy, CutoffRule, Engine, EngineConfig, GenerationParams, MonteCarlo, NodeId, PhysicalParams,
    ProtocolSpec,
};
use rand::SeedableRng;
use rand::rngs::StdRng;

fn compare(
    spec: &ProtocolSpec,
    policy: &CutoffPolicy,
    params: PhysicalParams,
    truncation: usize,
    seed: u64,
) {
    let eval = Engine::new(EngineConfig::new(truncation))
        .evaluate(spec, policy, &params)
        .unwrap();
    let root = eval.root();
    assert!(root.lost_mass() < 1e-6, "horizon too short for comparison");

    let mc = MonteCarlo::new(spec, policy, params).unwrap();
    let mut rng = StdRng::seed_from_u64(seed);
    let summary = mc.run(&mut rng, 20_000);

    let tolerance = 5.0 * summary.waiting_time_std_error;
    assert!(
        (summary.mean_waiting_time - root.mean_waiting_time()).abs() < tolerance,
        "waiting time: mc {} vs engine {} (tol {tolerance})",
        summary.mean_waiting_time,
        root.mean_waiting_time()
    );
    assert!(
        (summary.mean_werner - root.mean_werner()).abs() < 0.005,
        "werner: mc {} vs engine {}",
        summary.mean_werner,
        root.mean_werner()
    );
}

#[test]
fn swap_with_memory_cutoff_matches_sampling() {
    let spec = ProtocolSpec::swap_chain(3, 0).unwrap();
    let policy = CutoffPolicy::new().with(spec.root(), CutoffRule::MemoryTime(3));
    let params = PhysicalParams::new(0.5, 0.9, 0.95).with_coherence_time(400.0);
    compare(&spec, &policy, params, 200, 1);
}

#[test]
fn fidelity_cutoff_on_fresh_links_matches_sampling() {
    // gen, distill(gen, gen), swap: the cut-off judges elementary links only.
    let spec = ProtocolSpec::swap_chain(3, 1).unwrap();
    let policy = CutoffPolicy::new().with(NodeId(1), CutoffRule::Fidelity(0.85));
    let params = PhysicalParams::new(0.3, 0.8, 0.95).with_coherence_time(40.0);
    compare(&spec, &policy, params, 1500, 2);
}

#[test]
fn fidelity_cutoff_over_distilled_inputs_stays_close_to_sampling() {
    // The engine judges bin-averaged Werner parameters here, the sampler
    // judges each history, so only closeness is expected.
    let mut b = ProtocolSpec::builder();
    let g = b.generation();
    let d = b.distill(g, g, 1);
    let s = b.swap(d, d);
    let spec = b.build().unwrap();
    let policy = CutoffPolicy::new().with(s, CutoffRule::Fidelity(0.9));
    let params = PhysicalParams::new(0.2, 0.5, 0.98).with_coherence_time(400.0);

    let root = Engine::new(EngineConfig::new(1200))
        .evaluate(&spec, &policy, &params)
        .unwrap()
        .into_root();
    let summary = MonteCarlo::new(&spec, &policy, params)
        .unwrap()
        .run(&mut StdRng::seed_from_u64(5), 20_000);

    let gap = (summary.mean_waiting_time - root.mean_waiting_time()).abs() / root.mean_waiting_time();
    assert!(gap < 0.05, "mc {} vs engine {}", summary.mean_waiting_time, root.mean_waiting_time());
    assert!((summary.mean_werner - root.mean_werner()).abs() < 0.01);
}

#[test]
fn per_link_memories_match_sampling() {
    let links = [
        GenerationParams::new(0.5, 0.95, 20.0),
        GenerationParams::new(0.3, 0.9, 400.0),
    ];
    let spec = ProtocolSpec::swap_chain_with(&links, 0).unwrap();
    let policy = CutoffPolicy::new().with(spec.root(), CutoffRule::MemoryTime(5));
    let params = PhysicalParams::new(0.5, 0.9, 0.95);
    compare(&spec, &policy, params, 600, 6);
}

#[test]
fn run_time_cutoff_matches_sampling() {
    let spec = ProtocolSpec::swap_chain(5, 0).unwrap();
    let policy = CutoffPolicy::uniform(spec.tunable_nodes(), CutoffRule::RunTime(6));
    let params = PhysicalParams::new(0.4, 0.7, 0.97).with_coherence_time(25.0);
    compare(&spec, &policy, params, 1500, 3);
}

#[test]
fn histogram_approximates_engine_pmf() {
    let spec = ProtocolSpec::swap_chain(3, 0).unwrap();
    let policy = CutoffPolicy::new();
    let params = PhysicalParams::new(0.5, 1.0, 0.9);
    let exact = Engine::new(EngineConfig::new(40))
        .evaluate(&spec, &policy, &params)
        .unwrap()
        .into_root();
    let mc = MonteCarlo::new(&spec, &policy, params).unwrap();
    let hist = mc
        .histogram(&mut StdRng::seed_from_u64(4), 20_000, 40)
        .unwrap();
    for t in 1..6 {
        assert!((hist.probability(t) - exact.probability(t)).abs() < 0.015, "bin {t}");
    }
}

#[test]
fn sampling_is_reproducible() {
    let spec = ProtocolSpec::swap_chain(4, 1).unwrap();
    let policy = CutoffPolicy::new();
    let params = PhysicalParams::new(0.3, 0.8, 0.9).with_coherence_time(50.0);
    let mc = MonteCarlo::new(&spec, &policy, params).unwrap();
    let a = mc.run(&mut StdRng::seed_from_u64(42), 500);
    let b = mc.run(&mut StdRng::seed_from_u64(42), 500);
    assert_eq!(a, b);
}
