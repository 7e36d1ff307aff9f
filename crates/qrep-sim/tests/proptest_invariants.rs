//! Property-based tests for distribution invariants.

use proptest::prelude::*;
use qrep_sim::{
    CutoffPolicy, CutoffRule, Engine, EngineConfig, PhysicalParams, ProtocolSpec,
    TruncationMode, WaitingTimeDistribution,
};

proptest! {
    #[test]
    fn generation_mass_is_conserved(p in 0.001f64..=1.0, w0 in 0.0f64..=1.0, t in 2usize..500) {
        let g = WaitingTimeDistribution::geometric(p, w0, t).unwrap();
        prop_assert!((g.coverage() + g.lost_mass() - 1.0).abs() < 1e-6);
        prop_assert_eq!(g.probability(0), 0.0);
        // Lost mass is the geometric tail (1 - p)^(T - 1).
        let tail = (1.0 - p).powi((t - 1) as i32);
        prop_assert!((g.lost_mass() - tail).abs() < 1e-6);
    }

    #[test]
    fn evaluated_chains_stay_physical(
        p_gen in 0.05f64..=1.0,
        p_swap in 0.1f64..=1.0,
        w0 in 0.5f64..=1.0,
        t_coh in 1.0f64..500.0,
        tau in 0u64..20,
        rounds in 0u32..2,
    ) {
        let spec = ProtocolSpec::swap_chain(3, rounds).unwrap();
        let policy = CutoffPolicy::uniform(spec.tunable_nodes(), CutoffRule::MemoryTime(tau));
        let params = PhysicalParams::new(p_gen, p_swap, w0).with_coherence_time(t_coh);
        let engine = Engine::new(EngineConfig::new(64).with_truncation_mode(TruncationMode::Report));
        let eval = engine.evaluate(&spec, &policy, &params).unwrap();
        let root = eval.root();

        prop_assert_eq!(root.probability(0), 0.0);
        prop_assert!(root.coverage() <= 1.0 + 1e-9);
        for t in 0..root.truncation() {
            let (p, w) = (root.pmf()[t], root.werner()[t]);
            prop_assert!(p.is_finite() && p >= 0.0);
            prop_assert!(w.is_finite() && (0.0..=1.0).contains(&w));
            if p == 0.0 {
                prop_assert!(root.fidelity_at(t).is_none());
            }
        }
    }

    #[test]
    fn cutoff_beyond_horizon_is_a_no_op(p_gen in 0.2f64..=1.0, t_coh in 5.0f64..100.0) {
        let spec = ProtocolSpec::swap_chain(3, 0).unwrap();
        let params = PhysicalParams::new(p_gen, 0.8, 0.9).with_coherence_time(t_coh);
        let engine = Engine::new(EngineConfig::new(40).with_truncation_mode(TruncationMode::Report));
        let cut = CutoffPolicy::uniform(spec.tunable_nodes(), CutoffRule::MemoryTime(40));
        let a = engine.evaluate(&spec, &cut, &params).unwrap();
        let b = engine.evaluate(&spec, &CutoffPolicy::new(), &params).unwrap();
        for t in 0..40 {
            prop_assert!((a.root().probability(t) - b.root().probability(t)).abs() < 1e-14);
        }
    }
}
