//! Tests for the protocol unit operators.

use qrep_sim::convolution::DirectConvolver;
use qrep_sim::units::{self, UnitContext, distillation_success, distilled_werner};
use qrep_sim::{CutoffRule, WaitingTimeDistribution, werner_to_fidelity};

fn ctx(t_coh: f64) -> UnitContext<'static> {
    UnitContext::new(&DirectConvolver, t_coh)
}

fn brute_force_max_arrival(
    a: &WaitingTimeDistribution,
    b: &WaitingTimeDistribution,
    t_coh: f64,
) -> (Vec<f64>, Vec<f64>) {
    let n = a.truncation();
    let mut pmf = vec![0.0; n];
    let mut state = vec![0.0; n];
    for i in 1..n {
        for j in 1..n {
            let t = i.max(j);
            let dt = i.abs_diff(j) as f64;
            let decay = (-dt / t_coh).exp();
            let p = a.probability(i) * b.probability(j);
            pmf[t] += p;
            state[t] += p * a.werner()[i] * b.werner()[j] * decay;
        }
    }
    (pmf, state)
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

#[test]
fn generation_bin_zero_is_empty() {
    let g = units::generation(0.3, 0.9, 16).unwrap();
    assert_eq!(g.probability(0), 0.0);
    assert_eq!(g.fidelity_at(0), None);
    assert!((g.coverage() + g.lost_mass() - 1.0).abs() < 1e-12);
}

#[test]
fn generation_rejects_bad_inputs() {
    assert!(units::generation(0.0, 0.9, 16).is_err());
    assert!(units::generation(0.5, 1.1, 16).is_err());
    assert!(units::generation(0.5, 0.9, 1).is_err());
}

// ---------------------------------------------------------------------------
// Swap
// ---------------------------------------------------------------------------

#[test]
fn swap_matches_brute_force_max_arrival() {
    let t_coh = 20.0;
    let a = units::generation(0.4, 0.95, 10).unwrap();
    let b = units::generation(0.6, 0.9, 10).unwrap();
    let out = units::swap(ctx(t_coh), &a, &b, 1.0, None);
    let (pmf, state) = brute_force_max_arrival(&a, &b, t_coh);
    for t in 0..10 {
        assert!((out.probability(t) - pmf[t]).abs() < 1e-14, "pmf mismatch at {t}");
        if pmf[t] > 0.0 {
            let w = out.werner_at(t).unwrap();
            assert!((w - state[t] / pmf[t]).abs() < 1e-12, "werner mismatch at {t}");
        }
    }
}

#[test]
fn swap_failure_delays_delivery() {
    let g = units::generation(0.5, 0.95, 200).unwrap();
    let sure = units::swap(ctx(f64::INFINITY), &g, &g, 1.0, None);
    let flaky = units::swap(ctx(f64::INFINITY), &g, &g, 0.5, None);
    assert!(flaky.mean_waiting_time() > sure.mean_waiting_time());
    // Without decay every delivered pair has Werner w0².
    assert!((sure.mean_werner() - 0.95 * 0.95).abs() < 1e-12);
    assert!((flaky.mean_werner() - 0.95 * 0.95).abs() < 1e-12);
}

#[test]
fn swap_outputs_are_finite_and_bounded() {
    for p_gen in [0.01, 0.3, 1.0] {
        let g = units::generation(p_gen, 0.7, 64).unwrap();
        let rule = CutoffRule::Fidelity(0.5);
        let out = units::swap(ctx(5.0), &g, &g, 0.3, Some(&rule));
        assert!(out.pmf().iter().all(|p| p.is_finite() && *p >= 0.0));
        assert!(out.werner().iter().all(|w| (0.0..=1.0).contains(w)));
        assert!(out.coverage() <= 1.0 + 1e-12);
    }
}

// ---------------------------------------------------------------------------
// Distillation
// ---------------------------------------------------------------------------

#[test]
fn distillation_closed_form_at_f_09() {
    let w = (4.0 * 0.9 - 1.0) / 3.0;
    assert!((w - 0.8666666666666667_f64).abs() < 1e-15);
    assert!((distillation_success(w, w) - 0.8755555555555556).abs() < 1e-15);
    assert!((distilled_werner(w, w) - 0.9018612521150591).abs() < 1e-15);
    assert!((werner_to_fidelity(distilled_werner(w, w)) - 0.926395939086294).abs() < 1e-12);
}

#[test]
fn distillation_is_monotone_in_both_inputs() {
    let grid: Vec<f64> = (0..=20).map(|i| i as f64 / 20.0).collect();
    for &w1 in &grid {
        for pair in grid.windows(2) {
            assert!(distilled_werner(w1, pair[1]) >= distilled_werner(w1, pair[0]) - 1e-15);
            assert!(distilled_werner(pair[1], w1) >= distilled_werner(pair[0], w1) - 1e-15);
        }
    }
}

#[test]
fn distill_operator_improves_fidelity() {
    let g = units::generation(0.5, 0.8, 128).unwrap();
    let d = units::distill(ctx(f64::INFINITY), &g, &g, None);
    // Ideal memory: every delivered pair is the closed-form output.
    assert!((d.mean_werner() - distilled_werner(0.8, 0.8)).abs() < 1e-12);
    assert!(d.mean_waiting_time() > g.mean_waiting_time());
}

#[test]
fn distill_rounds_chain_on_previous_output() {
    let g = units::generation(0.5, 0.8, 256).unwrap();
    let once = units::distill(ctx(f64::INFINITY), &g, &g, None);
    let twice_manual = units::distill(ctx(f64::INFINITY), &once, &once, None);
    let twice = units::distill_rounds(ctx(f64::INFINITY), &g, &g, 2, None);
    assert_eq!(twice, twice_manual);
}

// ---------------------------------------------------------------------------
// Cut-offs
// ---------------------------------------------------------------------------

#[test]
fn zero_memory_cutoff_keeps_only_ties() {
    let g = units::generation(0.5, 0.95, 50).unwrap();
    let rule = CutoffRule::MemoryTime(0);
    let out = units::swap(ctx(400.0), &g, &g, 1.0, Some(&rule));
    assert_eq!(out.probability(0), 0.0);
    assert_eq!(out.fidelity_at(0), None);
    for t in 1..50 {
        if out.probability(t) > 0.0 {
            assert!((out.werner()[t] - 0.9025).abs() < 1e-12);
        }
    }
    assert!((out.mean_waiting_time() - 3.99996300029051).abs() < 1e-9);
}

#[test]
fn cutoff_at_horizon_changes_nothing() {
    let g = units::generation(0.5, 0.95, 50).unwrap();
    let rule = CutoffRule::MemoryTime(50);
    let cut = units::swap(ctx(400.0), &g, &g, 0.9, Some(&rule));
    let plain = units::swap(ctx(400.0), &g, &g, 0.9, None);
    for t in 0..50 {
        assert!((cut.probability(t) - plain.probability(t)).abs() < 1e-15);
        assert!((cut.werner()[t] - plain.werner()[t]).abs() < 1e-12);
    }
}

#[test]
fn tighter_cutoff_trades_latency_for_fidelity() {
    let g = units::generation(0.1, 0.95, 600).unwrap();
    let loose = units::swap(ctx(30.0), &g, &g, 0.9, Some(&CutoffRule::MemoryTime(40)));
    let tight = units::swap(ctx(30.0), &g, &g, 0.9, Some(&CutoffRule::MemoryTime(5)));
    assert!(tight.mean_werner() > loose.mean_werner());
    assert!(tight.mean_waiting_time() > loose.mean_waiting_time());
}

#[test]
fn memory_cutoff_golden_values() {
    let g = units::generation(0.5, 0.95, 50).unwrap();
    let rule = CutoffRule::MemoryTime(3);
    let out = units::swap(ctx(400.0), &g, &g, 0.9, Some(&rule));
    assert!((out.mean_waiting_time() - 3.0303030239342155).abs() < 1e-9);
    assert!((out.mean_fidelity() - 0.9251868431550067).abs() < 1e-9);
}

#[test]
fn fidelity_cutoff_bounds_delivered_quality() {
    // Every delivered pair is the product of two links no worse than w_cut.
    let g = units::generation(0.2, 0.95, 400).unwrap();
    let w_cut = 0.9;
    let out = units::swap(ctx(20.0), &g, &g, 1.0, Some(&CutoffRule::Fidelity(w_cut)));
    for t in 1..400 {
        if let Some(w) = out.werner_at(t) {
            assert!(w >= w_cut * 0.95 - 1e-12, "bin {t}: {w}");
        }
    }
}

#[test]
fn run_time_cutoff_restricts_ready_times() {
    let g = units::generation(0.3, 0.95, 300).unwrap();
    let out = units::swap(ctx(50.0), &g, &g, 1.0, Some(&CutoffRule::RunTime(4)));
    let plain = units::swap(ctx(50.0), &g, &g, 1.0, None);
    assert!(out.mean_werner() > plain.mean_werner());
    assert!((out.coverage() - 1.0).abs() < 1e-9);
}
