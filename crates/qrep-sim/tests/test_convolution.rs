//! Tests for the convolution backends.

use qrep_sim::convolution::{
    CrossCheckConvolver, DirectConvolver, FftConvolver, ParallelConvolver, max_convolve,
    max_relative_error,
};
use qrep_sim::{BackendKind, Convolver};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A random mass array of length `n` with bin 0 empty and total mass `mass`.
fn random_masses(rng: &mut StdRng, n: usize, mass: f64) -> Vec<f64> {
    let mut v: Vec<f64> = (0..n).map(|i| if i == 0 { 0.0 } else { rng.gen_range(0.0..1.0) }).collect();
    let total: f64 = v.iter().sum();
    v.iter_mut().for_each(|x| *x *= mass / total);
    v
}

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

#[test]
fn max_convolve_matches_enumeration() {
    let mut rng = StdRng::seed_from_u64(3);
    let a = random_masses(&mut rng, 12, 0.9);
    let b = random_masses(&mut rng, 12, 0.7);
    let mut expected = vec![0.0; 12];
    for i in 0..12 {
        for j in 0..12 {
            expected[i.max(j)] += a[i] * b[j];
        }
    }
    let got = max_convolve(&a, &b);
    for k in 0..12 {
        assert!((got[k] - expected[k]).abs() < 1e-15, "bin {k}");
    }
}

#[test]
fn backends_agree_on_convolution() {
    let mut rng = StdRng::seed_from_u64(5);
    for n in [2, 17, 64, 300] {
        let a = random_masses(&mut rng, n, 1.0);
        let b = random_masses(&mut rng, n, 0.5);
        let reference = DirectConvolver.convolve(&a, &b);
        for backend in [BackendKind::Fft, BackendKind::Parallel] {
            let got = backend.build().convolve(&a, &b);
            assert_eq!(got.len(), n);
            assert!(max_relative_error(&got, &reference) < 1e-9, "{backend} n={n}");
        }
    }
}

#[test]
fn backends_agree_on_geometric_sums() {
    let mut rng = StdRng::seed_from_u64(9);
    for (n, kernel_mass, weight) in [(32, 0.5, 1.0), (128, 0.9, 0.5), (256, 0.3, 1.0)] {
        let first = random_masses(&mut rng, n, 0.8);
        let kernel = random_masses(&mut rng, n, kernel_mass);
        let reference = DirectConvolver.geometric_sum(&first, &kernel, weight);
        for backend in [BackendKind::Fft, BackendKind::Parallel] {
            let got = backend.build().geometric_sum(&first, &kernel, weight);
            assert!(
                max_relative_error(&got, &reference) < 1e-9,
                "{backend} n={n} err={}",
                max_relative_error(&got, &reference)
            );
        }
    }
}

#[test]
fn geometric_sum_of_zero_weight_is_first() {
    let first = vec![0.0, 0.2, 0.3, 0.1];
    let kernel = vec![0.0, 0.5, 0.5, 0.0];
    for conv in [
        Box::new(DirectConvolver) as Box<dyn Convolver>,
        Box::new(ParallelConvolver),
        Box::new(FftConvolver),
    ] {
        let got = conv.geometric_sum(&first, &kernel, 0.0);
        assert!(max_relative_error(&got, &first) < 1e-12, "{}", conv.name());
    }
}

#[test]
fn fft_falls_back_when_retries_do_not_contract() {
    // r · Σ kernel = 1: the series only converges inside the horizon.
    let first = vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0];
    let kernel = vec![0.0, 1.0, 0.0, 0.0, 0.0, 0.0];
    let got = FftConvolver.geometric_sum(&first, &kernel, 1.0);
    let expected = DirectConvolver.geometric_sum(&first, &kernel, 1.0);
    assert_eq!(got, expected);
    assert_eq!(expected, vec![0.0, 1.0, 1.0, 1.0, 1.0, 1.0]);
}

// ---------------------------------------------------------------------------
// Cross-check
// ---------------------------------------------------------------------------

/// Deliberately wrong backend: drops the last output bin.
struct LossyConvolver;

impl Convolver for LossyConvolver {
    fn name(&self) -> &str {
        "lossy"
    }

    fn convolve(&self, a: &[f64], b: &[f64]) -> Vec<f64> {
        let mut c = DirectConvolver.convolve(a, b);
        if let Some(last) = c.last_mut() {
            *last = 0.0;
        }
        c
    }
}

#[test]
fn cross_check_records_divergences() {
    let checker = CrossCheckConvolver::new(Box::new(LossyConvolver), Box::new(DirectConvolver), 1e-9);
    let a = vec![0.0, 0.5, 0.5];
    let out = checker.convolve(&a, &a);
    // The primary's answer is returned unchanged.
    assert_eq!(out, vec![0.0, 0.0, 0.0]);

    let divergences = checker.drain_divergences();
    assert_eq!(divergences.len(), 1);
    assert_eq!(divergences[0].operation, "convolve");
    assert_eq!(divergences[0].primary, "lossy");
    assert_eq!(divergences[0].reference, "direct");
    assert!(divergences[0].max_rel_error > 0.5);
    assert!(checker.drain_divergences().is_empty());
}

#[test]
fn cross_check_is_silent_when_backends_agree() {
    let checker = CrossCheckConvolver::new(Box::new(FftConvolver), Box::new(DirectConvolver), 1e-9);
    let mut rng = StdRng::seed_from_u64(1);
    let a = random_masses(&mut rng, 40, 1.0);
    let b = random_masses(&mut rng, 40, 0.6);
    checker.convolve(&a, &b);
    checker.geometric_sum(&a, &b, 1.0);
    assert!(checker.drain_divergences().is_empty());
}
