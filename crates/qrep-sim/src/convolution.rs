//! Convolution backends.
//!
//! Every swap and distillation retry loop reduces to discrete convolutions of
//! truncated mass arrays. The [`Convolver`] trait is the single seam the
//! protocol operators depend on; concrete backends are picked at
//! configuration time through [`BackendKind`].
//!
//! All arrays handled here share one length `T`, and every output is
//! truncated to `T` bins.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use num_complex::Complex64;
use rayon::prelude::*;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SimError;
use crate::protocol::NodeId;

/// Largest magnitude the last padded FFT bin may carry before the result is
/// considered aliased.
pub const ALIASING_LIMIT: f64 = 1e-15;

/// Relative term size below which iterated geometric sums stop.
const ITERATION_CUTOFF: f64 = 1e-17;

/// Discrete convolution capability used by the protocol operators.
pub trait Convolver: Send + Sync {
    /// Short backend name used in logs and divergence reports.
    fn name(&self) -> &str;

    /// `c[k] = Σ_{i+j=k} a[i] b[j]` for `k < a.len()`.
    fn convolve(&self, a: &[f64], b: &[f64]) -> Vec<f64>;

    /// `c[k] = Σ_{max(i,j)=k} a[i] b[j]`, counting ties once.
    fn max_convolve(&self, a: &[f64], b: &[f64]) -> Vec<f64> {
        max_convolve(a, b)
    }

    /// `Σ_n r^n · first * kernel^{*n}`, truncated to `first.len()` bins.
    ///
    /// This is the closed form of a retry loop: `first` is the mass of the
    /// successful attempt and `kernel` the mass of one failed attempt.
    fn geometric_sum(&self, first: &[f64], kernel: &[f64], retry_weight: f64) -> Vec<f64> {
        iterated_geometric_sum(self, first, kernel, retry_weight)
    }

    /// Divergences recorded since the last call (cross-check mode only).
    fn drain_divergences(&self) -> Vec<NumericalDivergence> {
        Vec::new()
    }
}

/// Which backend an engine uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Dense CPU loops; exact recurrences for retry loops.
    #[default]
    Direct,
    /// Transform-based convolution through `rustfft`.
    Fft,
    /// Data-parallel CPU loops through `rayon`.
    Parallel,
}

impl BackendKind {
    /// Instantiate the backend.
    pub fn build(self) -> Box<dyn Convolver> {
        match self {
            Self::Direct => Box::new(DirectConvolver),
            Self::Fft => Box::new(FftConvolver),
            Self::Parallel => Box::new(ParallelConvolver),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Direct => "direct",
            Self::Fft => "fft",
            Self::Parallel => "parallel",
        };
        f.write_str(s)
    }
}

impl FromStr for BackendKind {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" | "cpu" => Ok(Self::Direct),
            "fft" => Ok(Self::Fft),
            "parallel" | "rayon" => Ok(Self::Parallel),
            other => Err(SimError::invalid(
                "backend",
                format!("unknown backend '{other}' (expected direct, fft or parallel)"),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Direct
// ---------------------------------------------------------------------------

/// Reference backend: plain loops and exact recurrences.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectConvolver;

impl Convolver for DirectConvolver {
    fn name(&self) -> &str {
        "direct"
    }

    fn convolve(&self, a: &[f64], b: &[f64]) -> Vec<f64> {
        let n = a.len();
        let mut c = vec![0.0; n];
        for (i, &ai) in a.iter().enumerate() {
            if ai == 0.0 {
                continue;
            }
            for (j, &bj) in b.iter().take(n - i).enumerate() {
                c[i + j] += ai * bj;
            }
        }
        c
    }

    /// Solves `g = first + r · kernel * g` bin by bin.
    fn geometric_sum(&self, first: &[f64], kernel: &[f64], retry_weight: f64) -> Vec<f64> {
        let n = first.len();
        let denom = 1.0 - retry_weight * kernel.first().copied().unwrap_or(0.0);
        debug_assert!(denom > 0.0, "retry loop with certain immediate failure");

        let support: Vec<(usize, f64)> = kernel
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, k)| **k != 0.0)
            .map(|(s, k)| (s, retry_weight * k))
            .collect();

        let mut g = vec![0.0; n];
        for t in 0..n {
            let mut acc = first[t];
            for &(s, k) in &support {
                if s > t {
                    break;
                }
                acc += k * g[t - s];
            }
            g[t] = acc / denom;
        }
        g
    }
}

// ---------------------------------------------------------------------------
// FFT
// ---------------------------------------------------------------------------

/// Transform-based backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct FftConvolver;

impl FftConvolver {
    fn padded_len(n: usize) -> usize {
        (2 * n).saturating_sub(1).max(1).next_power_of_two()
    }

    fn spectrum(planner: &mut FftPlanner<f64>, data: &[f64], size: usize) -> Vec<Complex64> {
        let mut buf: Vec<Complex64> = data.iter().map(|&x| Complex64::new(x, 0.0)).collect();
        buf.resize(size, Complex64::new(0.0, 0.0));
        planner.plan_fft_forward(size).process(&mut buf);
        buf
    }

    fn inverse(planner: &mut FftPlanner<f64>, mut buf: Vec<Complex64>) -> Vec<f64> {
        let size = buf.len();
        planner.plan_fft_inverse(size).process(&mut buf);
        let scale = 1.0 / size as f64;
        buf.iter().map(|c| c.re * scale).collect()
    }
}

impl Convolver for FftConvolver {
    fn name(&self) -> &str {
        "fft"
    }

    fn convolve(&self, a: &[f64], b: &[f64]) -> Vec<f64> {
        let n = a.len();
        let size = Self::padded_len(n);
        let mut planner = FftPlanner::new();
        let fa = Self::spectrum(&mut planner, a, size);
        let fb = Self::spectrum(&mut planner, b, size);
        let product: Vec<Complex64> = fa.iter().zip(&fb).map(|(x, y)| *x * *y).collect();
        let mut out = Self::inverse(&mut planner, product);
        out.truncate(n);
        // Round-off can push empty bins slightly negative.
        out.iter_mut().for_each(|v| *v = v.max(0.0));
        out
    }

    fn geometric_sum(&self, first: &[f64], kernel: &[f64], retry_weight: f64) -> Vec<f64> {
        let n = first.len();
        let mass: f64 = retry_weight * kernel.iter().sum::<f64>();
        if mass >= 1.0 {
            warn!(mass, "retry kernel is not contracting, using direct recurrence");
            return DirectConvolver.geometric_sum(first, kernel, retry_weight);
        }

        let size = Self::padded_len(n);
        let mut planner = FftPlanner::new();
        let ff = Self::spectrum(&mut planner, first, size);
        let fk = Self::spectrum(&mut planner, kernel, size);
        let one = Complex64::new(1.0, 0.0);
        let quotient: Vec<Complex64> = ff
            .iter()
            .zip(&fk)
            .map(|(f, k)| *f / (one - *k * retry_weight))
            .collect();
        let mut out = Self::inverse(&mut planner, quotient);

        let tail = out[size - 1].abs();
        if tail > ALIASING_LIMIT {
            warn!(tail, size, "circular aliasing in FFT geometric sum, using direct recurrence");
            return DirectConvolver.geometric_sum(first, kernel, retry_weight);
        }
        out.truncate(n);
        out.iter_mut().for_each(|v| *v = v.max(0.0));
        out
    }
}

// ---------------------------------------------------------------------------
// Parallel
// ---------------------------------------------------------------------------

/// Data-parallel backend: every output bin is an independent dot product.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelConvolver;

impl Convolver for ParallelConvolver {
    fn name(&self) -> &str {
        "parallel"
    }

    fn convolve(&self, a: &[f64], b: &[f64]) -> Vec<f64> {
        let n = a.len();
        (0..n)
            .into_par_iter()
            .map(|k| {
                (0..=k)
                    .filter(|&i| k - i < b.len())
                    .map(|i| a[i] * b[k - i])
                    .sum()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Cross-check
// ---------------------------------------------------------------------------

/// A disagreement between two backends on the same input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericalDivergence {
    /// Protocol node being evaluated, when known.
    pub node: Option<NodeId>,
    /// Primitive that disagreed.
    pub operation: String,
    /// Backend whose result was used.
    pub primary: String,
    /// Backend used for comparison.
    pub reference: String,
    /// Largest deviation relative to the reference's largest magnitude.
    pub max_rel_error: f64,
}

/// Runs every primitive on two backends and records disagreements.
///
/// The primary backend's output is always the one returned.
pub struct CrossCheckConvolver {
    primary: Box<dyn Convolver>,
    reference: Box<dyn Convolver>,
    tolerance: f64,
    divergences: Mutex<Vec<NumericalDivergence>>,
}

impl CrossCheckConvolver {
    /// Compare `primary` against `reference` with the given relative tolerance.
    pub fn new(primary: Box<dyn Convolver>, reference: Box<dyn Convolver>, tolerance: f64) -> Self {
        Self {
            primary,
            reference,
            tolerance,
            divergences: Mutex::new(Vec::new()),
        }
    }

    fn check(&self, operation: &str, primary: &[f64], reference: &[f64]) {
        let err = max_relative_error(primary, reference);
        if err > self.tolerance {
            warn!(
                operation,
                primary = self.primary.name(),
                reference = self.reference.name(),
                max_rel_error = err,
                "convolution backends disagree"
            );
            let record = NumericalDivergence {
                node: None,
                operation: operation.to_string(),
                primary: self.primary.name().to_string(),
                reference: self.reference.name().to_string(),
                max_rel_error: err,
            };
            self.divergences
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(record);
        }
    }
}

impl Convolver for CrossCheckConvolver {
    fn name(&self) -> &str {
        self.primary.name()
    }

    fn convolve(&self, a: &[f64], b: &[f64]) -> Vec<f64> {
        let out = self.primary.convolve(a, b);
        self.check("convolve", &out, &self.reference.convolve(a, b));
        out
    }

    fn max_convolve(&self, a: &[f64], b: &[f64]) -> Vec<f64> {
        let out = self.primary.max_convolve(a, b);
        self.check("max_convolve", &out, &self.reference.max_convolve(a, b));
        out
    }

    fn geometric_sum(&self, first: &[f64], kernel: &[f64], retry_weight: f64) -> Vec<f64> {
        let out = self.primary.geometric_sum(first, kernel, retry_weight);
        let reference = self.reference.geometric_sum(first, kernel, retry_weight);
        self.check("geometric_sum", &out, &reference);
        out
    }

    fn drain_divergences(&self) -> Vec<NumericalDivergence> {
        std::mem::take(
            &mut *self
                .divergences
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

// ---------------------------------------------------------------------------
// Shared primitives
// ---------------------------------------------------------------------------

/// Max-arrival law of two independent waiting times in O(T).
///
/// `c[k] = a[k] B[k] + b[k] A[k] - a[k] b[k]` with `A`, `B` the cumulative
/// sums, so the tie `i == j == k` is counted once.
pub fn max_convolve(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut ca = 0.0;
    let mut cb = 0.0;
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            ca += x;
            cb += y;
            x * cb + y * ca - x * y
        })
        .collect()
}

/// Geometric sum by repeated convolution, stopping once terms vanish.
pub fn iterated_geometric_sum<C: Convolver + ?Sized>(
    convolver: &C,
    first: &[f64],
    kernel: &[f64],
    retry_weight: f64,
) -> Vec<f64> {
    let n = first.len();
    let mut total = first.to_vec();
    if retry_weight == 0.0 {
        return total;
    }
    let weighted: Vec<f64> = kernel.iter().map(|k| retry_weight * k).collect();
    let mut term = first.to_vec();
    for _ in 0..4 * n.max(1) {
        term = convolver.convolve(&term, &weighted);
        let term_mass: f64 = term.iter().map(|v| v.abs()).sum();
        if term_mass == 0.0 {
            break;
        }
        total.iter_mut().zip(&term).for_each(|(t, v)| *t += v);
        let total_mass: f64 = total.iter().map(|v| v.abs()).sum();
        if term_mass <= ITERATION_CUTOFF * total_mass {
            break;
        }
    }
    total
}

/// Largest `|a - b|` relative to the largest `|b|`.
pub fn max_relative_error(a: &[f64], b: &[f64]) -> f64 {
    let scale = b.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    let diff = a
        .iter()
        .zip(b)
        .fold(0.0f64, |m, (x, y)| m.max((x - y).abs()));
    if scale > 0.0 { diff / scale } else { diff }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_convolve_small() {
        let c = DirectConvolver.convolve(&[0.0, 1.0, 2.0], &[1.0, 1.0, 0.0]);
        assert_eq!(c, vec![0.0, 1.0, 3.0]);
    }

    #[test]
    fn max_convolve_counts_ties_once() {
        let a = [0.0, 0.5, 0.5];
        let c = max_convolve(&a, &a);
        assert!((c[1] - 0.25).abs() < 1e-15);
        assert!((c[2] - 0.75).abs() < 1e-15);
    }

    #[test]
    fn direct_geometric_sum_solves_recurrence() {
        // g = first + 0.5 * shift(g): first = δ_1 gives g[t] = 0.5^(t-1).
        let first = [0.0, 1.0, 0.0, 0.0, 0.0];
        let kernel = [0.0, 1.0, 0.0, 0.0, 0.0];
        let g = DirectConvolver.geometric_sum(&first, &kernel, 0.5);
        assert_eq!(g, vec![0.0, 1.0, 0.5, 0.25, 0.125]);
    }

    #[test]
    fn backend_names_parse() {
        assert_eq!("FFT".parse::<BackendKind>().unwrap(), BackendKind::Fft);
        assert_eq!("rayon".parse::<BackendKind>().unwrap(), BackendKind::Parallel);
        assert!("gpu".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::default().to_string(), "direct");
    }

    #[test]
    fn relative_error_of_identical_arrays_is_zero() {
        assert_eq!(max_relative_error(&[1.0, 2.0], &[1.0, 2.0]), 0.0);
        assert!((max_relative_error(&[1.0, 2.2], &[1.0, 2.0]) - 0.1).abs() < 1e-12);
    }
}
