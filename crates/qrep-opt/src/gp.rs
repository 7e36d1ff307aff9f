//! Gaussian-process regression with an RBF kernel.
//!
//! Inputs live in the unit cube of the search space. Targets are
//! standardized before fitting, and the length scale is picked from a small
//! ladder by log marginal likelihood.

use faer::linalg::solvers::{Llt, Solve};
use faer::{Mat, Side};
use ndarray::{Array2, ArrayView1};

use crate::error::{OptError, OptResult};

/// Squared-exponential kernel `σ² exp(-|x - y|² / 2ℓ²)` plus observation noise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RbfKernel {
    pub length_scale: f64,
    pub variance: f64,
    pub noise: f64,
}

impl Default for RbfKernel {
    fn default() -> Self {
        Self {
            length_scale: 0.25,
            variance: 1.0,
            noise: 1e-6,
        }
    }
}

impl RbfKernel {
    pub fn eval(&self, a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
        let d2: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
        self.variance * (-d2 / (2.0 * self.length_scale * self.length_scale)).exp()
    }

    /// Gram matrix of the rows of `x`, with `noise + jitter` on the diagonal.
    fn gram(&self, x: &Array2<f64>, jitter: f64) -> Mat<f64> {
        Mat::from_fn(x.nrows(), x.nrows(), |i, j| {
            let k = self.eval(x.row(i), x.row(j));
            if i == j { k + self.noise + jitter } else { k }
        })
    }
}

/// Length scales tried by [`GaussianProcess::fit_best`].
pub const LENGTH_SCALES: [f64; 5] = [0.05, 0.1, 0.2, 0.4, 0.8];

/// Diagonal jitter tried, in order, when the Gram matrix is not positive definite.
const JITTER_LADDER: [f64; 7] = [0.0, 1e-8, 1e-7, 1e-6, 1e-5, 1e-4, 1e-3];

/// A fitted posterior.
pub struct GaussianProcess {
    kernel: RbfKernel,
    x: Array2<f64>,
    llt: Llt<f64>,
    alpha: Mat<f64>,
    y_mean: f64,
    y_std: f64,
    log_likelihood: f64,
}

impl std::fmt::Debug for GaussianProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GaussianProcess")
            .field("kernel", &self.kernel)
            .field("points", &self.x.nrows())
            .field("log_likelihood", &self.log_likelihood)
            .finish()
    }
}

impl GaussianProcess {
    /// Fit on rows of `x` with targets `y`.
    pub fn fit(x: Array2<f64>, y: &[f64], kernel: RbfKernel) -> OptResult<Self> {
        let n = x.nrows();
        if n == 0 || n != y.len() {
            return Err(OptError::Surrogate(format!(
                "need matching non-empty data, got {n} inputs and {} targets",
                y.len()
            )));
        }
        let y_mean = y.iter().sum::<f64>() / n as f64;
        let var = y.iter().map(|v| (v - y_mean) * (v - y_mean)).sum::<f64>() / n as f64;
        let y_std = if var > 0.0 { var.sqrt() } else { 1.0 };
        let z = Mat::from_fn(n, 1, |i, _| (y[i] - y_mean) / y_std);

        let llt = factorize(&kernel, &x)?;
        let alpha = llt.solve(&z);

        let l = llt.L();
        let log_det: f64 = (0..n).map(|i| l[(i, i)].ln()).sum();
        let fit: f64 = (0..n).map(|i| z[(i, 0)] * alpha[(i, 0)]).sum();
        let log_likelihood = -0.5 * fit - log_det - 0.5 * n as f64 * (2.0 * std::f64::consts::PI).ln();

        Ok(Self {
            kernel,
            x,
            llt,
            alpha,
            y_mean,
            y_std,
            log_likelihood,
        })
    }

    /// Fit once per length scale and keep the most likely model.
    pub fn fit_best(x: Array2<f64>, y: &[f64], base: RbfKernel, scales: &[f64]) -> OptResult<Self> {
        let mut best: Option<Self> = None;
        let mut last_err = None;
        for &length_scale in scales {
            match Self::fit(x.clone(), y, RbfKernel { length_scale, ..base }) {
                Ok(gp) => {
                    if best.as_ref().is_none_or(|b| gp.log_likelihood > b.log_likelihood) {
                        best = Some(gp);
                    }
                }
                Err(e) => last_err = Some(e),
            }
        }
        best.ok_or_else(|| last_err.unwrap_or_else(|| OptError::Surrogate("no length scale to try".into())))
    }

    pub fn kernel(&self) -> &RbfKernel {
        &self.kernel
    }

    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// Posterior mean and standard deviation at `x`, in target units.
    pub fn predict(&self, x: ArrayView1<f64>) -> (f64, f64) {
        let n = self.x.nrows();
        let k = Mat::from_fn(n, 1, |i, _| self.kernel.eval(self.x.row(i), x));
        let mean: f64 = (0..n).map(|i| k[(i, 0)] * self.alpha[(i, 0)]).sum();
        let v = self.llt.solve(&k);
        let explained: f64 = (0..n).map(|i| k[(i, 0)] * v[(i, 0)]).sum();
        let var = (self.kernel.variance - explained).max(0.0);
        (mean * self.y_std + self.y_mean, var.sqrt() * self.y_std)
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Cholesky factor of the Gram matrix, adding diagonal jitter until it
/// factorizes.
fn factorize(kernel: &RbfKernel, x: &Array2<f64>) -> OptResult<Llt<f64>> {
    let mut last = None;
    for jitter in JITTER_LADDER {
        match kernel.gram(x, jitter).llt(Side::Lower) {
            Ok(llt) => return Ok(llt),
            Err(e) => last = Some(e),
        }
    }
    Err(OptError::Surrogate(format!("kernel matrix is not positive definite ({last:?})")))
}
