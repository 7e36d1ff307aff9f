//! Truncated joint waiting-time / Werner-parameter distributions.
//!
//! A [`WaitingTimeDistribution`] holds `T` bins. Bin `t` stores the
//! probability that the pair is delivered exactly at time step `t` together
//! with the Werner parameter of that pair, conditioned on delivery at `t`.
//! Mass that would land at or beyond `T` is not stored; it is reported by
//! [`WaitingTimeDistribution::lost_mass`].

use ndarray::Array1;

use crate::error::{SimError, SimResult};
use crate::params::{check_probability, check_werner, werner_to_fidelity};

/// Joint distribution of delivery time and pair quality.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitingTimeDistribution {
    pmf: Array1<f64>,
    werner: Array1<f64>,
}

impl WaitingTimeDistribution {
    /// Build a distribution from explicit bins.
    ///
    /// Fails if the arrays differ in length, if `T < 2`, if any mass is
    /// negative or non-finite, if bin 0 carries mass, if the total exceeds
    /// one, or if a Werner parameter lies outside `[0, 1]`.
    pub fn new(pmf: Vec<f64>, werner: Vec<f64>) -> SimResult<Self> {
        if pmf.len() != werner.len() {
            return Err(SimError::invalid(
                "werner",
                format!("length {} does not match pmf length {}", werner.len(), pmf.len()),
            ));
        }
        check_truncation(pmf.len())?;
        if pmf.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(SimError::invalid("pmf", "masses must be finite and non-negative"));
        }
        if pmf[0] != 0.0 {
            return Err(SimError::invalid("pmf", "bin 0 must carry zero mass"));
        }
        let total: f64 = pmf.iter().sum();
        if total > 1.0 + 1e-9 {
            return Err(SimError::invalid("pmf", format!("total mass {total} exceeds 1")));
        }
        for w in &werner {
            check_werner("werner", *w)?;
        }
        Ok(Self::from_parts(Array1::from(pmf), Array1::from(werner)))
    }

    /// Waiting time of one elementary link: `P[t] = p (1 - p)^(t - 1)`.
    pub fn geometric(p_gen: f64, w0: f64, truncation: usize) -> SimResult<Self> {
        check_probability("p_gen", p_gen)?;
        check_werner("w0", w0)?;
        check_truncation(truncation)?;

        let mut pmf = Array1::zeros(truncation);
        for t in 1..truncation {
            pmf[t] = p_gen * (1.0 - p_gen).powi((t - 1) as i32);
        }
        Ok(Self::from_parts(pmf, Array1::from_elem(truncation, w0)))
    }

    pub(crate) fn from_parts(pmf: Array1<f64>, werner: Array1<f64>) -> Self {
        debug_assert_eq!(pmf.len(), werner.len());
        Self { pmf, werner }
    }

    /// Assemble a distribution from a pmf and a Werner-weighted mass array.
    ///
    /// Zero-mass bins get Werner parameter 0; the rest are clamped to `[0, 1]`.
    pub(crate) fn from_state(pmf: Vec<f64>, state: Vec<f64>) -> Self {
        let werner: Array1<f64> = pmf
            .iter()
            .zip(&state)
            .map(|(&p, &s)| if p > 0.0 { (s / p).clamp(0.0, 1.0) } else { 0.0 })
            .collect();
        Self::from_parts(Array1::from(pmf), werner)
    }

    /// Number of bins `T`.
    pub fn truncation(&self) -> usize {
        self.pmf.len()
    }

    /// Probability mass per bin.
    pub fn pmf(&self) -> &Array1<f64> {
        &self.pmf
    }

    /// Werner parameter per bin (0 for zero-mass bins).
    pub fn werner(&self) -> &Array1<f64> {
        &self.werner
    }

    /// Mass delivered exactly at `t` (0 beyond the horizon).
    pub fn probability(&self, t: usize) -> f64 {
        self.pmf.get(t).copied().unwrap_or(0.0)
    }

    /// Werner parameter at `t`, `None` when the bin carries no mass.
    pub fn werner_at(&self, t: usize) -> Option<f64> {
        match self.pmf.get(t) {
            Some(&p) if p > 0.0 => Some(self.werner[t]),
            _ => None,
        }
    }

    /// Fidelity at `t`, `None` when the bin carries no mass.
    pub fn fidelity_at(&self, t: usize) -> Option<f64> {
        self.werner_at(t).map(werner_to_fidelity)
    }

    /// Total mass inside the horizon.
    pub fn coverage(&self) -> f64 {
        self.pmf.sum()
    }

    /// Mass beyond the horizon, `1 - coverage`.
    pub fn lost_mass(&self) -> f64 {
        (1.0 - self.coverage()).max(0.0)
    }

    /// Cumulative distribution function.
    pub fn cdf(&self) -> Array1<f64> {
        let mut acc = 0.0;
        self.pmf
            .iter()
            .map(|p| {
                acc += p;
                acc
            })
            .collect()
    }

    /// `S[t] = P(delivery > t)`, including the mass beyond the horizon.
    pub(crate) fn survival(&self) -> Vec<f64> {
        let n = self.pmf.len();
        let mut s = vec![0.0; n];
        let mut acc = self.lost_mass();
        for t in (0..n).rev() {
            s[t] = acc;
            acc += self.pmf[t];
        }
        s
    }

    /// `pmf[t] * werner[t]` per bin.
    pub(crate) fn weighted_werner(&self) -> Array1<f64> {
        &self.pmf * &self.werner
    }

    /// Mean delivery time, conditioned on delivery inside the horizon.
    pub fn mean_waiting_time(&self) -> f64 {
        let total = self.coverage();
        if total <= 0.0 {
            return f64::INFINITY;
        }
        let weighted: f64 = self.pmf.iter().enumerate().map(|(t, p)| t as f64 * p).sum();
        weighted / total
    }

    /// Mean delivery time including the lost mass.
    ///
    /// The tail beyond the horizon is assumed geometric with the ratio of the
    /// last two bins, so `E[t | t >= T] = T + q / (1 - q)`.
    pub fn mean_waiting_time_extrapolated(&self) -> f64 {
        let n = self.pmf.len();
        let inside: f64 = self.pmf.iter().enumerate().map(|(t, p)| t as f64 * p).sum();
        let lost = self.lost_mass();
        if lost == 0.0 {
            return inside / self.coverage().max(f64::MIN_POSITIVE);
        }
        let (last, before) = (self.pmf[n - 1], self.pmf[n - 2]);
        let q = if last > 0.0 && before > 0.0 && last < before {
            last / before
        } else {
            0.0
        };
        inside + lost * (n as f64 + q / (1.0 - q))
    }

    /// Mean Werner parameter of delivered pairs.
    pub fn mean_werner(&self) -> f64 {
        let total = self.coverage();
        if total <= 0.0 {
            return 0.0;
        }
        self.weighted_werner().sum() / total
    }

    /// Mean fidelity of delivered pairs.
    pub fn mean_fidelity(&self) -> f64 {
        werner_to_fidelity(self.mean_werner())
    }

    /// Smallest `t` with `cdf[t] >= q`, `None` if the horizon never reaches it.
    pub fn quantile(&self, q: f64) -> Option<usize> {
        let mut acc = 0.0;
        for (t, p) in self.pmf.iter().enumerate() {
            acc += p;
            if acc >= q {
                return Some(t);
            }
        }
        None
    }
}

pub(crate) fn check_truncation(truncation: usize) -> SimResult<()> {
    if truncation < 2 {
        return Err(SimError::invalid(
            "truncation",
            format!("must be at least 2, got {truncation}"),
        ));
    }
    Ok(())
}
