//! Physical parameters of a repeater chain and the Werner/fidelity algebra.

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

/// Chain-wide hardware parameters.
///
/// Time is measured in elementary-link attempt slots. A coherence time of
/// `f64::INFINITY` models a perfect memory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicalParams {
    /// Success probability of one elementary-link generation attempt.
    pub p_gen: f64,
    /// Success probability of an entanglement swap.
    pub p_swap: f64,
    /// Werner parameter of a freshly generated link.
    pub w0: f64,
    /// Memory coherence time, in attempt slots.
    #[serde(default = "default_t_coh", with = "coherence_time")]
    pub t_coh: f64,
}

fn default_t_coh() -> f64 {
    f64::INFINITY
}

impl Default for PhysicalParams {
    fn default() -> Self {
        Self {
            p_gen: 0.5,
            p_swap: 0.9,
            w0: 0.95,
            t_coh: 400.0,
        }
    }
}

impl PhysicalParams {
    /// Parameters with a perfect memory.
    pub fn new(p_gen: f64, p_swap: f64, w0: f64) -> Self {
        Self {
            p_gen,
            p_swap,
            w0,
            t_coh: f64::INFINITY,
        }
    }

    /// Set the memory coherence time.
    #[must_use]
    pub fn with_coherence_time(mut self, t_coh: f64) -> Self {
        self.t_coh = t_coh;
        self
    }

    /// Check every field against its physical range.
    pub fn validate(&self) -> SimResult<()> {
        check_probability("p_gen", self.p_gen)?;
        check_probability("p_swap", self.p_swap)?;
        check_werner("w0", self.w0)?;
        check_coherence_time("t_coh", self.t_coh)
    }

    /// Multiplicative Werner decay after `dt` slots in memory.
    pub fn decay(&self, dt: usize) -> f64 {
        decay_factor(dt, self.t_coh)
    }
}

/// `exp(-dt / t_coh)`, exactly 1 for an infinite coherence time.
pub fn decay_factor(dt: usize, t_coh: f64) -> f64 {
    if t_coh.is_infinite() || dt == 0 {
        1.0
    } else {
        (-(dt as f64) / t_coh).exp()
    }
}

/// Coherence time of a pair whose two halves sit in memories with pair
/// coherence times `a` and `b`.
///
/// Each half contributes half the decay rate of its own pair, so the rates
/// add as `1/t = (1/a + 1/b) / 2`. Equal inputs are returned unchanged.
pub fn joint_coherence_time(a: f64, b: f64) -> f64 {
    if a == b {
        a
    } else {
        2.0 / (1.0 / a + 1.0 / b)
    }
}

/// `F = (1 + 3w) / 4`.
pub fn werner_to_fidelity(w: f64) -> f64 {
    (1.0 + 3.0 * w) / 4.0
}

/// `w = (4F - 1) / 3`.
pub fn fidelity_to_werner(f: f64) -> f64 {
    (4.0 * f - 1.0) / 3.0
}

pub(crate) fn check_probability(name: &'static str, p: f64) -> SimResult<()> {
    if !p.is_finite() || p <= 0.0 || p > 1.0 {
        return Err(SimError::invalid(name, format!("must be in (0, 1], got {p}")));
    }
    Ok(())
}

pub(crate) fn check_coherence_time(name: &'static str, t: f64) -> SimResult<()> {
    if t.is_nan() || t <= 0.0 {
        return Err(SimError::invalid(
            name,
            format!("must be positive (infinity allowed), got {t}"),
        ));
    }
    Ok(())
}

pub(crate) fn check_werner(name: &'static str, w: f64) -> SimResult<()> {
    if !w.is_finite() || !(0.0..=1.0).contains(&w) {
        return Err(SimError::invalid(name, format!("must be in [0, 1], got {w}")));
    }
    Ok(())
}

// JSON has no infinity; a perfect memory is written as `null`.
mod coherence_time {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &f64, s: S) -> Result<S::Ok, S::Error> {
        if t.is_finite() {
            s.serialize_some(t)
        } else {
            s.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::INFINITY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fidelity_conversion_inverts() {
        for f in [0.25, 0.5, 0.9, 1.0] {
            assert!((werner_to_fidelity(fidelity_to_werner(f)) - f).abs() < 1e-15);
        }
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(PhysicalParams::new(0.0, 0.5, 0.9).validate().is_err());
        assert!(PhysicalParams::new(0.5, 1.5, 0.9).validate().is_err());
        assert!(PhysicalParams::new(0.5, 0.5, -0.1).validate().is_err());
        assert!(
            PhysicalParams::new(0.5, 0.5, 0.9)
                .with_coherence_time(0.0)
                .validate()
                .is_err()
        );
        assert!(PhysicalParams::new(1.0, 1.0, 1.0).validate().is_ok());
    }

    #[test]
    fn perfect_memory_does_not_decay() {
        let p = PhysicalParams::new(0.5, 0.5, 0.9);
        assert_eq!(p.decay(1000), 1.0);
        let p = p.with_coherence_time(10.0);
        assert!((p.decay(10) - (-1.0f64).exp()).abs() < 1e-15);
    }

    #[test]
    fn joint_coherence_time_adds_rates() {
        assert_eq!(joint_coherence_time(400.0, 400.0), 400.0);
        assert!((joint_coherence_time(100.0, 300.0) - 150.0).abs() < 1e-12);
        assert!((joint_coherence_time(100.0, f64::INFINITY) - 200.0).abs() < 1e-12);
        assert!(joint_coherence_time(f64::INFINITY, f64::INFINITY).is_infinite());
    }

    #[test]
    fn infinite_coherence_time_serializes_as_null() {
        let p = PhysicalParams::new(0.5, 0.9, 0.95);
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"t_coh\":null"));
        let back: PhysicalParams = serde_json::from_str(&json).unwrap();
        assert!(back.t_coh.is_infinite());
    }
}
