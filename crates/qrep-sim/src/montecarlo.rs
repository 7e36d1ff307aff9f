//! Event-by-event Monte-Carlo simulation of a protocol tree.
//!
//! The sampler draws untruncated waiting times attempt by attempt, applies
//! the cut-off rules and Werner algebra of the analytic operators, and is
//! used to validate the engine statistically.
//!
//! The two agree in distribution for memory-time and run-time cut-offs, and
//! for fidelity cut-offs whose inputs are elementary links, where every
//! history in an arrival bin has the same Werner parameter. Once a fidelity
//! cut-off judges a swapped or distilled input, the engine compares the
//! bin-averaged Werner parameter against the threshold while the sampler
//! compares each history's own value. Their mean waiting times then differ
//! by a few percent.
//!
//! ```rust
//! use qrep_sim::{CutoffPolicy, MonteCarlo, PhysicalParams, ProtocolSpec};
//! use rand::SeedableRng;
//!
//! let spec = ProtocolSpec::swap_chain(3, 0).unwrap();
//! let params = PhysicalParams::new(0.5, 0.9, 0.95).with_coherence_time(400.0);
//! let policy = CutoffPolicy::new();
//! let mc = MonteCarlo::new(&spec, &policy, params).unwrap();
//! let mut rng = rand::rngs::StdRng::seed_from_u64(7);
//! let summary = mc.run(&mut rng, 1000);
//! assert!(summary.mean_waiting_time > 1.0);
//! ```

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::cutoff::{AttemptOutcome, CutoffPolicy, CutoffRule};
use crate::distribution::WaitingTimeDistribution;
use crate::error::{SimError, SimResult};
use crate::params::{PhysicalParams, joint_coherence_time};
use crate::protocol::{NodeId, ProtocolSpec, Unit};
use crate::units::{distillation_success, distilled_werner, swapped_werner};

/// One delivered pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Delivery {
    pub time: u64,
    pub werner: f64,
}

/// Sample statistics of a Monte-Carlo run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MonteCarloSummary {
    pub samples: usize,
    pub mean_waiting_time: f64,
    pub mean_werner: f64,
    /// Standard error of `mean_waiting_time`.
    pub waiting_time_std_error: f64,
}

/// Seeded sampler over one protocol tree.
#[derive(Debug, Clone)]
pub struct MonteCarlo<'a> {
    spec: &'a ProtocolSpec,
    policy: &'a CutoffPolicy,
    params: PhysicalParams,
    coherence: Vec<f64>,
}

impl<'a> MonteCarlo<'a> {
    pub fn new(spec: &'a ProtocolSpec, policy: &'a CutoffPolicy, params: PhysicalParams) -> SimResult<Self> {
        params.validate()?;
        spec.validate()?;
        policy.validate()?;
        let coherence = spec.coherence_times(params.t_coh);
        Ok(Self {
            spec,
            policy,
            params,
            coherence,
        })
    }

    /// Simulate one end-to-end delivery.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Delivery {
        self.sample_node(self.spec.root(), rng)
    }

    /// Simulate `samples` deliveries and summarize them.
    pub fn run<R: Rng + ?Sized>(&self, rng: &mut R, samples: usize) -> MonteCarloSummary {
        let mut sum_t = 0.0;
        let mut sum_t2 = 0.0;
        let mut sum_w = 0.0;
        for _ in 0..samples {
            let d = self.sample(rng);
            let t = d.time as f64;
            sum_t += t;
            sum_t2 += t * t;
            sum_w += d.werner;
        }
        let n = samples.max(1) as f64;
        let mean = sum_t / n;
        let variance = (sum_t2 / n - mean * mean).max(0.0);
        MonteCarloSummary {
            samples,
            mean_waiting_time: mean,
            mean_werner: sum_w / n,
            waiting_time_std_error: (variance / n).sqrt(),
        }
    }

    /// Empirical distribution over `truncation` bins.
    pub fn histogram<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        samples: usize,
        truncation: usize,
    ) -> SimResult<WaitingTimeDistribution> {
        if samples == 0 {
            return Err(SimError::invalid("samples", "must be at least 1"));
        }
        let mut counts = vec![0.0; truncation];
        let mut werner = vec![0.0; truncation];
        for _ in 0..samples {
            let d = self.sample(rng);
            if let Some(slot) = usize::try_from(d.time).ok().filter(|&t| t < truncation) {
                counts[slot] += 1.0;
                werner[slot] += d.werner;
            }
        }
        let total = samples as f64;
        let pmf: Vec<f64> = counts.iter().map(|c| c / total).collect();
        let werner: Vec<f64> = werner
            .iter()
            .zip(&counts)
            .map(|(w, c)| if *c > 0.0 { w / c } else { 0.0 })
            .collect();
        WaitingTimeDistribution::new(pmf, werner)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn sample_node<R: Rng + ?Sized>(&self, id: NodeId, rng: &mut R) -> Delivery {
        match self.spec.unit(id) {
            Some(Unit::Generation(g)) => {
                let p = g.p_gen.unwrap_or(self.params.p_gen);
                Delivery {
                    time: sample_geometric(p, rng),
                    werner: g.w0.unwrap_or(self.params.w0),
                }
            }
            Some(Unit::Swap { left, right }) => self.sample_swap(*left, *right, self.policy.get(id), rng),
            Some(Unit::Distill { left, right, rounds }) => {
                self.sample_distill(*left, *right, *rounds, self.policy.get(id), rng)
            }
            Some(Unit::Cutoff { child, rule }) => {
                let rule = self.policy.get(id).unwrap_or(rule);
                match self.spec.unit(*child) {
                    Some(Unit::Swap { left, right }) => self.sample_swap(*left, *right, Some(rule), rng),
                    Some(Unit::Distill { left, right, rounds }) => {
                        self.sample_distill(*left, *right, *rounds, Some(rule), rng)
                    }
                    _ => self.sample_node(*child, rng),
                }
            }
            // Validated specs never reach this.
            None => Delivery { time: 0, werner: 0.0 },
        }
    }

    fn sample_swap<R: Rng + ?Sized>(
        &self,
        left: NodeId,
        right: NodeId,
        rule: Option<&CutoffRule>,
        rng: &mut R,
    ) -> Delivery {
        let mut elapsed = 0u64;
        loop {
            let a = self.sample_node(left, rng);
            let b = self.sample_node(right, rng);
            match self.attempt(a, b, self.sides(left, right), rule) {
                Err(at) => elapsed += at,
                Ok((at, w1, w2)) => {
                    elapsed += at;
                    if rng.gen_bool(self.params.p_swap) {
                        return Delivery {
                            time: elapsed,
                            werner: swapped_werner(w1, w2),
                        };
                    }
                }
            }
        }
    }

    fn sample_distill<R: Rng + ?Sized>(
        &self,
        left: NodeId,
        right: NodeId,
        rounds: u32,
        rule: Option<&CutoffRule>,
        rng: &mut R,
    ) -> Delivery {
        let mut elapsed = 0u64;
        let (t_left, t_right) = self.sides(left, right);
        let t_coh = if rounds <= 1 {
            (t_left, t_right)
        } else {
            let t = joint_coherence_time(t_left, t_right);
            (t, t)
        };
        loop {
            let (a, b) = if rounds <= 1 {
                (self.sample_node(left, rng), self.sample_node(right, rng))
            } else {
                (
                    self.sample_distill(left, right, rounds - 1, rule, rng),
                    self.sample_distill(left, right, rounds - 1, rule, rng),
                )
            };
            match self.attempt(a, b, t_coh, rule) {
                Err(at) => elapsed += at,
                Ok((at, w1, w2)) => {
                    elapsed += at;
                    if rng.gen_bool(distillation_success(w1, w2).clamp(0.0, 1.0)) {
                        return Delivery {
                            time: elapsed,
                            werner: distilled_werner(w1, w2),
                        };
                    }
                }
            }
        }
    }

    fn sides(&self, left: NodeId, right: NodeId) -> (f64, f64) {
        (self.coherence[left.index()], self.coherence[right.index()])
    }

    /// `Ok((ready, aged w1, aged w2))` or `Err(abandon time)`.
    fn attempt(
        &self,
        a: Delivery,
        b: Delivery,
        (t_a, t_b): (f64, f64),
        rule: Option<&CutoffRule>,
    ) -> Result<(u64, f64, f64), u64> {
        if let Some(rule) = rule {
            let t_early = if a.time <= b.time { t_a } else { t_b };
            if let AttemptOutcome::Discarded { at } = rule.judge(a.time, a.werner, b.time, b.werner, t_early) {
                return Err(at);
            }
        }
        let ready = a.time.max(b.time);
        let w1 = CutoffRule::aged(a.werner, ready - a.time, t_a);
        let w2 = CutoffRule::aged(b.werner, ready - b.time, t_b);
        Ok((ready, w1, w2))
    }
}

/// Number of attempts until the first success, by inversion.
fn sample_geometric<R: Rng + ?Sized>(p: f64, rng: &mut R) -> u64 {
    if p >= 1.0 {
        return 1;
    }
    // 1 - u lies in (0, 1], so the logarithm is finite.
    let u: f64 = 1.0 - rng.r#gen::<f64>();
    let t = (u.ln() / (1.0 - p).ln()).ceil();
    if t < 1.0 { 1 } else { t as u64 }
}
