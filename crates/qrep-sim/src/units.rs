//! Protocol unit operators.
//!
//! Every operator is a pure function from input distributions to a new
//! output distribution. Swap and distillation share one structure: an
//! *attempt* waits for both input links, may be abandoned by a cut-off, and
//! is retried until it succeeds. The per-attempt masses come from a [`Join`]
//! of the two inputs; the retry loops are geometric sums evaluated by the
//! configured [`Convolver`].
//!
//! Memory decay is applied to the link that waits for its partner, with the
//! coherence time of the memories holding that link. A fidelity cut-off is
//! judged on the Werner parameter of the waiting link in its arrival bin.
//! Bins of a distilled or swapped input carry the *average* Werner parameter
//! of all histories that end there, so a fidelity threshold acts on that
//! average. An event-by-event sampler instead sees each history's own value
//! and may keep or discard a different set of attempts.

use crate::convolution::Convolver;
use crate::cutoff::CutoffRule;
use crate::distribution::WaitingTimeDistribution;
use crate::error::SimResult;
use crate::params::{decay_factor, joint_coherence_time};

/// Werner parameter after swapping two Werner pairs.
pub fn swapped_werner(w1: f64, w2: f64) -> f64 {
    w1 * w2
}

/// Success probability of one distillation round.
pub fn distillation_success(w1: f64, w2: f64) -> f64 {
    (1.0 + w1 * w2) / 2.0
}

/// Werner parameter of a successfully distilled pair.
pub fn distilled_werner(w1: f64, w2: f64) -> f64 {
    (w1 + w2 + 4.0 * w1 * w2) / (6.0 * distillation_success(w1, w2))
}

/// Shared state of the operators: the convolution backend and memory decay.
#[derive(Clone, Copy)]
pub struct UnitContext<'a> {
    pub convolver: &'a dyn Convolver,
    /// Coherence time of the memories holding the left input.
    pub t_coh_left: f64,
    /// Coherence time of the memories holding the right input.
    pub t_coh_right: f64,
}

impl<'a> UnitContext<'a> {
    /// The same coherence time on both inputs.
    pub fn new(convolver: &'a dyn Convolver, t_coh: f64) -> Self {
        Self {
            convolver,
            t_coh_left: t_coh,
            t_coh_right: t_coh,
        }
    }

    /// Separate coherence times for the left and right input.
    #[must_use]
    pub fn with_coherence(mut self, left: f64, right: f64) -> Self {
        self.t_coh_left = left;
        self.t_coh_right = right;
        self
    }

    /// Coherence time of the pair an operator delivers.
    pub fn output_coherence(&self) -> f64 {
        joint_coherence_time(self.t_coh_left, self.t_coh_right)
    }
}

/// Waiting time of one elementary link.
pub fn generation(p_gen: f64, w0: f64, truncation: usize) -> SimResult<WaitingTimeDistribution> {
    WaitingTimeDistribution::geometric(p_gen, w0, truncation)
}

/// Swap two links, retrying on cut-off and on swap failure.
pub fn swap(
    ctx: UnitContext<'_>,
    left: &WaitingTimeDistribution,
    right: &WaitingTimeDistribution,
    p_swap: f64,
    rule: Option<&CutoffRule>,
) -> WaitingTimeDistribution {
    let join = Join::new(left, right, rule, ctx.t_coh_left, ctx.t_coh_right);
    let conv = ctx.convolver;

    let fail = join.failures();
    let pmf_cut = conv.geometric_sum(&join.passing(conv), &fail, 1.0);
    let pmf = scaled(conv.geometric_sum(&pmf_cut, &pmf_cut, 1.0 - p_swap), p_swap);

    let state_attempt = conv.geometric_sum(&join.successes(swapped_werner), &fail, 1.0);
    let state = scaled(conv.geometric_sum(&state_attempt, &pmf_cut, 1.0 - p_swap), p_swap);

    WaitingTimeDistribution::from_state(pmf, state)
}

/// One distillation round, retrying on cut-off and on distillation failure.
pub fn distill(
    ctx: UnitContext<'_>,
    left: &WaitingTimeDistribution,
    right: &WaitingTimeDistribution,
    rule: Option<&CutoffRule>,
) -> WaitingTimeDistribution {
    let join = Join::new(left, right, rule, ctx.t_coh_left, ctx.t_coh_right);
    let conv = ctx.convolver;

    let fail = join.failures();
    let succeeded = conv.geometric_sum(&join.successes(|a, b| 0.5 + 0.5 * a * b), &fail, 1.0);
    let failed = conv.geometric_sum(&join.successes(|a, b| 0.5 - 0.5 * a * b), &fail, 1.0);
    let pmf = conv.geometric_sum(&succeeded, &failed, 1.0);

    let state_attempt = conv.geometric_sum(
        &join.successes(|a, b| (a + b + 4.0 * a * b) / 6.0),
        &fail,
        1.0,
    );
    let state = conv.geometric_sum(&state_attempt, &failed, 1.0);

    WaitingTimeDistribution::from_state(pmf, state)
}

/// `rounds` distillation rounds: first on `(left, right)`, then on two
/// copies of the previous output.
pub fn distill_rounds(
    ctx: UnitContext<'_>,
    left: &WaitingTimeDistribution,
    right: &WaitingTimeDistribution,
    rounds: u32,
    rule: Option<&CutoffRule>,
) -> WaitingTimeDistribution {
    let mut out = distill(ctx, left, right, rule);
    let t = ctx.output_coherence();
    let ctx = ctx.with_coherence(t, t);
    for _ in 1..rounds {
        out = distill(ctx, &out, &out, rule);
    }
    out
}

fn scaled(mut v: Vec<f64>, factor: f64) -> Vec<f64> {
    v.iter_mut().for_each(|x| *x *= factor);
    v
}

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

/// Per-attempt masses of two independent input links under a cut-off.
pub struct Join<'a> {
    left: &'a WaitingTimeDistribution,
    right: &'a WaitingTimeDistribution,
    rule: Option<&'a CutoffRule>,
    t_coh_left: f64,
    t_coh_right: f64,
    decay_left: Vec<f64>,
    decay_right: Vec<f64>,
}

impl<'a> Join<'a> {
    /// `t_coh_left` and `t_coh_right` age the left and right link while
    /// it waits for the other one.
    pub fn new(
        left: &'a WaitingTimeDistribution,
        right: &'a WaitingTimeDistribution,
        rule: Option<&'a CutoffRule>,
        t_coh_left: f64,
        t_coh_right: f64,
    ) -> Self {
        let n = left.truncation();
        debug_assert_eq!(n, right.truncation());
        let decay_left: Vec<f64> = (0..n).map(|dt| decay_factor(dt, t_coh_left)).collect();
        let decay_right = if t_coh_right == t_coh_left {
            decay_left.clone()
        } else {
            (0..n).map(|dt| decay_factor(dt, t_coh_right)).collect()
        };
        Self {
            left,
            right,
            rule,
            t_coh_left,
            t_coh_right,
            decay_left,
            decay_right,
        }
    }

    fn window(&self, w_early: f64, t_coh: f64) -> Option<usize> {
        self.rule
            .and_then(|r| r.window(w_early, t_coh))
            .map(|w| usize::try_from(w).unwrap_or(usize::MAX))
    }

    fn run_time_limit(&self) -> Option<usize> {
        match self.rule {
            Some(CutoffRule::RunTime(limit)) => Some(usize::try_from(*limit).unwrap_or(usize::MAX)),
            _ => None,
        }
    }

    /// Mass of attempts that pass the cut-off, placed at `max(i, j)`.
    pub fn passing(&self, convolver: &dyn Convolver) -> Vec<f64> {
        match self.rule {
            // Without a cut-off this is the plain max-arrival law.
            None => convolver.max_convolve(&self.left.pmf().to_vec(), &self.right.pmf().to_vec()),
            Some(_) => self.successes(|_, _| 1.0),
        }
    }

    /// `Σ P_left[i] P_right[j] g(w_i, w_j)` over attempts that pass the
    /// cut-off, placed at `max(i, j)`. The earlier link's Werner parameter is
    /// decayed by its time in memory before `g` is applied.
    pub fn successes(&self, payload: impl Fn(f64, f64) -> f64) -> Vec<f64> {
        let (pa, wa) = (self.left.pmf(), self.left.werner());
        let (pb, wb) = (self.right.pmf(), self.right.werner());
        let n = pa.len();

        let limit = self.run_time_limit();
        let mut out = vec![0.0; n];
        for t1 in 1..n {
            let p1 = pa[t1];
            if p1 == 0.0 {
                continue;
            }
            let (lo, hi) = match self.rule {
                Some(CutoffRule::MemoryTime(tau)) => {
                    let tau = usize::try_from(*tau).unwrap_or(usize::MAX);
                    (t1.saturating_sub(tau).max(1), t1.saturating_add(tau).min(n - 1))
                }
                _ => (1, n - 1),
            };
            for t2 in lo..=hi {
                let p2 = pb[t2];
                if p2 == 0.0 {
                    continue;
                }
                let ready = t1.max(t2);
                if let Some(limit) = limit {
                    if ready > limit {
                        continue;
                    }
                }
                let (w1, w2) = if t1 < t2 {
                    if self.window(wa[t1], self.t_coh_left).is_some_and(|win| t2 - t1 > win) {
                        continue;
                    }
                    (wa[t1] * self.decay_left[t2 - t1], wb[t2])
                } else if t2 < t1 {
                    if self.window(wb[t2], self.t_coh_right).is_some_and(|win| t1 - t2 > win) {
                        continue;
                    }
                    (wa[t1], wb[t2] * self.decay_right[t1 - t2])
                } else {
                    (wa[t1], wb[t2])
                };
                out[ready] += p1 * p2 * payload(w1, w2);
            }
        }
        out
    }

    /// Mass of attempts abandoned by the cut-off, placed at the abandon time.
    ///
    /// The partner's survival function includes mass beyond the horizon, so
    /// partners that never arrive in time are counted.
    pub fn failures(&self) -> Vec<f64> {
        let (pa, wa) = (self.left.pmf(), self.left.werner());
        let (pb, wb) = (self.right.pmf(), self.right.werner());
        let n = pa.len();
        let mut out = vec![0.0; n];
        if self.rule.is_none() {
            return out;
        }
        let sa = self.left.survival();
        let sb = self.right.survival();

        if let Some(limit) = self.run_time_limit() {
            if limit < n {
                out[limit] = sa[limit] + sb[limit] - sa[limit] * sb[limit];
            }
            return out;
        }

        for te in 1..n {
            if let Some(win) = self.window(wa[te], self.t_coh_left) {
                let t = te.saturating_add(win);
                if t < n {
                    out[t] += pa[te] * sb[t];
                }
            }
            if let Some(win) = self.window(wb[te], self.t_coh_right) {
                let t = te.saturating_add(win);
                if t < n {
                    out[t] += pb[te] * sa[t];
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convolution::DirectConvolver;

    #[test]
    fn bbpssw_closed_form() {
        let w = (4.0 * 0.9 - 1.0) / 3.0;
        let f_out = (1.0 + 3.0 * distilled_werner(w, w)) / 4.0;
        assert!((f_out - 0.926395939086294).abs() < 1e-12);
        assert!((distillation_success(w, w) - 0.8755555555555556).abs() < 1e-12);
    }

    #[test]
    fn join_without_cutoff_has_no_failures() {
        let g = WaitingTimeDistribution::geometric(0.3, 0.9, 20).unwrap();
        let join = Join::new(&g, &g, None, 50.0, 50.0);
        assert!(join.failures().iter().all(|&v| v == 0.0));
        let ps = join.passing(&DirectConvolver);
        assert_eq!(ps[0], 0.0);
        assert!((ps[1] - 0.09).abs() < 1e-15);
    }

    #[test]
    fn attempt_masses_add_up_to_one() {
        // Every attempt either passes, fails inside the horizon, or is lost.
        let g = WaitingTimeDistribution::geometric(0.3, 0.9, 400).unwrap();
        let rule = CutoffRule::MemoryTime(4);
        let join = Join::new(&g, &g, Some(&rule), 50.0, 50.0);
        let total: f64 = join.passing(&DirectConvolver).iter().sum::<f64>()
            + join.failures().iter().sum::<f64>();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn only_the_waiting_link_decays() {
        // Left always arrives at 1, right always at 3.
        let early = WaitingTimeDistribution::new(vec![0.0, 1.0, 0.0, 0.0, 0.0], vec![0.9; 5]).unwrap();
        let late = WaitingTimeDistribution::new(vec![0.0, 0.0, 0.0, 1.0, 0.0], vec![0.8; 5]).unwrap();
        let join = Join::new(&early, &late, None, 10.0, f64::INFINITY);
        let out = join.successes(|a, b| a * b);
        assert!((out[3] - 0.9 * (-0.2f64).exp() * 0.8).abs() < 1e-15);

        // A perfect memory on the waiting side keeps the link intact.
        let join = Join::new(&early, &late, None, f64::INFINITY, 10.0);
        let out = join.successes(|a, b| a * b);
        assert!((out[3] - 0.72).abs() < 1e-15);
    }

    #[test]
    fn run_time_failures_at_limit() {
        let g = WaitingTimeDistribution::geometric(0.5, 0.9, 30).unwrap();
        let rule = CutoffRule::RunTime(2);
        let join = Join::new(&g, &g, Some(&rule), 50.0, 50.0);
        let fail = join.failures();
        // P(max > 2) = 1 - 0.75^2
        assert!((fail[2] - (1.0 - 0.5625)).abs() < 1e-12);
        assert_eq!(fail.iter().filter(|v| **v != 0.0).count(), 1);
    }
}
