//! Brute-force search over protocol structures.
//!
//! A [`ProtocolSpace`] holds every way to turn a chain of elementary links
//! into one end-to-end link: each binary bracketing of the segments into
//! swaps, with up to `max_dists` distillation rounds on each input of every
//! swap. Candidates are written in the step encoding of
//! [`ProtocolSpec::from_steps`], e.g. `d0 s0 s0` on three segments. The
//! search evaluates all of them without cut-offs and ranks them by key rate.
//!
//! ```rust
//! use qrep_opt::{ProtocolSearch, ProtocolSpace};
//! use qrep_sim::{EngineConfig, PhysicalParams, ScoringParams};
//!
//! let space = ProtocolSpace::uniform(3, 1).unwrap();
//! assert_eq!(space.len(), 4);
//!
//! let params = PhysicalParams::new(0.5, 0.9, 0.95).with_coherence_time(400.0);
//! let search = ProtocolSearch::new(EngineConfig::new(400), ScoringParams::default());
//! let report = search.run(&space, &params).unwrap();
//! assert_eq!(report.candidates.len(), 4);
//! assert!(report.best().is_some());
//! ```

use std::time::{Duration, Instant};

use qrep_sim::{
    CutoffPolicy, EngineConfig, GenerationParams, PhysicalParams, ProtocolSpec, ScoringParams, suggest_truncation,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{OptError, OptResult};
use crate::trial::{TrialMetrics, TrialStatus, assess};

/// Largest space [`ProtocolSpace::new`] accepts.
pub const MAX_PROTOCOLS: usize = 100_000;

/// Every protocol structure over a fixed chain of links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSpace {
    links: Vec<GenerationParams>,
    max_dists: u32,
}

impl ProtocolSpace {
    /// One entry of `links` per elementary link.
    pub fn new(links: Vec<GenerationParams>, max_dists: u32) -> OptResult<Self> {
        if links.is_empty() {
            return Err(OptError::InvalidConfig {
                name: "nodes",
                reason: "a chain needs at least 2 nodes".into(),
            });
        }
        let space = Self { links, max_dists };
        let len = count(space.segments(), max_dists);
        if len > MAX_PROTOCOLS as u128 {
            return Err(OptError::InvalidConfig {
                name: "max_dists",
                reason: format!(
                    "{} segments with up to {max_dists} distillations give {len} protocols, more than {MAX_PROTOCOLS}",
                    space.segments()
                ),
            });
        }
        Ok(space)
    }

    /// A chain of `nodes` nodes whose links all use the chain-wide parameters.
    pub fn uniform(nodes: usize, max_dists: u32) -> OptResult<Self> {
        Self::new(vec![GenerationParams::default(); nodes.saturating_sub(1)], max_dists)
    }

    /// Number of elementary links.
    pub fn segments(&self) -> usize {
        self.links.len()
    }

    pub fn max_dists(&self) -> u32 {
        self.max_dists
    }

    pub fn links(&self) -> &[GenerationParams] {
        &self.links
    }

    /// Number of candidates.
    pub fn len(&self) -> usize {
        // Bounded by MAX_PROTOCOLS in `new`.
        count(self.segments(), self.max_dists) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All candidates as step sequences, in a fixed order.
    pub fn step_sequences(&self) -> Vec<Vec<String>> {
        sequences(0, self.segments(), self.max_dists)
    }

    /// Build the protocol tree of one step sequence.
    pub fn protocol<S: AsRef<str>>(&self, steps: &[S]) -> OptResult<ProtocolSpec> {
        Ok(ProtocolSpec::from_steps_with(&self.links, steps)?)
    }
}

/// Number of bracketings of `segments` with `max_dists + 1` choices on both
/// inputs of every swap.
fn count(segments: usize, max_dists: u32) -> u128 {
    let choices = u128::from(max_dists) + 1;
    let per_swap = choices.saturating_mul(choices);
    let mut c = vec![0u128; segments + 1];
    if segments > 0 {
        c[1] = 1;
    }
    for n in 2..=segments {
        c[n] = (1..n).fold(0u128, |acc, m| {
            acc.saturating_add(c[m].saturating_mul(c[n - m]).saturating_mul(per_swap))
        });
    }
    c[segments]
}

/// Step sequences that merge segments `lo..hi` into segment `lo`.
fn sequences(lo: usize, hi: usize, max_dists: u32) -> Vec<Vec<String>> {
    if hi - lo == 1 {
        return vec![Vec::new()];
    }
    let mut out = Vec::new();
    for mid in lo + 1..hi {
        let lefts = sequences(lo, mid, max_dists);
        let rights = sequences(mid, hi, max_dists);
        for left in &lefts {
            for right in &rights {
                for d_left in 0..=max_dists {
                    for d_right in 0..=max_dists {
                        let mut steps = left.clone();
                        steps.extend(right.iter().cloned());
                        steps.extend((0..d_left).map(|_| format!("d{lo}")));
                        steps.extend((0..d_right).map(|_| format!("d{mid}")));
                        steps.push(format!("s{lo}"));
                        out.push(steps);
                    }
                }
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// One evaluated protocol structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolCandidate {
    /// Position in the space, starting at 0.
    pub index: usize,
    pub steps: Vec<String>,
    /// Tree form of the protocol.
    pub protocol: String,
    pub score: f64,
    pub feasible: bool,
    pub status: TrialStatus,
    #[serde(default)]
    pub metrics: Option<TrialMetrics>,
    #[serde(default)]
    pub elapsed_ms: f64,
}

/// Everything a structure search produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSearchReport {
    /// Candidates in space order.
    pub candidates: Vec<ProtocolCandidate>,
    pub elapsed: Duration,
}

impl ProtocolSearchReport {
    /// Highest-scoring feasible candidate, first one on ties.
    pub fn best(&self) -> Option<&ProtocolCandidate> {
        self.candidates
            .iter()
            .filter(|c| c.feasible)
            .fold(None, |best: Option<&ProtocolCandidate>, c| match best {
                Some(b) if b.score >= c.score => Some(b),
                _ => Some(c),
            })
    }

    /// Feasible candidates, best first.
    pub fn ranked(&self) -> Vec<&ProtocolCandidate> {
        let mut ranked: Vec<&ProtocolCandidate> = self.candidates.iter().filter(|c| c.feasible).collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));
        ranked
    }

    pub fn feasible_count(&self) -> usize {
        self.candidates.iter().filter(|c| c.feasible).count()
    }
}

/// Evaluates every candidate of a [`ProtocolSpace`].
#[derive(Debug, Clone)]
pub struct ProtocolSearch {
    engine: EngineConfig,
    scoring: ScoringParams,
    suggest_truncation: bool,
    parallel: bool,
}

impl ProtocolSearch {
    pub fn new(engine: EngineConfig, scoring: ScoringParams) -> Self {
        Self {
            engine,
            scoring,
            suggest_truncation: false,
            parallel: true,
        }
    }

    /// Size each candidate's horizon from its own nesting depth instead of
    /// using the engine's.
    #[must_use]
    pub fn with_suggested_truncation(mut self, suggest: bool) -> Self {
        self.suggest_truncation = suggest;
        self
    }

    /// Evaluate candidates on the rayon pool.
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Evaluate and score one step sequence.
    pub fn evaluate(
        &self,
        space: &ProtocolSpace,
        params: &PhysicalParams,
        index: usize,
        steps: &[String],
    ) -> OptResult<ProtocolCandidate> {
        let started = Instant::now();
        let spec = space.protocol(steps)?;
        let mut engine = self.engine.clone();
        if self.suggest_truncation {
            engine.truncation = suggest_truncation(params, spec.swap_levels(), spec.distill_levels());
            engine.max_truncation = engine.max_truncation.max(engine.truncation);
        }
        let assessment = assess(&engine, &self.scoring, &spec, &CutoffPolicy::new(), params)?;
        if assessment.status == TrialStatus::Truncated {
            warn!(steps = %steps.join(","), truncation = engine.truncation, "protocol under-covered");
        }
        Ok(ProtocolCandidate {
            index,
            steps: steps.to_vec(),
            protocol: spec.to_string(),
            score: assessment.score,
            feasible: assessment.status.is_feasible(),
            status: assessment.status,
            metrics: assessment.metrics,
            elapsed_ms: started.elapsed().as_secs_f64() * 1e3,
        })
    }

    /// Evaluate the whole space and keep every candidate in memory.
    pub fn run(&self, space: &ProtocolSpace, params: &PhysicalParams) -> OptResult<ProtocolSearchReport> {
        self.run_with(space, params, &mut |_| Ok(()))
    }

    /// Evaluate the whole space, handing every candidate to `sink` in space
    /// order.
    pub fn run_with(
        &self,
        space: &ProtocolSpace,
        params: &PhysicalParams,
        sink: &mut dyn FnMut(&ProtocolCandidate) -> OptResult<()>,
    ) -> OptResult<ProtocolSearchReport> {
        self.engine.validate()?;
        params.validate()?;

        let started = Instant::now();
        let sequences = space.step_sequences();
        info!(
            segments = space.segments(),
            max_dists = space.max_dists(),
            protocols = sequences.len(),
            "starting protocol search"
        );

        let evaluated: Vec<ProtocolCandidate> = if self.parallel {
            sequences
                .par_iter()
                .enumerate()
                .map(|(i, steps)| self.evaluate(space, params, i, steps))
                .collect::<OptResult<_>>()?
        } else {
            sequences
                .iter()
                .enumerate()
                .map(|(i, steps)| self.evaluate(space, params, i, steps))
                .collect::<OptResult<_>>()?
        };
        for candidate in &evaluated {
            debug!(
                candidate = candidate.index,
                steps = %candidate.steps.join(","),
                score = candidate.score,
                status = ?candidate.status,
                "protocol evaluated"
            );
            sink(candidate)?;
        }

        let report = ProtocolSearchReport {
            candidates: evaluated,
            elapsed: started.elapsed(),
        };
        match report.best() {
            Some(best) => info!(
                protocols = report.candidates.len(),
                best = %best.steps.join(","),
                score = best.score,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "protocol search finished"
            ),
            None => warn!(protocols = report.candidates.len(), "no feasible protocol found"),
        }
        Ok(report)
    }
}
