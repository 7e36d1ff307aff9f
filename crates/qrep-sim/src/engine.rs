//! Bottom-up evaluation of protocol trees.
//!
//! The engine walks the arena in ascending id order, which is a valid
//! post-order because children always precede their parents. Results are
//! memoized per node for the duration of one call, so a sub-tree shared by
//! id is computed once.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::convolution::{BackendKind, Convolver, CrossCheckConvolver, NumericalDivergence};
use crate::cutoff::{CutoffPolicy, CutoffRule};
use crate::distribution::{WaitingTimeDistribution, check_truncation};
use crate::error::{SimError, SimResult};
use crate::params::PhysicalParams;
use crate::protocol::{NodeId, ProtocolSpec, Unit};
use crate::units::{self, UnitContext};

/// What to do when the root loses more mass than tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationMode {
    /// Fail with [`SimError::Truncation`].
    #[default]
    Error,
    /// Return the result and log the loss.
    Report,
}

/// Immutable engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of time bins `T`.
    pub truncation: usize,
    /// Convolution backend.
    #[serde(default)]
    pub backend: BackendKind,
    /// Reference backend to cross-check every primitive against.
    #[serde(default)]
    pub cross_check: Option<BackendKind>,
    /// Relative tolerance of the cross-check.
    #[serde(default = "default_divergence_tolerance")]
    pub divergence_tolerance: f64,
    /// Largest acceptable lost mass at the root.
    #[serde(default = "default_truncation_tolerance")]
    pub truncation_tolerance: f64,
    #[serde(default)]
    pub truncation_mode: TruncationMode,
    /// Upper bound for [`Engine::evaluate_adaptive`].
    #[serde(default = "default_max_truncation")]
    pub max_truncation: usize,
}

fn default_divergence_tolerance() -> f64 {
    1e-9
}

fn default_truncation_tolerance() -> f64 {
    0.01
}

fn default_max_truncation() -> usize {
    1 << 16
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EngineConfig {
    /// Defaults with the given horizon.
    pub fn new(truncation: usize) -> Self {
        Self {
            truncation,
            backend: BackendKind::default(),
            cross_check: None,
            divergence_tolerance: default_divergence_tolerance(),
            truncation_tolerance: default_truncation_tolerance(),
            truncation_mode: TruncationMode::default(),
            max_truncation: default_max_truncation(),
        }
    }

    #[must_use]
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Cross-check every primitive of the main backend against `reference`.
    #[must_use]
    pub fn with_cross_check(mut self, reference: BackendKind) -> Self {
        self.cross_check = Some(reference);
        self
    }

    #[must_use]
    pub fn with_truncation_mode(mut self, mode: TruncationMode) -> Self {
        self.truncation_mode = mode;
        self
    }

    #[must_use]
    pub fn with_truncation_tolerance(mut self, tolerance: f64) -> Self {
        self.truncation_tolerance = tolerance;
        self
    }

    #[must_use]
    pub fn with_max_truncation(mut self, max: usize) -> Self {
        self.max_truncation = max;
        self
    }

    pub fn validate(&self) -> SimResult<()> {
        check_truncation(self.truncation)?;
        if !(0.0..1.0).contains(&self.truncation_tolerance) {
            return Err(SimError::invalid(
                "truncation_tolerance",
                format!("must be in [0, 1), got {}", self.truncation_tolerance),
            ));
        }
        if self.divergence_tolerance.is_nan() || self.divergence_tolerance < 0.0 {
            return Err(SimError::invalid(
                "divergence_tolerance",
                format!("must be non-negative, got {}", self.divergence_tolerance),
            ));
        }
        if self.max_truncation < self.truncation {
            return Err(SimError::invalid(
                "max_truncation",
                format!(
                    "must be at least the truncation {}, got {}",
                    self.truncation, self.max_truncation
                ),
            ));
        }
        Ok(())
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone)]
pub struct Evaluation {
    root_id: NodeId,
    root: WaitingTimeDistribution,
    nodes: Vec<Option<WaitingTimeDistribution>>,
    /// Backend disagreements, tagged with the node being evaluated.
    pub warnings: Vec<NumericalDivergence>,
    /// Horizon actually used.
    pub truncation: usize,
    /// Wall-clock time of the evaluation.
    pub elapsed: Duration,
}

impl Evaluation {
    /// Distribution of the delivered end-to-end pair.
    pub fn root(&self) -> &WaitingTimeDistribution {
        &self.root
    }

    /// Take ownership of the root distribution.
    pub fn into_root(self) -> WaitingTimeDistribution {
        self.root
    }

    /// Distribution of an intermediate node, if it was computed.
    ///
    /// Nodes folded into a cut-off wrapper have no distribution of their own.
    pub fn node(&self, id: NodeId) -> Option<&WaitingTimeDistribution> {
        if id == self.root_id {
            return Some(&self.root);
        }
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    /// Mass beyond the horizon at the root.
    pub fn lost_mass(&self) -> f64 {
        self.root().lost_mass()
    }
}

/// Evaluates protocol trees with one immutable configuration.
pub struct Engine {
    config: EngineConfig,
    convolver: Box<dyn Convolver>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("convolver", &self.convolver.name())
            .finish()
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let convolver: Box<dyn Convolver> = match config.cross_check {
            Some(reference) => Box::new(CrossCheckConvolver::new(
                config.backend.build(),
                reference.build(),
                config.divergence_tolerance,
            )),
            None => config.backend.build(),
        };
        Self { config, convolver }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Evaluate `spec` under `policy`.
    ///
    /// All inputs are validated before any computation starts.
    pub fn evaluate(
        &self,
        spec: &ProtocolSpec,
        policy: &CutoffPolicy,
        params: &PhysicalParams,
    ) -> SimResult<Evaluation> {
        self.evaluate_with(spec, policy, params, self.config.truncation, self.config.truncation_mode)
    }

    /// Evaluate, doubling the horizon until the lost mass is within tolerance
    /// or `max_truncation` is reached.
    pub fn evaluate_adaptive(
        &self,
        spec: &ProtocolSpec,
        policy: &CutoffPolicy,
        params: &PhysicalParams,
    ) -> SimResult<Evaluation> {
        let mut truncation = self.config.truncation;
        loop {
            match self.evaluate_with(spec, policy, params, truncation, TruncationMode::Error) {
                Err(e @ SimError::Truncation { .. }) => {
                    if truncation >= self.config.max_truncation {
                        return Err(e);
                    }
                    let next = (truncation * 2).min(self.config.max_truncation);
                    debug!(from = truncation, to = next, "growing truncation horizon");
                    truncation = next;
                }
                other => return other,
            }
        }
    }

    fn evaluate_with(
        &self,
        spec: &ProtocolSpec,
        policy: &CutoffPolicy,
        params: &PhysicalParams,
        truncation: usize,
        mode: TruncationMode,
    ) -> SimResult<Evaluation> {
        self.config.validate()?;
        check_truncation(truncation)?;
        params.validate()?;
        spec.validate()?;
        policy.validate()?;
        for (id, _) in policy.iter() {
            if spec.unit(id).is_none() {
                return Err(SimError::InvalidProtocol(format!(
                    "cut-off policy refers to {id}, which is not in the protocol"
                )));
            }
        }

        let started = Instant::now();
        let ctx = UnitContext::new(self.convolver.as_ref(), params.t_coh);
        let coherence = spec.coherence_times(params.t_coh);
        let mut nodes: Vec<Option<WaitingTimeDistribution>> = vec![None; spec.len()];
        let mut warnings = Vec::new();
        // Discard anything left over from an earlier call.
        self.convolver.drain_divergences();

        for id in spec.evaluation_order() {
            let node_started = Instant::now();
            let dist = evaluate_node(ctx, spec, policy, params, truncation, id, &nodes, &coherence)?;
            let divergences = self.convolver.drain_divergences();
            if !divergences.is_empty() {
                warn!(node = %id, count = divergences.len(), "numerical divergence while evaluating node");
            }
            warnings.extend(divergences.into_iter().map(|mut d| {
                d.node = Some(id);
                d
            }));
            debug!(
                node = %id,
                kind = spec.unit(id).map_or("?", Unit::kind),
                coverage = dist.coverage(),
                elapsed_us = node_started.elapsed().as_micros() as u64,
                "evaluated node"
            );
            nodes[id.index()] = Some(dist);
        }

        let root_id = spec.root();
        let root = nodes[root_id.index()]
            .take()
            .ok_or_else(|| SimError::InvalidProtocol(format!("root {root_id} was not evaluated")))?;
        let evaluation = Evaluation {
            root_id,
            root,
            nodes,
            warnings,
            truncation,
            elapsed: started.elapsed(),
        };

        let root = evaluation.root();
        let lost_mass = root.lost_mass();
        if lost_mass > self.config.truncation_tolerance {
            match mode {
                TruncationMode::Error => {
                    return Err(SimError::Truncation {
                        coverage: root.coverage(),
                        lost_mass,
                        tolerance: self.config.truncation_tolerance,
                        truncation,
                    });
                }
                TruncationMode::Report => warn!(
                    truncation,
                    lost_mass,
                    tolerance = self.config.truncation_tolerance,
                    "truncation horizon too short, distribution is incomplete"
                ),
            }
        }
        Ok(evaluation)
    }
}

/// Evaluate `spec` with default engine settings and horizon `truncation`.
pub fn evaluate_protocol(
    spec: &ProtocolSpec,
    policy: &CutoffPolicy,
    params: &PhysicalParams,
    truncation: usize,
) -> SimResult<WaitingTimeDistribution> {
    Ok(Engine::new(EngineConfig::new(truncation))
        .evaluate(spec, policy, params)?
        .into_root())
}

/// Heuristic horizon for a chain with the given nesting.
///
/// Starts from the mean generation time, grows it by the expected retry
/// factor of every swap and distillation level, and keeps a wide margin for
/// the tail.
pub fn suggest_truncation(params: &PhysicalParams, swap_levels: usize, distill_levels: usize) -> usize {
    let p_gen = params.p_gen.clamp(f64::MIN_POSITIVE, 1.0);
    let p_swap = params.p_swap.clamp(f64::MIN_POSITIVE, 1.0);
    let p_dist = units::distillation_success(params.w0, params.w0);

    let mut mean = 1.0 / p_gen;
    for _ in 0..distill_levels {
        mean *= 1.5 / p_dist;
    }
    for _ in 0..swap_levels {
        mean *= 1.5 / p_swap;
    }
    let suggested = (20.0 * mean).ceil();
    if suggested >= (1u64 << 24) as f64 {
        1 << 24
    } else {
        (suggested as usize).max(32)
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn evaluate_node(
    ctx: UnitContext<'_>,
    spec: &ProtocolSpec,
    policy: &CutoffPolicy,
    params: &PhysicalParams,
    truncation: usize,
    id: NodeId,
    nodes: &[Option<WaitingTimeDistribution>],
    coherence: &[f64],
) -> SimResult<WaitingTimeDistribution> {
    let unit = spec
        .unit(id)
        .ok_or_else(|| SimError::InvalidProtocol(format!("{id} is not in the protocol")))?;
    let input = |child: NodeId| {
        nodes[child.index()]
            .as_ref()
            .ok_or_else(|| SimError::InvalidProtocol(format!("{id} reached before its input {child}")))
    };
    let sides = |left: NodeId, right: NodeId| ctx.with_coherence(coherence[left.index()], coherence[right.index()]);
    let operator = |unit: &Unit, rule: Option<&CutoffRule>| -> SimResult<WaitingTimeDistribution> {
        match *unit {
            Unit::Swap { left, right } => Ok(units::swap(
                sides(left, right),
                input(left)?,
                input(right)?,
                params.p_swap,
                rule,
            )),
            Unit::Distill { left, right, rounds } => Ok(units::distill_rounds(
                sides(left, right),
                input(left)?,
                input(right)?,
                rounds,
                rule,
            )),
            Unit::Generation(g) => units::generation(
                g.p_gen.unwrap_or(params.p_gen),
                g.w0.unwrap_or(params.w0),
                truncation,
            ),
            Unit::Cutoff { .. } => Err(SimError::InvalidProtocol(format!("{id}: cut-off directly over cut-off"))),
        }
    };

    match unit {
        Unit::Cutoff { child, rule } => {
            let rule = policy.get(id).unwrap_or(rule);
            match spec.unit(*child) {
                // A fresh link has not aged, so the cut-off has nothing to do.
                Some(Unit::Generation(_)) => input(*child).cloned(),
                Some(inner) => operator(inner, Some(rule)),
                None => Err(SimError::InvalidProtocol(format!("{id} wraps missing node {child}"))),
            }
        }
        other => operator(other, policy.get(id)),
    }
}
