//! Protocol trees.
//!
//! A [`ProtocolSpec`] is an arena of [`Unit`]s addressed by [`NodeId`].
//! Children are always created before their parents, so ids are in
//! topological order and the last node is the root. A child may be shared by
//! several parents; `Swap { left: x, right: x }` combines two independent
//! copies of `x`.
//!
//! # Example
//!
//! ```rust
//! use qrep_sim::protocol::{Level, ProtocolSpec};
//!
//! // distill the elementary link once, then swap twice: a 5-node chain
//! let spec = ProtocolSpec::nested(&[Level::Distill, Level::Swap, Level::Swap]).unwrap();
//! assert_eq!(spec.len(), 4);
//! assert_eq!(spec.swap_levels(), 2);
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cutoff::CutoffRule;
use crate::error::{SimError, SimResult};
use crate::params::{check_coherence_time, check_probability, check_werner, joint_coherence_time};

/// Index of a unit in a [`ProtocolSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Arena index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Per-link overrides of the chain-wide generation parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Generation success probability of this link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub p_gen: Option<f64>,
    /// Initial Werner parameter of this link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w0: Option<f64>,
    /// Coherence time of the memories holding this link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t_coh: Option<f64>,
}

impl GenerationParams {
    /// Overrides for every field.
    pub fn new(p_gen: f64, w0: f64, t_coh: f64) -> Self {
        Self {
            p_gen: Some(p_gen),
            w0: Some(w0),
            t_coh: Some(t_coh),
        }
    }

    fn is_default(&self) -> bool {
        self.p_gen.is_none() && self.w0.is_none() && self.t_coh.is_none()
    }
}

/// One protocol step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    /// Elementary-link generation by repeated attempts.
    Generation(GenerationParams),
    /// Entanglement swap of two links.
    Swap { left: NodeId, right: NodeId },
    /// `rounds` successive distillation rounds.
    Distill {
        left: NodeId,
        right: NodeId,
        rounds: u32,
    },
    /// A cut-off applied to every attempt of `child`.
    Cutoff { child: NodeId, rule: CutoffRule },
}

impl Unit {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Generation(_) => "generation",
            Self::Swap { .. } => "swap",
            Self::Distill { .. } => "distill",
            Self::Cutoff { .. } => "cutoff",
        }
    }

    /// Direct children.
    pub fn children(&self) -> Vec<NodeId> {
        match *self {
            Self::Generation(_) => Vec::new(),
            Self::Swap { left, right } | Self::Distill { left, right, .. } => vec![left, right],
            Self::Cutoff { child, .. } => vec![child],
        }
    }
}

/// Level kinds of the symmetric nested encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Swap,
    Distill,
}

impl TryFrom<u8> for Level {
    type Error = SimError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Swap),
            1 => Ok(Self::Distill),
            other => Err(SimError::InvalidProtocol(format!(
                "level code must be 0 (swap) or 1 (distill), got {other}"
            ))),
        }
    }
}

/// Immutable protocol tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSpec {
    units: Vec<Unit>,
}

impl ProtocolSpec {
    /// Start building a tree node by node.
    pub fn builder() -> ProtocolBuilder {
        ProtocolBuilder::default()
    }

    /// Build from raw units and validate the structure.
    pub fn from_units(units: Vec<Unit>) -> SimResult<Self> {
        let spec = Self { units };
        spec.validate()?;
        Ok(spec)
    }

    /// Symmetric nesting: each level combines two copies of the level below.
    pub fn nested(levels: &[Level]) -> SimResult<Self> {
        let mut b = Self::builder();
        let mut top = b.generation();
        for level in levels {
            top = match level {
                Level::Swap => b.swap(top, top),
                Level::Distill => b.distill(top, top, 1),
            };
        }
        b.build()
    }

    /// Nesting from numeric level codes, 0 = swap and 1 = distill.
    pub fn nested_codes(codes: &[u8]) -> SimResult<Self> {
        let levels = codes
            .iter()
            .map(|&c| Level::try_from(c))
            .collect::<SimResult<Vec<_>>>()?;
        Self::nested(&levels)
    }

    /// Step encoding over `segments` elementary links.
    ///
    /// `sK` swaps live segment `K` with the next live segment to its right;
    /// `dK` distills live segment `K` with a copy of itself. Exactly one live
    /// segment must remain.
    pub fn from_steps<S: AsRef<str>>(segments: usize, steps: &[S]) -> SimResult<Self> {
        Self::from_steps_with(&vec![GenerationParams::default(); segments], steps)
    }

    /// Step encoding over one elementary link per entry of `links`.
    pub fn from_steps_with<S: AsRef<str>>(links: &[GenerationParams], steps: &[S]) -> SimResult<Self> {
        let segments = links.len();
        if segments == 0 {
            return Err(SimError::invalid("segments", "must be at least 1"));
        }
        let mut b = Self::builder();
        let mut live: Vec<Option<NodeId>> = links.iter().map(|g| Some(b.generation_with(*g))).collect();

        for step in steps {
            let step = step.as_ref();
            let (op, idx) = parse_step(step)?;
            let current = live
                .get(idx)
                .copied()
                .flatten()
                .ok_or_else(|| SimError::InvalidProtocol(format!("step '{step}': segment {idx} is not live")))?;
            match op {
                'd' => live[idx] = Some(b.distill(current, current, 1)),
                _ => {
                    let partner = (idx + 1..segments)
                        .find(|&j| live[j].is_some())
                        .ok_or_else(|| {
                            SimError::InvalidProtocol(format!(
                                "step '{step}': no live segment right of {idx}"
                            ))
                        })?;
                    let right = live[partner].take().ok_or_else(|| {
                        SimError::InvalidProtocol(format!("step '{step}': segment {partner} vanished"))
                    })?;
                    live[idx] = Some(b.swap(current, right));
                }
            }
        }

        let remaining = live.iter().filter(|s| s.is_some()).count();
        if remaining != 1 {
            return Err(SimError::InvalidProtocol(format!(
                "steps leave {remaining} live segments, expected exactly 1"
            )));
        }
        b.build()
    }

    /// Balanced swap tree over `nodes - 1` segments with `distill_rounds`
    /// distillation rounds on every elementary link.
    ///
    /// Identical sub-chains share one node.
    pub fn swap_chain(nodes: usize, distill_rounds: u32) -> SimResult<Self> {
        if nodes < 2 {
            return Err(SimError::invalid("nodes", format!("must be at least 2, got {nodes}")));
        }
        let mut b = Self::builder();
        let mut link = b.generation();
        if distill_rounds > 0 {
            link = b.distill(link, link, distill_rounds);
        }
        let mut built: HashMap<usize, NodeId> = HashMap::new();
        built.insert(1, link);
        let root = build_segments(&mut b, &mut built, nodes - 1);
        debug_assert_eq!(b.last(), Some(root));
        b.build()
    }

    /// Balanced swap tree over one elementary link per entry of `links`,
    /// with `distill_rounds` distillation rounds on every elementary link.
    ///
    /// Splits the segments exactly like [`ProtocolSpec::swap_chain`], but
    /// nothing is shared, since every link may differ.
    pub fn swap_chain_with(links: &[GenerationParams], distill_rounds: u32) -> SimResult<Self> {
        if links.is_empty() {
            return Err(SimError::invalid("nodes", "must be at least 2, got 1"));
        }
        let mut b = Self::builder();
        let leaves: Vec<NodeId> = links
            .iter()
            .map(|g| {
                let link = b.generation_with(*g);
                if distill_rounds > 0 {
                    b.distill(link, link, distill_rounds)
                } else {
                    link
                }
            })
            .collect();
        build_links(&mut b, &leaves);
        b.build()
    }

    /// The root node (last in the arena).
    pub fn root(&self) -> NodeId {
        NodeId(self.units.len().saturating_sub(1) as u32)
    }

    /// Unit stored at `id`.
    pub fn unit(&self, id: NodeId) -> Option<&Unit> {
        self.units.get(id.index())
    }

    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Nodes in arena order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Unit)> {
        self.units
            .iter()
            .enumerate()
            .map(|(i, u)| (NodeId(i as u32), u))
    }

    /// Structural checks: non-empty, children before parents, cut-offs only
    /// over swap, distill or generation nodes, at least one distill round,
    /// valid per-link overrides and cut-off rules.
    pub fn validate(&self) -> SimResult<()> {
        if self.units.is_empty() {
            return Err(SimError::InvalidProtocol("protocol has no units".into()));
        }
        for (id, unit) in self.iter() {
            for child in unit.children() {
                if child >= id {
                    return Err(SimError::InvalidProtocol(format!(
                        "{id} ({}) refers to {child}, which is not an earlier node",
                        unit.kind()
                    )));
                }
            }
            match unit {
                Unit::Generation(g) => {
                    if let Some(p) = g.p_gen {
                        check_probability("p_gen", p)?;
                    }
                    if let Some(w) = g.w0 {
                        check_werner("w0", w)?;
                    }
                    if let Some(t) = g.t_coh {
                        check_coherence_time("t_coh", t)?;
                    }
                }
                Unit::Distill { rounds: 0, .. } => {
                    return Err(SimError::invalid("rounds", format!("{id}: distillation needs at least 1 round")));
                }
                Unit::Cutoff { child, rule } => {
                    rule.validate()?;
                    if let Some(Unit::Cutoff { .. }) = self.unit(*child) {
                        return Err(SimError::InvalidProtocol(format!(
                            "{id}: cut-off directly over cut-off {child}"
                        )));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Nodes whose distributions the engine has to compute, in ascending order.
    ///
    /// A swap or distill node that is only reached through a cut-off wrapper
    /// is folded into that wrapper and does not appear.
    pub fn evaluation_order(&self) -> Vec<NodeId> {
        let mut needed = vec![false; self.units.len()];
        if let Some(last) = needed.last_mut() {
            *last = true;
        }
        for idx in (0..self.units.len()).rev() {
            if needed[idx] {
                for dep in self.operands(NodeId(idx as u32)) {
                    needed[dep.index()] = true;
                }
            }
        }
        needed
            .iter()
            .enumerate()
            .filter(|(_, n)| **n)
            .map(|(i, _)| NodeId(i as u32))
            .collect()
    }

    /// Inputs consumed when evaluating `id`.
    ///
    /// For a cut-off over a swap or distill node these are the grandchildren.
    pub fn operands(&self, id: NodeId) -> Vec<NodeId> {
        match self.unit(id) {
            Some(Unit::Cutoff { child, .. }) => match self.unit(*child) {
                Some(inner @ (Unit::Swap { .. } | Unit::Distill { .. })) => inner.children(),
                _ => vec![*child],
            },
            Some(unit) => unit.children(),
            None => Vec::new(),
        }
    }

    /// Nodes whose behavior a cut-off policy can change, in ascending order.
    pub fn tunable_nodes(&self) -> Vec<NodeId> {
        self.evaluation_order()
            .into_iter()
            .filter(|&id| match self.unit(id) {
                Some(Unit::Swap { .. } | Unit::Distill { .. }) => true,
                Some(Unit::Cutoff { child, .. }) => {
                    matches!(self.unit(*child), Some(Unit::Swap { .. } | Unit::Distill { .. }))
                }
                _ => false,
            })
            .collect()
    }

    /// Height of every node: 0 for leaves, 1 + max child height otherwise.
    ///
    /// A cut-off wrapper has the height of its child.
    pub fn heights(&self) -> Vec<usize> {
        let mut h = vec![0usize; self.units.len()];
        for (id, unit) in self.iter() {
            h[id.index()] = match unit {
                Unit::Generation(_) => 0,
                Unit::Cutoff { child, .. } => h[child.index()],
                other => 1 + other.children().iter().map(|c| h[c.index()]).max().unwrap_or(0),
            };
        }
        h
    }

    /// Coherence time of the pair every node delivers.
    ///
    /// Elementary links use their own override or `default`. A swap or
    /// distillation delivers a pair whose halves sit where the outer halves
    /// of its inputs sat, see [`joint_coherence_time`]. A cut-off wrapper
    /// inherits from its child.
    pub fn coherence_times(&self, default: f64) -> Vec<f64> {
        let mut t = vec![default; self.units.len()];
        for (id, unit) in self.iter() {
            t[id.index()] = match *unit {
                Unit::Generation(g) => g.t_coh.unwrap_or(default),
                Unit::Swap { left, right } | Unit::Distill { left, right, .. } => {
                    joint_coherence_time(t[left.index()], t[right.index()])
                }
                Unit::Cutoff { child, .. } => t[child.index()],
            };
        }
        t
    }

    /// Largest number of swap nodes on a root-to-leaf path.
    pub fn swap_levels(&self) -> usize {
        self.count_levels(|u| usize::from(matches!(u, Unit::Swap { .. })))
    }

    /// Largest number of distillation rounds on a root-to-leaf path.
    pub fn distill_levels(&self) -> usize {
        self.count_levels(|u| match u {
            Unit::Distill { rounds, .. } => *rounds as usize,
            _ => 0,
        })
    }

    fn count_levels(&self, weight: impl Fn(&Unit) -> usize) -> usize {
        let mut depth = vec![0usize; self.units.len()];
        for (id, unit) in self.iter() {
            let below = unit.children().iter().map(|c| depth[c.index()]).max().unwrap_or(0);
            depth[id.index()] = below + weight(unit);
        }
        depth.last().copied().unwrap_or(0)
    }

    fn fmt_node(&self, id: NodeId, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit(id) {
            Some(Unit::Generation(g)) if g.is_default() => write!(f, "gen"),
            Some(Unit::Generation(g)) => {
                let fields: Vec<String> = [
                    g.p_gen.map(|p| format!("p={p}")),
                    g.w0.map(|w| format!("w0={w}")),
                    g.t_coh.map(|t| format!("t_coh={t}")),
                ]
                .into_iter()
                .flatten()
                .collect();
                write!(f, "gen({})", fields.join(", "))
            }
            Some(Unit::Swap { left, right }) => {
                write!(f, "swap(")?;
                self.fmt_node(*left, f)?;
                write!(f, ", ")?;
                self.fmt_node(*right, f)?;
                write!(f, ")")
            }
            Some(Unit::Distill { left, right, rounds }) => {
                write!(f, "distill{}(", if *rounds > 1 { format!("^{rounds}") } else { String::new() })?;
                self.fmt_node(*left, f)?;
                write!(f, ", ")?;
                self.fmt_node(*right, f)?;
                write!(f, ")")
            }
            Some(Unit::Cutoff { child, rule }) => {
                write!(f, "cutoff[{rule:?}](")?;
                self.fmt_node(*child, f)?;
                write!(f, ")")
            }
            None => write!(f, "?{id}"),
        }
    }
}

impl fmt::Display for ProtocolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.units.is_empty() {
            return write!(f, "<empty>");
        }
        self.fmt_node(self.root(), f)
    }
}

/// Incremental tree construction; every method returns the new node's id.
#[derive(Debug, Clone, Default)]
pub struct ProtocolBuilder {
    units: Vec<Unit>,
}

impl ProtocolBuilder {
    fn push(&mut self, unit: Unit) -> NodeId {
        self.units.push(unit);
        NodeId((self.units.len() - 1) as u32)
    }

    /// Elementary link with the chain-wide parameters.
    pub fn generation(&mut self) -> NodeId {
        self.push(Unit::Generation(GenerationParams::default()))
    }

    /// Elementary link with its own parameters.
    pub fn generation_with(&mut self, params: GenerationParams) -> NodeId {
        self.push(Unit::Generation(params))
    }

    pub fn swap(&mut self, left: NodeId, right: NodeId) -> NodeId {
        self.push(Unit::Swap { left, right })
    }

    pub fn distill(&mut self, left: NodeId, right: NodeId, rounds: u32) -> NodeId {
        self.push(Unit::Distill { left, right, rounds })
    }

    pub fn cutoff(&mut self, child: NodeId, rule: CutoffRule) -> NodeId {
        self.push(Unit::Cutoff { child, rule })
    }

    /// Most recently added node.
    pub fn last(&self) -> Option<NodeId> {
        self.units.len().checked_sub(1).map(|i| NodeId(i as u32))
    }

    /// Finish; the last node becomes the root.
    pub fn build(self) -> SimResult<ProtocolSpec> {
        ProtocolSpec::from_units(self.units)
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn build_segments(b: &mut ProtocolBuilder, built: &mut HashMap<usize, NodeId>, segments: usize) -> NodeId {
    if let Some(&id) = built.get(&segments) {
        return id;
    }
    let half = segments / 2;
    let left = build_segments(b, built, half);
    let right = build_segments(b, built, segments - half);
    let id = b.swap(left, right);
    built.insert(segments, id);
    id
}

fn build_links(b: &mut ProtocolBuilder, links: &[NodeId]) -> NodeId {
    if let [link] = links {
        return *link;
    }
    let (left, right) = links.split_at(links.len() / 2);
    let left = build_links(b, left);
    let right = build_links(b, right);
    b.swap(left, right)
}

fn parse_step(step: &str) -> SimResult<(char, usize)> {
    let mut chars = step.chars();
    let op = chars.next().map(|c| c.to_ascii_lowercase());
    let idx = chars.as_str().parse::<usize>().ok();
    match (op, idx) {
        (Some(op @ ('s' | 'd')), Some(idx)) => Ok((op, idx)),
        _ => Err(SimError::InvalidProtocol(format!(
            "step '{step}' must be s<segment> or d<segment>"
        ))),
    }
}
