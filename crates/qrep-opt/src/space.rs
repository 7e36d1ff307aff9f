//! Search spaces over cut-off policies.
//!
//! A point of the space assigns one number to every dimension. Each
//! dimension drives the cut-off rule of a group of protocol nodes, so a
//! symmetric chain can be tuned with one value per nesting level.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use qrep_sim::{CutoffPolicy, CutoffRule, NodeId, ProtocolSpec};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{OptError, OptResult};

/// Which cut-off rule a dimension controls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoffKind {
    MemoryTime,
    Fidelity,
    RunTime,
}

impl CutoffKind {
    /// Integer-valued kinds are rounded when a point is snapped.
    pub fn is_integer(self) -> bool {
        matches!(self, Self::MemoryTime | Self::RunTime)
    }

    /// The rule this kind produces for a coordinate value.
    pub fn rule(self, value: f64) -> CutoffRule {
        match self {
            Self::MemoryTime => CutoffRule::MemoryTime(value.round().max(0.0) as u64),
            Self::Fidelity => CutoffRule::Fidelity(value),
            Self::RunTime => CutoffRule::RunTime(value.round().max(0.0) as u64),
        }
    }
}

impl fmt::Display for CutoffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryTime => write!(f, "memory_time"),
            Self::Fidelity => write!(f, "fidelity"),
            Self::RunTime => write!(f, "run_time"),
        }
    }
}

impl std::str::FromStr for CutoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "memory_time" | "memory" | "tau" => Ok(Self::MemoryTime),
            "fidelity" | "werner" => Ok(Self::Fidelity),
            "run_time" | "runtime" => Ok(Self::RunTime),
            other => Err(format!(
                "unknown cut-off kind '{other}' (expected memory_time, fidelity or run_time)"
            )),
        }
    }
}

/// One coordinate of the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    /// Nodes that receive this dimension's rule.
    pub nodes: Vec<NodeId>,
    pub kind: CutoffKind,
    pub lower: f64,
    pub upper: f64,
}

impl Dimension {
    pub fn new(name: impl Into<String>, nodes: Vec<NodeId>, kind: CutoffKind, lower: f64, upper: f64) -> Self {
        Self {
            name: name.into(),
            nodes,
            kind,
            lower,
            upper,
        }
    }

    fn validate(&self) -> OptResult<()> {
        let fail = |reason: String| {
            Err(OptError::InvalidBounds {
                dimension: self.name.clone(),
                reason,
            })
        };
        if !self.lower.is_finite() || !self.upper.is_finite() {
            return fail(format!("bounds must be finite, got [{}, {}]", self.lower, self.upper));
        }
        if self.lower > self.upper {
            return fail(format!("lower bound {} exceeds upper bound {}", self.lower, self.upper));
        }
        if self.nodes.is_empty() {
            return fail("controls no node".into());
        }
        match self.kind {
            CutoffKind::Fidelity if self.lower < 0.0 || self.upper >= 1.0 => {
                fail(format!("Werner cut-offs must lie in [0, 1), got [{}, {}]", self.lower, self.upper))
            }
            CutoffKind::MemoryTime | CutoffKind::RunTime if self.lower < 0.0 => {
                fail(format!("time cut-offs must be non-negative, got {}", self.lower))
            }
            _ => Ok(()),
        }
    }

    /// Clamp into bounds and round integer kinds.
    fn snap(&self, value: f64) -> f64 {
        let v = value.clamp(self.lower, self.upper);
        if self.kind.is_integer() {
            v.round().clamp(self.lower.ceil(), self.upper.floor().max(self.lower.ceil()))
        } else {
            v
        }
    }

    /// `steps` evenly spaced values, deduplicated after snapping.
    fn grid_values(&self, steps: usize) -> Vec<f64> {
        let steps = steps.max(1);
        let mut values = Vec::with_capacity(steps);
        for i in 0..steps {
            let raw = if steps == 1 {
                self.lower
            } else if i == steps - 1 {
                self.upper
            } else {
                self.lower + (self.upper - self.lower) * i as f64 / (steps - 1) as f64
            };
            let v = self.snap(raw);
            if values.last() != Some(&v) {
                values.push(v);
            }
        }
        values
    }
}

/// The set of candidate policies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Dimension>", into = "Vec<Dimension>")]
pub struct SearchSpace {
    dimensions: Vec<Dimension>,
}

impl SearchSpace {
    /// Build a space, checking bounds and that no node is claimed twice.
    pub fn new(dimensions: Vec<Dimension>) -> OptResult<Self> {
        if dimensions.is_empty() {
            return Err(OptError::EmptySearchSpace);
        }
        let mut claimed = HashSet::new();
        for dim in &dimensions {
            dim.validate()?;
            for node in &dim.nodes {
                if !claimed.insert(*node) {
                    return Err(OptError::InvalidBounds {
                        dimension: dim.name.clone(),
                        reason: format!("node {node} already belongs to another dimension"),
                    });
                }
            }
        }
        Ok(Self { dimensions })
    }

    /// One dimension per tree height: every tunable node at the same nesting
    /// level shares one cut-off value.
    pub fn per_level(spec: &ProtocolSpec, kind: CutoffKind, lower: f64, upper: f64) -> OptResult<Self> {
        let heights = spec.heights();
        let mut levels: BTreeMap<usize, Vec<NodeId>> = BTreeMap::new();
        for node in spec.tunable_nodes() {
            levels.entry(heights[node.index()]).or_default().push(node);
        }
        Self::new(
            levels
                .into_iter()
                .map(|(h, nodes)| Dimension::new(format!("level{h}"), nodes, kind, lower, upper))
                .collect(),
        )
    }

    /// One dimension per tunable node.
    pub fn per_node(spec: &ProtocolSpec, kind: CutoffKind, lower: f64, upper: f64) -> OptResult<Self> {
        Self::new(
            spec.tunable_nodes()
                .into_iter()
                .map(|node| Dimension::new(node.to_string(), vec![node], kind, lower, upper))
                .collect(),
        )
    }

    pub fn dimensions(&self) -> &[Dimension] {
        &self.dimensions
    }

    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// The cut-off policy a point stands for.
    pub fn policy(&self, point: &[f64]) -> CutoffPolicy {
        let mut policy = CutoffPolicy::new();
        for (dim, &value) in self.dimensions.iter().zip(point) {
            let rule = dim.kind.rule(dim.snap(value));
            for &node in &dim.nodes {
                policy.insert(node, rule);
            }
        }
        policy
    }

    /// Clamp every coordinate into bounds and round integer dimensions.
    pub fn snap(&self, point: &[f64]) -> Vec<f64> {
        self.dimensions.iter().zip(point).map(|(d, &v)| d.snap(v)).collect()
    }

    /// Map a point into the unit cube.
    pub fn normalize(&self, point: &[f64]) -> Vec<f64> {
        self.dimensions
            .iter()
            .zip(point)
            .map(|(d, &v)| {
                let width = d.upper - d.lower;
                if width > 0.0 { (v - d.lower) / width } else { 0.0 }
            })
            .collect()
    }

    /// Map a unit-cube point back into the space, snapped.
    pub fn denormalize(&self, unit: &[f64]) -> Vec<f64> {
        self.dimensions
            .iter()
            .zip(unit)
            .map(|(d, &u)| d.snap(d.lower + u * (d.upper - d.lower)))
            .collect()
    }

    /// A uniformly random point, snapped.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<f64> {
        let unit: Vec<f64> = (0..self.dimensions.len()).map(|_| rng.r#gen::<f64>()).collect();
        self.denormalize(&unit)
    }

    /// Cartesian grid with `steps` values per dimension, first dimension
    /// varying slowest.
    pub fn grid(&self, steps: usize) -> Vec<Vec<f64>> {
        let axes: Vec<Vec<f64>> = self.dimensions.iter().map(|d| d.grid_values(steps)).collect();
        let mut points: Vec<Vec<f64>> = vec![Vec::with_capacity(axes.len())];
        for axis in &axes {
            points = points
                .into_iter()
                .flat_map(|prefix| {
                    axis.iter().map(move |&v| {
                        let mut p = prefix.clone();
                        p.push(v);
                        p
                    })
                })
                .collect();
        }
        points
    }
}

impl TryFrom<Vec<Dimension>> for SearchSpace {
    type Error = OptError;

    fn try_from(dimensions: Vec<Dimension>) -> OptResult<Self> {
        Self::new(dimensions)
    }
}

impl From<SearchSpace> for Vec<Dimension> {
    fn from(space: SearchSpace) -> Self {
        space.dimensions
    }
}
