//! Cut-off rules and per-node cut-off policies.
//!
//! A cut-off decides, for one attempt of a swap or distillation, whether the
//! link that arrived first may keep waiting for its partner. When it may not,
//! the attempt is abandoned and both links are regenerated.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};
use crate::params::decay_factor;
use crate::protocol::NodeId;

/// When a stored link is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CutoffRule {
    /// The earlier link may wait at most this many steps.
    MemoryTime(u64),
    /// The earlier link is discarded once its decayed Werner parameter drops
    /// below this value.
    Fidelity(f64),
    /// The attempt is abandoned if both links are not ready by this step.
    RunTime(u64),
}

/// Outcome of one attempt under a cut-off rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Both links are in memory at `at`.
    Ready { at: u64 },
    /// The attempt was abandoned at `at`.
    Discarded { at: u64 },
}

impl CutoffRule {
    /// Range check.
    pub fn validate(&self) -> SimResult<()> {
        match *self {
            Self::MemoryTime(_) => Ok(()),
            Self::Fidelity(w) if w.is_finite() && (0.0..1.0).contains(&w) => Ok(()),
            Self::Fidelity(w) => Err(SimError::invalid(
                "cutoff",
                format!("Werner threshold must be in [0, 1), got {w}"),
            )),
            Self::RunTime(0) => Err(SimError::invalid("cutoff", "run-time cut-off must be at least 1")),
            Self::RunTime(_) => Ok(()),
        }
    }

    /// How long a link that arrived with Werner parameter `w_early` may wait.
    ///
    /// `None` means unlimited. Run-time rules do not limit waiting and also
    /// return `None`; they are handled on the whole attempt.
    pub fn window(&self, w_early: f64, t_coh: f64) -> Option<u64> {
        match *self {
            Self::MemoryTime(tau) => Some(tau),
            Self::Fidelity(w_cut) => {
                if w_early < w_cut {
                    Some(0)
                } else if t_coh.is_infinite() || w_cut <= 0.0 {
                    None
                } else {
                    // Saturating cast: a huge window is effectively unlimited.
                    Some((t_coh * (w_early / w_cut).ln()).floor() as u64)
                }
            }
            Self::RunTime(_) => None,
        }
    }

    /// Judge one attempt whose links arrived at `t1`, `t2` with Werner
    /// parameters `w1`, `w2`.
    pub fn judge(&self, t1: u64, w1: f64, t2: u64, w2: f64, t_coh: f64) -> AttemptOutcome {
        let ready = t1.max(t2);
        if let Self::RunTime(limit) = *self {
            return if ready <= limit {
                AttemptOutcome::Ready { at: ready }
            } else {
                AttemptOutcome::Discarded { at: limit }
            };
        }
        let (early, w_early) = if t1 <= t2 { (t1, w1) } else { (t2, w2) };
        match self.window(w_early, t_coh) {
            Some(win) if ready - early > win => AttemptOutcome::Discarded {
                at: early.saturating_add(win),
            },
            _ => AttemptOutcome::Ready { at: ready },
        }
    }

    /// Werner parameter of the earlier link after waiting `dt` steps.
    pub fn aged(w: f64, dt: u64, t_coh: f64) -> f64 {
        w * decay_factor(dt as usize, t_coh)
    }
}

/// Cut-off rules keyed by protocol node. Missing entries mean no cut-off.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<PolicyEntry>", into = "Vec<PolicyEntry>")]
pub struct CutoffPolicy {
    rules: BTreeMap<NodeId, CutoffRule>,
}

/// Serialized form of one policy entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub node: NodeId,
    pub rule: CutoffRule,
}

impl From<Vec<PolicyEntry>> for CutoffPolicy {
    fn from(entries: Vec<PolicyEntry>) -> Self {
        Self {
            rules: entries.into_iter().map(|e| (e.node, e.rule)).collect(),
        }
    }
}

impl From<CutoffPolicy> for Vec<PolicyEntry> {
    fn from(policy: CutoffPolicy) -> Self {
        policy
            .rules
            .into_iter()
            .map(|(node, rule)| PolicyEntry { node, rule })
            .collect()
    }
}

impl CutoffPolicy {
    /// A policy without cut-offs.
    pub fn new() -> Self {
        Self::default()
    }

    /// The same rule on every listed node.
    pub fn uniform(nodes: impl IntoIterator<Item = NodeId>, rule: CutoffRule) -> Self {
        Self {
            rules: nodes.into_iter().map(|n| (n, rule)).collect(),
        }
    }

    /// Add or replace the rule of `node`.
    #[must_use]
    pub fn with(mut self, node: NodeId, rule: CutoffRule) -> Self {
        self.insert(node, rule);
        self
    }

    /// Add or replace the rule of `node`.
    pub fn insert(&mut self, node: NodeId, rule: CutoffRule) {
        self.rules.insert(node, rule);
    }

    /// Rule of `node`, if any.
    pub fn get(&self, node: NodeId) -> Option<&CutoffRule> {
        self.rules.get(&node)
    }

    /// Entries in node order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &CutoffRule)> {
        self.rules.iter().map(|(n, r)| (*n, r))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Range-check every rule.
    pub fn validate(&self) -> SimResult<()> {
        self.rules.values().try_for_each(CutoffRule::validate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_window_discards_at_early_plus_tau() {
        let rule = CutoffRule::MemoryTime(3);
        assert_eq!(rule.judge(2, 0.9, 5, 0.9, 100.0), AttemptOutcome::Ready { at: 5 });
        assert_eq!(rule.judge(2, 0.9, 6, 0.9, 100.0), AttemptOutcome::Discarded { at: 5 });
        assert_eq!(rule.judge(7, 0.9, 1, 0.9, 100.0), AttemptOutcome::Discarded { at: 4 });
    }

    #[test]
    fn ties_always_pass() {
        let rule = CutoffRule::MemoryTime(0);
        assert_eq!(rule.judge(4, 0.9, 4, 0.9, 10.0), AttemptOutcome::Ready { at: 4 });
    }

    #[test]
    fn fidelity_window_follows_decay() {
        // w * exp(-Δ/t_coh) >= w_cut  <=>  Δ <= t_coh ln(w / w_cut)
        let rule = CutoffRule::Fidelity(0.8);
        let win = rule.window(0.9, 100.0).unwrap();
        assert_eq!(win, (100.0 * (0.9f64 / 0.8).ln()).floor() as u64);
        assert_eq!(rule.window(0.7, 100.0), Some(0));
        assert_eq!(rule.window(0.9, f64::INFINITY), None);
    }

    #[test]
    fn run_time_discards_at_limit() {
        let rule = CutoffRule::RunTime(5);
        assert_eq!(rule.judge(3, 0.9, 5, 0.9, 10.0), AttemptOutcome::Ready { at: 5 });
        assert_eq!(rule.judge(3, 0.9, 9, 0.9, 10.0), AttemptOutcome::Discarded { at: 5 });
    }

    #[test]
    fn validation() {
        assert!(CutoffRule::RunTime(0).validate().is_err());
        assert!(CutoffRule::Fidelity(1.0).validate().is_err());
        assert!(CutoffRule::Fidelity(f64::NAN).validate().is_err());
        assert!(CutoffRule::MemoryTime(0).validate().is_ok());
    }

    #[test]
    fn policy_serializes_as_entry_list() {
        let policy = CutoffPolicy::new()
            .with(NodeId(2), CutoffRule::MemoryTime(7))
            .with(NodeId(1), CutoffRule::Fidelity(0.5));
        let json = serde_json::to_string(&policy).unwrap();
        assert_eq!(
            json,
            r#"[{"node":1,"rule":{"kind":"fidelity","value":0.5}},{"node":2,"rule":{"kind":"memory_time","value":7}}]"#
        );
        let back: CutoffPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, policy);
    }
}
