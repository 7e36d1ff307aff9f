//! Shared helpers for CLI commands.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Args;
use console::style;
use qrep_sim::{BackendKind, CutoffPolicy, CutoffRule, KeyRate};

use crate::config::{LinkValues, Overrides, Settings, parse_steps};

/// Chain and engine flags shared by `simulate` and `optimize`.
#[derive(Debug, Clone, Default, Args)]
pub struct ChainArgs {
    /// Number of nodes in the chain, end nodes included
    #[arg(long)]
    pub nodes: Option<usize>,

    /// Distillation rounds on every elementary link
    #[arg(long = "max_dists", alias = "max-dists")]
    pub max_dists: Option<u32>,

    /// Memory coherence time, in attempt slots (one value, or one per link)
    #[arg(long = "t_coh", alias = "t-coh")]
    pub t_coh: Option<LinkValues>,

    /// Elementary-link generation success probability (one value, or one per link)
    #[arg(long = "p_gen", alias = "p-gen")]
    pub p_gen: Option<LinkValues>,

    /// Swap success probability
    #[arg(long = "p_swap", alias = "p-swap")]
    pub p_swap: Option<f64>,

    /// Werner parameter of fresh links (one value, or one per link)
    #[arg(long)]
    pub w0: Option<LinkValues>,

    /// Protocol as swap and distill steps, e.g. "s1,s0" or "d0,s0"
    #[arg(long)]
    pub protocol: Option<String>,

    /// Truncation horizon (derived from the parameters if omitted)
    #[arg(short = 'T', long)]
    pub truncation: Option<usize>,

    /// Convolution backend (direct, fft, parallel)
    #[arg(long)]
    pub backend: Option<BackendKind>,

    /// YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl ChainArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            nodes: self.nodes,
            max_dists: self.max_dists,
            t_coh: self.t_coh.clone(),
            p_gen: self.p_gen.clone(),
            p_swap: self.p_swap,
            w0: self.w0.clone(),
            protocol_steps: self.protocol.as_deref().map(parse_steps),
            truncation: self.truncation,
            backend: self.backend,
        }
    }

    /// Resolve flags, environment and config file.
    pub fn settings(&self) -> Result<Settings> {
        Settings::load(self.config.as_deref(), &self.overrides(), |k| std::env::var(k).ok())
    }
}

/// Parse `kind:value`, e.g. `memory:12`, `fidelity:0.9`, `runtime:40`.
pub fn parse_cutoff(raw: &str) -> Result<CutoffRule> {
    let Some((kind, value)) = raw.split_once([':', '=']) else {
        bail!("Invalid cut-off '{raw}': expected kind:value, e.g. memory:10 or fidelity:0.9");
    };
    let value = value.trim();
    let rule = match kind.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "memory" | "memory_time" | "tau" => CutoffRule::MemoryTime(value.parse()?),
        "fidelity" | "werner" => CutoffRule::Fidelity(value.parse()?),
        "runtime" | "run_time" => CutoffRule::RunTime(value.parse()?),
        other => bail!("Unknown cut-off kind '{other}'. Available: memory, fidelity, runtime"),
    };
    rule.validate()?;
    Ok(rule)
}

/// Print the key-rate figures.
pub fn print_key_rate(k: &KeyRate) {
    println!("  Mean waiting time: {:.6}", k.mean_waiting_time);
    println!("  Mean Werner:       {:.6}", k.mean_werner);
    println!("  Mean fidelity:     {:.6}", k.mean_fidelity);
    println!("  Key fraction:      {:.6}", k.key_fraction);
    if k.feasible {
        println!("  Secret key rate:   {}", style(format!("{:.6e}", k.rate)).green().bold());
    } else {
        println!("  Secret key rate:   {}", style("0 (no key can be distilled)").red());
    }
}

/// Print a policy one node per line.
pub fn print_policy(policy: &CutoffPolicy) {
    if policy.is_empty() {
        println!("  (no cut-offs)");
    }
    for (node, rule) in policy.iter() {
        let text = match rule {
            CutoffRule::MemoryTime(t) => format!("memory time {t}"),
            CutoffRule::Fidelity(w) => format!("Werner >= {w}"),
            CutoffRule::RunTime(t) => format!("run time {t}"),
        };
        println!("  {:<6} {text}", style(node.to_string()).cyan());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cutoff() {
        assert_eq!(parse_cutoff("memory:12").unwrap(), CutoffRule::MemoryTime(12));
        assert_eq!(parse_cutoff("tau=3").unwrap(), CutoffRule::MemoryTime(3));
        assert_eq!(parse_cutoff("fidelity:0.9").unwrap(), CutoffRule::Fidelity(0.9));
        assert_eq!(parse_cutoff("run-time:40").unwrap(), CutoffRule::RunTime(40));
        assert!(parse_cutoff("memory").is_err());
        assert!(parse_cutoff("memory:-1").is_err());
        assert!(parse_cutoff("fidelity:1.5").is_err());
        assert!(parse_cutoff("age:3").is_err());
    }
}
