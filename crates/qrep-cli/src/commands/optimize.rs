//! Optimize command implementation.

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Args;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use qrep_opt::{
    CutoffKind, OptimizationStatus, Optimizer, OptimizerConfig, ProtocolCandidate, ProtocolSearch, ProtocolSpace,
    RunHeader, SearchSpace, StrategyKind, TrialLog,
};
use qrep_sim::ScoringParams;
use serde::Serialize;

use super::common::{ChainArgs, print_key_rate, print_policy};
use crate::config::Settings;
use crate::report::{self, ExportConfig};

/// What `optimize` searches over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchTarget {
    /// Cut-off values on a fixed protocol.
    #[default]
    Cutoffs,
    /// Every swap and distillation structure, without cut-offs.
    Protocols,
}

impl fmt::Display for SearchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cutoffs => write!(f, "cutoffs"),
            Self::Protocols => write!(f, "protocols"),
        }
    }
}

impl std::str::FromStr for SearchTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "cutoffs" | "cutoff" | "policy" => Ok(Self::Cutoffs),
            "protocols" | "protocol" | "structure" => Ok(Self::Protocols),
            other => Err(format!("unknown search target '{other}' (expected cutoffs or protocols)")),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct OptimizeArgs {
    #[command(flatten)]
    pub chain: ChainArgs,

    /// What to search: cut-offs on the chain, or protocol structures with
    /// up to max_dists distillations per swap input
    #[arg(long, default_value = "cutoffs")]
    pub search: SearchTarget,

    /// Search strategy (grid, random, gp)
    #[arg(long, default_value = "gp")]
    pub optimizer: StrategyKind,

    /// Maximum number of trials
    #[arg(short = 'n', long, default_value = "50")]
    pub trials: usize,

    /// Seed for random and surrogate-guided proposals
    #[arg(short, long, default_value = "0")]
    pub seed: u64,

    /// Cut-off kind to tune (memory_time, fidelity, run_time)
    #[arg(long, default_value = "memory_time")]
    pub cutoff_kind: CutoffKind,

    /// Lower bound of every cut-off dimension
    #[arg(long)]
    pub min_cutoff: Option<f64>,

    /// Upper bound of every cut-off dimension
    #[arg(long)]
    pub max_cutoff: Option<f64>,

    /// Values per dimension for grid search
    #[arg(long, default_value = "8")]
    pub grid_steps: usize,

    /// Wall-clock budget in seconds
    #[arg(long)]
    pub time_budget: Option<f64>,

    /// Evaluate trials one at a time
    #[arg(long)]
    pub sequential: bool,

    /// Trial log (JSON lines), or the ranked protocols (JSON) with
    /// --search protocols
    #[arg(short, long)]
    pub filename: Option<PathBuf>,
}

/// Default search bounds per cut-off kind.
fn default_bounds(kind: CutoffKind) -> (f64, f64) {
    match kind {
        CutoffKind::MemoryTime => (0.0, 50.0),
        CutoffKind::RunTime => (1.0, 200.0),
        CutoffKind::Fidelity => (0.5, 0.99),
    }
}

/// Execute the optimize command.
pub fn execute(args: &OptimizeArgs) -> Result<()> {
    let settings = args.chain.settings()?;
    match args.search {
        SearchTarget::Cutoffs => optimize_cutoffs(args, &settings),
        SearchTarget::Protocols => search_protocols(args, &settings),
    }
}

fn optimize_cutoffs(args: &OptimizeArgs, settings: &Settings) -> Result<()> {
    let spec = settings.protocol()?;
    let params = settings.physical();

    let (lower, upper) = default_bounds(args.cutoff_kind);
    let lower = args.min_cutoff.unwrap_or(lower);
    let upper = args.max_cutoff.unwrap_or(upper);
    let space = SearchSpace::per_level(&spec, args.cutoff_kind, lower, upper)?;
    if space.is_empty() {
        bail!("A chain of {} nodes has no swap or distillation to tune", settings.nodes);
    }

    let truncation = settings.truncation_for(&spec);
    let engine = settings.engine_config(truncation);
    let scoring = ScoringParams::default();

    let mut config = OptimizerConfig::new(args.optimizer, args.trials)
        .with_seed(args.seed)
        .with_grid_steps(args.grid_steps)
        .with_parallel(!args.sequential);
    if let Some(secs) = args.time_budget {
        config = config.with_time_budget(secs);
    }

    println!(
        "{} Optimizing {} cut-offs on {} nodes with {} ({} trials, {} dimension(s), T = {})",
        style("→").cyan().bold(),
        style(args.cutoff_kind).green(),
        settings.nodes,
        style(args.optimizer).yellow(),
        args.trials,
        space.len(),
        truncation
    );

    let mut log = match &args.filename {
        Some(path) => {
            let header = RunHeader::new(
                spec.clone(),
                params,
                engine.clone(),
                scoring,
                space.clone(),
                args.optimizer,
                args.seed,
            );
            Some(TrialLog::create(path, &header).with_context(|| format!("Failed to create {}", path.display()))?)
        }
        None => None,
    };

    let pb = create_progress_bar(args.trials as u64, "trials")?;
    let optimizer = Optimizer::new(config, engine, scoring);
    let result = optimizer.run_with(&spec, &params, &space, &mut |trial| {
        if let Some(log) = log.as_mut() {
            log.append(trial)?;
        }
        pb.inc(1);
        Ok(())
    });
    pb.finish_and_clear();
    let report = result?;

    println!(
        "{} {} trials in {:.2}s, {} feasible",
        style("✓").green().bold(),
        report.trials.len(),
        report.elapsed.as_secs_f64(),
        report.feasible_count()
    );

    match &report.status {
        OptimizationStatus::Optimal { best } => {
            println!();
            println!("Best policy (trial {}):", best.index);
            print_policy(&best.policy);
            if let Some(metrics) = &best.metrics {
                print_key_rate(&metrics.key_rate);
            }
        }
        OptimizationStatus::NoFeasiblePolicy => {
            println!(
                "{} No feasible policy: no trial reached a positive key rate",
                style("!").yellow().bold()
            );
        }
    }

    if let Some(log) = &log {
        println!();
        println!("  Trial log: {}", style(log.path().display()).green());
    }

    Ok(())
}

/// Ranked output of a protocol search.
#[derive(Debug, Serialize)]
struct ProtocolRanking<'a> {
    settings: &'a Settings,
    protocols: usize,
    feasible: usize,
    elapsed_ms: f64,
    ranked: Vec<&'a ProtocolCandidate>,
}

fn search_protocols(args: &OptimizeArgs, settings: &Settings) -> Result<()> {
    if settings.protocol_steps.is_some() {
        bail!("--search protocols enumerates structures itself; drop --protocol");
    }
    let space = ProtocolSpace::new(settings.links_or_default()?, settings.max_dists)?;
    let params = settings.physical();
    let engine = settings.engine_config(settings.truncation.unwrap_or(2));
    let search = ProtocolSearch::new(engine, ScoringParams::default())
        .with_suggested_truncation(settings.truncation.is_none())
        .with_parallel(!args.sequential);

    println!(
        "{} Searching {} protocol(s) on {} nodes, up to {} distillation(s) per swap input",
        style("→").cyan().bold(),
        style(space.len()).green(),
        settings.nodes,
        settings.max_dists
    );

    let pb = create_progress_bar(space.len() as u64, "protocols")?;
    let result = search.run_with(&space, &params, &mut |_| {
        pb.inc(1);
        Ok(())
    });
    pb.finish_and_clear();
    let report = result?;

    println!(
        "{} {} protocols in {:.2}s, {} feasible",
        style("✓").green().bold(),
        report.candidates.len(),
        report.elapsed.as_secs_f64(),
        report.feasible_count()
    );

    match report.best() {
        Some(best) => {
            println!();
            println!("Best protocol (candidate {}):", best.index);
            println!("  Steps:    {}", style(best.steps.join(",")).cyan());
            println!("  Protocol: {}", best.protocol);
            if let Some(metrics) = &best.metrics {
                print_key_rate(&metrics.key_rate);
            }
        }
        None => {
            println!(
                "{} No feasible protocol: none reached a positive key rate",
                style("!").yellow().bold()
            );
        }
    }

    if let Some(path) = &args.filename {
        let ranking = ProtocolRanking {
            settings,
            protocols: report.candidates.len(),
            feasible: report.feasible_count(),
            elapsed_ms: report.elapsed.as_secs_f64() * 1e3,
            ranked: report.ranked(),
        };
        report::to_file(&ranking, path, &ExportConfig::default())?;
        println!();
        println!("  Ranking: {}", style(path.display()).green());
    }

    Ok(())
}

/// Progress bar for the trial loop.
fn create_progress_bar(len: u64, message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message(message.to_string());
    Ok(pb)
}
