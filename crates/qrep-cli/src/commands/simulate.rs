//! Simulate command implementation.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use qrep_sim::{CutoffPolicy, Engine, ScoringParams, key_rate_breakdown};
use tracing::info;

use super::common::{ChainArgs, parse_cutoff, print_key_rate, print_policy};
use crate::report::{self, DistributionData, ExportConfig, ReproducibilityInfo, SimulationReport};

#[derive(Debug, Clone, Args)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub chain: ChainArgs,

    /// Cut-off on every swap and distillation, e.g. memory:10, fidelity:0.9, runtime:40
    #[arg(long)]
    pub cutoff: Option<String>,

    /// Grow the horizon until the lost mass is within tolerance
    #[arg(long)]
    pub adaptive: bool,

    /// JSON report path; the distribution goes to `<stem>.csv` alongside
    #[arg(short, long)]
    pub filename: Option<PathBuf>,
}

/// Execute the simulate command.
pub fn execute(args: &SimulateArgs, cli_args: &[String]) -> Result<()> {
    let mut settings = args.chain.settings()?;
    settings.adaptive |= args.adaptive;

    let spec = settings.protocol()?;
    let params = settings.physical();
    let policy = match &args.cutoff {
        Some(raw) => CutoffPolicy::uniform(spec.tunable_nodes(), parse_cutoff(raw)?),
        None => CutoffPolicy::new(),
    };

    let truncation = settings.truncation_for(&spec);
    let engine = Engine::new(settings.engine_config(truncation));

    println!(
        "{} Simulating {} nodes, {} distillation round(s), T = {}",
        style("→").cyan().bold(),
        style(settings.nodes).green(),
        settings.max_dists,
        style(truncation).yellow()
    );
    if settings.protocol_steps.is_some() {
        println!("  Protocol: {}", style(&spec).cyan());
    }

    let eval = if settings.adaptive {
        engine.evaluate_adaptive(&spec, &policy, &params)?
    } else {
        engine.evaluate(&spec, &policy, &params).with_context(|| {
            format!("Evaluation at T = {truncation} failed; raise --truncation or pass --adaptive")
        })?
    };
    info!(
        truncation = eval.truncation,
        elapsed_ms = eval.elapsed.as_secs_f64() * 1e3,
        "simulation finished"
    );

    let root = eval.root();
    let key_rate = key_rate_breakdown(root, &ScoringParams::default());

    println!("{} Evaluation complete", style("✓").green().bold());
    println!("  Horizon:           {}", eval.truncation);
    println!("  Coverage:          {:.9}", root.coverage());
    print_key_rate(&key_rate);
    if !policy.is_empty() {
        println!();
        println!("Cut-offs:");
        print_policy(&policy);
    }
    for w in &eval.warnings {
        let node = w.node.map_or_else(|| "?".to_string(), |n| n.to_string());
        println!(
            "  {} {} and {} disagree on {} at node {node} (relative error {:.3e})",
            style("!").yellow().bold(),
            w.primary,
            w.reference,
            w.operation,
            w.max_rel_error
        );
    }

    if let Some(path) = &args.filename {
        let report = SimulationReport {
            reproducibility: ReproducibilityInfo::capture(cli_args),
            settings: settings.clone(),
            protocol: spec.to_string(),
            policy: policy.clone(),
            truncation: eval.truncation,
            coverage: root.coverage(),
            lost_mass: root.lost_mass(),
            key_rate,
            warnings: eval.warnings.clone(),
            elapsed_ms: eval.elapsed.as_secs_f64() * 1e3,
            distribution: DistributionData::from_distribution(root),
        };
        report::to_file(&report, path, &ExportConfig::default())?;
        let csv = report::csv_path(path);
        report::write_csv(root, &csv)?;
        println!();
        println!("  Report:       {}", style(path.display()).green());
        println!("  Distribution: {}", style(csv.display()).green());
    }

    Ok(())
}
