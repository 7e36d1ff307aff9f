//! qrep command-line interface
//!
//! Evaluates quantum repeater chains and searches for cut-off policies that
//! maximize the secret key rate.
//!
//! ```text
//!   A ==== r1 ==== r2 ==== B        qrep simulate --nodes 3 --cutoff memory:10
//!     \__ swap __/                  qrep optimize --nodes 5 --optimizer gp
//! ```

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod report;

use commands::{optimize, simulate, version};

/// qrep - waiting times, fidelities and cut-off optimization for repeater chains
#[derive(Parser)]
#[command(name = "qrep")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate one protocol and print its waiting time, fidelity and key rate
    Simulate(simulate::SimulateArgs),

    /// Search for the cut-off policy with the highest key rate
    Optimize(optimize::OptimizeArgs),

    /// Show version information
    Version,
}

fn main() {
    let cli = Cli::parse();

    // Setup logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    // Execute command
    let result = match cli.command {
        Commands::Simulate(sim) => simulate::execute(&sim, &args),
        Commands::Optimize(opt) => optimize::execute(&opt),
        Commands::Version => {
            version::execute();
            Ok(())
        }
    };

    // Handle errors
    if let Err(e) = result {
        eprintln!("{} {:#}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }
}
