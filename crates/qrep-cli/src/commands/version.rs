//! Version command implementation.

use console::style;

/// Execute the version command.
pub fn execute() {
    let version = env!("CARGO_PKG_VERSION");

    println!(
        "{} {} - repeater chain simulation and cut-off optimization",
        style("qrep").cyan().bold(),
        style(format!("v{version}")).yellow()
    );
    println!();
    println!("Components:");
    println!("  qrep-sim   Waiting-time and Werner distributions of protocol trees");
    println!("  qrep-opt   Cut-off policy search (grid, random, Gaussian process)");
    println!("  qrep-cli   Command-line interface");
    println!();
    println!("Repository: {}", style(env!("CARGO_PKG_REPOSITORY")).underlined());
    println!("License:    {}", style(env!("CARGO_PKG_LICENSE")).dim());
}
