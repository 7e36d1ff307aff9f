//! Result files: a JSON report and a plot-ready CSV of the distribution.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use qrep_sim::{CutoffPolicy, KeyRate, NumericalDivergence, WaitingTimeDistribution};
use serde::{Deserialize, Serialize};

use crate::config::Settings;

/// Information for reproducing a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReproducibilityInfo {
    pub qrep_version: String,
    /// Command line of this run.
    pub cli_args: Vec<String>,
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
}

impl ReproducibilityInfo {
    pub fn capture(cli_args: &[String]) -> Self {
        Self {
            qrep_version: env!("CARGO_PKG_VERSION").to_string(),
            cli_args: cli_args.to_vec(),
            schema_version: "0.1.0".into(),
            generated_at: Utc::now(),
        }
    }
}

/// Binned distribution as plain arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionData {
    pub pmf: Vec<f64>,
    pub werner: Vec<f64>,
}

/// Output of `qrep simulate`.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub reproducibility: ReproducibilityInfo,
    pub settings: Settings,
    /// Protocol tree in text form.
    pub protocol: String,
    pub policy: CutoffPolicy,
    pub truncation: usize,
    pub coverage: f64,
    pub lost_mass: f64,
    pub key_rate: KeyRate,
    pub warnings: Vec<NumericalDivergence>,
    pub elapsed_ms: f64,
    pub distribution: DistributionData,
}

impl DistributionData {
    pub fn from_distribution(dist: &WaitingTimeDistribution) -> Self {
        Self {
            pmf: dist.pmf().to_vec(),
            werner: dist.werner().to_vec(),
        }
    }
}

/// Export configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Whether to pretty-print JSON output.
    pub pretty: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self { pretty: true }
    }
}

/// Serialize a report to a JSON string.
pub fn to_json<T: Serialize>(report: &T, config: &ExportConfig) -> Result<String> {
    let json = if config.pretty {
        serde_json::to_string_pretty(report)
    } else {
        serde_json::to_string(report)
    };
    json.context("Failed to serialize report")
}

/// Write a report to a JSON file.
pub fn to_file<T: Serialize>(report: &T, path: &Path, config: &ExportConfig) -> Result<()> {
    let json = to_json(report, config)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

/// `<dir>/<stem>.csv` next to `path`.
pub fn csv_path(path: &Path) -> PathBuf {
    path.with_extension("csv")
}

/// CSV with columns `t,pmf,cdf,werner,fidelity`; zero-mass bins leave the
/// fidelity empty.
pub fn distribution_csv(dist: &WaitingTimeDistribution) -> String {
    let cdf = dist.cdf();
    let rows = (0..dist.truncation()).map(|t| {
        let fidelity = dist.fidelity_at(t).map(|f| f.to_string()).unwrap_or_default();
        format!("{t},{},{},{},{fidelity}\n", dist.pmf()[t], cdf[t], dist.werner()[t])
    });
    std::iter::once("t,pmf,cdf,werner,fidelity\n".to_string()).chain(rows).collect()
}

pub fn write_csv(dist: &WaitingTimeDistribution, path: &Path) -> Result<()> {
    std::fs::write(path, distribution_csv(dist)).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_layout() {
        let dist = WaitingTimeDistribution::geometric(0.5, 0.8, 4).unwrap();
        let csv = distribution_csv(&dist);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "t,pmf,cdf,werner,fidelity");
        assert!(lines[1].starts_with("0,0,0,"));
        assert!(lines[1].ends_with(','));
        assert!(lines[2].starts_with("1,0.5,0.5,0.8,"));
    }

    #[test]
    fn test_csv_rows_are_newline_terminated() {
        let dist = WaitingTimeDistribution::geometric(0.5, 0.8, 3).unwrap();
        let csv = distribution_csv(&dist);
        assert!(csv.ends_with('\n'));
        assert_eq!(csv.matches('\n').count(), 4);
        let last = csv.lines().last().unwrap();
        assert_eq!(last, format!("2,0.25,0.75,0.8,{}", dist.fidelity_at(2).unwrap()));
    }

    #[test]
    fn test_csv_path_replaces_extension() {
        assert_eq!(csv_path(Path::new("out/run.json")), PathBuf::from("out/run.csv"));
        assert_eq!(csv_path(Path::new("run")), PathBuf::from("run.csv"));
    }
}
