//! Append-only trial log in JSON lines.
//!
//! The first line is a header describing the run; every following line is
//! one trial. Floats are written with full round-trip precision, so a log
//! read back reproduces policies and scores exactly.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use qrep_sim::{EngineConfig, PhysicalParams, ProtocolSpec, ScoringParams};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OptError, OptResult};
use crate::space::SearchSpace;
use crate::strategy::StrategyKind;
use crate::trial::{Trial, best_trial};

/// Run description written once at the top of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHeader {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub qrep_version: String,
    pub protocol: ProtocolSpec,
    pub params: PhysicalParams,
    pub engine: EngineConfig,
    pub scoring: ScoringParams,
    pub space: SearchSpace,
    pub strategy: StrategyKind,
    pub seed: u64,
}

impl RunHeader {
    /// Header for a run starting now, with a fresh id.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        protocol: ProtocolSpec,
        params: PhysicalParams,
        engine: EngineConfig,
        scoring: ScoringParams,
        space: SearchSpace,
        strategy: StrategyKind,
        seed: u64,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            qrep_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol,
            params,
            engine,
            scoring,
            space,
            strategy,
            seed,
        }
    }
}

/// One logged trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial: Trial,
    pub recorded_at: DateTime<Utc>,
}

/// One line of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRecord {
    Header(RunHeader),
    Trial(TrialRecord),
}

/// Writer half of the log.
#[derive(Debug)]
pub struct TrialLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl TrialLog {
    /// Create (or truncate) `path` and write the header.
    pub fn create(path: impl AsRef<Path>, header: &RunHeader) -> OptResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .map_err(|e| OptError::Log(format!("failed to create {}: {e}", path.display())))?;
        let mut log = Self {
            path,
            writer: BufWriter::new(file),
        };
        log.write_line(&LogRecord::Header(header.clone()))?;
        Ok(log)
    }

    /// Append one trial and flush, so an interrupted run keeps its history.
    pub fn append(&mut self, trial: &Trial) -> OptResult<()> {
        self.write_line(&LogRecord::Trial(TrialRecord {
            trial: trial.clone(),
            recorded_at: Utc::now(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a complete log back.
    pub fn read(path: impl AsRef<Path>) -> OptResult<LoggedRun> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| OptError::Log(format!("failed to open {}: {e}", path.display())))?;
        let mut header = None;
        let mut trials = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: LogRecord = serde_json::from_str(&line)
                .map_err(|e| OptError::Log(format!("{}:{}: {e}", path.display(), n + 1)))?;
            match (record, header.is_some()) {
                (LogRecord::Header(h), false) => header = Some(h),
                (LogRecord::Header(_), true) => {
                    return Err(OptError::Log(format!(
                        "{}:{}: duplicate header",
                        path.display(),
                        n + 1
                    )));
                }
                (LogRecord::Trial(_), false) => {
                    return Err(OptError::Log(format!(
                        "{}:{}: trial before header",
                        path.display(),
                        n + 1
                    )));
                }
                (LogRecord::Trial(t), true) => trials.push(t),
            }
        }
        let header = header.ok_or_else(|| OptError::Log(format!("{}: empty log", path.display())))?;
        Ok(LoggedRun { header, trials })
    }

    fn write_line(&mut self, record: &LogRecord) -> OptResult<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// A log read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedRun {
    pub header: RunHeader,
    pub trials: Vec<TrialRecord>,
}

impl LoggedRun {
    /// Best feasible trial.
    pub fn best(&self) -> Option<&TrialRecord> {
        let best = best_trial(self.trials.iter().map(|r| &r.trial))?;
        self.trials.iter().find(|r| r.trial.index == best.index)
    }
}
