//! `qrep-opt` - cut-off policy search for quantum repeater chains.
//!
//! The optimizer treats the simulation engine as a black box: each trial
//! turns a point of a [`SearchSpace`] into a [`qrep_sim::CutoffPolicy`],
//! evaluates the protocol under it and records the secret-key-rate score.
//! A [`ProtocolSearch`] instead enumerates protocol structures, swap order
//! and distillation placement, and ranks them the same way.
//!
//! # Quick start
//!
//! ```rust
//! use qrep_opt::{CutoffKind, Optimizer, OptimizerConfig, SearchSpace, StrategyKind};
//! use qrep_sim::{EngineConfig, PhysicalParams, ProtocolSpec, ScoringParams};
//!
//! let spec = ProtocolSpec::swap_chain(3, 0).unwrap();
//! let params = PhysicalParams::new(0.5, 0.9, 0.95).with_coherence_time(400.0);
//! let space = SearchSpace::per_level(&spec, CutoffKind::MemoryTime, 0.0, 20.0).unwrap();
//!
//! let optimizer = Optimizer::new(
//!     OptimizerConfig::new(StrategyKind::Grid, 5),
//!     EngineConfig::new(100),
//!     ScoringParams::default(),
//! );
//! let report = optimizer.run(&spec, &params, &space).unwrap();
//! assert!(report.best().is_some());
//! ```

pub mod driver;
pub mod error;
pub mod gp;
pub mod log;
pub mod protocol_space;
pub mod space;
pub mod strategy;
pub mod trial;

pub use driver::{OptimizationReport, OptimizationStatus, Optimizer, OptimizerConfig};
pub use error::{OptError, OptResult};
pub use log::{LogRecord, LoggedRun, RunHeader, TrialLog, TrialRecord};
pub use protocol_space::{ProtocolCandidate, ProtocolSearch, ProtocolSearchReport, ProtocolSpace};
pub use space::{CutoffKind, Dimension, SearchSpace};
pub use strategy::{BayesianSearch, GridSearch, Proposer, RandomSearch, StrategyKind};
pub use trial::{Assessment, Trial, TrialMetrics, TrialStatus, assess, best_trial};
