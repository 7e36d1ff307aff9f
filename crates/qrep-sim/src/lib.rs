//! `qrep-sim` - waiting-time and fidelity distributions of quantum repeater
//! chains.
//!
//! A repeater protocol is a tree of probabilistic steps:
//!
//! - **Generation** of elementary links by repeated attempts
//! - **Swap** of two adjacent links into a longer one
//! - **Distillation** of two noisy links into one better link
//! - **Cut-offs** that discard stored links before they decay too far
//!
//! The [`Engine`] evaluates such a tree bottom-up and returns the joint
//! distribution of the delivery time and the Werner parameter of the final
//! pair. [`objective::score`] turns that distribution into a secret-key-rate
//! figure of merit.
//!
//! # Quick start
//!
//! ```rust
//! use qrep_sim::{CutoffPolicy, Engine, EngineConfig, PhysicalParams, ProtocolSpec};
//!
//! // Three nodes: two elementary links joined by one swap.
//! let spec = ProtocolSpec::swap_chain(3, 0).unwrap();
//! let params = PhysicalParams::new(0.5, 0.9, 0.95).with_coherence_time(400.0);
//!
//! let engine = Engine::new(EngineConfig::new(50));
//! let eval = engine.evaluate(&spec, &CutoffPolicy::new(), &params).unwrap();
//! let root = eval.root();
//! assert!((root.mean_waiting_time() - 2.962962962751337).abs() < 1e-9);
//! ```

pub mod convolution;
pub mod cutoff;
pub mod distribution;
pub mod engine;
pub mod error;
pub mod montecarlo;
pub mod objective;
pub mod params;
pub mod protocol;
pub mod units;

pub use convolution::{BackendKind, Convolver, NumericalDivergence};
pub use cutoff::{CutoffPolicy, CutoffRule};
pub use distribution::WaitingTimeDistribution;
pub use engine::{Engine, EngineConfig, Evaluation, TruncationMode, evaluate_protocol, suggest_truncation};
pub use error::{SimError, SimResult};
pub use montecarlo::{MonteCarlo, MonteCarloSummary};
pub use objective::{KeyRate, ScoringParams, key_rate_breakdown, score};
pub use params::{PhysicalParams, fidelity_to_werner, werner_to_fidelity};
pub use protocol::{GenerationParams, Level, NodeId, ProtocolBuilder, ProtocolSpec, Unit};
