//! # Passforge: Pass-Pipeline Model Optimization
//!
//! **Version**: 0.1.0
//!
//! Passforge takes an input model and a set of optimization passes
//! (conversion, quantization, graph optimization, tuning), searches the
//! joint space of pass options, and keeps the best resulting models
//! according to an evaluator's metrics and goals.
//!
//! ## Architecture
//!
//! - [`config`]: the JSON run document
//! - [`pass`]: pass contract, option schemas, built-in catalog
//! - [`flow`]: ordered pass chains resolved from the document
//! - [`search`]: search space, algorithms, and the staged strategy
//! - [`cache`]: content-addressed artifact, evaluation and run cache
//! - [`executor`]: runs one flow for one search point through the cache
//! - [`evaluator`]: metrics, goals and ranking
//! - [`engine`]: the run loop tying it together
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use passforge::config::RunConfig;
//! use passforge::Engine;
//!
//! let config = RunConfig::from_path("run.json")?;
//! passforge::logging::init_logging(config.engine.log_directive());
//!
//! let outcome = Engine::from_config(config)?.run()?;
//! println!("best: {:?}", outcome.output_models.first());
//! # Ok::<(), passforge::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod artifact;
pub mod cache;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod flow;
pub mod hash;
pub mod logging;
pub mod pass;
pub mod run;
pub mod search;
pub mod system;
pub mod value;

pub use artifact::{ModelArtifact, ModelFormat};
pub use engine::{Engine, EngineBuilder, RunOutcome, StopHandle};
pub use error::{Error, Result, TrialFailure};
pub use evaluator::{EvaluationResult, MetricValue};
pub use hash::Fingerprint;
pub use run::{Manifest, RunRecord, RunStatus};
pub use search::{SearchPoint, SearchState};
pub use value::OptionValue;
