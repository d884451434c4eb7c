//! Error types for passforge
//!
//! Errors split into two classes:
//! - **Run-level**: configuration problems and a search that produced no
//!   successful trial. These abort the run.
//! - **Trial-local**: pass, evaluation, data and cache failures. These are
//!   captured on the trial's run record and surfaced in the manifest.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// A single failed trial, kept for run-level reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialFailure {
    /// Short fingerprint of the search point
    pub point: String,
    /// Flow the point belonged to
    pub flow: String,
    /// Rendered error cause
    pub cause: String,
}

impl std::fmt::Display for TrialFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{} @ {}] {}", self.point, self.flow, self.cause)
    }
}

fn render_failures(failures: &[TrialFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("  - {failure}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// passforge error types
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or unresolvable configuration (fatal, raised before any trial)
    #[error("Configuration error: {0}\nFix the run configuration and start the run again")]
    Configuration(String),

    /// A pass failed for one search point
    #[error("Pass '{pass}' failed: {message}")]
    PassExecution {
        /// Logical pass name
        pass: String,
        /// Failure detail
        message: String,
    },

    /// Metric measurement failed
    #[error("Evaluation failed: {0}")]
    Evaluation(String),

    /// Unreadable or partial cache entry (recovered by recomputing)
    #[error("Cache entry {key} is corrupt: {message}")]
    CacheCorruption {
        /// Cache key of the entry
        key: String,
        /// Decode failure detail
        message: String,
    },

    /// Every trial of the run failed
    #[error("No successful trials ({} failed):\n{}", failures.len(), render_failures(failures))]
    NoSuccessfulTrials {
        /// Per-trial causes
        failures: Vec<TrialFailure>,
    },

    /// Data source could not produce batches
    #[error("Data loader error: {0}")]
    DataLoader(String),

    /// Execution target could not run a command
    #[error("Execution target error: {0}")]
    Execution(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Shorthand for a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Shorthand for a pass execution error.
    pub fn pass(pass: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PassExecution {
            pass: pass.into(),
            message: message.into(),
        }
    }

    /// Whether this error only affects the trial that raised it.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(
            self,
            Self::PassExecution { .. }
                | Self::Evaluation(_)
                | Self::CacheCorruption { .. }
                | Self::DataLoader(_)
                | Self::Execution(_)
        )
    }
}
