//! Result manifest written to the output directory

use super::RunRecord;
use crate::artifact::ModelArtifact;
use crate::cache::CacheStats;
use crate::evaluator::EvaluationResult;
use crate::hash::Fingerprint;
use crate::search::SearchState;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// File name of the manifest inside the output directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Everything a run produced, trial by trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Run identifier
    pub run_id: String,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: DateTime<Utc>,
    /// Final search state
    pub search_state: SearchState,
    /// Unmodified input model
    pub input_model: ModelArtifact,
    /// Baseline evaluation of the input model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<EvaluationResult>,
    /// Search point fingerprints of the persisted records, best first
    pub best: Vec<Fingerprint>,
    /// Cache activity during the run
    pub cache: CacheStats,
    /// Every trial in completion order
    pub trials: Vec<RunRecord>,
}

impl Manifest {
    /// Write `manifest.json` into `dir`, replacing any previous one.
    ///
    /// # Errors
    /// Returns an IO or JSON error if the file cannot be written.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(MANIFEST_FILE);
        write_json_atomic(&path, self)?;
        Ok(path)
    }

    /// Read a manifest file.
    ///
    /// # Errors
    /// Returns an IO or JSON error if the file cannot be read or parsed.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Number of successful trials.
    #[must_use]
    pub fn successful(&self) -> usize {
        self.trials.iter().filter(|t| t.is_success()).count()
    }
}

/// Write pretty JSON to `path` through a temp file in the same directory.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.write_all(b"\n")?;
    file.flush()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
