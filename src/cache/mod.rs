//! Run cache: artifacts, evaluations and run records
//!
//! One [`CacheContext`] is built per engine and threaded to every component
//! that needs it. Three namespaces share one root directory:
//!
//! - `artifacts/`: pass step key to output [`ModelArtifact`]
//! - `evaluations/`: (artifact, evaluator) key to [`EvaluationResult`]
//! - `runs/`: search point fingerprint to run record
//!
//! Pass outputs live under `models/<step key>/`. All namespaces are
//! append-only; an unreadable entry is logged, removed and treated as
//! absent so the caller recomputes it.
//!
//! # Example
//!
//! ```rust
//! use passforge::cache::CacheContext;
//!
//! # fn example() -> passforge::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let cache = CacheContext::open(dir.path(), false)?;
//! assert_eq!(cache.stats().hits, 0);
//! # Ok(())
//! # }
//! ```

mod disk;
mod store;

pub use disk::DiskStore;
pub use store::{EntryStore, MemoryStore};

use crate::artifact::ModelArtifact;
use crate::evaluator::EvaluationResult;
use crate::hash::Fingerprint;
use crate::Result;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Counter snapshot of a cache context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Pass outputs reused
    pub hits: u64,
    /// Pass outputs computed
    pub misses: u64,
    /// Evaluations reused
    pub evaluation_hits: u64,
    /// Corrupt entries discarded
    pub corrupt: u64,
}

impl CacheStats {
    /// Activity since an earlier snapshot.
    #[must_use]
    pub const fn since(&self, earlier: &Self) -> Self {
        Self {
            hits: self.hits.saturating_sub(earlier.hits),
            misses: self.misses.saturating_sub(earlier.misses),
            evaluation_hits: self.evaluation_hits.saturating_sub(earlier.evaluation_hits),
            corrupt: self.corrupt.saturating_sub(earlier.corrupt),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evaluation_hits: AtomicU64,
    corrupt: AtomicU64,
}

/// Shared cache of one engine.
#[derive(Debug)]
pub struct CacheContext {
    root: PathBuf,
    artifacts: Arc<dyn EntryStore>,
    evaluations: Arc<dyn EntryStore>,
    runs: Arc<dyn EntryStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    cleaned: DashSet<String>,
    counters: Counters,
}

impl CacheContext {
    /// Open the on-disk cache at `root`.
    ///
    /// With `clean`, every existing entry and model directory is deleted
    /// first.
    ///
    /// # Errors
    /// Returns an IO error if the directories cannot be created or cleared.
    pub fn open(root: impl Into<PathBuf>, clean: bool) -> Result<Self> {
        let root = root.into();
        if clean && root.exists() {
            debug!(root = %root.display(), "Clearing cache");
            std::fs::remove_dir_all(&root)?;
        }
        std::fs::create_dir_all(root.join("models"))?;
        Ok(Self::with_stores(
            root.clone(),
            Arc::new(DiskStore::open(root.join("artifacts"))?),
            Arc::new(DiskStore::open(root.join("evaluations"))?),
            Arc::new(DiskStore::open(root.join("runs"))?),
        ))
    }

    /// Cache over custom stores; pass outputs still go under `root/models`.
    #[must_use]
    pub fn with_stores(
        root: PathBuf,
        artifacts: Arc<dyn EntryStore>,
        evaluations: Arc<dyn EntryStore>,
        runs: Arc<dyn EntryStore>,
    ) -> Self {
        Self {
            root,
            artifacts,
            evaluations,
            runs,
            locks: DashMap::new(),
            cleaned: DashSet::new(),
            counters: Counters::default(),
        }
    }

    /// Cache root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by the pass invocation with step key `key`.
    #[must_use]
    pub fn model_dir(&self, key: &Fingerprint) -> PathBuf {
        self.root.join("models").join(key.to_hex())
    }

    /// Drop every cached evaluation.
    ///
    /// # Errors
    /// Returns an IO error if entries cannot be removed.
    pub fn clear_evaluations(&self) -> Result<()> {
        self.evaluations.clear()
    }

    /// Run `f` while holding the lock for `key`.
    ///
    /// Trials sharing a pass prefix serialize on the step key, so the
    /// second one finds the first one's entry instead of recomputing it.
    pub fn with_key_lock<T>(&self, key: &Fingerprint, f: impl FnOnce() -> T) -> T {
        let hex = key.to_hex();
        let lock = Arc::clone(self.locks.entry(hex.clone()).or_default().value());
        let result = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        // Only the map's own handle left: nobody is waiting on this key.
        self.locks.remove_if(&hex, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Cached output of a pass step.
    ///
    /// Entries whose model path no longer exists count as corrupt.
    #[must_use]
    pub fn lookup_artifact(&self, key: &Fingerprint) -> Option<ModelArtifact> {
        let hex = key.to_hex();
        let artifact: ModelArtifact = self.read(self.artifacts.as_ref(), "artifacts", &hex)?;
        if !artifact.path().exists() {
            self.discard(
                self.artifacts.as_ref(),
                "artifacts",
                &hex,
                &format!("model path {} is missing", artifact.path().display()),
            );
            return None;
        }
        Some(artifact)
    }

    /// Store the output of a pass step.
    ///
    /// # Errors
    /// Returns an IO or JSON error if the entry cannot be written.
    pub fn store_artifact(&self, key: &Fingerprint, artifact: &ModelArtifact) -> Result<()> {
        self.write(self.artifacts.as_ref(), &key.to_hex(), artifact)
    }

    /// Forget the output of a pass step (`clean_run_cache`).
    ///
    /// # Errors
    /// Returns an IO error if the entry or model directory cannot be
    /// removed.
    pub fn remove_artifact(&self, key: &Fingerprint) -> Result<()> {
        self.artifacts.remove(&key.to_hex())?;
        let dir = self.model_dir(key);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// Forget the output of a pass step unless this run already did.
    ///
    /// Returns whether the entry was removed. Later trials of the same run
    /// reuse the recomputed output.
    ///
    /// # Errors
    /// Returns an IO error if the entry or model directory cannot be
    /// removed.
    pub fn clean_artifact_once(&self, key: &Fingerprint) -> Result<bool> {
        if !self.cleaned.insert(key.to_hex()) {
            return Ok(false);
        }
        self.remove_artifact(key)?;
        Ok(true)
    }

    /// Start a new run: steps may be cleaned again.
    pub fn begin_run(&self) {
        self.cleaned.clear();
    }

    /// Count a reused pass output
    pub fn record_hit(&self) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a computed pass output
    pub fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Key of the evaluation of `artifact` by an evaluator.
    #[must_use]
    pub fn evaluation_key(artifact: &Fingerprint, evaluator: &Fingerprint) -> Fingerprint {
        Fingerprint::of_parts(&["evaluation", &artifact.to_hex(), &evaluator.to_hex()])
    }

    /// Cached raw evaluation (goals not applied).
    #[must_use]
    pub fn lookup_evaluation(&self, key: &Fingerprint) -> Option<EvaluationResult> {
        let result = self.read(self.evaluations.as_ref(), "evaluations", &key.to_hex());
        if result.is_some() {
            self.counters.evaluation_hits.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Store a raw evaluation.
    ///
    /// # Errors
    /// Returns an IO or JSON error if the entry cannot be written.
    pub fn store_evaluation(&self, key: &Fingerprint, result: &EvaluationResult) -> Result<()> {
        self.write(self.evaluations.as_ref(), &key.to_hex(), result)
    }

    /// Cached run record by search point fingerprint.
    #[must_use]
    pub fn lookup_run<T: DeserializeOwned>(&self, point: &Fingerprint) -> Option<T> {
        self.read(self.runs.as_ref(), "runs", &point.to_hex())
    }

    /// Store a run record. A record already stored for the same point is
    /// kept.
    ///
    /// # Errors
    /// Returns an IO or JSON error if the entry cannot be written.
    pub fn store_run<T: Serialize>(&self, point: &Fingerprint, record: &T) -> Result<()> {
        self.write(self.runs.as_ref(), &point.to_hex(), record)
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evaluation_hits: self.counters.evaluation_hits.load(Ordering::Relaxed),
            corrupt: self.counters.corrupt.load(Ordering::Relaxed),
        }
    }

    fn read<T: DeserializeOwned>(&self, store: &dyn EntryStore, namespace: &str, key: &str) -> Option<T> {
        let bytes = match store.get(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                self.discard(store, namespace, key, &e.to_string());
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                self.discard(store, namespace, key, &e.to_string());
                None
            }
        }
    }

    fn discard(&self, store: &dyn EntryStore, namespace: &str, key: &str, message: &str) {
        let error = crate::Error::CacheCorruption {
            key: format!("{namespace}/{key}"),
            message: message.to_string(),
        };
        warn!(%error, "Discarding cache entry");
        self.counters.corrupt.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = store.remove(key) {
            warn!(namespace, key, error = %e, "Could not remove corrupt cache entry");
        }
    }

    fn write<T: Serialize + ?Sized>(&self, store: &dyn EntryStore, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        if !store.put(key, &bytes)? {
            debug!(key, "Cache entry already present");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ModelFormat;
    use crate::evaluator::MetricValue;

    fn memory_cache(root: &Path) -> (CacheContext, Arc<MemoryStore>) {
        let artifacts = Arc::new(MemoryStore::new());
        let cache = CacheContext::with_stores(
            root.to_path_buf(),
            Arc::clone(&artifacts) as Arc<dyn EntryStore>,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
        );
        (cache, artifacts)
    }

    #[test]
    fn test_key_locks_are_released() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = memory_cache(dir.path());
        let key = Fingerprint::of_bytes(b"step");
        assert_eq!(cache.with_key_lock(&key, || 7), 7);
        assert!(cache.locks.is_empty());
    }

    #[test]
    fn test_artifact_cleaned_once_per_run() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = memory_cache(dir.path());
        let key = Fingerprint::of_bytes(b"step");
        let model_dir = cache.model_dir(&key);
        std::fs::create_dir_all(&model_dir).unwrap();
        cache
            .store_artifact(&key, &ModelArtifact::new(key, &model_dir, ModelFormat::Onnx))
            .unwrap();

        assert!(cache.clean_artifact_once(&key).unwrap());
        assert!(!model_dir.exists());

        std::fs::create_dir_all(&model_dir).unwrap();
        assert!(!cache.clean_artifact_once(&key).unwrap());
        assert!(model_dir.exists());

        cache.begin_run();
        assert!(cache.clean_artifact_once(&key).unwrap());
    }

    #[test]
    fn test_artifact_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheContext::open(dir.path(), false).unwrap();
        let key = Fingerprint::of_bytes(b"step");
        let model_dir = cache.model_dir(&key);
        std::fs::create_dir_all(&model_dir).unwrap();
        let artifact = ModelArtifact::new(key, &model_dir, ModelFormat::Onnx);

        assert!(cache.lookup_artifact(&key).is_none());
        cache.store_artifact(&key, &artifact).unwrap();
        assert_eq!(cache.lookup_artifact(&key), Some(artifact));
    }

    #[test]
    fn test_corrupt_entry_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, artifacts) = memory_cache(dir.path());
        let key = Fingerprint::of_bytes(b"step");
        artifacts.corrupt(&key.to_hex(), b"{\"id\": \"trunc");

        assert!(cache.lookup_artifact(&key).is_none());
        assert_eq!(cache.stats().corrupt, 1);
        // The bad entry is gone, so a fresh write succeeds
        assert!(!artifacts.exists(&key.to_hex()));
    }

    #[test]
    fn test_missing_model_path_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _) = memory_cache(dir.path());
        let key = Fingerprint::of_bytes(b"step");
        let artifact = ModelArtifact::new(key, dir.path().join("gone"), ModelFormat::Onnx);
        cache.store_artifact(&key, &artifact).unwrap();

        assert!(cache.lookup_artifact(&key).is_none());
        assert_eq!(cache.stats().corrupt, 1);
    }

    #[test]
    fn test_clean_open_removes_entries() {
        let dir = tempfile::tempdir().unwrap();
        let key = Fingerprint::of_bytes(b"eval");
        let mut result = EvaluationResult::new();
        result.insert("accuracy-accuracy_score", MetricValue::new(0.9, Some(1), true));
        {
            let cache = CacheContext::open(dir.path(), false).unwrap();
            cache.store_evaluation(&key, &result).unwrap();
        }
        let reopened = CacheContext::open(dir.path(), false).unwrap();
        assert_eq!(reopened.lookup_evaluation(&key), Some(result));
        assert_eq!(reopened.stats().evaluation_hits, 1);

        let cleaned = CacheContext::open(dir.path(), true).unwrap();
        assert!(cleaned.lookup_evaluation(&key).is_none());
    }

    #[test]
    fn test_key_lock_serializes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(CacheContext::open(dir.path(), false).unwrap());
        let key = Fingerprint::of_bytes(b"shared");
        let computed = AtomicU64::new(0);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    cache.with_key_lock(&key, || {
                        if cache.lookup_run::<u32>(&key).is_none() {
                            computed.fetch_add(1, Ordering::SeqCst);
                            cache.store_run(&key, &7_u32).unwrap();
                        }
                    });
                });
            }
        });
        assert_eq!(computed.load(Ordering::SeqCst), 1);
    }
}
