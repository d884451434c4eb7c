//! Cache recovery across runs

mod common;

use common::{config, document, score_scorer, Bonus, Scale};
use passforge::{Engine, RunStatus};
use std::path::Path;
use std::sync::atomic::Ordering;

fn run(dir: &Path, scale: Scale) -> passforge::RunOutcome {
    Engine::builder(config(&document(dir)))
        .pass(scale)
        .pass(Bonus::new())
        .metric_scorer("quality", score_scorer)
        .build()
        .unwrap()
        .run()
        .unwrap()
}

fn entries(dir: &Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect()
}

#[test]
fn test_corrupt_artifact_entries_are_recomputed() {
    let dir = tempfile::tempdir().unwrap();
    run(dir.path(), Scale::new());

    let artifacts = dir.path().join("cache").join("artifacts");
    let corrupted = entries(&artifacts);
    assert_eq!(corrupted.len(), 6);
    for path in &corrupted {
        std::fs::write(path, b"{ truncated").unwrap();
    }

    let scale = Scale::new();
    let calls = scale.calls();
    let outcome = run(dir.path(), scale);

    assert!(outcome.records.iter().all(|r| r.status() == RunStatus::Success));
    assert_eq!(outcome.cache.corrupt, 6);
    assert_eq!(outcome.cache.misses, 6);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(entries(&artifacts).len(), 6);
}

#[test]
fn test_deleted_model_directory_is_recomputed() {
    let dir = tempfile::tempdir().unwrap();
    run(dir.path(), Scale::new());
    std::fs::remove_dir_all(dir.path().join("cache").join("models")).unwrap();

    let scale = Scale::new();
    let calls = scale.calls();
    let outcome = run(dir.path(), scale);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.cache.corrupt, 6);
    assert!(outcome.records.iter().all(|r| r.status() == RunStatus::Success));
}

#[test]
fn test_run_records_cached_per_point() {
    let dir = tempfile::tempdir().unwrap();
    let outcome = run(dir.path(), Scale::new());
    assert_eq!(entries(&dir.path().join("cache").join("runs")).len(), 4);
    assert_eq!(entries(&dir.path().join("cache").join("evaluations")).len(), 5);
    assert_eq!(outcome.records.len(), 4);
}
