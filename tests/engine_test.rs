//! End-to-end runs of the engine with in-process passes
//!
//! The document tunes `scale` (factor 1 or 2) followed by `bonus`
//! (0 or 1), so the joint space has four points scoring
//! 1.0, 1.5, 2.0 and 2.5.

mod common;

use common::{config, document, score, score_scorer, Bonus, Scale};
use passforge::engine::{Engine, MODEL_CONFIG_FILE};
use passforge::run::MANIFEST_FILE;
use passforge::{Error, Manifest, RunStatus, SearchState};
use serde_json::json;
use std::sync::atomic::Ordering;

fn engine(doc: &serde_json::Value, scale: Scale, bonus: Bonus) -> Engine {
    Engine::builder(config(doc))
        .pass(scale)
        .pass(bonus)
        .metric_scorer("quality", score_scorer)
        .build()
        .unwrap()
}

#[test]
fn test_exhaustive_run_executes_each_step_once() {
    let dir = tempfile::tempdir().unwrap();
    let doc = document(dir.path());
    let (scale, bonus) = (Scale::new(), Bonus::new());
    let (scale_calls, bonus_calls) = (scale.calls(), bonus.calls());

    let engine = engine(&doc, scale, bonus);
    assert_eq!(engine.flows()[0].id(), "scale-bonus");
    let outcome = engine.run().unwrap();

    assert_eq!(outcome.records.len(), 4);
    assert!(outcome.records.iter().all(|r| r.status() == RunStatus::Success));
    assert_eq!(outcome.state, SearchState::Exhausted);
    // Both bonus values share each scale output.
    assert_eq!(scale_calls.load(Ordering::SeqCst), 2);
    assert_eq!(bonus_calls.load(Ordering::SeqCst), 4);

    assert_eq!(outcome.best.len(), 2);
    assert!((score(outcome.best[0].evaluation()) - 2.5).abs() < 1e-9);
    assert!((score(outcome.best[1].evaluation()) - 2.0).abs() < 1e-9);
    assert!((score(outcome.baseline.as_ref()) - 1.0).abs() < 1e-9);
}

#[test]
fn test_outputs_persisted_with_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = document(dir.path());
    doc["engine"]["output_name"] = json!("tuned");

    let outcome = engine(&doc, Scale::new(), Bonus::new()).run().unwrap();

    let first = &outcome.output_models[0];
    assert!(first.ends_with("tuned_1_scale-bonus"));
    assert!(first.join(MODEL_CONFIG_FILE).exists());
    assert!(first.join("model.bin").exists());
    let persisted: serde_json::Value =
        serde_json::from_slice(&std::fs::read(first.join(MODEL_CONFIG_FILE)).unwrap()).unwrap();
    assert_eq!(persisted["rank"], 1);
    assert_eq!(persisted["flow"], "scale-bonus");

    let manifest = Manifest::read(&outcome.manifest_path).unwrap();
    assert!(outcome.manifest_path.ends_with(MANIFEST_FILE));
    assert_eq!(manifest.trials.len(), 4);
    assert_eq!(manifest.successful(), 4);
    assert_eq!(manifest.best[0], outcome.best[0].fingerprint());
    assert!(dir.path().join("out").join("input_model_metrics.json").exists());
}

#[test]
fn test_second_run_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let doc = document(dir.path());
    let first = engine(&doc, Scale::new(), Bonus::new()).run().unwrap();

    let (scale, bonus) = (Scale::new(), Bonus::new());
    let (scale_calls, bonus_calls) = (scale.calls(), bonus.calls());
    let second = engine(&doc, scale, bonus).run().unwrap();

    assert_eq!(scale_calls.load(Ordering::SeqCst), 0);
    assert_eq!(bonus_calls.load(Ordering::SeqCst), 0);
    assert_eq!(second.cache.misses, 0);
    assert_eq!(second.cache.hits, 8);
    // Four trials plus the baseline.
    assert_eq!(second.cache.evaluation_hits, 5);
    for (a, b) in first.records.iter().zip(&second.records) {
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.evaluation(), b.evaluation());
    }
}

#[test]
fn test_clean_cache_recomputes() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = document(dir.path());
    engine(&doc, Scale::new(), Bonus::new()).run().unwrap();

    doc["engine"]["clean_cache"] = json!(true);
    let scale = Scale::new();
    let scale_calls = scale.calls();
    let outcome = engine(&doc, scale, Bonus::new()).run().unwrap();

    assert_eq!(scale_calls.load(Ordering::SeqCst), 2);
    assert_eq!(outcome.cache.hits, 2);
    assert_eq!(outcome.cache.misses, 6);
}

#[test]
fn test_clean_run_cache_reruns_one_pass() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = document(dir.path());
    engine(&doc, Scale::new(), Bonus::new()).run().unwrap();

    doc["passes"]["scale"]["clean_run_cache"] = json!(true);
    let (scale, bonus) = (Scale::new(), Bonus::new());
    let (scale_calls, bonus_calls) = (scale.calls(), bonus.calls());
    engine(&doc, scale, bonus).run().unwrap();

    // Each scale step reruns once; its outputs keep their keys, so bonus hits.
    assert_eq!(scale_calls.load(Ordering::SeqCst), 2);
    assert_eq!(bonus_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_clean_run_cache_with_parallel_workers() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = document(dir.path());
    engine(&doc, Scale::new(), Bonus::new()).run().unwrap();

    doc["passes"]["scale"]["clean_run_cache"] = json!(true);
    doc["engine"]["num_workers"] = json!(2);
    for _ in 0..5 {
        let scale = Scale::new();
        let scale_calls = scale.calls();
        let outcome = engine(&doc, scale, Bonus::new()).run().unwrap();

        assert_eq!(outcome.records.len(), 4);
        assert!(outcome.records.iter().all(|r| r.status() == RunStatus::Success));
        assert_eq!(scale_calls.load(Ordering::SeqCst), 2);
    }
}

#[test]
fn test_failed_trials_do_not_abort_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let doc = document(dir.path());

    let outcome = engine(&doc, Scale::new().failing_on(2), Bonus::new()).run().unwrap();

    let failed: Vec<_> = outcome
        .records
        .iter()
        .filter(|r| r.status() == RunStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|r| r.error().unwrap().contains("scale")));
    assert!((score(outcome.best[0].evaluation()) - 1.5).abs() < 1e-9);
}

#[test]
fn test_rejected_points_are_not_executed() {
    let dir = tempfile::tempdir().unwrap();
    let doc = document(dir.path());
    let scale = Scale::new().rejecting(2);
    let scale_calls = scale.calls();

    let outcome = engine(&doc, scale, Bonus::new()).run().unwrap();

    let invalid = outcome
        .records
        .iter()
        .filter(|r| r.status() == RunStatus::Invalid)
        .count();
    assert_eq!(invalid, 2);
    assert_eq!(scale_calls.load(Ordering::SeqCst), 1);
    assert!(outcome.records.iter().all(|r| r.status() != RunStatus::Failed));
}

#[test]
fn test_all_failures_reported_after_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = document(dir.path());
    doc["passes"]["scale"]["disable_search"] = json!(true);

    let err = engine(&doc, Scale::new().failing_on(1), Bonus::new())
        .run()
        .unwrap_err();

    match err {
        Error::NoSuccessfulTrials { failures } => {
            assert_eq!(failures.len(), 2);
            assert!(failures[0].cause.contains("not supported"));
        }
        other => panic!("unexpected error: {other}"),
    }
    let manifest = Manifest::read(&dir.path().join("out").join(MANIFEST_FILE)).unwrap();
    assert_eq!(manifest.successful(), 0);
    assert_eq!(manifest.trials.len(), 2);
}

#[test]
fn test_pass_by_pass_tunes_one_pass_at_a_time() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = document(dir.path());
    doc["engine"]["search_strategy"]["execution_order"] = json!("pass-by-pass");
    let scale = Scale::new();
    let scale_calls = scale.calls();

    let outcome = engine(&doc, scale, Bonus::new()).run().unwrap();

    // scale over {1, 2} with bonus held, then bonus over {0, 1} with scale at 2
    assert_eq!(outcome.records.len(), 4);
    assert_eq!(scale_calls.load(Ordering::SeqCst), 2);
    assert!((score(outcome.best[0].evaluation()) - 2.5).abs() < 1e-9);
    // The repeated point is reported once.
    assert_ne!(outcome.best[0].fingerprint(), outcome.best[1].fingerprint());
}

#[test]
fn test_parallel_workers_match_sequential_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = document(dir.path());
    doc["engine"]["num_workers"] = json!(4);
    let (scale, bonus) = (Scale::new(), Bonus::new());
    let (scale_calls, bonus_calls) = (scale.calls(), bonus.calls());

    let outcome = engine(&doc, scale, bonus).run().unwrap();

    assert_eq!(outcome.records.len(), 4);
    assert_eq!(scale_calls.load(Ordering::SeqCst), 2);
    assert_eq!(bonus_calls.load(Ordering::SeqCst), 4);
    assert!((score(outcome.best[0].evaluation()) - 2.5).abs() < 1e-9);
    let mut trials: Vec<usize> = outcome.records.iter().map(|r| r.trial()).collect();
    trials.sort_unstable();
    assert_eq!(trials, vec![0, 1, 2, 3]);
}

#[test]
fn test_stopped_engine_runs_no_trial() {
    let dir = tempfile::tempdir().unwrap();
    let doc = document(dir.path());
    let engine = engine(&doc, Scale::new(), Bonus::new());
    engine.stop_handle().stop();

    let err = engine.run().unwrap_err();
    assert!(matches!(err, Error::NoSuccessfulTrials { ref failures } if failures.is_empty()));
    let manifest = Manifest::read(&dir.path().join("out").join(MANIFEST_FILE)).unwrap();
    assert_eq!(manifest.search_state, SearchState::Stopped);
}

#[test]
fn test_stop_when_goals_met() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = document(dir.path());
    doc["engine"]["search_strategy"]["stop_when_goals_met"] = json!(true);
    doc["evaluators"]["quality"]["metrics"][0]["sub_types"][0]["goal"] =
        json!({"type": "threshold", "value": 0.5});

    let outcome = engine(&doc, Scale::new(), Bonus::new()).run().unwrap();

    assert_eq!(outcome.records.len(), 1);
    assert_eq!(outcome.state, SearchState::Converged);
    assert_eq!(outcome.best[0].goals_met(), Some(true));
}

#[test]
fn test_relative_goal_judged_against_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = document(dir.path());
    // At least 100% better than the input model's 1.0.
    doc["evaluators"]["quality"]["metrics"][0]["sub_types"][0]["goal"] =
        json!({"type": "min-improvement", "value": 1.0});

    let outcome = engine(&doc, Scale::new(), Bonus::new()).run().unwrap();

    let met = outcome
        .records
        .iter()
        .filter(|r| r.goals_met() == Some(true))
        .count();
    assert_eq!(met, 2);
}

#[test]
fn test_relative_goal_without_baseline_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = document(dir.path());
    doc["engine"]["evaluate_input_model"] = json!(false);
    doc["evaluators"]["quality"]["metrics"][0]["sub_types"][0]["goal"] =
        json!({"type": "max-degradation", "value": 0.05});

    let err = Engine::builder(config(&doc))
        .pass(Scale::new())
        .pass(Bonus::new())
        .metric_scorer("quality", score_scorer)
        .build()
        .unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.to_string().contains("evaluate_input_model"));
}

#[test]
fn test_run_without_search_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = document(dir.path());
    doc["engine"]
        .as_object_mut()
        .unwrap()
        .remove("search_strategy");

    let outcome = engine(&doc, Scale::new(), Bonus::new()).run().unwrap();

    assert_eq!(outcome.records.len(), 1);
    assert!((score(outcome.best[0].evaluation()) - 1.0).abs() < 1e-9);
}

#[test]
fn test_unknown_pass_type_rejected_at_build() {
    let dir = tempfile::tempdir().unwrap();
    let doc = document(dir.path());
    let err = Engine::builder(config(&doc)).pass(Scale::new()).build().unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.to_string().contains("Bonus"));
}

#[test]
fn test_max_iter_limits_trials() {
    let dir = tempfile::tempdir().unwrap();
    let mut doc = document(dir.path());
    doc["engine"]["search_strategy"]["max_iter"] = json!(3);

    let outcome = engine(&doc, Scale::new(), Bonus::new()).run().unwrap();

    assert_eq!(outcome.records.len(), 3);
    assert_eq!(outcome.state, SearchState::Exhausted);
}

#[cfg(feature = "tokio")]
#[tokio::test]
async fn test_run_async() {
    let dir = tempfile::tempdir().unwrap();
    let doc = document(dir.path());
    let engine = std::sync::Arc::new(engine(&doc, Scale::new(), Bonus::new()));

    let outcome = engine.run_async().await.unwrap();
    assert_eq!(outcome.records.len(), 4);
}
