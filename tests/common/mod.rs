//! Shared fixtures: in-process passes, a metadata scorer and a run document

#![allow(dead_code)]

use passforge::config::RunConfig;
use passforge::evaluator::{Measurement, Metric, ScorerContext};
use passforge::pass::{Pass, PassContext, PassOptionSpec, PassSchema, ResolvedConfig};
use passforge::search::SearchParameter;
use passforge::{Error, EvaluationResult, ModelArtifact, OptionValue, Result};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn score_of(artifact: &ModelArtifact) -> f64 {
    artifact
        .metadata()
        .get("score")
        .and_then(OptionValue::as_f64)
        .unwrap_or(1.0)
}

fn write_output(ctx: &PassContext<'_>, input: &ModelArtifact, score: f64) -> Result<ModelArtifact> {
    let path = ctx.output_dir.join("model.bin");
    std::fs::write(&path, format!("{} -> {score}", input.path().display()))?;
    Ok(ModelArtifact::new(input.id(), path, input.format().clone()).with_metadata("score", score))
}

/// Multiplies the score by `factor` (searchable over 1 and 2).
pub struct Scale {
    schema: PassSchema,
    calls: Arc<AtomicUsize>,
    fail_on: Option<i64>,
    reject: Option<i64>,
}

impl Scale {
    pub fn new() -> Self {
        Self {
            schema: PassSchema::new().option(
                PassOptionSpec::new("factor", 1i64).searchable(SearchParameter::categorical([1i64, 2])),
            ),
            calls: Arc::new(AtomicUsize::new(0)),
            fail_on: None,
            reject: None,
        }
    }

    /// Fail whenever `factor` equals `factor`.
    pub const fn failing_on(mut self, factor: i64) -> Self {
        self.fail_on = Some(factor);
        self
    }

    /// Reject the option combination with this `factor` before execution.
    pub const fn rejecting(mut self, factor: i64) -> Self {
        self.reject = Some(factor);
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Pass for Scale {
    fn pass_type(&self) -> &str {
        "Scale"
    }

    fn schema(&self) -> &PassSchema {
        &self.schema
    }

    fn validate_search_point(&self, config: &ResolvedConfig) -> bool {
        self.reject.is_none() || config.get("factor").and_then(OptionValue::as_i64) != self.reject
    }

    fn run(&self, input: &ModelArtifact, config: &ResolvedConfig, ctx: &PassContext<'_>) -> Result<ModelArtifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let factor = config.get("factor").and_then(OptionValue::as_i64).unwrap_or(1);
        if self.fail_on.is_some_and(|f| f == factor) {
            return Err(Error::pass(ctx.pass_name, format!("factor {factor} is not supported")));
        }
        #[allow(clippy::cast_precision_loss)]
        let score = score_of(input) * factor as f64;
        write_output(ctx, input, score)
    }
}

/// Adds half of `bonus` (searchable over 0 and 1) to the score.
pub struct Bonus {
    schema: PassSchema,
    calls: Arc<AtomicUsize>,
}

impl Bonus {
    pub fn new() -> Self {
        Self {
            schema: PassSchema::new().option(
                PassOptionSpec::new("bonus", 0i64).searchable(SearchParameter::categorical([0i64, 1])),
            ),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl Pass for Bonus {
    fn pass_type(&self) -> &str {
        "Bonus"
    }

    fn schema(&self) -> &PassSchema {
        &self.schema
    }

    fn run(&self, input: &ModelArtifact, config: &ResolvedConfig, ctx: &PassContext<'_>) -> Result<ModelArtifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let bonus = config.get("bonus").and_then(OptionValue::as_i64).unwrap_or(0);
        #[allow(clippy::cast_precision_loss)]
        let score = score_of(input) + bonus as f64 * 0.5;
        write_output(ctx, input, score)
    }
}

/// Reports the `score` metadata of an artifact (1.0 for the input model).
pub fn score_scorer(
    artifact: &ModelArtifact,
    _metric: &Metric,
    _ctx: &ScorerContext<'_>,
) -> Result<Measurement> {
    Ok(Measurement::Values(BTreeMap::from([(
        "score".to_string(),
        score_of(artifact),
    )])))
}

/// Run document over `scale` then `bonus`, exhaustive search, rooted in `dir`.
pub fn document(dir: &Path) -> Value {
    json!({
        "input_model": {
            "type": "ONNXModel",
            "config": {"model_path": dir.join("input.onnx")}
        },
        "evaluators": {
            "quality": {"metrics": [{
                "name": "quality",
                "type": "custom",
                "sub_types": [{"name": "score", "priority": 1}]
            }]}
        },
        "passes": {
            "scale": {"type": "Scale"},
            "bonus": {"type": "Bonus"}
        },
        "pass_flows": [["scale", "bonus"]],
        "engine": {
            "search_strategy": {
                "execution_order": "joint",
                "search_algorithm": "exhaustive",
                "output_model_num": 2
            },
            "evaluator": "quality",
            "cache_dir": dir.join("cache"),
            "output_dir": dir.join("out")
        }
    })
}

pub fn config(doc: &Value) -> RunConfig {
    RunConfig::from_json_str(&doc.to_string()).unwrap()
}

pub fn score(result: Option<&EvaluationResult>) -> f64 {
    result.and_then(|r| r.get("quality-score")).map(|m| m.value).unwrap()
}
