//! Optimize Pipeline: prune then quantize a model, keep the best two
//!
//! Both passes run in-process and only record what they would do in the
//! artifact metadata. A scorer closure turns that metadata into accuracy
//! and latency, so the whole search runs without external tools.
//!
//! Accuracy (priority 1) may degrade at most 2% from the input model;
//! among candidates meeting that goal, average latency (priority 2) decides.
//!
//! Run with: cargo run --example optimize_pipeline

use anyhow::{Context, Result};
use passforge::config::RunConfig;
use passforge::evaluator::{Measurement, Metric, ScorerContext};
use passforge::pass::{Pass, PassContext, PassOptionSpec, PassSchema, ResolvedConfig};
use passforge::search::SearchParameter;
use passforge::{Engine, ModelArtifact, OptionValue};
use std::collections::BTreeMap;

fn meta(artifact: &ModelArtifact, key: &str, default: f64) -> f64 {
    artifact
        .metadata()
        .get(key)
        .and_then(OptionValue::as_f64)
        .unwrap_or(default)
}

fn emit(
    ctx: &PassContext<'_>,
    input: &ModelArtifact,
    sparsity: f64,
    bits: f64,
) -> passforge::Result<ModelArtifact> {
    let path = ctx.output_dir.join("model.onnx");
    std::fs::write(&path, format!("sparsity={sparsity} bits={bits}"))?;
    Ok(ModelArtifact::new(input.id(), path, input.format().clone())
        .with_metadata("sparsity", sparsity)
        .with_metadata("bits", bits))
}

struct Prune {
    schema: PassSchema,
}

impl Pass for Prune {
    fn pass_type(&self) -> &str {
        "Prune"
    }

    fn schema(&self) -> &PassSchema {
        &self.schema
    }

    fn run(
        &self,
        input: &ModelArtifact,
        config: &ResolvedConfig,
        ctx: &PassContext<'_>,
    ) -> passforge::Result<ModelArtifact> {
        let sparsity = config.get("sparsity").and_then(OptionValue::as_f64).unwrap_or(0.0);
        emit(ctx, input, sparsity, meta(input, "bits", 32.0))
    }
}

struct Quantize {
    schema: PassSchema,
}

impl Pass for Quantize {
    fn pass_type(&self) -> &str {
        "Quantize"
    }

    fn schema(&self) -> &PassSchema {
        &self.schema
    }

    fn validate_search_point(&self, config: &ResolvedConfig) -> bool {
        // 4-bit kernels only exist for per-channel weights
        config.get("bits").and_then(OptionValue::as_i64) != Some(4)
            || config.get("per_channel").and_then(OptionValue::as_bool) == Some(true)
    }

    fn run(
        &self,
        input: &ModelArtifact,
        config: &ResolvedConfig,
        ctx: &PassContext<'_>,
    ) -> passforge::Result<ModelArtifact> {
        let bits = config.get("bits").and_then(OptionValue::as_f64).unwrap_or(8.0);
        emit(ctx, input, meta(input, "sparsity", 0.0), bits)
    }
}

fn simulated_scorer(
    artifact: &ModelArtifact,
    metric: &Metric,
    _ctx: &ScorerContext<'_>,
) -> passforge::Result<Measurement> {
    let sparsity = meta(artifact, "sparsity", 0.0);
    let bits = meta(artifact, "bits", 32.0);
    let values = match metric.name.as_str() {
        "accuracy" => {
            let loss = sparsity * sparsity * 0.2 + (32.0 - bits) / 32.0 * 0.015;
            BTreeMap::from([("accuracy_score".to_string(), 0.91 - loss)])
        }
        _ => {
            let avg = 20.0 * (1.0 - sparsity * 0.6) * (bits / 32.0).max(0.25);
            BTreeMap::from([("avg".to_string(), avg)])
        }
    };
    Ok(Measurement::Values(values))
}

fn main() -> Result<()> {
    passforge::logging::init_logging("passforge=info");

    let workdir = tempfile::tempdir().context("creating work directory")?;
    let input = workdir.path().join("resnet.onnx");
    std::fs::write(&input, "fp32 weights").context("writing input model")?;

    let doc = serde_json::json!({
        "input_model": {"type": "ONNXModel", "config": {"model_path": input}},
        "evaluators": {
            "sim": {"metrics": [
                {"name": "accuracy", "type": "accuracy", "sub_types": [
                    {"name": "accuracy_score", "priority": 1,
                     "goal": {"type": "percent-max-degradation", "value": 2.0}}
                ]},
                {"name": "latency", "type": "latency", "sub_types": [
                    {"name": "avg", "priority": 2}
                ]}
            ]}
        },
        "passes": {
            "prune": {"type": "Prune"},
            "quantize": {"type": "Quantize"}
        },
        "pass_flows": [["prune", "quantize"]],
        "engine": {
            "search_strategy": {"search_algorithm": "exhaustive", "output_model_num": 2},
            "evaluator": "sim",
            "num_workers": 2,
            "cache_dir": workdir.path().join("cache"),
            "output_dir": workdir.path().join("models")
        }
    });
    let config = RunConfig::from_json_str(&doc.to_string())?;

    let prune = Prune {
        schema: PassSchema::new().option(
            PassOptionSpec::new("sparsity", 0.0)
                .searchable(SearchParameter::categorical([0.0, 0.25, 0.5])),
        ),
    };
    let quantize = Quantize {
        schema: PassSchema::new()
            .option(PassOptionSpec::new("bits", 8i64).searchable(SearchParameter::categorical([4i64, 8, 16])))
            .option(PassOptionSpec::new("per_channel", false).searchable(SearchParameter::categorical([false, true]))),
    };

    let engine = Engine::builder(config)
        .pass(prune)
        .pass(quantize)
        .scorer(passforge::evaluator::MetricType::Accuracy, simulated_scorer)
        .scorer(passforge::evaluator::MetricType::Latency, simulated_scorer)
        .build()?;
    let outcome = engine.run()?;

    println!("=== Passforge: prune + quantize ===\n");
    println!("Trials: {}  state: {:?}", outcome.records.len(), outcome.state);
    println!(
        "Cache: {} hits, {} misses\n",
        outcome.cache.hits, outcome.cache.misses
    );
    for (record, dir) in outcome.best.iter().zip(&outcome.output_models) {
        println!("{}", record.point());
        if let Some(evaluation) = record.evaluation() {
            for (key, metric) in evaluation.iter() {
                println!("  {key:<24} {:>8.4}  goal met: {:?}", metric.value, metric.goal_met);
            }
        }
        println!("  saved to {}\n", dir.display());
    }
    println!("Manifest: {}", outcome.manifest_path.display());
    Ok(())
}
