//! Metric scorers - the measuring collaborators
//!
//! A scorer is registered per metric type (or per metric name, which
//! takes precedence) and returns either named values or raw samples.

use super::metric::{Metric, MetricType};
use crate::artifact::ModelArtifact;
use crate::data::DataSource;
use crate::system::{Command, Environment, ExecutionTarget};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Raw output of a scorer.
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    /// One value per sub-type name
    Values(BTreeMap<String, f64>),
    /// Raw samples reduced per sub-type name (`avg`, `p90`, ...)
    Samples(Vec<f64>),
}

/// Everything a scorer may use besides the artifact.
#[derive(Clone, Copy)]
pub struct ScorerContext<'a> {
    /// Where measurements run
    pub target: &'a dyn ExecutionTarget,
    /// Tool command prefix
    pub runner: &'a str,
    /// Data source of the metric being measured
    pub data: Option<&'a dyn DataSource>,
    /// Execution providers to measure with
    pub execution_providers: &'a [String],
}

impl<'a> ScorerContext<'a> {
    /// Context without data.
    #[must_use]
    pub const fn new(target: &'a dyn ExecutionTarget, runner: &'a str) -> Self {
        Self {
            target,
            runner,
            data: None,
            execution_providers: &[],
        }
    }

    /// Same context scoped to one metric's data source.
    #[must_use]
    pub const fn with_data(&self, data: Option<&'a dyn DataSource>) -> Self {
        Self {
            target: self.target,
            runner: self.runner,
            data,
            execution_providers: self.execution_providers,
        }
    }
}

impl std::fmt::Debug for ScorerContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScorerContext")
            .field("target", &self.target.name())
            .field("runner", &self.runner)
            .field("data", &self.data.map(DataSource::name))
            .finish()
    }
}

/// Measures one metric of one artifact.
pub trait MetricScorer: Send + Sync {
    /// Take the measurement.
    ///
    /// # Errors
    /// Returns `Evaluation`, `DataLoader` or `Execution` errors; all are
    /// local to the trial.
    fn measure(
        &self,
        artifact: &ModelArtifact,
        metric: &Metric,
        ctx: &ScorerContext<'_>,
    ) -> Result<Measurement>;
}

impl<F> MetricScorer for F
where
    F: Fn(&ModelArtifact, &Metric, &ScorerContext<'_>) -> Result<Measurement> + Send + Sync,
{
    fn measure(
        &self,
        artifact: &ModelArtifact,
        metric: &Metric,
        ctx: &ScorerContext<'_>,
    ) -> Result<Measurement> {
        self(artifact, metric, ctx)
    }
}

/// Scorers by metric name and metric type.
#[derive(Clone, Default)]
pub struct ScorerRegistry {
    by_name: BTreeMap<String, Arc<dyn MetricScorer>>,
    by_type: BTreeMap<MetricType, Arc<dyn MetricScorer>>,
}

impl ScorerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with [`ToolScorer`] for every metric type.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let tool: Arc<dyn MetricScorer> = Arc::new(ToolScorer);
        for metric_type in [
            MetricType::Accuracy,
            MetricType::Latency,
            MetricType::Throughput,
            MetricType::Custom,
        ] {
            registry.by_type.insert(metric_type, Arc::clone(&tool));
        }
        registry
    }

    /// Register a scorer for a metric type.
    pub fn register_type(&mut self, metric_type: MetricType, scorer: impl MetricScorer + 'static) {
        self.by_type.insert(metric_type, Arc::new(scorer));
    }

    /// Register a scorer for one metric name.
    pub fn register_metric(&mut self, name: impl Into<String>, scorer: impl MetricScorer + 'static) {
        self.by_name.insert(name.into(), Arc::new(scorer));
    }

    /// Scorer for a metric: by name, else by type.
    #[must_use]
    pub fn get(&self, metric: &Metric) -> Option<&Arc<dyn MetricScorer>> {
        self.by_name
            .get(&metric.name)
            .or_else(|| self.by_type.get(&metric.metric_type))
    }
}

impl std::fmt::Debug for ScorerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScorerRegistry")
            .field("metrics", &self.by_name.keys().collect::<Vec<_>>())
            .field("types", &self.by_type.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Scorer driving an external tool:
/// `<runner> evaluate --model <path> --metric <json-file> [--data-config <json-file>]`.
///
/// Stdout must hold a JSON object of sub-type values or an array of samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolScorer;

fn json_file(value: &serde_json::Value) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("passforge-")
        .suffix(".json")
        .tempfile()?;
    serde_json::to_writer(&mut file, value)?;
    file.flush()?;
    Ok(file)
}

impl MetricScorer for ToolScorer {
    fn measure(
        &self,
        artifact: &ModelArtifact,
        metric: &Metric,
        ctx: &ScorerContext<'_>,
    ) -> Result<Measurement> {
        let metric_file = json_file(&serde_json::to_value(metric)?)?;
        let data_file = ctx
            .data
            .map(|data| serde_json::to_value(data.config()).map_err(Error::from).and_then(|v| json_file(&v)))
            .transpose()?;

        let mut command = Command::from_runner(ctx.runner)?
            .arg("evaluate")
            .arg("--model")
            .arg(path_arg(artifact.path()))
            .arg("--metric")
            .arg(path_arg(metric_file.path()));
        if let Some(file) = &data_file {
            command = command.arg("--data-config").arg(path_arg(file.path()));
        }
        for provider in ctx.execution_providers {
            command = command.arg("--execution-provider").arg(provider.clone());
        }

        let output = ctx.target.run(&command, &Environment::new())?;
        if !output.success() {
            return Err(Error::Evaluation(format!(
                "scorer for '{}' exited with {}: {}",
                metric.name,
                output.status_text(),
                output.stderr.trim()
            )));
        }
        parse_measurement(&output.stdout).map_err(|message| {
            Error::Evaluation(format!("scorer for '{}' printed {message}", metric.name))
        })
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn parse_measurement(stdout: &str) -> std::result::Result<Measurement, String> {
    let value: serde_json::Value = serde_json::from_str(stdout.trim())
        .map_err(|e| format!("invalid JSON: {e}"))?;
    match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(name, v)| {
                v.as_f64()
                    .map(|f| (name.clone(), f))
                    .ok_or_else(|| format!("a non-numeric value for '{name}'"))
            })
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()
            .map(Measurement::Values),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| "a non-numeric sample".to_string()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Measurement::Samples),
        other => Err(format!("{other} (expected an object or an array)")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_values_and_samples() {
        assert_eq!(
            parse_measurement(r#"{"accuracy_score": 0.91}"#).unwrap(),
            Measurement::Values(BTreeMap::from([("accuracy_score".to_string(), 0.91)]))
        );
        assert_eq!(
            parse_measurement("[1.5, 2.5]\n").unwrap(),
            Measurement::Samples(vec![1.5, 2.5])
        );
        assert!(parse_measurement("\"fast\"").is_err());
        assert!(parse_measurement(r#"{"avg": "slow"}"#).is_err());
    }

    #[test]
    fn test_registry_prefers_metric_name() {
        let mut registry = ScorerRegistry::with_builtins();
        registry.register_metric("accuracy", |_: &ModelArtifact, _: &Metric, _: &ScorerContext<'_>| {
            Ok(Measurement::Samples(vec![1.0]))
        });
        let accuracy = Metric::new("accuracy", MetricType::Accuracy);
        let other = Metric::new("f1", MetricType::Accuracy);
        assert!(registry.get(&accuracy).is_some());
        assert!(registry.get(&other).is_some());
        assert!(ScorerRegistry::new().get(&other).is_none());
    }

}
