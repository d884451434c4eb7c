//! Evaluator - metric measurement, goals and ranking
//!
//! An [`Evaluator`] runs every declared metric against an artifact through
//! a [`MetricScorer`] and reduces the measurement to one value per
//! sub-type. Results are keyed `"<metric>-<sub_type>"`.
//!
//! Goals are applied separately ([`EvaluationResult::with_goals`]) so a
//! cached raw result can be re-judged against a new baseline.
//!
//! ## Ranking
//!
//! [`EvaluationResult::compare`] walks ranked sub-metrics by priority
//! (1 first):
//! 1. if exactly one side meets the goal, it wins
//! 2. if both meet the goal, move on to the next priority
//! 3. otherwise the better value wins when it differs by more than
//!    [`GOAL_EPSILON`], else move on
//!
//! Results equal on every level compare `Equal`; callers keep the earlier
//! trial.

mod aggregate;
mod metric;
mod scorer;

pub use aggregate::{aggregate, is_aggregation, AGGREGATIONS};
pub use metric::{validate_metrics, GoalType, Metric, MetricGoal, MetricType, SubMetric, GOAL_EPSILON};
pub use scorer::{Measurement, MetricScorer, ScorerContext, ScorerRegistry, ToolScorer};

use crate::artifact::ModelArtifact;
use crate::data::DataSource;
use crate::hash::Fingerprint;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// One measured sub-metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    /// Measured value
    pub value: f64,
    /// Rank (1 highest); `None` is unranked
    #[serde(default)]
    pub priority: Option<u32>,
    /// Direction
    pub higher_is_better: bool,
    /// Goal verdict; `None` when the sub-metric has no goal
    #[serde(default)]
    pub goal_met: Option<bool>,
}

impl MetricValue {
    /// Value without a goal verdict.
    #[must_use]
    pub const fn new(value: f64, priority: Option<u32>, higher_is_better: bool) -> Self {
        Self {
            value,
            priority,
            higher_is_better,
            goal_met: None,
        }
    }

    /// Value oriented so that larger is better.
    #[must_use]
    pub fn signed(&self) -> f64 {
        if self.higher_is_better {
            self.value
        } else {
            -self.value
        }
    }
}

/// Sub-metric values of one artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvaluationResult {
    metrics: BTreeMap<String, MetricValue>,
}

impl EvaluationResult {
    /// Empty result.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            metrics: BTreeMap::new(),
        }
    }

    /// Insert a sub-metric value.
    pub fn insert(&mut self, key: impl Into<String>, value: MetricValue) {
        self.metrics.insert(key.into(), value);
    }

    /// Look up a sub-metric.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&MetricValue> {
        self.metrics.get(key)
    }

    /// Iterate sub-metrics by key.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &MetricValue)> {
        self.metrics.iter()
    }

    /// Number of sub-metrics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Whether no sub-metric was measured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Whether any sub-metric carries a goal verdict.
    #[must_use]
    pub fn has_goals(&self) -> bool {
        self.metrics.values().any(|m| m.goal_met.is_some())
    }

    /// Whether every goal is met (vacuously true without goals).
    #[must_use]
    pub fn all_goals_met(&self) -> bool {
        self.metrics.values().all(|m| m.goal_met != Some(false))
    }

    /// Ranked sub-metric keys, highest priority first.
    #[must_use]
    pub fn ranked_keys(&self) -> Vec<&str> {
        let mut ranked: Vec<(u32, &str)> = self
            .metrics
            .iter()
            .filter_map(|(key, m)| m.priority.map(|p| (p, key.as_str())))
            .collect();
        ranked.sort_unstable();
        ranked.into_iter().map(|(_, key)| key).collect()
    }

    /// Copy with goal verdicts computed against `baseline`.
    ///
    /// # Errors
    /// Returns `ConfigurationError` for relative goals whose baseline
    /// value is missing.
    pub fn with_goals(&self, metrics: &[Metric], baseline: Option<&Self>) -> Result<Self> {
        let mut judged = self.clone();
        for metric in metrics {
            for sub in &metric.sub_types {
                let key = metric.key(sub);
                let Some(goal) = &sub.goal else {
                    continue;
                };
                let Some(entry) = judged.metrics.get_mut(&key) else {
                    continue;
                };
                let base = baseline.and_then(|b| b.get(&key)).map(|m| m.value);
                entry.goal_met = Some(goal.is_met(entry.value, base, entry.higher_is_better)?);
            }
        }
        Ok(judged)
    }

    /// Deciding level against `other`: ordering and margin (in signed
    /// units, infinite for a goal verdict).
    fn decide(&self, other: &Self) -> (Ordering, f64) {
        for key in self.ranked_keys() {
            let Some(mine) = self.get(key) else {
                continue;
            };
            let Some(theirs) = other.get(key) else {
                return (Ordering::Greater, f64::INFINITY);
            };
            match (mine.goal_met, theirs.goal_met) {
                (Some(true), Some(false)) => return (Ordering::Greater, f64::INFINITY),
                (Some(false), Some(true)) => return (Ordering::Less, f64::INFINITY),
                (Some(true), Some(true)) => continue,
                _ => {}
            }
            let margin = mine.signed() - theirs.signed();
            if margin > GOAL_EPSILON {
                return (Ordering::Greater, margin);
            }
            if margin < -GOAL_EPSILON {
                return (Ordering::Less, -margin);
            }
        }
        (Ordering::Equal, 0.0)
    }

    /// Rank against `other`; `Greater` means `self` is better.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        self.decide(other).0
    }

    /// Whether `self` beats `other` by more than `tolerance` on the
    /// deciding sub-metric. A goal verdict always counts.
    #[must_use]
    pub fn improves_on(&self, other: &Self, tolerance: f64) -> bool {
        match self.decide(other) {
            (Ordering::Greater, margin) => margin > tolerance,
            _ => false,
        }
    }
}

/// Metric with its resolved data source.
#[derive(Debug, Clone)]
pub struct EvaluatorMetric {
    /// Declaration
    pub metric: Metric,
    /// Source resolved from `metric.data_config`
    pub data: Option<Arc<dyn DataSource>>,
}

/// Runs declared metrics through registered scorers.
#[derive(Debug, Clone)]
pub struct Evaluator {
    metrics: Vec<EvaluatorMetric>,
    scorers: ScorerRegistry,
    fingerprint: Fingerprint,
}

impl Evaluator {
    /// Build an evaluator.
    ///
    /// # Errors
    /// Returns `ConfigurationError` for invalid metric declarations or
    /// metric types without a registered scorer.
    pub fn new(metrics: Vec<EvaluatorMetric>, scorers: ScorerRegistry) -> Result<Self> {
        let declared: Vec<Metric> = metrics.iter().map(|m| m.metric.clone()).collect();
        validate_metrics(&declared)?;
        for metric in &declared {
            if scorers.get(metric).is_none() {
                return Err(Error::config(format!(
                    "no scorer registered for metric '{}' of type {}",
                    metric.name,
                    metric.metric_type.as_str()
                )));
            }
        }
        let fingerprint = Fingerprint::of_parts(&[
            "evaluator",
            &serde_json::to_string(&declared)?,
        ]);
        Ok(Self {
            metrics,
            scorers,
            fingerprint,
        })
    }

    /// Declared metrics.
    #[must_use]
    pub fn metrics(&self) -> Vec<Metric> {
        self.metrics.iter().map(|m| m.metric.clone()).collect()
    }

    /// Fingerprint of the metric declarations (evaluation cache key part).
    #[must_use]
    pub const fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Whether any goal needs a baseline.
    #[must_use]
    pub fn needs_baseline(&self) -> bool {
        self.metrics.iter().any(|m| {
            m.metric
                .sub_types
                .iter()
                .any(|s| s.goal.is_some_and(|g| g.goal_type.needs_baseline()))
        })
    }

    /// Measure every metric (no goal verdicts).
    ///
    /// # Errors
    /// Returns `Evaluation` (or a data/execution error) when a scorer
    /// fails or does not produce a declared sub-type.
    pub fn evaluate(&self, artifact: &ModelArtifact, ctx: &ScorerContext<'_>) -> Result<EvaluationResult> {
        let mut result = EvaluationResult::new();
        for entry in &self.metrics {
            let metric = &entry.metric;
            let scorer = self.scorers.get(metric).ok_or_else(|| {
                Error::Evaluation(format!("no scorer for metric '{}'", metric.name))
            })?;
            let scoped = ctx.with_data(entry.data.as_deref());
            let measurement = scorer.measure(artifact, metric, &scoped)?;
            for sub in &metric.sub_types {
                let value = match &measurement {
                    Measurement::Values(values) => values.get(&sub.name).copied().ok_or_else(|| {
                        Error::Evaluation(format!(
                            "scorer for '{}' returned no value for sub-type '{}'",
                            metric.name, sub.name
                        ))
                    })?,
                    Measurement::Samples(samples) => aggregate(&sub.name, samples)?,
                };
                if !value.is_finite() {
                    return Err(Error::Evaluation(format!(
                        "metric '{}' is not finite ({value})",
                        metric.key(sub)
                    )));
                }
                result.insert(
                    metric.key(sub),
                    MetricValue::new(value, sub.priority, metric.higher_is_better(sub)),
                );
            }
            debug!(metric = %metric.name, artifact = %artifact.id().to_short(), "measured");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(pairs: &[(&str, f64, u32, bool, Option<bool>)]) -> EvaluationResult {
        let mut r = EvaluationResult::new();
        for (key, value, priority, hib, met) in pairs {
            let mut m = MetricValue::new(*value, Some(*priority), *hib);
            m.goal_met = *met;
            r.insert(*key, m);
        }
        r
    }

    #[test]
    fn test_goal_verdict_beats_value() {
        let a = result(&[("acc", 0.80, 1, true, Some(true)), ("lat", 50.0, 2, false, None)]);
        let b = result(&[("acc", 0.79, 1, true, Some(false)), ("lat", 10.0, 2, false, None)]);
        assert_eq!(a.compare(&b), Ordering::Greater);
    }

    #[test]
    fn test_lower_priority_decides_when_both_meet_goal() {
        let a = result(&[("acc", 0.86, 1, true, Some(true)), ("lat", 20.0, 2, false, None)]);
        let b = result(&[("acc", 0.90, 1, true, Some(true)), ("lat", 30.0, 2, false, None)]);
        assert_eq!(a.compare(&b), Ordering::Greater);
        assert_eq!(b.compare(&a), Ordering::Less);
    }

    #[test]
    fn test_value_decides_without_goals() {
        let a = result(&[("acc", 0.86, 1, true, None), ("lat", 10.0, 2, false, None)]);
        let b = result(&[("acc", 0.90, 1, true, None), ("lat", 30.0, 2, false, None)]);
        assert_eq!(b.compare(&a), Ordering::Greater);
    }

    #[test]
    fn test_equal_results() {
        let a = result(&[("acc", 0.9, 1, true, None)]);
        assert_eq!(a.compare(&a.clone()), Ordering::Equal);
        assert!(!a.improves_on(&a.clone(), 0.0));
    }

    #[test]
    fn test_improvement_tolerance() {
        let a = result(&[("acc", 0.905, 1, true, None)]);
        let b = result(&[("acc", 0.900, 1, true, None)]);
        assert!(a.improves_on(&b, 0.001));
        assert!(!a.improves_on(&b, 0.01));
    }

    #[test]
    fn test_with_goals_against_baseline() {
        let metrics = vec![Metric::new("accuracy", MetricType::Accuracy).sub_type(
            SubMetric::new("score")
                .with_priority(1)
                .with_goal(GoalType::MaxDegradation, 0.05),
        )];
        let baseline = result(&[("accuracy-score", 0.90, 1, true, None)]);
        let pass = result(&[("accuracy-score", 0.855, 1, true, None)]);
        let fail = result(&[("accuracy-score", 0.85, 1, true, None)]);
        assert_eq!(
            pass.with_goals(&metrics, Some(&baseline)).unwrap().get("accuracy-score").unwrap().goal_met,
            Some(true)
        );
        assert_eq!(
            fail.with_goals(&metrics, Some(&baseline)).unwrap().get("accuracy-score").unwrap().goal_met,
            Some(false)
        );
        assert!(pass.with_goals(&metrics, None).is_err());
    }

    #[test]
    fn test_serialization_is_flat_map() {
        let r = result(&[("acc", 0.5, 1, true, None)]);
        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("acc").is_some());
    }
}
