//! Metric declarations and goals

use crate::value::OptionValue;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Comparison epsilon for goal checks.
pub const GOAL_EPSILON: f64 = 1e-9;

/// Metric family; selects the scorer and the `higher_is_better` default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Model quality (higher is better)
    Accuracy,
    /// Inference time (lower is better)
    Latency,
    /// Inferences per unit time (higher is better)
    Throughput,
    /// User defined (higher is better unless stated)
    Custom,
}

impl MetricType {
    /// Default direction.
    #[must_use]
    pub const fn higher_is_better(self) -> bool {
        !matches!(self, Self::Latency)
    }

    /// Name as string
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accuracy => "accuracy",
            Self::Latency => "latency",
            Self::Throughput => "throughput",
            Self::Custom => "custom",
        }
    }
}

/// Goal kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GoalType {
    /// Absolute bound
    Threshold,
    /// Allowed loss as a fraction of the baseline
    MaxDegradation,
    /// Required gain as a fraction of the baseline
    MinImprovement,
    /// Allowed loss in percent of the baseline
    PercentMaxDegradation,
    /// Required gain in percent of the baseline
    PercentMinImprovement,
}

impl GoalType {
    /// Whether the goal is relative to the baseline.
    #[must_use]
    pub const fn needs_baseline(self) -> bool {
        !matches!(self, Self::Threshold)
    }
}

/// Pass/fail criterion of a sub-metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricGoal {
    /// Goal kind
    #[serde(rename = "type")]
    pub goal_type: GoalType,
    /// Bound, fraction or percentage depending on the kind
    pub value: f64,
}

impl MetricGoal {
    /// Value a candidate must reach (or not fall below).
    ///
    /// For higher-is-better metrics the candidate must be `>=` the
    /// target; for lower-is-better metrics `<=`.
    ///
    /// # Errors
    /// Returns `ConfigurationError` for relative goals without a baseline.
    pub fn target(&self, baseline: Option<f64>, higher_is_better: bool) -> Result<f64> {
        let relative = |fraction: f64, improve: bool| -> Result<f64> {
            let b = baseline.ok_or_else(|| {
                Error::config(format!(
                    "goal {:?} needs a baseline; enable evaluate_input_model",
                    self.goal_type
                ))
            })?;
            let delta = b.abs() * fraction;
            // improve: move in the "better" direction, else allow the worse one
            Ok(if improve == higher_is_better { b + delta } else { b - delta })
        };
        match self.goal_type {
            GoalType::Threshold => Ok(self.value),
            GoalType::MaxDegradation => relative(self.value, false),
            GoalType::MinImprovement => relative(self.value, true),
            GoalType::PercentMaxDegradation => relative(self.value / 100.0, false),
            GoalType::PercentMinImprovement => relative(self.value / 100.0, true),
        }
    }

    /// Whether `value` meets the goal.
    ///
    /// # Errors
    /// See [`Self::target`].
    pub fn is_met(&self, value: f64, baseline: Option<f64>, higher_is_better: bool) -> Result<bool> {
        let target = self.target(baseline, higher_is_better)?;
        Ok(if higher_is_better {
            value >= target - GOAL_EPSILON
        } else {
            value <= target + GOAL_EPSILON
        })
    }
}

/// One measured quantity of a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubMetric {
    /// Sub-type name (`accuracy_score`, `avg`, `p90`, ...)
    pub name: String,
    /// Rank for tie-breaking; 1 is highest, `None` is unranked
    #[serde(default)]
    pub priority: Option<u32>,
    /// Direction override
    #[serde(default)]
    pub higher_is_better: Option<bool>,
    /// Pass/fail criterion
    #[serde(default)]
    pub goal: Option<MetricGoal>,
    /// Scorer specific settings
    #[serde(default)]
    pub metric_config: BTreeMap<String, OptionValue>,
}

impl SubMetric {
    /// Sub-metric with no priority or goal.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: None,
            higher_is_better: None,
            goal: None,
            metric_config: BTreeMap::new(),
        }
    }

    /// Set the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set the goal.
    #[must_use]
    pub const fn with_goal(mut self, goal_type: GoalType, value: f64) -> Self {
        self.goal = Some(MetricGoal { goal_type, value });
        self
    }

    /// Set the direction.
    #[must_use]
    pub const fn with_higher_is_better(mut self, higher_is_better: bool) -> Self {
        self.higher_is_better = Some(higher_is_better);
        self
    }
}

/// A declared metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metric {
    /// Metric name
    pub name: String,
    /// Metric family
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    /// Measured sub-types
    pub sub_types: Vec<SubMetric>,
    /// Data config name or inline definition
    #[serde(default)]
    pub data_config: Option<OptionValue>,
    /// Scorer specific settings
    #[serde(default)]
    pub user_config: BTreeMap<String, OptionValue>,
}

impl Metric {
    /// Metric without sub-types.
    pub fn new(name: impl Into<String>, metric_type: MetricType) -> Self {
        Self {
            name: name.into(),
            metric_type,
            sub_types: Vec::new(),
            data_config: None,
            user_config: BTreeMap::new(),
        }
    }

    /// Add a sub-type.
    #[must_use]
    pub fn sub_type(mut self, sub: SubMetric) -> Self {
        self.sub_types.push(sub);
        self
    }

    /// Set the data config reference.
    #[must_use]
    pub fn with_data_config(mut self, reference: impl Into<OptionValue>) -> Self {
        self.data_config = Some(reference.into());
        self
    }

    /// Result key of a sub-type: `"<metric>-<sub>"`.
    #[must_use]
    pub fn key(&self, sub: &SubMetric) -> String {
        format!("{}-{}", self.name, sub.name)
    }

    /// Effective direction of a sub-type.
    #[must_use]
    pub fn higher_is_better(&self, sub: &SubMetric) -> bool {
        sub.higher_is_better
            .unwrap_or_else(|| self.metric_type.higher_is_better())
    }
}

/// Check metric declarations of one evaluator.
///
/// # Errors
/// Returns `ConfigurationError` for metrics without sub-types, duplicate
/// result keys, priorities of 0 or duplicate priorities.
pub fn validate_metrics(metrics: &[Metric]) -> Result<()> {
    let mut keys: Vec<String> = Vec::new();
    let mut priorities: Vec<u32> = Vec::new();
    for metric in metrics {
        if metric.sub_types.is_empty() {
            return Err(Error::config(format!(
                "metric '{}' declares no sub_types",
                metric.name
            )));
        }
        for sub in &metric.sub_types {
            let key = metric.key(sub);
            if keys.contains(&key) {
                return Err(Error::config(format!("metric '{key}' is declared twice")));
            }
            keys.push(key);
            if let Some(priority) = sub.priority {
                if priority == 0 {
                    return Err(Error::config(format!(
                        "metric '{}' has priority 0; priorities start at 1",
                        metric.key(sub)
                    )));
                }
                if priorities.contains(&priority) {
                    return Err(Error::config(format!(
                        "priority {priority} is used by more than one metric"
                    )));
                }
                priorities.push(priority);
            }
        }
    }
    Ok(())
}
