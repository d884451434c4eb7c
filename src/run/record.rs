//! Run Record - one trial of one search point

use crate::artifact::ModelArtifact;
use crate::evaluator::EvaluationResult;
use crate::executor::StepOutcome;
use crate::hash::Fingerprint;
use crate::search::SearchPoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Flow ran and the artifact was evaluated
    Success,
    /// A pass or the evaluation failed
    Failed,
    /// The point was rejected by a pass before execution
    Invalid,
}

/// Association of a search point with its artifact and evaluation.
///
/// Records are never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    trial: usize,
    fingerprint: Fingerprint,
    flow: String,
    point: SearchPoint,
    status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    artifact: Option<ModelArtifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    evaluation: Option<EvaluationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    goals_met: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default)]
    steps: Vec<StepOutcome>,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
}

impl RunRecord {
    /// Create a builder for the trial numbered `trial`.
    #[must_use]
    pub fn builder(trial: usize, point: SearchPoint) -> RunRecordBuilder {
        RunRecordBuilder::new(trial, point)
    }

    /// Trial number (proposal order, from 0)
    #[must_use]
    pub const fn trial(&self) -> usize {
        self.trial
    }

    /// Search point fingerprint
    #[must_use]
    pub const fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Flow identity
    #[must_use]
    pub fn flow(&self) -> &str {
        &self.flow
    }

    /// Evaluated search point
    #[must_use]
    pub const fn point(&self) -> &SearchPoint {
        &self.point
    }

    /// Trial outcome
    #[must_use]
    pub const fn status(&self) -> RunStatus {
        self.status
    }

    /// Whether the trial succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    /// Final artifact (successful trials)
    #[must_use]
    pub const fn artifact(&self) -> Option<&ModelArtifact> {
        self.artifact.as_ref()
    }

    /// Evaluation with goal verdicts (successful trials)
    #[must_use]
    pub const fn evaluation(&self) -> Option<&EvaluationResult> {
        self.evaluation.as_ref()
    }

    /// Whether every goal was met (`None` without goals)
    #[must_use]
    pub const fn goals_met(&self) -> Option<bool> {
        self.goals_met
    }

    /// Failure or rejection cause
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Per-step cache outcomes
    #[must_use]
    pub fn steps(&self) -> &[StepOutcome] {
        &self.steps
    }

    /// Trial start time
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Trial end time
    #[must_use]
    pub const fn ended_at(&self) -> DateTime<Utc> {
        self.ended_at
    }
}

/// Builder for [`RunRecord`].
#[derive(Debug, Clone)]
pub struct RunRecordBuilder {
    trial: usize,
    point: SearchPoint,
    status: RunStatus,
    artifact: Option<ModelArtifact>,
    evaluation: Option<EvaluationResult>,
    error: Option<String>,
    steps: Vec<StepOutcome>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl RunRecordBuilder {
    /// Start a record; the start time is now.
    #[must_use]
    pub fn new(trial: usize, point: SearchPoint) -> Self {
        Self {
            trial,
            point,
            status: RunStatus::Failed,
            artifact: None,
            evaluation: None,
            error: None,
            steps: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Override the start time.
    #[must_use]
    pub const fn started_at(mut self, time: DateTime<Utc>) -> Self {
        self.started_at = time;
        self
    }

    /// Set the end time (defaults to build time).
    #[must_use]
    pub const fn ended_at(mut self, time: DateTime<Utc>) -> Self {
        self.ended_at = Some(time);
        self
    }

    /// Per-step cache outcomes.
    #[must_use]
    pub fn steps(mut self, steps: Vec<StepOutcome>) -> Self {
        self.steps = steps;
        self
    }

    /// Mark successful.
    #[must_use]
    pub fn success(mut self, artifact: ModelArtifact, evaluation: EvaluationResult) -> Self {
        self.status = RunStatus::Success;
        self.artifact = Some(artifact);
        self.evaluation = Some(evaluation);
        self.error = None;
        self
    }

    /// Mark failed with a cause.
    #[must_use]
    pub fn failed(mut self, cause: impl Into<String>) -> Self {
        self.status = RunStatus::Failed;
        self.error = Some(cause.into());
        self
    }

    /// Mark rejected before execution.
    #[must_use]
    pub fn invalid(mut self, reason: impl Into<String>) -> Self {
        self.status = RunStatus::Invalid;
        self.error = Some(reason.into());
        self
    }

    /// Build the record.
    #[must_use]
    pub fn build(self) -> RunRecord {
        let goals_met = self
            .evaluation
            .as_ref()
            .filter(|e| e.has_goals())
            .map(EvaluationResult::all_goals_met);
        RunRecord {
            trial: self.trial,
            fingerprint: self.point.fingerprint(),
            flow: self.point.flow().to_string(),
            point: self.point,
            status: self.status,
            artifact: self.artifact,
            evaluation: self.evaluation,
            goals_met,
            error: self.error,
            steps: self.steps,
            started_at: self.started_at,
            ended_at: self.ended_at.unwrap_or_else(Utc::now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ModelFormat;
    use crate::evaluator::MetricValue;
    use crate::search::PassValues;

    fn point() -> SearchPoint {
        SearchPoint::new("conversion-quantization".to_string(), PassValues::new())
    }

    #[test]
    fn test_builder_defaults_to_failed() {
        let record = RunRecord::builder(0, point()).failed("boom").build();
        assert_eq!(record.status(), RunStatus::Failed);
        assert_eq!(record.error(), Some("boom"));
        assert!(record.artifact().is_none());
        assert_eq!(record.flow(), "conversion-quantization");
        assert_eq!(record.fingerprint(), point().fingerprint());
    }

    #[test]
    fn test_success_records_goal_verdict() {
        let mut evaluation = EvaluationResult::new();
        let mut value = MetricValue::new(0.9, Some(1), true);
        value.goal_met = Some(true);
        evaluation.insert("accuracy-accuracy_score", value);
        let artifact = ModelArtifact::new(Fingerprint::of_bytes(b"a"), "m.onnx", ModelFormat::Onnx);

        let record = RunRecord::builder(3, point())
            .success(artifact.clone(), evaluation)
            .build();
        assert!(record.is_success());
        assert_eq!(record.goals_met(), Some(true));
        assert_eq!(record.artifact(), Some(&artifact));
        assert!(record.ended_at() >= record.started_at());
    }

    #[test]
    fn test_status_serialization() {
        let record = RunRecord::builder(1, point()).invalid("rejected").build();
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "invalid");
        assert!(json.get("artifact").is_none());
        let back: RunRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
