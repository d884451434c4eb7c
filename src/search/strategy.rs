//! Search Strategy - sampling loop state machine
//!
//! `Init -> Sampling -> Converged | Exhausted | Stopped`
//!
//! - `Init`: stages are planned and every stage space is validated.
//! - `Sampling`: `next_batch` hands out points, `record` feeds results back.
//! - `Converged`: `patience` consecutive trials without an improvement
//!   beyond `tolerance`, or (`stop_when_goals_met`) the best result meets
//!   every goal.
//! - `Exhausted`: every stage ran out of points or budget (`num_samples`
//!   per stage, `max_iter`, `max_time`).
//! - `Stopped`: cancelled from outside.
//!
//! With `execution_order: joint` there is one stage over the whole space.
//! With `pass-by-pass` each tunable pass of each flow gets its own stage,
//! other passes held at the best values found so far (or their defaults).

use super::{AlgorithmRegistry, FlowSpace, SearchAlgorithm, SearchPoint, SearchSpace, Trial};
use crate::config::{ExecutionOrder, SearchStrategyConfig};
use crate::evaluator::EvaluationResult;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Search lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchState {
    /// Planned, no point handed out yet
    Init,
    /// Handing out points
    Sampling,
    /// No improvement within patience, or goals met
    Converged,
    /// Space or budget used up
    Exhausted,
    /// Cancelled
    Stopped,
}

impl SearchState {
    /// Whether no more points will be proposed.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Converged | Self::Exhausted | Self::Stopped)
    }
}

/// What a sampling stage tunes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageInfo {
    /// Stage position
    pub index: usize,
    /// Flow tuned (`None` for the joint stage over all flows)
    pub flow: Option<String>,
    /// Pass tuned (`None` when all passes are tuned together)
    pub pass: Option<String>,
}

/// Outcome of one trial fed back to the strategy.
#[derive(Debug, Clone, Copy)]
pub enum TrialFeedback<'a> {
    /// Evaluated, goals applied
    Evaluated(&'a EvaluationResult),
    /// A pass or the evaluation failed
    Failed,
    /// The point was rejected before execution
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StagePlan {
    Joint,
    Flow(String),
    Pass { flow: String, pass: String },
}

/// Sampling loop over a [`SearchSpace`].
pub struct SearchStrategy {
    config: SearchStrategyConfig,
    registry: AlgorithmRegistry,
    space: SearchSpace,
    plan: Vec<StagePlan>,
    stage: usize,
    algorithm: Option<Box<dyn SearchAlgorithm>>,
    state: SearchState,
    stage_history: Vec<Trial>,
    history: Vec<Trial>,
    stage_proposed: usize,
    proposed: usize,
    in_flight: usize,
    best: Option<(SearchPoint, EvaluationResult)>,
    stale: usize,
    started: Option<Instant>,
}

impl SearchStrategy {
    /// Plan stages and validate each stage space against the algorithm.
    ///
    /// # Errors
    /// Returns `ConfigurationError` for unknown algorithms, spaces the
    /// algorithm cannot handle, or unbounded searches without `num_samples`.
    pub fn new(
        config: SearchStrategyConfig,
        registry: AlgorithmRegistry,
        space: SearchSpace,
    ) -> Result<Self> {
        let plan = plan_stages(&config, &space);
        let strategy = Self {
            config,
            registry,
            space,
            plan,
            stage: 0,
            algorithm: None,
            state: SearchState::Init,
            stage_history: Vec::new(),
            history: Vec::new(),
            stage_proposed: 0,
            proposed: 0,
            in_flight: 0,
            best: None,
            stale: 0,
            started: None,
        };
        for index in 0..strategy.plan.len() {
            let stage_space = strategy.stage_space(index);
            let bounded = strategy.config.search_algorithm_config.num_samples.is_some()
                || stage_space.cardinality().is_some()
                || strategy.config.max_iter.is_some();
            if !bounded {
                return Err(Error::config(format!(
                    "search algorithm '{}' over a continuous space needs search_algorithm_config.num_samples or max_iter",
                    strategy.config.search_algorithm
                )));
            }
            strategy.registry.build(
                &strategy.config.search_algorithm,
                stage_space,
                &strategy.config.search_algorithm_config,
            )?;
        }
        Ok(strategy)
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> SearchState {
        self.state
    }

    /// Every completed trial, in completion order.
    #[must_use]
    pub fn history(&self) -> &[Trial] {
        &self.history
    }

    /// Best point and result so far.
    #[must_use]
    pub fn best(&self) -> Option<(&SearchPoint, &EvaluationResult)> {
        self.best.as_ref().map(|(p, r)| (p, r))
    }

    /// Number of points handed out.
    #[must_use]
    pub const fn proposed(&self) -> usize {
        self.proposed
    }

    /// Number of planned stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.plan.len()
    }

    /// Current stage description (`None` before sampling or when done).
    #[must_use]
    pub fn stage_info(&self) -> Option<StageInfo> {
        if self.state != SearchState::Sampling {
            return None;
        }
        self.plan.get(self.stage).map(|plan| {
            let (flow, pass) = match plan {
                StagePlan::Joint => (None, None),
                StagePlan::Flow(flow) => (Some(flow.clone()), None),
                StagePlan::Pass { flow, pass } => (Some(flow.clone()), Some(pass.clone())),
            };
            StageInfo {
                index: self.stage,
                flow,
                pass,
            }
        })
    }

    /// Cancel: no further points are proposed.
    pub fn stop(&mut self) {
        if !self.state.is_terminal() {
            info!(proposed = self.proposed, "search stopped");
            self.state = SearchState::Stopped;
        }
    }

    /// Hand out up to `n` points.
    ///
    /// Returns fewer (possibly zero) points when the current stage must
    /// drain before the next one can be planned, or the search is over.
    ///
    /// # Errors
    /// Returns `ConfigurationError` if a stage algorithm cannot be built.
    pub fn next_batch(&mut self, n: usize) -> Result<Vec<SearchPoint>> {
        if self.state == SearchState::Init {
            self.started = Some(Instant::now());
            self.state = SearchState::Sampling;
            self.enter_stage(0)?;
        }

        let mut batch = Vec::with_capacity(n);
        while batch.len() < n && self.state == SearchState::Sampling {
            if self.budget_spent() {
                info!(proposed = self.proposed, "search budget exhausted");
                self.state = SearchState::Exhausted;
                break;
            }

            let stage_full = self
                .config
                .search_algorithm_config
                .num_samples
                .is_some_and(|limit| self.stage_proposed >= limit);
            let proposal = if stage_full {
                None
            } else {
                self.algorithm
                    .as_mut()
                    .and_then(|algorithm| algorithm.propose(&self.stage_history))
            };

            match proposal {
                Some(point) => {
                    debug!(point = %point, stage = self.stage, "proposed");
                    self.stage_proposed += 1;
                    self.proposed += 1;
                    self.in_flight += 1;
                    batch.push(point);
                }
                None if self.in_flight > 0 || !batch.is_empty() => break,
                None => self.enter_stage(self.stage + 1)?,
            }
        }
        Ok(batch)
    }

    /// Feed back one completed trial.
    pub fn record(&mut self, point: &SearchPoint, feedback: TrialFeedback<'_>) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let result = match feedback {
            TrialFeedback::Evaluated(result) => Some(result.clone()),
            TrialFeedback::Failed | TrialFeedback::Invalid => None,
        };
        if let Some(algorithm) = self.algorithm.as_mut() {
            algorithm.update(point, result.as_ref());
        }

        match (&result, &self.best) {
            (Some(new), None) => {
                self.best = Some((point.clone(), new.clone()));
                self.stale = 0;
            }
            (Some(new), Some((_, best))) => {
                if new.improves_on(best, self.config.tolerance) {
                    self.best = Some((point.clone(), new.clone()));
                    self.stale = 0;
                } else {
                    if new.compare(best).is_gt() {
                        self.best = Some((point.clone(), new.clone()));
                    }
                    self.stale += 1;
                }
            }
            (None, _) => {
                if matches!(feedback, TrialFeedback::Failed) {
                    self.stale += 1;
                }
            }
        }

        let trial = Trial {
            point: point.clone(),
            result,
        };
        self.stage_history.push(trial.clone());
        self.history.push(trial);

        if self.state != SearchState::Sampling {
            return;
        }
        if self.config.patience.is_some_and(|p| p > 0 && self.stale >= p) {
            info!(stale = self.stale, "search converged: no improvement within patience");
            self.state = SearchState::Converged;
        } else if self.config.stop_when_goals_met
            && self.best.as_ref().is_some_and(|(_, r)| r.has_goals() && r.all_goals_met())
        {
            info!("search converged: all goals met");
            self.state = SearchState::Converged;
        }
    }

    fn budget_spent(&self) -> bool {
        if self.config.max_iter.is_some_and(|limit| self.proposed >= limit) {
            return true;
        }
        match (self.config.max_time, self.started) {
            (Some(seconds), Some(started)) => {
                started.elapsed() >= Duration::from_secs_f64(seconds.max(0.0))
            }
            _ => false,
        }
    }

    fn enter_stage(&mut self, index: usize) -> Result<()> {
        if index >= self.plan.len() {
            info!(proposed = self.proposed, "search space exhausted");
            self.algorithm = None;
            self.state = SearchState::Exhausted;
            return Ok(());
        }
        let space = self.stage_space(index);
        self.algorithm = Some(self.registry.build(
            &self.config.search_algorithm,
            space,
            &self.config.search_algorithm_config,
        )?);
        self.stage = index;
        self.stage_proposed = 0;
        self.stage_history.clear();
        if let Some(info) = self.stage_info() {
            info!(
                stage = info.index,
                flow = info.flow.as_deref().unwrap_or("*"),
                pass = info.pass.as_deref().unwrap_or("*"),
                "entering search stage"
            );
        }
        Ok(())
    }

    fn stage_space(&self, index: usize) -> SearchSpace {
        match &self.plan[index] {
            StagePlan::Joint => self.space.clone(),
            StagePlan::Flow(flow) => SearchSpace::from_flow_spaces(
                self.space.flow(flow).cloned().into_iter().collect(),
            ),
            StagePlan::Pass { flow, pass } => {
                let spaces: Vec<FlowSpace> = self
                    .space
                    .flow(flow)
                    .map(|space| {
                        let base = self
                            .best
                            .as_ref()
                            .filter(|(point, _)| point.flow() == flow)
                            .map(|(point, _)| point.values().clone())
                            .unwrap_or_default();
                        space.restrict_to(pass, &base)
                    })
                    .into_iter()
                    .collect();
                SearchSpace::from_flow_spaces(spaces)
            }
        }
    }
}

impl std::fmt::Debug for SearchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchStrategy")
            .field("state", &self.state)
            .field("stage", &self.stage)
            .field("stages", &self.plan.len())
            .field("proposed", &self.proposed)
            .field("completed", &self.history.len())
            .finish_non_exhaustive()
    }
}

fn plan_stages(config: &SearchStrategyConfig, space: &SearchSpace) -> Vec<StagePlan> {
    match config.execution_order {
        ExecutionOrder::Joint => vec![StagePlan::Joint],
        ExecutionOrder::PassByPass => space
            .flows()
            .iter()
            .flat_map(|flow| {
                let passes = flow.tunable_passes();
                if passes.is_empty() {
                    vec![StagePlan::Flow(flow.flow.clone())]
                } else {
                    passes
                        .into_iter()
                        .map(|pass| StagePlan::Pass {
                            flow: flow.flow.clone(),
                            pass,
                        })
                        .collect()
                }
            })
            .collect(),
    }
}
