//! Search over pass configurations
//!
//! A [`SearchStrategy`] drives one [`SearchAlgorithm`] per sampling stage.
//! Algorithms share one contract: `propose(history)` returns the next
//! point to try (or `None` when they have nothing left), `update` feeds
//! back the outcome of a completed trial.
//!
//! Built-in algorithms:
//! - `exhaustive`: deterministic Cartesian enumeration
//! - `random`: seeded uniform sampling without replacement
//! - `tpe`: seeded tree-structured Parzen estimator

mod exhaustive;
mod parameter;
mod point;
mod random;
mod space;
mod strategy;
mod tpe;

pub use exhaustive::ExhaustiveSearch;
pub use parameter::{ConditionalSupport, SearchParameter};
pub use point::{PassValues, SearchPoint};
pub use random::RandomSearch;
pub use space::{Dimension, FlowSpace, SearchSpace, MAX_ENUMERATED_POINTS};
pub use strategy::{SearchState, SearchStrategy, StageInfo, TrialFeedback};
pub use tpe::TpeSearch;

use crate::config::SearchAlgorithmConfig;
use crate::evaluator::EvaluationResult;
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A completed trial as seen by a search algorithm.
///
/// `result` is `None` when the trial failed or was rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    /// Evaluated point
    pub point: SearchPoint,
    /// Evaluation outcome (goals applied)
    pub result: Option<EvaluationResult>,
}

/// Proposal contract shared by all search algorithms.
pub trait SearchAlgorithm: Send {
    /// Registered algorithm name.
    fn name(&self) -> &str;

    /// Propose the next point given every completed trial of this stage.
    ///
    /// Proposals still in flight are not in `history`; algorithms track
    /// their own proposals so they never hand out duplicates.
    fn propose(&mut self, history: &[Trial]) -> Option<SearchPoint>;

    /// Feed back the result of a completed trial.
    fn update(&mut self, _point: &SearchPoint, _result: Option<&EvaluationResult>) {}
}

/// Factory building an algorithm over a stage space.
pub type AlgorithmFactory =
    Arc<dyn Fn(SearchSpace, &SearchAlgorithmConfig) -> Result<Box<dyn SearchAlgorithm>> + Send + Sync>;

/// Registry mapping algorithm names to factories.
///
/// Read-only once the engine is built.
#[derive(Clone)]
pub struct AlgorithmRegistry {
    factories: BTreeMap<String, AlgorithmFactory>,
}

impl AlgorithmRegistry {
    /// Empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with `exhaustive`, `random` and `tpe`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("exhaustive", |space, _config| {
            Ok(Box::new(ExhaustiveSearch::new(&space)?) as Box<dyn SearchAlgorithm>)
        });
        registry.register("random", |space, config| {
            Ok(Box::new(RandomSearch::new(space, config.seed)) as Box<dyn SearchAlgorithm>)
        });
        registry.register("tpe", |space, config| {
            Ok(Box::new(TpeSearch::new(space, config)?) as Box<dyn SearchAlgorithm>)
        });
        registry
    }

    /// Register (or replace) a factory.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(SearchSpace, &SearchAlgorithmConfig) -> Result<Box<dyn SearchAlgorithm>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Build an algorithm by name.
    ///
    /// # Errors
    /// Returns `ConfigurationError` for unknown names or when the factory
    /// rejects the space.
    pub fn build(
        &self,
        name: &str,
        space: SearchSpace,
        config: &SearchAlgorithmConfig,
    ) -> Result<Box<dyn SearchAlgorithm>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.factories.keys().map(String::as_str).collect();
            Error::config(format!(
                "unknown search algorithm '{name}' (registered: {})",
                known.join(", ")
            ))
        })?;
        factory(space, config)
    }
}

impl Default for AlgorithmRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgorithmRegistry")
            .field("algorithms", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
