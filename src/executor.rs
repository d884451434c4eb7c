//! Flow execution with per-step caching
//!
//! Each step's cache key is a fingerprint of (pass type, resolved config,
//! input artifact id). Before running a step the executor looks the key
//! up; a hit reuses the cached output, so search points sharing a config
//! prefix only pay for the steps where they differ. The step key doubles
//! as the output artifact id, which chains keys down the flow.

use crate::artifact::ModelArtifact;
use crate::cache::CacheContext;
use crate::data::DataCatalog;
use crate::flow::{FlowStep, ResolvedFlow};
use crate::hash::Fingerprint;
use crate::pass::{PassContext, ResolvedConfig};
use crate::system::ExecutionTarget;
use crate::value::OptionValue;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Cache key of one pass invocation.
#[must_use]
pub fn step_key(pass_type: &str, config: &ResolvedConfig, input: &Fingerprint) -> Fingerprint {
    let config = OptionValue::Map(config.clone()).canonical();
    Fingerprint::of_parts(&["pass", pass_type, &config, &input.to_hex()])
}

/// What happened to one step of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Logical pass name
    pub pass: String,
    /// Step cache key
    pub key: Fingerprint,
    /// Whether the output came from the cache
    pub cached: bool,
}

/// Final artifact of a flow plus per-step outcomes.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowOutput {
    /// Artifact produced by the last step
    pub artifact: ModelArtifact,
    /// One entry per step, in order
    pub steps: Vec<StepOutcome>,
}

impl FlowOutput {
    /// Steps served from cache
    #[must_use]
    pub fn cache_hits(&self) -> usize {
        self.steps.iter().filter(|s| s.cached).count()
    }

    /// Steps executed
    #[must_use]
    pub fn cache_misses(&self) -> usize {
        self.steps.len() - self.cache_hits()
    }
}

/// Runs flows against a shared cache.
#[derive(Clone, Copy)]
pub struct FlowExecutor<'a> {
    cache: &'a CacheContext,
    target: &'a dyn ExecutionTarget,
    runner: &'a str,
    data: &'a DataCatalog,
    execution_providers: &'a [String],
}

impl<'a> FlowExecutor<'a> {
    /// Create an executor.
    #[must_use]
    pub const fn new(
        cache: &'a CacheContext,
        target: &'a dyn ExecutionTarget,
        runner: &'a str,
        data: &'a DataCatalog,
        execution_providers: &'a [String],
    ) -> Self {
        Self {
            cache,
            target,
            runner,
            data,
            execution_providers,
        }
    }

    /// Execute `flow` on `input` with one resolved config per step.
    ///
    /// # Errors
    /// Returns `PassExecution` naming the first failing step; later steps
    /// are not run.
    pub fn execute(
        &self,
        flow: &ResolvedFlow,
        configs: &[ResolvedConfig],
        input: &ModelArtifact,
    ) -> Result<FlowOutput> {
        if configs.len() != flow.steps().len() {
            return Err(Error::Other(format!(
                "flow '{}' has {} steps but {} configs were given",
                flow.id(),
                flow.steps().len(),
                configs.len()
            )));
        }

        let mut current = input.clone();
        let mut steps = Vec::with_capacity(configs.len());
        for (step, config) in flow.steps().iter().zip(configs) {
            let key = step_key(step.pass().pass_type(), config, &current.id());
            let (artifact, cached) = self
                .cache
                .with_key_lock(&key, || self.run_step(step, config, &current, &key))
                .map_err(|e| match e {
                    Error::PassExecution { .. } => e,
                    other => Error::pass(step.name(), other.to_string()),
                })?;
            steps.push(StepOutcome {
                pass: step.name().to_string(),
                key,
                cached,
            });
            current = artifact;
        }
        Ok(FlowOutput {
            artifact: current,
            steps,
        })
    }

    fn run_step(
        &self,
        step: &FlowStep,
        config: &ResolvedConfig,
        input: &ModelArtifact,
        key: &Fingerprint,
    ) -> Result<(ModelArtifact, bool)> {
        if step.clean_run_cache() && self.cache.clean_artifact_once(key)? {
            debug!(pass = step.name(), key = %key.to_short(), "Cleaned cached pass output");
        } else if let Some(hit) = self.cache.lookup_artifact(key) {
            debug!(pass = step.name(), key = %key.to_short(), "Reusing cached pass output");
            self.cache.record_hit();
            return Ok((hit, true));
        }
        self.cache.record_miss();

        let dir = self.cache.model_dir(key);
        if dir.exists() {
            // Left behind by an invocation that never stored its entry.
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;

        info!(
            pass = step.name(),
            pass_type = step.pass().pass_type(),
            key = %key.to_short(),
            "Running pass"
        );
        let ctx = PassContext {
            pass_name: step.name(),
            output_dir: &dir,
            target: self.target,
            runner: self.runner,
            data: self.data,
            execution_providers: self.execution_providers,
        };
        let artifact = step.pass().run(input, config, &ctx)?.with_id(*key);
        self.cache.store_artifact(key, &artifact)?;
        Ok((artifact, false))
    }
}

impl std::fmt::Debug for FlowExecutor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowExecutor")
            .field("cache", &self.cache.root())
            .field("target", &self.target.name())
            .field("runner", &self.runner)
            .finish_non_exhaustive()
    }
}
