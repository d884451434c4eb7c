//! Engine - top-level driver of an optimization run
//!
//! Construction resolves the run document into flows, an evaluator, the
//! execution targets and a validated search strategy, and opens the cache.
//! Every configuration problem surfaces here, before any trial runs.
//!
//! [`Engine::run`] then:
//! 1. evaluates the unmodified input model as baseline (if requested)
//! 2. drives the search loop, running each batch of points on a worker
//!    pool of `engine.num_workers` threads
//! 3. persists the best `output_model_num` records and the manifest
//!
//! Trial failures never abort the run; they are recorded and reported.
//! A run without a single successful trial returns
//! [`Error::NoSuccessfulTrials`] after the manifest is written.
//!
//! # Example
//!
//! ```rust,no_run
//! use passforge::config::RunConfig;
//! use passforge::Engine;
//!
//! # fn example() -> passforge::Result<()> {
//! let config = RunConfig::from_path("run.json")?;
//! let engine = Engine::from_config(config)?;
//! let outcome = engine.run()?;
//! for record in &outcome.best {
//!     println!("{} {:?}", record.flow(), record.evaluation());
//! }
//! # Ok(())
//! # }
//! ```

use crate::artifact::{ModelArtifact, ModelFormat};
use crate::cache::{CacheContext, CacheStats};
use crate::config::{EvaluatorConfig, NamedOrInline, RunConfig, SearchAlgorithmConfig, SearchStrategyConfig};
use crate::data::{DataCatalog, DataRegistry, DataSource};
use crate::evaluator::{
    EvaluationResult, Evaluator, EvaluatorMetric, MetricScorer, MetricType, ScorerContext,
    ScorerRegistry,
};
use crate::executor::FlowExecutor;
use crate::flow::{resolve_flows, ResolvedFlow};
use crate::hash::Fingerprint;
use crate::pass::{Pass, PassRegistry, ResolvedConfig};
use crate::run::{write_json_atomic, Manifest, RunRecord, RunStatus, RunStore};
use crate::search::{
    AlgorithmRegistry, SearchAlgorithm, SearchPoint, SearchSpace, SearchState, SearchStrategy,
    TrialFeedback,
};
use crate::system::{build_target, Command, ExecutionTarget};
use crate::value::OptionValue;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, info_span, warn};

/// File written next to the manifest with the baseline evaluation.
pub const INPUT_MODEL_METRICS_FILE: &str = "input_model_metrics.json";

/// File written into each persisted model directory.
pub const MODEL_CONFIG_FILE: &str = "model_config.json";

/// Cancels a running search between batches.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    /// Request the search to stop. In-flight trials complete.
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// What a run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Final search state
    pub state: SearchState,
    /// Persisted records, best first
    pub best: Vec<RunRecord>,
    /// Directories the best records were persisted to, same order
    pub output_models: Vec<PathBuf>,
    /// Every trial in completion order
    pub records: Vec<RunRecord>,
    /// Baseline evaluation of the input model
    pub baseline: Option<EvaluationResult>,
    /// Written manifest
    pub manifest_path: PathBuf,
    /// Cache activity during the run
    pub cache: CacheStats,
}

#[derive(Serialize)]
struct PersistedModel<'a> {
    rank: usize,
    trial: usize,
    fingerprint: Fingerprint,
    flow: &'a str,
    search_point: &'a SearchPoint,
    model: ModelArtifact,
    metrics: Option<&'a EvaluationResult>,
    goals_met: Option<bool>,
}

/// Builder for [`Engine`]: registries and execution target overrides.
pub struct EngineBuilder {
    config: RunConfig,
    passes: PassRegistry,
    scorers: ScorerRegistry,
    algorithms: AlgorithmRegistry,
    data: DataRegistry,
    host: Option<Arc<dyn ExecutionTarget>>,
    target: Option<Arc<dyn ExecutionTarget>>,
}

impl EngineBuilder {
    /// Builder with the built-in passes, scorers, algorithms and data types.
    #[must_use]
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            passes: PassRegistry::with_builtins(),
            scorers: ScorerRegistry::with_builtins(),
            algorithms: AlgorithmRegistry::with_builtins(),
            data: DataRegistry::with_builtins(),
            host: None,
            target: None,
        }
    }

    /// Register (or replace) a pass type.
    #[must_use]
    pub fn pass(mut self, pass: impl Pass + 'static) -> Self {
        self.passes.register(pass);
        self
    }

    /// Replace the pass registry.
    #[must_use]
    pub fn passes(mut self, registry: PassRegistry) -> Self {
        self.passes = registry;
        self
    }

    /// Register a scorer for a metric type.
    #[must_use]
    pub fn scorer(mut self, metric_type: MetricType, scorer: impl MetricScorer + 'static) -> Self {
        self.scorers.register_type(metric_type, scorer);
        self
    }

    /// Register a scorer for one metric name.
    #[must_use]
    pub fn metric_scorer(mut self, name: impl Into<String>, scorer: impl MetricScorer + 'static) -> Self {
        self.scorers.register_metric(name, scorer);
        self
    }

    /// Register a search algorithm.
    #[must_use]
    pub fn algorithm<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(SearchSpace, &SearchAlgorithmConfig) -> Result<Box<dyn SearchAlgorithm>>
            + Send
            + Sync
            + 'static,
    {
        self.algorithms.register(name, factory);
        self
    }

    /// Register a data source type.
    #[must_use]
    pub fn data_source<F>(mut self, data_type: impl Into<String>, factory: F) -> Self
    where
        F: Fn(crate::config::DataConfig) -> Result<Arc<dyn DataSource>> + Send + Sync + 'static,
    {
        self.data.register(data_type, factory);
        self
    }

    /// Run passes on `target` instead of `engine.host`.
    #[must_use]
    pub fn host(mut self, target: Arc<dyn ExecutionTarget>) -> Self {
        self.host = Some(target);
        self
    }

    /// Run evaluation on `target` instead of `engine.target`.
    #[must_use]
    pub fn target(mut self, target: Arc<dyn ExecutionTarget>) -> Self {
        self.target = Some(target);
        self
    }

    /// Resolve the configuration and open the cache.
    ///
    /// # Errors
    /// Returns `ConfigurationError` for anything the run could not
    /// execute, or an IO error if the cache cannot be opened.
    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        let engine = &config.engine;
        if engine.num_workers == 0 {
            return Err(Error::config("engine.num_workers must be at least 1"));
        }
        Command::from_runner(&engine.runner)?;

        let flows = resolve_flows(&config, &self.passes)?;

        let mut data = DataCatalog::build(&self.data, &config.data_configs)?;
        if let Some(input_data) = config.input_model_data_config()? {
            if data.get(&input_data.name).is_none() {
                data.insert(self.data.build(input_data)?);
            }
        }

        let evaluator = engine
            .evaluator
            .as_ref()
            .map(|reference| build_evaluator(&config, reference, &self.data, &mut data, self.scorers))
            .transpose()?;
        if let Some(evaluator) = &evaluator {
            if evaluator.needs_baseline() && !engine.evaluate_input_model {
                return Err(Error::config(
                    "metric goals relative to the input model need engine.evaluate_input_model: true",
                ));
            }
        }

        let host = match self.host {
            Some(target) => target,
            None => build_target(&config.resolve_system(engine.host.as_ref())?)?,
        };
        let target = match self.target {
            Some(target) => target,
            None => build_target(&config.resolve_system(engine.target.as_ref())?)?,
        };

        let strategy = engine.search_strategy.clone().unwrap_or_default();
        SearchStrategy::new(
            strategy.clone(),
            self.algorithms.clone(),
            SearchSpace::from_flows(&flows),
        )?;

        let input = input_artifact(&config)?;
        let cache = CacheContext::open(engine.resolved_cache_dir()?, engine.clean_cache)?;
        if engine.clean_evaluation_cache {
            cache.clear_evaluations()?;
        }
        let output_dir = engine.resolved_output_dir()?;

        info!(
            flows = flows.len(),
            search = engine.search_enabled(),
            algorithm = %strategy.search_algorithm,
            host = host.name(),
            target = target.name(),
            cache = %cache.root().display(),
            "Engine ready"
        );
        Ok(Engine {
            config,
            flows,
            evaluator,
            host,
            target,
            data,
            algorithms: self.algorithms,
            strategy,
            cache,
            input,
            output_dir,
            stop: StopHandle::default(),
        })
    }
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("passes", &self.passes)
            .field("scorers", &self.scorers)
            .field("algorithms", &self.algorithms)
            .finish_non_exhaustive()
    }
}

fn build_evaluator(
    config: &RunConfig,
    reference: &NamedOrInline<EvaluatorConfig>,
    registry: &DataRegistry,
    catalog: &mut DataCatalog,
    scorers: ScorerRegistry,
) -> Result<Evaluator> {
    let declared = config.resolve_evaluator(reference)?;
    let mut metrics = Vec::with_capacity(declared.metrics.len());
    for metric in declared.metrics {
        let data = match &metric.data_config {
            None | Some(OptionValue::Null) => None,
            Some(reference) => {
                let reference = if matches!(reference, OptionValue::InputModelDataConfig) {
                    config.input_model.declared_data_config().ok_or_else(|| {
                        Error::config(format!(
                            "metric '{}' uses the input model data config, but the input model declares none",
                            metric.name
                        ))
                    })?
                } else {
                    reference
                };
                let data_config = config.resolve_data_config(reference)?;
                Some(match catalog.get(&data_config.name) {
                    Some(source) => source,
                    None => {
                        let source = registry.build(data_config)?;
                        catalog.insert(Arc::clone(&source));
                        source
                    }
                })
            }
        };
        metrics.push(EvaluatorMetric { metric, data });
    }
    Evaluator::new(metrics, scorers)
}

fn input_artifact(config: &RunConfig) -> Result<ModelArtifact> {
    let model = &config.input_model;
    let path = model
        .model_path()
        .or_else(|| {
            model
                .config
                .get("hf_config")
                .and_then(OptionValue::as_map)
                .and_then(|hf| hf.get("model_name"))
                .and_then(OptionValue::as_str)
                .map(PathBuf::from)
        })
        .ok_or_else(|| {
            Error::config("input_model.config needs a model_path (or hf_config.model_name)")
        })?;
    let metadata: BTreeMap<String, OptionValue> = model
        .config
        .iter()
        .filter(|(key, _)| key.as_str() != "model_path")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Ok(ModelArtifact::input(
        path,
        ModelFormat::from_model_type(&model.model_type),
        metadata,
    ))
}

/// A configured optimization run.
pub struct Engine {
    config: RunConfig,
    flows: Vec<ResolvedFlow>,
    evaluator: Option<Evaluator>,
    host: Arc<dyn ExecutionTarget>,
    target: Arc<dyn ExecutionTarget>,
    data: DataCatalog,
    algorithms: AlgorithmRegistry,
    strategy: SearchStrategyConfig,
    cache: CacheContext,
    input: ModelArtifact,
    output_dir: PathBuf,
    stop: StopHandle,
}

impl Engine {
    /// Start building an engine.
    #[must_use]
    pub fn builder(config: RunConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Engine with the built-in registries.
    ///
    /// # Errors
    /// See [`EngineBuilder::build`].
    pub fn from_config(config: RunConfig) -> Result<Self> {
        EngineBuilder::new(config).build()
    }

    /// Run document
    #[must_use]
    pub const fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Resolved flows
    #[must_use]
    pub fn flows(&self) -> &[ResolvedFlow] {
        &self.flows
    }

    /// Shared cache
    #[must_use]
    pub const fn cache(&self) -> &CacheContext {
        &self.cache
    }

    /// Unmodified input model
    #[must_use]
    pub const fn input_model(&self) -> &ModelArtifact {
        &self.input
    }

    /// Output root
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Handle cancelling the search. A stopped engine stays stopped.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run the optimization.
    ///
    /// # Errors
    /// Returns `NoSuccessfulTrials` (after writing the manifest) when no
    /// trial succeeded, an `Evaluation` error when the baseline needed by
    /// relative goals cannot be measured, or an IO error when outputs
    /// cannot be written.
    pub fn run(&self) -> Result<RunOutcome> {
        let started_at = Utc::now();
        let stats_before = self.cache.stats();
        self.cache.begin_run();
        let workers = self.config.engine.num_workers;
        info!(
            flows = self.flows.len(),
            algorithm = %self.strategy.search_algorithm,
            workers,
            "Starting optimization run"
        );

        let baseline = self.evaluate_baseline()?;
        let mut search = SearchStrategy::new(
            self.strategy.clone(),
            self.algorithms.clone(),
            SearchSpace::from_flows(&self.flows),
        )?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("passforge-trial-{i}"))
            .build()
            .map_err(|e| Error::Other(format!("cannot start worker pool: {e}")))?;

        let mut store = RunStore::new();
        let mut next_trial = 0;
        loop {
            if self.stop.is_stopped() {
                search.stop();
            }
            let batch = search.next_batch(workers)?;
            if batch.is_empty() {
                break;
            }
            let first = next_trial;
            next_trial += batch.len();
            let records: Vec<RunRecord> = pool.install(|| {
                batch
                    .par_iter()
                    .enumerate()
                    .map(|(offset, point)| self.run_trial(first + offset, point, baseline.as_ref()))
                    .collect()
            });
            for record in records {
                let feedback = match (record.status(), record.evaluation()) {
                    (RunStatus::Success, Some(evaluation)) => TrialFeedback::Evaluated(evaluation),
                    (RunStatus::Invalid, _) => TrialFeedback::Invalid,
                    _ => TrialFeedback::Failed,
                };
                search.record(record.point(), feedback);
                if let Err(e) = self.cache.store_run(&record.fingerprint(), &record) {
                    warn!(error = %e, "Could not cache run record");
                }
                store.add(record);
            }
        }

        let state = search.state();
        let best: Vec<RunRecord> = store
            .best(self.strategy.output_model_num)
            .into_iter()
            .cloned()
            .collect();
        std::fs::create_dir_all(&self.output_dir)?;
        let output_models = best
            .iter()
            .enumerate()
            .map(|(index, record)| self.persist_best(index + 1, record))
            .collect::<Result<Vec<_>>>()?;
        if let Some(baseline) = &baseline {
            write_json_atomic(&self.output_dir.join(INPUT_MODEL_METRICS_FILE), baseline)?;
        }

        let cache = self.cache.stats().since(&stats_before);
        let manifest = Manifest {
            run_id: self.run_id(started_at)?,
            started_at,
            finished_at: Utc::now(),
            search_state: state,
            input_model: self.input.clone(),
            baseline: baseline.clone(),
            best: best.iter().map(RunRecord::fingerprint).collect(),
            cache,
            trials: store.records().to_vec(),
        };
        let manifest_path = manifest.write(&self.output_dir)?;
        info!(
            trials = store.len(),
            succeeded = store.with_status(RunStatus::Success).len(),
            failed = store.with_status(RunStatus::Failed).len(),
            invalid = store.with_status(RunStatus::Invalid).len(),
            cache_hits = cache.hits,
            cache_misses = cache.misses,
            state = ?state,
            manifest = %manifest_path.display(),
            "Run finished"
        );

        if best.is_empty() {
            return Err(Error::NoSuccessfulTrials {
                failures: store.failures(),
            });
        }
        Ok(RunOutcome {
            state,
            best,
            output_models,
            records: store.records().to_vec(),
            baseline,
            manifest_path,
            cache,
        })
    }

    fn run_id(&self, started_at: DateTime<Utc>) -> Result<String> {
        let digest = Fingerprint::of_parts(&[
            "run",
            &started_at.to_rfc3339(),
            &serde_json::to_string(&self.config)?,
        ]);
        Ok(format!(
            "{}-{}",
            started_at.format("%Y%m%dT%H%M%SZ"),
            digest.to_short()
        ))
    }

    fn evaluate_baseline(&self) -> Result<Option<EvaluationResult>> {
        let Some(evaluator) = &self.evaluator else {
            return Ok(None);
        };
        if !self.config.engine.evaluate_input_model {
            return Ok(None);
        }
        let _span = info_span!("baseline", model = %self.input.path().display()).entered();
        match self.measure(evaluator, &self.input) {
            Ok(raw) => {
                info!(metrics = raw.len(), "Input model evaluated");
                let judged = raw.with_goals(&evaluator.metrics(), Some(&raw))?;
                Ok(Some(judged))
            }
            Err(e) if evaluator.needs_baseline() => Err(Error::Evaluation(format!(
                "baseline evaluation of the input model failed, and relative goals need it: {e}"
            ))),
            Err(e) => {
                warn!(error = %e, "Baseline evaluation failed");
                Ok(None)
            }
        }
    }

    fn run_trial(&self, index: usize, point: &SearchPoint, baseline: Option<&EvaluationResult>) -> RunRecord {
        let span = info_span!(
            "trial",
            index,
            point = %point.fingerprint().to_short(),
            flow = point.flow()
        );
        let _enter = span.enter();
        let builder = RunRecord::builder(index, point.clone());

        let Some(flow) = self.flows.iter().find(|f| f.id() == point.flow()) else {
            return builder
                .failed(format!("search point names unknown flow '{}'", point.flow()))
                .build();
        };
        let configs: Vec<ResolvedConfig> = flow
            .steps()
            .iter()
            .map(|step| step.params().config_at(&point.pass_values(step.name())))
            .collect();
        let rejected = flow
            .steps()
            .iter()
            .zip(&configs)
            .find(|(step, config)| !step.pass().validate_search_point(config));
        if let Some((step, _)) = rejected {
            debug!(pass = step.name(), "Search point rejected");
            return builder
                .invalid(format!(
                    "pass '{}' ({}) does not support this option combination",
                    step.name(),
                    step.pass().pass_type()
                ))
                .build();
        }

        let executor = FlowExecutor::new(
            &self.cache,
            &*self.host,
            &self.config.engine.runner,
            &self.data,
            &self.config.engine.execution_providers,
        );
        let output = match executor.execute(flow, &configs, &self.input) {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "Trial failed");
                return builder.failed(e.to_string()).build();
            }
        };
        let builder = builder.steps(output.steps.clone());
        match self.evaluate(&output.artifact, baseline) {
            Ok(evaluation) => {
                info!(
                    cache_hits = output.cache_hits(),
                    cache_misses = output.cache_misses(),
                    goals_met = evaluation.all_goals_met(),
                    "Trial succeeded"
                );
                builder.success(output.artifact, evaluation).build()
            }
            Err(e) => {
                warn!(error = %e, "Trial evaluation failed");
                builder.failed(e.to_string()).build()
            }
        }
    }

    fn evaluate(&self, artifact: &ModelArtifact, baseline: Option<&EvaluationResult>) -> Result<EvaluationResult> {
        let Some(evaluator) = &self.evaluator else {
            return Ok(EvaluationResult::new());
        };
        self.measure(evaluator, artifact)?
            .with_goals(&evaluator.metrics(), baseline)
    }

    /// Raw evaluation through the evaluation cache.
    fn measure(&self, evaluator: &Evaluator, artifact: &ModelArtifact) -> Result<EvaluationResult> {
        let key = CacheContext::evaluation_key(&artifact.id(), &evaluator.fingerprint());
        self.cache.with_key_lock(&key, || {
            if let Some(hit) = self.cache.lookup_evaluation(&key) {
                debug!(artifact = %artifact.id().to_short(), "Reusing cached evaluation");
                return Ok(hit);
            }
            let ctx = ScorerContext {
                target: &*self.target,
                runner: &self.config.engine.runner,
                data: None,
                execution_providers: &self.config.engine.execution_providers,
            };
            let result = evaluator.evaluate(artifact, &ctx)?;
            if let Err(e) = self.cache.store_evaluation(&key, &result) {
                warn!(error = %e, "Could not cache evaluation");
            }
            Ok(result)
        })
    }

    fn persist_best(&self, rank: usize, record: &RunRecord) -> Result<PathBuf> {
        let name = match &self.config.engine.output_name {
            Some(prefix) => format!("{prefix}_{rank}_{}", record.flow()),
            None => format!("{rank}_{}", record.flow()),
        };
        let dir = self.output_dir.join(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;

        let artifact = record
            .artifact()
            .ok_or_else(|| Error::Other(format!("trial {} has no artifact", record.trial())))?;
        let model = match copy_model(artifact.path(), &dir)? {
            Some(path) => artifact.relocated(path),
            None => {
                warn!(path = %artifact.path().display(), "Model path missing, not copied");
                artifact.clone()
            }
        };
        let persisted = PersistedModel {
            rank,
            trial: record.trial(),
            fingerprint: record.fingerprint(),
            flow: record.flow(),
            search_point: record.point(),
            model,
            metrics: record.evaluation(),
            goals_met: record.goals_met(),
        };
        write_json_atomic(&dir.join(MODEL_CONFIG_FILE), &persisted)?;
        info!(rank, flow = record.flow(), dir = %dir.display(), "Persisted output model");
        Ok(dir)
    }
}

#[cfg(feature = "tokio")]
impl Engine {
    /// Run on tokio's blocking pool.
    ///
    /// # Errors
    /// See [`Engine::run`]; a panicked run is reported as `Other`.
    pub async fn run_async(self: Arc<Self>) -> Result<RunOutcome> {
        tokio::task::spawn_blocking(move || self.run())
            .await
            .map_err(|e| Error::Other(format!("run task failed: {e}")))?
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("flows", &self.flows.iter().map(ResolvedFlow::id).collect::<Vec<_>>())
            .field("host", &self.host.name())
            .field("target", &self.target.name())
            .field("cache", &self.cache.root())
            .field("output_dir", &self.output_dir)
            .finish_non_exhaustive()
    }
}

/// Copy a model file or directory into `dir`. `None` if `src` is gone.
fn copy_model(src: &Path, dir: &Path) -> Result<Option<PathBuf>> {
    if src.is_dir() {
        let dst = dir.join("model");
        copy_dir(src, &dst)?;
        Ok(Some(dst))
    } else if src.is_file() {
        let name = src.file_name().map_or_else(|| "model".into(), ToOwned::to_owned);
        let dst = dir.join(name);
        std::fs::copy(src, &dst)?;
        Ok(Some(dst))
    } else {
        Ok(None)
    }
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}
