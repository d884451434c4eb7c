//! Engine and search strategy configuration

use super::{EvaluatorConfig, SystemConfig};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;

/// How passes of a flow are tuned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionOrder {
    /// All passes of a flow are tuned together
    #[default]
    Joint,
    /// One pass at a time, others held fixed
    #[serde(alias = "sequential")]
    PassByPass,
}

/// Algorithm-specific search settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchAlgorithmConfig {
    /// Points per sampling stage (`None` = until the algorithm runs dry)
    #[serde(default)]
    pub num_samples: Option<usize>,
    /// RNG seed for random and tpe
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Random trials before tpe starts modelling (default 10)
    #[serde(default)]
    pub n_startup: Option<usize>,
    /// Candidates scored per tpe proposal
    #[serde(default = "default_n_candidates")]
    pub n_candidates: usize,
    /// Fraction of trials treated as "good" by tpe
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

const fn default_seed() -> u64 {
    1
}

const fn default_n_candidates() -> usize {
    24
}

const fn default_gamma() -> f64 {
    0.25
}

impl Default for SearchAlgorithmConfig {
    fn default() -> Self {
        Self {
            num_samples: None,
            seed: default_seed(),
            n_startup: None,
            n_candidates: default_n_candidates(),
            gamma: default_gamma(),
        }
    }
}

/// `engine.search_strategy` settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchStrategyConfig {
    /// Joint or pass-by-pass tuning
    #[serde(default)]
    pub execution_order: ExecutionOrder,
    /// Registered algorithm name
    #[serde(default = "default_algorithm")]
    pub search_algorithm: String,
    /// Algorithm settings
    #[serde(default)]
    pub search_algorithm_config: SearchAlgorithmConfig,
    /// Best records persisted to the output directory
    #[serde(default = "default_output_model_num")]
    pub output_model_num: usize,
    /// Converge as soon as the best result meets every goal
    #[serde(default)]
    pub stop_when_goals_met: bool,
    /// Total trial budget over all stages
    #[serde(default)]
    pub max_iter: Option<usize>,
    /// Wall clock budget in seconds
    #[serde(default)]
    pub max_time: Option<f64>,
    /// Minimum margin for a result to count as an improvement
    #[serde(default)]
    pub tolerance: f64,
    /// Consecutive non-improving trials before converging
    #[serde(default)]
    pub patience: Option<usize>,
}

fn default_algorithm() -> String {
    "exhaustive".to_string()
}

const fn default_output_model_num() -> usize {
    1
}

impl Default for SearchStrategyConfig {
    fn default() -> Self {
        Self {
            execution_order: ExecutionOrder::default(),
            search_algorithm: default_algorithm(),
            search_algorithm_config: SearchAlgorithmConfig::default(),
            output_model_num: default_output_model_num(),
            stop_when_goals_met: false,
            max_iter: None,
            max_time: None,
            tolerance: 0.0,
            patience: None,
        }
    }
}

/// Value given by name or inline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NamedOrInline<T> {
    /// Reference to a named top-level entry
    Name(String),
    /// Inline definition
    Inline(T),
}

/// `engine` section of the run document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// `false`/absent disables search; `true` uses defaults
    #[serde(default, deserialize_with = "search_strategy_setting")]
    pub search_strategy: Option<SearchStrategyConfig>,
    /// Evaluator used for trials and the baseline
    #[serde(default)]
    pub evaluator: Option<NamedOrInline<EvaluatorConfig>>,
    /// System running passes
    #[serde(default)]
    pub host: Option<NamedOrInline<SystemConfig>>,
    /// System running evaluation
    #[serde(default)]
    pub target: Option<NamedOrInline<SystemConfig>>,
    /// Cache root
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Output root
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Prefix for persisted output directories
    #[serde(default)]
    pub output_name: Option<String>,
    /// Drop every cache entry before the run
    #[serde(default)]
    pub clean_cache: bool,
    /// Drop cached evaluations (artifacts are kept)
    #[serde(default)]
    pub clean_evaluation_cache: bool,
    /// Evaluate the unmodified input model as baseline
    #[serde(default = "default_true")]
    pub evaluate_input_model: bool,
    /// Concurrent trials (1 = sequential)
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Command prefix invoking external pass and scorer tools
    #[serde(default = "default_runner")]
    pub runner: String,
    /// 0 verbose, 1 info, 2 warning, 3 error, 4 fatal
    #[serde(default = "default_log_severity")]
    pub log_severity_level: u8,
    /// Execution providers forwarded to passes
    #[serde(default)]
    pub execution_providers: Vec<String>,
}

fn search_strategy_setting<'de, D>(deserializer: D) -> Result<Option<SearchStrategyConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Setting {
        Toggle(bool),
        Config(Box<SearchStrategyConfig>),
    }

    Ok(match Option::<Setting>::deserialize(deserializer)? {
        None | Some(Setting::Toggle(false)) => None,
        Some(Setting::Toggle(true)) => Some(SearchStrategyConfig::default()),
        Some(Setting::Config(config)) => Some(*config),
    })
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".passforge-cache")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("passforge-output")
}

const fn default_true() -> bool {
    true
}

const fn default_num_workers() -> usize {
    1
}

fn default_runner() -> String {
    "passforge-tool".to_string()
}

const fn default_log_severity() -> u8 {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            search_strategy: None,
            evaluator: None,
            host: None,
            target: None,
            cache_dir: default_cache_dir(),
            output_dir: default_output_dir(),
            output_name: None,
            clean_cache: false,
            clean_evaluation_cache: false,
            evaluate_input_model: default_true(),
            num_workers: default_num_workers(),
            runner: default_runner(),
            log_severity_level: default_log_severity(),
            execution_providers: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Whether a search strategy is configured.
    #[must_use]
    pub const fn search_enabled(&self) -> bool {
        self.search_strategy.is_some()
    }

    /// Tracing directive matching `log_severity_level`.
    #[must_use]
    pub const fn log_directive(&self) -> &'static str {
        match self.log_severity_level {
            0 => "passforge=trace",
            1 => "passforge=info",
            2 => "passforge=warn",
            _ => "passforge=error",
        }
    }

    /// Cache root resolved against the working directory.
    ///
    /// # Errors
    /// Returns an IO error if the working directory is unavailable.
    pub fn resolved_cache_dir(&self) -> crate::Result<PathBuf> {
        absolutize(&self.cache_dir)
    }

    /// Output root resolved against the working directory.
    ///
    /// # Errors
    /// Returns an IO error if the working directory is unavailable.
    pub fn resolved_output_dir(&self) -> crate::Result<PathBuf> {
        absolutize(&self.output_dir)
    }
}

fn absolutize(path: &std::path::Path) -> crate::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
