//! Run configuration document
//!
//! Top-level keys: `input_model`, `systems`, `data_configs`, `evaluators`,
//! `passes`, `pass_flows`, `engine`. Unknown keys are rejected.
//!
//! # Example
//!
//! ```rust
//! use passforge::config::RunConfig;
//!
//! let config = RunConfig::from_json_str(r#"{
//!     "input_model": {"type": "PyTorchModel", "config": {"model_path": "model.pt"}},
//!     "passes": {
//!         "conversion": {"type": "OnnxConversion", "config": {"target_opset": 13}},
//!         "quantization": {"type": "OnnxDynamicQuantization"}
//!     },
//!     "engine": {"search_strategy": false}
//! }"#)?;
//! assert_eq!(config.pass_names(), ["conversion", "quantization"]);
//! # Ok::<(), passforge::Error>(())
//! ```

mod engine;
mod system;

pub use engine::{
    EngineConfig, ExecutionOrder, NamedOrInline, SearchAlgorithmConfig, SearchStrategyConfig,
};
pub use system::{
    DockerRunParams, DockerSystemConfig, LocalDockerConfig, PythonEnvironmentConfig, SystemConfig,
};

use crate::evaluator::Metric;
use crate::value::OptionValue;
use crate::{Error, Result};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// `input_model` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputModelConfig {
    /// Model type (`PyTorchModel`, `ONNXModel`, `HfModel`, ...)
    #[serde(rename = "type")]
    pub model_type: String,
    /// Loader settings (`model_path`, `hf_config`, `data_config`, ...)
    #[serde(default)]
    pub config: BTreeMap<String, OptionValue>,
}

impl InputModelConfig {
    /// Model path (`config.model_path`), if any.
    #[must_use]
    pub fn model_path(&self) -> Option<PathBuf> {
        self.config
            .get("model_path")
            .and_then(OptionValue::as_str)
            .map(PathBuf::from)
    }

    /// Declared data config: `config.data_config`, else
    /// `config.hf_config.dataset`.
    #[must_use]
    pub fn declared_data_config(&self) -> Option<&OptionValue> {
        self.config
            .get("data_config")
            .filter(|v| !v.is_null())
            .or_else(|| {
                self.config
                    .get("hf_config")
                    .and_then(OptionValue::as_map)
                    .and_then(|hf| hf.get("dataset"))
                    .filter(|v| !v.is_null())
            })
    }
}

/// Entry of `data_configs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    /// Entry name (taken from the map key when given as a map)
    #[serde(default)]
    pub name: String,
    /// Registered data source type
    #[serde(rename = "type", default = "default_data_type")]
    pub data_type: String,
    /// Source parameters (`data_file`, `batch_size`, `max_samples`, ...)
    #[serde(default)]
    pub params_config: BTreeMap<String, OptionValue>,
    /// Component overrides (opaque here)
    #[serde(default)]
    pub components: BTreeMap<String, OptionValue>,
    /// Opaque nested configs handed to external sources
    #[serde(default)]
    pub load_dataset_config: Option<OptionValue>,
    /// Opaque nested configs handed to external sources
    #[serde(default)]
    pub pre_process_data_config: Option<OptionValue>,
    /// Opaque nested configs handed to external sources
    #[serde(default)]
    pub post_process_data_config: Option<OptionValue>,
    /// Opaque nested configs handed to external sources
    #[serde(default)]
    pub dataloader_config: Option<OptionValue>,
}

fn default_data_type() -> String {
    "DummyDataContainer".to_string()
}

impl DataConfig {
    /// Serialize as an option value map.
    #[must_use]
    pub fn to_option_value(&self) -> OptionValue {
        serde_json::to_value(self).map_or(OptionValue::Null, OptionValue::from)
    }
}

/// Entry of `evaluators`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluatorConfig {
    /// Metrics measured on every artifact
    pub metrics: Vec<Metric>,
}

/// Entry of `passes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PassConfig {
    /// Registered pass type
    #[serde(rename = "type")]
    pub pass_type: String,
    /// User option values
    #[serde(default)]
    pub config: BTreeMap<String, OptionValue>,
    /// Pin every option to its explicit or default value
    #[serde(default)]
    pub disable_search: bool,
    /// Ignore cached outputs of this pass
    #[serde(default)]
    pub clean_run_cache: bool,
}

impl PassConfig {
    /// Pass config with no user options.
    pub fn new(pass_type: impl Into<String>) -> Self {
        Self {
            pass_type: pass_type.into(),
            config: BTreeMap::new(),
            disable_search: false,
            clean_run_cache: false,
        }
    }

    /// Set one user option.
    #[must_use]
    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<OptionValue>) -> Self {
        self.config.insert(name.into(), value.into());
        self
    }
}

/// Complete run document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Model to optimize
    pub input_model: InputModelConfig,
    /// Named execution targets
    #[serde(default)]
    pub systems: BTreeMap<String, SystemConfig>,
    /// Named data configs (list or map)
    #[serde(default, deserialize_with = "named_data_configs")]
    pub data_configs: BTreeMap<String, DataConfig>,
    /// Named evaluators
    #[serde(default)]
    pub evaluators: BTreeMap<String, EvaluatorConfig>,
    /// Passes in declaration order
    #[serde(
        default,
        deserialize_with = "ordered_passes",
        serialize_with = "serialize_passes"
    )]
    pub passes: Vec<(String, PassConfig)>,
    /// Flows as lists of pass names (empty = one flow of all passes)
    #[serde(default)]
    pub pass_flows: Vec<Vec<String>>,
    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl RunConfig {
    /// Parse a run document.
    ///
    /// # Errors
    /// Returns `ConfigurationError` for malformed JSON, unknown keys or
    /// type mismatches.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("invalid run config: {e}")))
    }

    /// Read and parse a run document.
    ///
    /// # Errors
    /// Returns an IO error if the file cannot be read, or
    /// `ConfigurationError` if it does not parse.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::config(format!("invalid run config {}: {e}", path.display())))
    }

    /// Pass names in declaration order.
    #[must_use]
    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Look up a pass by name.
    #[must_use]
    pub fn pass(&self, name: &str) -> Option<&PassConfig> {
        self.passes
            .iter()
            .find(|(pass_name, _)| pass_name == name)
            .map(|(_, config)| config)
    }

    /// Flows to run: `pass_flows`, or one flow of every pass.
    #[must_use]
    pub fn flows(&self) -> Vec<Vec<String>> {
        if self.pass_flows.is_empty() {
            vec![self.passes.iter().map(|(name, _)| name.clone()).collect()]
        } else {
            self.pass_flows.clone()
        }
    }

    /// Resolve a data config given by name or inline.
    ///
    /// # Errors
    /// Returns `ConfigurationError` for names missing from `data_configs`
    /// or inline values that do not parse.
    pub fn resolve_data_config(&self, reference: &OptionValue) -> Result<DataConfig> {
        if let Some(name) = reference.as_str() {
            return self.data_configs.get(name).cloned().ok_or_else(|| {
                Error::config(format!(
                    "data config '{name}' is not declared in data_configs"
                ))
            });
        }
        let mut config: DataConfig = serde_json::from_value(reference.to_json())
            .map_err(|e| Error::config(format!("invalid inline data config: {e}")))?;
        if config.name.is_empty() {
            config.name = "inline".to_string();
        }
        Ok(config)
    }

    /// The input model's data config, resolved.
    ///
    /// # Errors
    /// See [`Self::resolve_data_config`].
    pub fn input_model_data_config(&self) -> Result<Option<DataConfig>> {
        self.input_model
            .declared_data_config()
            .map(|reference| self.resolve_data_config(reference))
            .transpose()
    }

    /// Resolve an evaluator reference.
    ///
    /// # Errors
    /// Returns `ConfigurationError` for names missing from `evaluators`.
    pub fn resolve_evaluator(
        &self,
        reference: &NamedOrInline<EvaluatorConfig>,
    ) -> Result<EvaluatorConfig> {
        match reference {
            NamedOrInline::Inline(config) => Ok(config.clone()),
            NamedOrInline::Name(name) => self.evaluators.get(name).cloned().ok_or_else(|| {
                Error::config(format!("evaluator '{name}' is not declared in evaluators"))
            }),
        }
    }

    /// Resolve a system reference (absent = local).
    ///
    /// # Errors
    /// Returns `ConfigurationError` for names missing from `systems`.
    pub fn resolve_system(
        &self,
        reference: Option<&NamedOrInline<SystemConfig>>,
    ) -> Result<SystemConfig> {
        match reference {
            None => Ok(SystemConfig::local()),
            Some(NamedOrInline::Inline(config)) => Ok(config.clone()),
            Some(NamedOrInline::Name(name)) => self.systems.get(name).cloned().ok_or_else(|| {
                Error::config(format!("system '{name}' is not declared in systems"))
            }),
        }
    }
}

fn named_data_configs<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, DataConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Entries {
        List(Vec<DataConfig>),
        Map(BTreeMap<String, DataConfig>),
    }

    match Entries::deserialize(deserializer)? {
        Entries::Map(map) => Ok(map
            .into_iter()
            .map(|(name, mut config)| {
                config.name.clone_from(&name);
                (name, config)
            })
            .collect()),
        Entries::List(list) => {
            let mut map = BTreeMap::new();
            for config in list {
                if config.name.is_empty() {
                    return Err(serde::de::Error::custom("data_configs list entries need a name"));
                }
                if map.contains_key(&config.name) {
                    return Err(serde::de::Error::custom(format!(
                        "data config '{}' is declared twice",
                        config.name
                    )));
                }
                map.insert(config.name.clone(), config);
            }
            Ok(map)
        }
    }
}

fn ordered_passes<'de, D>(deserializer: D) -> std::result::Result<Vec<(String, PassConfig)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PassesVisitor;

    impl<'de> Visitor<'de> for PassesVisitor {
        type Value = Vec<(String, PassConfig)>;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("a map of pass name to pass config")
        }

        fn visit_map<A>(self, mut access: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut passes: Vec<(String, PassConfig)> = Vec::new();
            while let Some((name, config)) = access.next_entry::<String, PassConfig>()? {
                if passes.iter().any(|(existing, _)| *existing == name) {
                    return Err(serde::de::Error::custom(format!(
                        "pass '{name}' is declared twice"
                    )));
                }
                passes.push((name, config));
            }
            Ok(passes)
        }
    }

    deserializer.deserialize_map(PassesVisitor)
}

#[allow(clippy::ptr_arg)]
fn serialize_passes<S>(passes: &Vec<(String, PassConfig)>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut map = serializer.serialize_map(Some(passes.len()))?;
    for (name, config) in passes {
        map.serialize_entry(name, config)?;
    }
    map.end()
}
