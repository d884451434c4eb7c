//! System (execution target) declarations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Entry of the `systems` section: `{"type": .., "config": {..}}`.
///
/// The `config` body is decoded by the system type when the target is
/// built (see [`crate::system::build_target`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemConfig {
    /// System type (`LocalSystem`, `PythonEnvironment`, `Docker`)
    #[serde(rename = "type")]
    pub system_type: String,
    /// Type-specific settings
    #[serde(default)]
    pub config: serde_json::Value,
}

impl SystemConfig {
    /// Local system declaration.
    #[must_use]
    pub fn local() -> Self {
        Self {
            system_type: "LocalSystem".to_string(),
            config: serde_json::Value::Null,
        }
    }
}

/// `config` body of a `PythonEnvironment` system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PythonEnvironmentConfig {
    /// Directory holding the environment's executables
    pub python_environment_path: std::path::PathBuf,
    /// Extra environment variables
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
}

/// `local_docker_config` of a `Docker` system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDockerConfig {
    /// Image used for `docker run`
    pub image_name: String,
    /// Dockerfile (informational; images are not built here)
    #[serde(default)]
    pub dockerfile: Option<String>,
    /// Build context (informational)
    #[serde(default)]
    pub build_context_path: Option<String>,
    /// Extra `docker run` parameters (`volumes`, `environment`)
    #[serde(default)]
    pub run_params: Option<DockerRunParams>,
}

/// Subset of `docker run` parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerRunParams {
    /// Host path to container path
    #[serde(default)]
    pub volumes: BTreeMap<String, String>,
    /// Environment variables
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

/// `config` body of a `Docker` system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerSystemConfig {
    /// Local docker settings
    pub local_docker_config: LocalDockerConfig,
}
