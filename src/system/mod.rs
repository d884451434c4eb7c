//! Execution targets
//!
//! Passes and scorers never spawn processes themselves; they go through an
//! [`ExecutionTarget`] with a `run(command, environment)` contract. The
//! engine picks the target from `engine.host` (passes) and
//! `engine.target` (evaluation).

mod docker;
mod local;

pub use docker::DockerSystem;
pub use local::{LocalSystem, PythonEnvironment};

use crate::config::{DockerSystemConfig, PythonEnvironmentConfig, SystemConfig};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Program invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Command {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}

impl Command {
    /// Command running `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    /// Command from a runner string: program followed by leading arguments.
    ///
    /// # Errors
    /// Returns `ConfigurationError` if `runner` is blank.
    pub fn from_runner(runner: &str) -> Result<Self> {
        let mut parts = runner.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::config("engine.runner is empty"))?;
        Ok(Self::new(program).args(parts))
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Program name
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments
    #[must_use]
    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Working directory
    #[must_use]
    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Environment variables added for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Empty environment (inherit the process environment).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            vars: BTreeMap::new(),
        }
    }

    /// Add one variable.
    #[must_use]
    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Merge `other` over `self`.
    #[must_use]
    pub fn merged(&self, other: &Self) -> Self {
        let mut vars = self.vars.clone();
        vars.extend(other.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { vars }
    }

    /// Iterate variables
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    /// Look up a variable
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// Captured process result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code (`None` if killed by a signal)
    pub status: Option<i32>,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the process exited with code 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.status, Some(0))
    }

    /// Exit status for messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.status
            .map_or_else(|| "a signal".to_string(), |code| format!("code {code}"))
    }
}

/// Where commands physically run.
pub trait ExecutionTarget: Send + Sync + std::fmt::Debug {
    /// System name for logs and manifests.
    fn name(&self) -> &str;

    /// Run a command to completion and capture its output.
    ///
    /// # Errors
    /// Returns `Execution` error if the command cannot be started. A
    /// non-zero exit is reported through [`CommandOutput::status`].
    fn run(&self, command: &Command, env: &Environment) -> Result<CommandOutput>;
}

/// Build a target from its declaration.
///
/// # Errors
/// Returns `ConfigurationError` for unknown system types or malformed
/// type-specific config.
pub fn build_target(config: &SystemConfig) -> Result<Arc<dyn ExecutionTarget>> {
    let body = |what: &str| -> Result<serde_json::Value> {
        if config.config.is_null() {
            return Err(Error::config(format!("system type {what} needs a config body")));
        }
        Ok(config.config.clone())
    };
    match config.system_type.as_str() {
        "LocalSystem" => Ok(Arc::new(LocalSystem::new())),
        "PythonEnvironment" => {
            let parsed: PythonEnvironmentConfig = serde_json::from_value(body("PythonEnvironment")?)
                .map_err(|e| Error::config(format!("invalid PythonEnvironment config: {e}")))?;
            Ok(Arc::new(PythonEnvironment::new(parsed)))
        }
        "Docker" => {
            let parsed: DockerSystemConfig = serde_json::from_value(body("Docker")?)
                .map_err(|e| Error::config(format!("invalid Docker config: {e}")))?;
            Ok(Arc::new(DockerSystem::new(parsed.local_docker_config)))
        }
        other => Err(Error::config(format!(
            "system type '{other}' is not supported (use LocalSystem, PythonEnvironment or Docker)"
        ))),
    }
}
