//! Local process targets

use super::{Command, CommandOutput, Environment, ExecutionTarget};
use crate::config::PythonEnvironmentConfig;
use crate::{Error, Result};
use std::ffi::OsString;
use tracing::debug;

/// Runs commands as child processes of this one.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalSystem;

impl LocalSystem {
    /// Create a local system.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

pub(super) fn spawn(command: &Command, env: &Environment) -> Result<CommandOutput> {
    debug!(command = %command, "running");
    let mut process = std::process::Command::new(command.program());
    process.args(command.arguments());
    if let Some(dir) = command.cwd() {
        process.current_dir(dir);
    }
    for (key, value) in env.iter() {
        process.env(key, value);
    }
    let output = process.output().map_err(|e| {
        Error::Execution(format!("cannot start '{}': {e}", command.program()))
    })?;
    Ok(CommandOutput {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

impl ExecutionTarget for LocalSystem {
    fn name(&self) -> &str {
        "LocalSystem"
    }

    fn run(&self, command: &Command, env: &Environment) -> Result<CommandOutput> {
        spawn(command, env)
    }
}

/// Local processes with a dedicated environment directory on `PATH`.
#[derive(Debug, Clone)]
pub struct PythonEnvironment {
    config: PythonEnvironmentConfig,
}

impl PythonEnvironment {
    /// Create from config.
    #[must_use]
    pub const fn new(config: PythonEnvironmentConfig) -> Self {
        Self { config }
    }

    /// `PATH` with the environment directory in front.
    ///
    /// # Errors
    /// Returns `Execution` error if the joined path is not representable.
    pub fn search_path(&self) -> Result<OsString> {
        let current = std::env::var_os("PATH").unwrap_or_default();
        let mut entries = vec![self.config.python_environment_path.clone()];
        entries.extend(std::env::split_paths(&current));
        std::env::join_paths(entries)
            .map_err(|e| Error::Execution(format!("invalid python_environment_path: {e}")))
    }
}

impl ExecutionTarget for PythonEnvironment {
    fn name(&self) -> &str {
        "PythonEnvironment"
    }

    fn run(&self, command: &Command, env: &Environment) -> Result<CommandOutput> {
        let mut scoped = Environment::new();
        for (key, value) in &self.config.environment_variables {
            scoped = scoped.var(key.clone(), value.clone());
        }
        scoped = scoped.var("PATH", self.search_path()?.to_string_lossy().into_owned());
        spawn(command, &scoped.merged(env))
    }
}
