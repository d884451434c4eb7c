//! Docker target: commands wrapped in `docker run --rm`

use super::local::spawn;
use super::{Command, CommandOutput, Environment, ExecutionTarget};
use crate::config::LocalDockerConfig;
use crate::Result;

/// Runs every command in a fresh container of a local image.
#[derive(Debug, Clone)]
pub struct DockerSystem {
    config: LocalDockerConfig,
}

impl DockerSystem {
    /// Create from `local_docker_config`.
    #[must_use]
    pub const fn new(config: LocalDockerConfig) -> Self {
        Self { config }
    }

    /// The `docker run` invocation wrapping `command`.
    #[must_use]
    pub fn wrap(&self, command: &Command, env: &Environment) -> Command {
        let mut docker = Command::new("docker").args(["run", "--rm"]);
        if let Some(params) = &self.config.run_params {
            for (host, container) in &params.volumes {
                docker = docker.arg("-v").arg(format!("{host}:{container}"));
            }
            for (key, value) in &params.environment {
                docker = docker.arg("-e").arg(format!("{key}={value}"));
            }
        }
        for (key, value) in env.iter() {
            docker = docker.arg("-e").arg(format!("{key}={value}"));
        }
        if let Some(dir) = command.cwd() {
            docker = docker.arg("-w").arg(dir.to_string_lossy().into_owned());
        }
        docker
            .arg(self.config.image_name.clone())
            .arg(command.program())
            .args(command.arguments().iter().cloned())
    }
}

impl ExecutionTarget for DockerSystem {
    fn name(&self) -> &str {
        "Docker"
    }

    fn run(&self, command: &Command, env: &Environment) -> Result<CommandOutput> {
        spawn(&self.wrap(command, env), &Environment::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DockerRunParams;
    use std::collections::BTreeMap;

    #[test]
    fn test_wrap_command() {
        let docker = DockerSystem::new(LocalDockerConfig {
            image_name: "passforge:cpu".to_string(),
            run_params: Some(DockerRunParams {
                volumes: BTreeMap::from([("/data".to_string(), "/mnt/data".to_string())]),
                environment: BTreeMap::new(),
            }),
            ..LocalDockerConfig::default()
        });
        let wrapped = docker.wrap(
            &Command::new("tool").arg("evaluate"),
            &Environment::new().var("OMP_NUM_THREADS", "4"),
        );
        assert_eq!(
            wrapped.to_string(),
            "docker run --rm -v /data:/mnt/data -e OMP_NUM_THREADS=4 passforge:cpu tool evaluate"
        );
    }
}
