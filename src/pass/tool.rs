//! Tool-invoked passes
//!
//! The heavy lifting of a tool pass happens in an external program run
//! through the execution target:
//!
//! ```text
//! <runner> pass <type> --input <path> --output <dir> --config <json-file>
//! ```
//!
//! The tool prints the output artifact as JSON
//! (`{"path": .., "format": .., "metadata": {..}}`) or nothing, in which
//! case the output directory is the artifact.

use super::{Pass, PassContext, PassSchema, ResolvedConfig};
use crate::artifact::{ModelArtifact, ModelFormat};
use crate::hash::Fingerprint;
use crate::system::{Command, Environment};
use crate::value::OptionValue;
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;

type Validator = fn(&ResolvedConfig) -> bool;

/// Pass delegating its work to an external tool.
#[derive(Debug, Clone)]
pub struct ToolPass {
    pass_type: String,
    schema: PassSchema,
    input_formats: Vec<ModelFormat>,
    output_format: Option<ModelFormat>,
    requires_data: bool,
    validator: Option<Validator>,
}

impl ToolPass {
    /// Start declaring a tool pass.
    pub fn builder(pass_type: impl Into<String>) -> ToolPassBuilder {
        ToolPassBuilder {
            pass: Self {
                pass_type: pass_type.into(),
                schema: PassSchema::new(),
                input_formats: Vec::new(),
                output_format: None,
                requires_data: false,
                validator: None,
            },
        }
    }
}

/// Builder for [`ToolPass`].
#[derive(Debug, Clone)]
pub struct ToolPassBuilder {
    pass: ToolPass,
}

impl ToolPassBuilder {
    /// Option schema.
    #[must_use]
    pub fn schema(mut self, schema: PassSchema) -> Self {
        self.pass.schema = schema;
        self
    }

    /// Accepted input formats.
    #[must_use]
    pub fn inputs(mut self, formats: impl IntoIterator<Item = ModelFormat>) -> Self {
        self.pass.input_formats = formats.into_iter().collect();
        self
    }

    /// Produced format.
    #[must_use]
    pub fn output(mut self, format: ModelFormat) -> Self {
        self.pass.output_format = Some(format);
        self
    }

    /// Mark as needing calibration data.
    #[must_use]
    pub const fn requires_data(mut self) -> Self {
        self.pass.requires_data = true;
        self
    }

    /// Search point validator.
    #[must_use]
    pub fn validator(mut self, validator: Validator) -> Self {
        self.pass.validator = Some(validator);
        self
    }

    /// Finish.
    #[must_use]
    pub fn build(self) -> ToolPass {
        self.pass
    }
}

#[derive(Debug, Deserialize)]
struct ToolArtifact {
    path: PathBuf,
    #[serde(default)]
    format: Option<ModelFormat>,
    #[serde(default)]
    metadata: BTreeMap<String, OptionValue>,
}

impl Pass for ToolPass {
    fn pass_type(&self) -> &str {
        &self.pass_type
    }

    fn schema(&self) -> &PassSchema {
        &self.schema
    }

    fn input_formats(&self) -> &[ModelFormat] {
        &self.input_formats
    }

    fn output_format(&self) -> Option<ModelFormat> {
        self.output_format.clone()
    }

    fn requires_data(&self) -> bool {
        self.requires_data
    }

    fn validate_search_point(&self, config: &ResolvedConfig) -> bool {
        self.validator.map_or(true, |validate| validate(config))
    }

    fn run(
        &self,
        input: &ModelArtifact,
        config: &ResolvedConfig,
        ctx: &PassContext<'_>,
    ) -> Result<ModelArtifact> {
        let config_json = OptionValue::Map(config.clone()).to_json();
        let mut config_file = tempfile::Builder::new()
            .prefix("passforge-pass-")
            .suffix(".json")
            .tempfile_in(ctx.output_dir)?;
        serde_json::to_writer_pretty(&mut config_file, &config_json)?;
        config_file.flush()?;

        let mut command = Command::from_runner(ctx.runner)?
            .arg("pass")
            .arg(self.pass_type.clone())
            .arg("--input")
            .arg(input.path().to_string_lossy().into_owned())
            .arg("--output")
            .arg(ctx.output_dir.to_string_lossy().into_owned())
            .arg("--config")
            .arg(config_file.path().to_string_lossy().into_owned());
        for provider in ctx.execution_providers {
            command = command.arg("--execution-provider").arg(provider.clone());
        }

        let output = ctx.target.run(&command, &Environment::new())?;
        if !output.success() {
            return Err(Error::pass(
                ctx.pass_name,
                format!(
                    "tool exited with {}: {}",
                    output.status_text(),
                    output.stderr.trim()
                ),
            ));
        }

        let format = self
            .output_format
            .clone()
            .unwrap_or_else(|| input.format().clone());
        let stdout = output.stdout.trim();
        if stdout.is_empty() {
            return Ok(ModelArtifact::new(Fingerprint::of_bytes(&[]), ctx.output_dir, format));
        }
        let printed: ToolArtifact = serde_json::from_str(stdout).map_err(|e| {
            Error::pass(ctx.pass_name, format!("tool printed an invalid artifact: {e}"))
        })?;
        let path = if printed.path.is_absolute() {
            printed.path
        } else {
            ctx.output_dir.join(printed.path)
        };
        let mut artifact = ModelArtifact::new(
            Fingerprint::of_bytes(&[]),
            path,
            printed.format.unwrap_or(format),
        );
        for (key, value) in printed.metadata {
            artifact = artifact.with_metadata(key, value);
        }
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataCatalog;
    use crate::system::{CommandOutput, ExecutionTarget};

    #[derive(Debug)]
    struct Scripted {
        stdout: &'static str,
        status: i32,
    }

    impl ExecutionTarget for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn run(&self, command: &Command, _env: &Environment) -> Result<CommandOutput> {
            assert_eq!(command.arguments()[0], "pass");
            assert_eq!(command.arguments()[1], "OnnxConversion");
            Ok(CommandOutput {
                status: Some(self.status),
                stdout: self.stdout.to_string(),
                stderr: "boom".to_string(),
            })
        }
    }

    fn run_with(target: &Scripted) -> Result<ModelArtifact> {
        let dir = tempfile::tempdir().unwrap();
        let pass = ToolPass::builder("OnnxConversion")
            .inputs([ModelFormat::PyTorch])
            .output(ModelFormat::Onnx)
            .build();
        let catalog = DataCatalog::default();
        let ctx = PassContext {
            pass_name: "conversion",
            output_dir: dir.path(),
            target,
            runner: "tool",
            data: &catalog,
            execution_providers: &[],
        };
        let input = ModelArtifact::input("model.pt", ModelFormat::PyTorch, BTreeMap::new());
        pass.run(&input, &ResolvedConfig::new(), &ctx)
    }

    #[test]
    fn test_empty_stdout_uses_output_dir() {
        let artifact = run_with(&Scripted { stdout: "", status: 0 }).unwrap();
        assert_eq!(artifact.format(), &ModelFormat::Onnx);
    }

    #[test]
    fn test_printed_artifact() {
        let artifact = run_with(&Scripted {
            stdout: r#"{"path": "model.onnx", "metadata": {"opset": 17}}"#,
            status: 0,
        })
        .unwrap();
        assert!(artifact.path().ends_with("model.onnx"));
        assert_eq!(artifact.metadata().get("opset"), Some(&OptionValue::Int(17)));
    }

    #[test]
    fn test_tool_failure_is_pass_error() {
        let err = run_with(&Scripted { stdout: "", status: 2 }).unwrap_err();
        assert!(matches!(err, Error::PassExecution { ref pass, .. } if pass == "conversion"));
        assert!(err.to_string().contains("boom"));
    }
}
