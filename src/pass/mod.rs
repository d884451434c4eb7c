//! Pass - a single named model transformation
//!
//! A pass is a pure collaborator: `(input artifact, resolved config) ->
//! output artifact | error`. It declares an option schema, the formats it
//! accepts and the format it produces. Passes keep no state between
//! invocations; everything they need arrives through [`PassContext`].

mod catalog;
mod registry;
mod schema;
mod tool;

pub use catalog::builtin_passes;
pub use registry::PassRegistry;
pub use schema::{
    PassOptionSpec, PassParameters, PassSchema, ResolvedConfig, SearchableOption, DEFAULT_VALUE,
    SEARCHABLE_VALUES,
};
pub use tool::{ToolPass, ToolPassBuilder};

use crate::artifact::{ModelArtifact, ModelFormat};
use crate::data::{DataCatalog, DataSource};
use crate::system::ExecutionTarget;
use crate::value::OptionValue;
use crate::{Error, Result};
use std::path::Path;
use std::sync::Arc;

/// Everything a pass invocation may use besides its input and config.
#[derive(Clone, Copy)]
pub struct PassContext<'a> {
    /// Logical pass name in the flow
    pub pass_name: &'a str,
    /// Fresh directory owned by this invocation
    pub output_dir: &'a Path,
    /// Where external work runs
    pub target: &'a dyn ExecutionTarget,
    /// Tool command prefix
    pub runner: &'a str,
    /// Declared data sources
    pub data: &'a DataCatalog,
    /// Execution providers forwarded to tools
    pub execution_providers: &'a [String],
}

impl PassContext<'_> {
    /// Data source named by the config's `data_config` option.
    ///
    /// `data_config` may be a name or a map with a `name` key (the form
    /// the input model data config is substituted as).
    ///
    /// # Errors
    /// Returns `DataLoader` error if the referenced source is unknown.
    pub fn data_source(&self, config: &ResolvedConfig) -> Result<Option<Arc<dyn DataSource>>> {
        let name = match config.get("data_config") {
            None | Some(OptionValue::Null) => return Ok(None),
            Some(OptionValue::String(name)) => name.as_str(),
            Some(OptionValue::Map(map)) => map.get("name").and_then(OptionValue::as_str).unwrap_or(""),
            Some(other) => {
                return Err(Error::DataLoader(format!(
                    "pass '{}': data_config {other} is neither a name nor a data config",
                    self.pass_name
                )))
            }
        };
        self.data.get(name).map(Some).ok_or_else(|| {
            Error::DataLoader(format!(
                "pass '{}' references unknown data config '{name}'",
                self.pass_name
            ))
        })
    }
}

impl std::fmt::Debug for PassContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassContext")
            .field("pass_name", &self.pass_name)
            .field("output_dir", &self.output_dir)
            .field("target", &self.target.name())
            .finish_non_exhaustive()
    }
}

/// A registered transformation type.
pub trait Pass: Send + Sync {
    /// Registered type identifier (e.g. `"OnnxQuantization"`).
    fn pass_type(&self) -> &str;

    /// Option declarations.
    fn schema(&self) -> &PassSchema;

    /// Accepted input formats; empty accepts any.
    fn input_formats(&self) -> &[ModelFormat] {
        &[]
    }

    /// Produced format; `None` keeps the input format.
    fn output_format(&self) -> Option<ModelFormat> {
        None
    }

    /// Whether the pass needs a calibration data config.
    fn requires_data(&self) -> bool {
        false
    }

    /// Reject option combinations the pass cannot run. Rejected search
    /// points are recorded as invalid and never executed.
    fn validate_search_point(&self, _config: &ResolvedConfig) -> bool {
        true
    }

    /// Transform `input` into a new artifact written under
    /// `ctx.output_dir`. The returned id is replaced by the cache key.
    ///
    /// # Errors
    /// Returns `PassExecution` (or an execution/data error) when the
    /// transformation cannot complete.
    fn run(
        &self,
        input: &ModelArtifact,
        config: &ResolvedConfig,
        ctx: &PassContext<'_>,
    ) -> Result<ModelArtifact>;

    /// Whether this pass accepts `format`.
    fn accepts(&self, format: &ModelFormat) -> bool {
        let formats = self.input_formats();
        formats.is_empty() || formats.contains(format)
    }
}

impl std::fmt::Debug for dyn Pass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pass")
            .field("type", &self.pass_type())
            .finish_non_exhaustive()
    }
}
