//! Pass flow resolution
//!
//! A flow is an ordered chain of logical pass names. Resolution turns each
//! name into its registered [`Pass`] plus resolved [`PassParameters`] and
//! checks the chain: every name declared, no pass repeated, and each
//! step accepting the format the previous step produces.

use crate::artifact::ModelFormat;
use crate::config::RunConfig;
use crate::pass::{Pass, PassParameters, PassRegistry};
use crate::value::OptionValue;
use crate::{Error, Result};
use std::collections::BTreeSet;
use std::sync::Arc;

/// One resolved step of a flow.
#[derive(Debug, Clone)]
pub struct FlowStep {
    name: String,
    pass: Arc<dyn Pass>,
    params: PassParameters,
    clean_run_cache: bool,
}

impl FlowStep {
    /// Create a step.
    #[must_use]
    pub fn new(name: impl Into<String>, pass: Arc<dyn Pass>, params: PassParameters) -> Self {
        Self {
            name: name.into(),
            pass,
            params,
            clean_run_cache: false,
        }
    }

    /// Ignore cached outputs of this step.
    #[must_use]
    pub const fn with_clean_run_cache(mut self, clean: bool) -> Self {
        self.clean_run_cache = clean;
        self
    }

    /// Logical pass name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registered pass implementation
    #[must_use]
    pub const fn pass(&self) -> &Arc<dyn Pass> {
        &self.pass
    }

    /// Resolved options
    #[must_use]
    pub const fn params(&self) -> &PassParameters {
        &self.params
    }

    /// Whether cached outputs are ignored
    #[must_use]
    pub const fn clean_run_cache(&self) -> bool {
        self.clean_run_cache
    }
}

/// A validated linear chain of passes.
#[derive(Debug, Clone)]
pub struct ResolvedFlow {
    id: String,
    steps: Vec<FlowStep>,
}

impl ResolvedFlow {
    /// Build a flow from steps, checking the format chain from `input`.
    ///
    /// # Errors
    /// Returns `ConfigurationError` for an empty flow, a repeated pass or
    /// an incompatible format chain.
    pub fn new(steps: Vec<FlowStep>, input: &ModelFormat) -> Result<Self> {
        if steps.is_empty() {
            return Err(Error::config("a pass flow must name at least one pass"));
        }
        let id = steps
            .iter()
            .map(FlowStep::name)
            .collect::<Vec<_>>()
            .join("-");

        let mut seen = BTreeSet::new();
        let mut format = input.clone();
        for step in &steps {
            if !seen.insert(step.name()) {
                return Err(Error::config(format!(
                    "flow '{id}' uses pass '{}' more than once; flows must be linear chains",
                    step.name()
                )));
            }
            if !step.pass().accepts(&format) {
                let accepted: Vec<&str> =
                    step.pass().input_formats().iter().map(ModelFormat::as_str).collect();
                return Err(Error::config(format!(
                    "flow '{id}': pass '{}' ({}) accepts {} but receives {format}",
                    step.name(),
                    step.pass().pass_type(),
                    accepted.join("/")
                )));
            }
            if let Some(next) = step.pass().output_format() {
                format = next;
            }
        }
        Ok(Self { id, steps })
    }

    /// Flow identity: pass names joined by `-`
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Steps in execution order
    #[must_use]
    pub fn steps(&self) -> &[FlowStep] {
        &self.steps
    }

    /// Look up a step by logical pass name.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&FlowStep> {
        self.steps.iter().find(|step| step.name == name)
    }
}

/// Resolve every flow of a run document.
///
/// # Errors
/// Returns `ConfigurationError` for unknown pass types or names, invalid
/// option values, missing data configs, broken format chains and
/// duplicate flows.
pub fn resolve_flows(config: &RunConfig, registry: &PassRegistry) -> Result<Vec<ResolvedFlow>> {
    let input_format = ModelFormat::from_model_type(&config.input_model.model_type);
    let input_data = config
        .input_model_data_config()?
        .map(|data| data.to_option_value());
    let search_enabled = config.engine.search_enabled();

    let mut flows: Vec<ResolvedFlow> = Vec::new();
    for names in config.flows() {
        let mut steps = Vec::with_capacity(names.len());
        for name in &names {
            let pass_config = config.pass(name).ok_or_else(|| {
                Error::config(format!(
                    "pass flow references '{name}', which is not declared in passes (declared: {})",
                    config.pass_names().join(", ")
                ))
            })?;
            let pass = registry.get(&pass_config.pass_type)?;
            pass.schema().validate(pass.pass_type())?;
            let params = pass.schema().resolve(
                name,
                &pass_config.config,
                search_enabled && !pass_config.disable_search,
                input_data.as_ref(),
            )?;
            check_data_references(config, name, pass.as_ref(), &params)?;
            steps.push(
                FlowStep::new(name.clone(), pass, params)
                    .with_clean_run_cache(pass_config.clean_run_cache),
            );
        }
        let flow = ResolvedFlow::new(steps, &input_format)?;
        if flows.iter().any(|existing| existing.id == flow.id) {
            return Err(Error::config(format!("pass flow '{}' is declared twice", flow.id)));
        }
        flows.push(flow);
    }
    Ok(flows)
}

fn check_data_references(
    config: &RunConfig,
    name: &str,
    pass: &dyn Pass,
    params: &PassParameters,
) -> Result<()> {
    let data = params.fixed().get("data_config");
    if pass.requires_data()
        && pass.schema().get("data_config").is_some()
        && data.map_or(true, OptionValue::is_null)
    {
        return Err(Error::config(format!(
            "pass '{name}' ({}) needs calibration data; set its data_config",
            pass.pass_type()
        )));
    }
    if let Some(OptionValue::String(reference)) = data {
        if !config.data_configs.contains_key(reference) {
            return Err(Error::config(format!(
                "pass '{name}' references data config '{reference}', which is not declared in data_configs"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_config(json: &str) -> RunConfig {
        RunConfig::from_json_str(json).unwrap()
    }

    const BASE: &str = r#"{
        "input_model": {"type": "PyTorchModel", "config": {"model_path": "model.pt"}},
        "passes": {
            "conversion": {"type": "OnnxConversion"},
            "quantization": {"type": "OnnxDynamicQuantization"},
            "perf": {"type": "OrtPerfTuning"}
        }
    }"#;

    #[test]
    fn test_default_flow_uses_every_pass() {
        let flows = resolve_flows(&run_config(BASE), &PassRegistry::with_builtins()).unwrap();
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].id(), "conversion-quantization-perf");
        assert_eq!(flows[0].steps().len(), 3);
    }

    #[test]
    fn test_format_chain_checked() {
        let mut config = run_config(BASE);
        config.pass_flows = vec![vec!["quantization".to_string()]];
        let err = resolve_flows(&config, &PassRegistry::with_builtins()).unwrap_err();
        assert!(err.to_string().contains("receives pytorch"), "{err}");
    }

    #[test]
    fn test_repeated_pass_rejected() {
        let mut config = run_config(BASE);
        config.pass_flows = vec![vec![
            "conversion".to_string(),
            "perf".to_string(),
            "perf".to_string(),
        ]];
        let err = resolve_flows(&config, &PassRegistry::with_builtins()).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_unknown_pass_name_and_duplicate_flow() {
        let mut config = run_config(BASE);
        config.pass_flows = vec![vec!["conversion".to_string(), "pruning".to_string()]];
        assert!(resolve_flows(&config, &PassRegistry::with_builtins()).is_err());

        config.pass_flows = vec![vec!["conversion".to_string()], vec!["conversion".to_string()]];
        let err = resolve_flows(&config, &PassRegistry::with_builtins()).unwrap_err();
        assert!(err.to_string().contains("declared twice"));
    }

    #[test]
    fn test_static_quantization_needs_data() {
        let config = run_config(
            r#"{
            "input_model": {"type": "ONNXModel", "config": {"model_path": "model.onnx"}},
            "passes": {"quantization": {"type": "OnnxStaticQuantization"}}
        }"#,
        );
        let err = resolve_flows(&config, &PassRegistry::with_builtins()).unwrap_err();
        assert!(err.to_string().contains("calibration data"));
    }

    #[test]
    fn test_disable_search_pins_options() {
        let config = run_config(
            r#"{
            "input_model": {"type": "ONNXModel", "config": {"model_path": "model.onnx"}},
            "passes": {"quantization": {"type": "OnnxDynamicQuantization", "disable_search": true}},
            "engine": {"search_strategy": true}
        }"#,
        );
        let flows = resolve_flows(&config, &PassRegistry::with_builtins()).unwrap();
        assert!(flows[0].steps()[0].params().searchable().is_empty());
    }
}
