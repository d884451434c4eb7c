//! Pass option schema and config resolution
//!
//! A pass declares every option it understands. User config in the run
//! document is validated against that declaration and split into fixed
//! values and searchable domains.

use crate::search::SearchParameter;
use crate::value::OptionValue;
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Config value asking for the option's search domain.
pub const SEARCHABLE_VALUES: &str = "SEARCHABLE_VALUES";

/// Config value pinning the option to its default.
pub const DEFAULT_VALUE: &str = "DEFAULT_VALUE";

/// Fully resolved option map handed to a pass invocation.
pub type ResolvedConfig = BTreeMap<String, OptionValue>;

/// Declaration of a single pass option.
#[derive(Debug, Clone, PartialEq)]
pub struct PassOptionSpec {
    name: String,
    default: OptionValue,
    searchable: Option<SearchParameter>,
    required: bool,
    description: String,
}

impl PassOptionSpec {
    /// Option with a default value.
    pub fn new(name: impl Into<String>, default: impl Into<OptionValue>) -> Self {
        Self {
            name: name.into(),
            default: default.into(),
            searchable: None,
            required: false,
            description: String::new(),
        }
    }

    /// Option the user must set.
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            required: true,
            ..Self::new(name, OptionValue::Null)
        }
    }

    /// Declare the search domain.
    #[must_use]
    pub fn searchable(mut self, domain: SearchParameter) -> Self {
        self.searchable = Some(domain);
        self
    }

    /// Attach a description.
    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Option name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Default value
    #[must_use]
    pub const fn default_value(&self) -> &OptionValue {
        &self.default
    }

    /// Search domain, if searchable
    #[must_use]
    pub const fn search_domain(&self) -> Option<&SearchParameter> {
        self.searchable.as_ref()
    }

    /// Whether the user must supply a value
    #[must_use]
    pub const fn is_required(&self) -> bool {
        self.required
    }

    /// Human readable description
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Ordered option declarations of one pass type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassSchema {
    options: Vec<PassOptionSpec>,
}

impl PassSchema {
    /// Empty schema.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            options: Vec::new(),
        }
    }

    /// Append an option declaration.
    #[must_use]
    pub fn option(mut self, spec: PassOptionSpec) -> Self {
        self.options.push(spec);
        self
    }

    /// Append all declarations of another schema.
    #[must_use]
    pub fn extend(mut self, other: Self) -> Self {
        self.options.extend(other.options);
        self
    }

    /// Look up an option by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PassOptionSpec> {
        self.options.iter().find(|spec| spec.name == name)
    }

    /// Iterate declarations in order.
    pub fn iter(&self) -> impl Iterator<Item = &PassOptionSpec> {
        self.options.iter()
    }

    /// Names of all options with a search domain.
    #[must_use]
    pub fn searchable_names(&self) -> Vec<&str> {
        self.options
            .iter()
            .filter(|spec| spec.searchable.is_some())
            .map(PassOptionSpec::name)
            .collect()
    }

    /// Check declarations are consistent.
    ///
    /// # Errors
    /// Returns `ConfigurationError` for duplicate names, malformed domains,
    /// or conditional parents not declared earlier in the schema.
    pub fn validate(&self, pass_type: &str) -> Result<()> {
        for (index, spec) in self.options.iter().enumerate() {
            let earlier = &self.options[..index];
            if earlier.iter().any(|prev| prev.name == spec.name) {
                return Err(Error::config(format!(
                    "pass type '{pass_type}' declares option '{}' twice",
                    spec.name
                )));
            }
            if let Some(domain) = &spec.searchable {
                domain.validate(&spec.name)?;
                for parent in domain.parents() {
                    if !earlier.iter().any(|prev| &prev.name == parent) {
                        return Err(Error::config(format!(
                            "option '{}' of pass type '{pass_type}' depends on '{parent}', which is not declared before it",
                            spec.name
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve user config against this schema.
    ///
    /// # Arguments
    /// * `pass_name` - Logical pass name (for error messages)
    /// * `user` - Option values from the run document
    /// * `search_enabled` - Whether searchable options stay searchable
    /// * `input_data_config` - Substitution for `__input_model_data_config__`
    ///
    /// # Errors
    /// Returns `ConfigurationError` for unknown option names, missing
    /// required values, `SEARCHABLE_VALUES` on a non-searchable option, or
    /// an unresolvable data config reference.
    pub fn resolve(
        &self,
        pass_name: &str,
        user: &BTreeMap<String, OptionValue>,
        search_enabled: bool,
        input_data_config: Option<&OptionValue>,
    ) -> Result<PassParameters> {
        if let Some(unknown) = user.keys().find(|key| self.get(key).is_none()) {
            let known: Vec<&str> = self.options.iter().map(PassOptionSpec::name).collect();
            return Err(Error::config(format!(
                "pass '{pass_name}' has unknown option '{unknown}' (known options: {})",
                known.join(", ")
            )));
        }

        let mut params = PassParameters::default();
        for spec in &self.options {
            params
                .defaults
                .insert(spec.name.clone(), spec.default.clone());

            let chosen = match user.get(&spec.name) {
                Some(OptionValue::String(s)) if s == SEARCHABLE_VALUES => {
                    if spec.searchable.is_none() {
                        return Err(Error::config(format!(
                            "option '{}' of pass '{pass_name}' is not searchable",
                            spec.name
                        )));
                    }
                    None
                }
                Some(OptionValue::String(s)) if s == DEFAULT_VALUE => Some(spec.default.clone()),
                Some(value) => Some(value.clone()),
                None if spec.searchable.is_some() && search_enabled => None,
                None => Some(spec.default.clone()),
            };

            match (chosen, &spec.searchable) {
                (Some(value), _) => {
                    let value = resolve_reference(pass_name, &spec.name, value, input_data_config)?;
                    if spec.required && value.is_null() {
                        return Err(Error::config(format!(
                            "option '{}' of pass '{pass_name}' is required",
                            spec.name
                        )));
                    }
                    params.fixed.insert(spec.name.clone(), value);
                }
                (None, Some(domain)) if search_enabled => {
                    params.add_searchable(&spec.name, domain);
                }
                (None, _) => {
                    params
                        .fixed
                        .insert(spec.name.clone(), spec.default.clone());
                }
            }
        }
        Ok(params)
    }
}

fn resolve_reference(
    pass_name: &str,
    option: &str,
    value: OptionValue,
    input_data_config: Option<&OptionValue>,
) -> Result<OptionValue> {
    if !value.has_unresolved_reference() {
        return Ok(value);
    }
    input_data_config
        .map(|data| value.substitute_reference(data))
        .ok_or_else(|| {
            Error::config(format!(
                "option '{option}' of pass '{pass_name}' references the input model data config, \
                 but the input model declares none"
            ))
        })
}

/// One searchable option after resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchableOption {
    /// Option name
    pub name: String,
    /// Domain (conditionals already narrowed where parents are fixed)
    pub domain: SearchParameter,
    /// Fixed parent values a conditional domain depends on
    pub context: BTreeMap<String, OptionValue>,
}

/// Resolved options of one pass: fixed values plus searchable domains.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassParameters {
    fixed: ResolvedConfig,
    searchable: Vec<SearchableOption>,
    defaults: ResolvedConfig,
}

impl PassParameters {
    fn add_searchable(&mut self, name: &str, domain: &SearchParameter) {
        let parents = domain.parents();
        let searchable_parents = parents
            .iter()
            .any(|parent| self.searchable.iter().any(|opt| &opt.name == parent));

        if domain.is_conditional() && !searchable_parents {
            // Every parent is fixed: narrow to the matching branch now.
            let parent_values: Vec<OptionValue> = parents
                .iter()
                .map(|parent| self.fixed.get(parent).cloned().unwrap_or(OptionValue::Null))
                .collect();
            match domain.branch_for(&parent_values) {
                Some(branch) => self.searchable.push(SearchableOption {
                    name: name.to_string(),
                    domain: branch.clone(),
                    context: BTreeMap::new(),
                }),
                None => {
                    let default = self.defaults.get(name).cloned().unwrap_or(OptionValue::Null);
                    self.fixed.insert(name.to_string(), default);
                }
            }
            return;
        }

        let context = parents
            .iter()
            .filter_map(|parent| {
                self.fixed
                    .get(parent)
                    .map(|value| (parent.clone(), value.clone()))
            })
            .collect();
        self.searchable.push(SearchableOption {
            name: name.to_string(),
            domain: domain.clone(),
            context,
        });
    }

    /// Fixed option values.
    #[must_use]
    pub const fn fixed(&self) -> &ResolvedConfig {
        &self.fixed
    }

    /// Searchable options in schema order.
    #[must_use]
    pub fn searchable(&self) -> &[SearchableOption] {
        &self.searchable
    }

    /// Schema default of an option.
    #[must_use]
    pub fn default_of(&self, name: &str) -> Option<&OptionValue> {
        self.defaults.get(name)
    }

    /// Concrete config for one assignment of the searchable options.
    ///
    /// Searchable options missing from `assigned` (inactive conditionals)
    /// take their schema default.
    #[must_use]
    pub fn config_at(&self, assigned: &BTreeMap<String, OptionValue>) -> ResolvedConfig {
        let mut config = self.fixed.clone();
        for option in &self.searchable {
            let value = assigned
                .get(&option.name)
                .or_else(|| self.defaults.get(&option.name))
                .cloned()
                .unwrap_or(OptionValue::Null);
            config.insert(option.name.clone(), value);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> PassSchema {
        PassSchema::new()
            .option(
                PassOptionSpec::new("quant_mode", "static")
                    .searchable(SearchParameter::categorical(["dynamic", "static"])),
            )
            .option(
                PassOptionSpec::new("calibrate_method", "MinMax").searchable(
                    SearchParameter::conditional_on(
                        "quant_mode",
                        [(
                            OptionValue::from("static"),
                            SearchParameter::categorical(["MinMax", "Entropy"]),
                        )],
                    ),
                ),
            )
            .option(PassOptionSpec::new("data_config", OptionValue::Null))
    }

    fn user(pairs: &[(&str, OptionValue)]) -> BTreeMap<String, OptionValue> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = schema()
            .resolve("quant", &user(&[("bogus", OptionValue::Int(1))]), true, None)
            .unwrap_err();
        assert!(err.to_string().contains("unknown option 'bogus'"));
    }

    #[test]
    fn test_searchable_by_default_when_search_enabled() {
        let params = schema().resolve("quant", &BTreeMap::new(), true, None).unwrap();
        let names: Vec<&str> = params.searchable().iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, ["quant_mode", "calibrate_method"]);
    }

    #[test]
    fn test_search_disabled_uses_defaults() {
        let params = schema().resolve("quant", &BTreeMap::new(), false, None).unwrap();
        assert!(params.searchable().is_empty());
        assert_eq!(params.fixed().get("quant_mode"), Some(&OptionValue::from("static")));
    }

    #[test]
    fn test_fixed_parent_narrows_conditional() {
        let params = schema()
            .resolve("quant", &user(&[("quant_mode", "dynamic".into())]), true, None)
            .unwrap();
        assert!(params.searchable().is_empty());
        assert_eq!(
            params.fixed().get("calibrate_method"),
            Some(&OptionValue::from("MinMax"))
        );

        let params = schema()
            .resolve("quant", &user(&[("quant_mode", "static".into())]), true, None)
            .unwrap();
        assert_eq!(params.searchable().len(), 1);
        assert!(!params.searchable()[0].domain.is_conditional());
    }

    #[test]
    fn test_input_model_data_config_substitution() {
        let config = user(&[("data_config", OptionValue::InputModelDataConfig)]);
        assert!(schema().resolve("quant", &config, true, None).is_err());

        let data = OptionValue::from("glue_mrpc");
        let params = schema().resolve("quant", &config, true, Some(&data)).unwrap();
        assert_eq!(params.fixed().get("data_config"), Some(&data));
    }

    #[test]
    fn test_searchable_values_sentinel_on_plain_option() {
        let config = user(&[("data_config", SEARCHABLE_VALUES.into())]);
        assert!(schema().resolve("quant", &config, true, None).is_err());
    }

    #[test]
    fn test_conditional_parent_must_precede() {
        let bad = PassSchema::new().option(
            PassOptionSpec::new("a", 1_i64).searchable(SearchParameter::conditional_on(
                "b",
                [(OptionValue::Int(1), SearchParameter::Boolean)],
            )),
        );
        assert!(bad.validate("Bad").is_err());
        assert!(schema().validate("Quant").is_ok());
    }

    #[test]
    fn test_config_at_fills_inactive_defaults() {
        let params = schema().resolve("quant", &BTreeMap::new(), true, None).unwrap();
        let assigned = user(&[("quant_mode", "dynamic".into())]);
        let config = params.config_at(&assigned);
        assert_eq!(config.get("calibrate_method"), Some(&OptionValue::from("MinMax")));
        assert_eq!(config.get("data_config"), Some(&OptionValue::Null));
    }
}
