//! Joint search space over pass flows
//!
//! The space is the Cartesian product of every searchable option domain
//! of the passes in a flow. With several flows the flow choice is one more
//! categorical dimension: a point belongs to exactly one flow and only
//! carries values for that flow's passes.

use super::point::{PassValues, SearchPoint};
use super::SearchParameter;
use crate::flow::ResolvedFlow;
use crate::value::OptionValue;
use crate::{Error, Result};
use rand::Rng;
use std::collections::BTreeMap;

/// Largest space `enumerate` will materialize.
pub const MAX_ENUMERATED_POINTS: u64 = 1_000_000;

/// One searchable option of one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Dimension {
    /// Logical pass name
    pub pass: String,
    /// Option name
    pub option: String,
    /// Domain (may be conditional on earlier options of the same pass)
    pub parameter: SearchParameter,
    /// Schema default, used when the pass is not being tuned
    pub default: OptionValue,
    /// Fixed parent values a conditional domain depends on
    pub context: BTreeMap<String, OptionValue>,
}

impl Dimension {
    /// Active domain given the values already assigned to this pass.
    ///
    /// `None` means the option is inactive (conditional without a match).
    #[must_use]
    pub fn active_domain(&self, assigned: &BTreeMap<String, OptionValue>) -> Option<&SearchParameter> {
        if !self.parameter.is_conditional() {
            return Some(&self.parameter);
        }
        let parent_values: Vec<OptionValue> = self
            .parameter
            .parents()
            .iter()
            .map(|parent| {
                assigned
                    .get(parent)
                    .or_else(|| self.context.get(parent))
                    .cloned()
                    .unwrap_or(OptionValue::Null)
            })
            .collect();
        self.parameter.branch_for(&parent_values)
    }

    /// Value used when this dimension is held fixed: the schema default if
    /// it lies in the active domain, else the first domain value.
    #[must_use]
    pub fn held_value(&self, domain: &SearchParameter) -> OptionValue {
        if domain.contains(&self.default) {
            return self.default.clone();
        }
        match domain {
            SearchParameter::FloatRange { low, .. } => OptionValue::Float(*low),
            other => other
                .values()
                .and_then(|values| values.into_iter().next())
                .unwrap_or_else(|| self.default.clone()),
        }
    }
}

/// Search space of a single flow.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSpace {
    /// Flow identity
    pub flow: String,
    /// Searchable dimensions, in flow then schema order
    pub dimensions: Vec<Dimension>,
    /// Values pinned for passes not tuned in this space
    pub fixed: PassValues,
}

impl FlowSpace {
    /// Build from a resolved flow.
    #[must_use]
    pub fn from_flow(flow: &ResolvedFlow) -> Self {
        let dimensions = flow
            .steps()
            .iter()
            .flat_map(|step| {
                step.params().searchable().iter().map(move |opt| Dimension {
                    pass: step.name().to_string(),
                    option: opt.name.clone(),
                    parameter: opt.domain.clone(),
                    default: step
                        .params()
                        .default_of(&opt.name)
                        .cloned()
                        .unwrap_or(OptionValue::Null),
                    context: opt.context.clone(),
                })
            })
            .collect();
        Self {
            flow: flow.id().to_string(),
            dimensions,
            fixed: PassValues::new(),
        }
    }

    /// Logical names of passes with at least one dimension, in order.
    #[must_use]
    pub fn tunable_passes(&self) -> Vec<String> {
        let mut passes: Vec<String> = Vec::new();
        for dim in &self.dimensions {
            if !passes.contains(&dim.pass) {
                passes.push(dim.pass.clone());
            }
        }
        passes
    }

    /// Assignment holding every dimension at its held value.
    #[must_use]
    pub fn held_assignment(&self) -> PassValues {
        let mut values = self.fixed.clone();
        for dim in &self.dimensions {
            let assigned = values.entry(dim.pass.clone()).or_default();
            if let Some(domain) = dim.active_domain(assigned).cloned() {
                let held = dim.held_value(&domain);
                assigned.insert(dim.option.clone(), held);
            }
        }
        values.retain(|_, opts| !opts.is_empty());
        values
    }

    /// Sub-space tuning only `pass`; every other dimension is pinned to
    /// its value in `base` (or its held value when `base` lacks it).
    #[must_use]
    pub fn restrict_to(&self, pass: &str, base: &PassValues) -> Self {
        let held = self.held_assignment();
        let mut fixed = PassValues::new();
        for dim in self.dimensions.iter().filter(|d| d.pass != pass) {
            let value = base
                .get(&dim.pass)
                .and_then(|opts| opts.get(&dim.option))
                .or_else(|| held.get(&dim.pass).and_then(|opts| opts.get(&dim.option)));
            if let Some(value) = value {
                fixed
                    .entry(dim.pass.clone())
                    .or_default()
                    .insert(dim.option.clone(), value.clone());
            }
        }
        Self {
            flow: self.flow.clone(),
            dimensions: self
                .dimensions
                .iter()
                .filter(|d| d.pass == pass)
                .cloned()
                .collect(),
            fixed,
        }
    }

    /// Exact number of points (`None` if any active domain is continuous
    /// or the count does not fit).
    #[must_use]
    pub fn cardinality(&self) -> Option<u64> {
        fn count(dims: &[Dimension], values: &mut PassValues) -> Option<u64> {
            let Some((dim, rest)) = dims.split_first() else {
                return Some(1);
            };
            let assigned = values.get(&dim.pass).cloned().unwrap_or_default();
            let Some(domain) = dim.active_domain(&assigned).cloned() else {
                return count(rest, values);
            };
            if !dim.parameter.is_conditional() && !rest.iter().any(|d| d.pass == dim.pass && d.parameter.is_conditional()) {
                // Nothing later depends on this value: multiply directly.
                return domain.cardinality()?.checked_mul(count(rest, values)?);
            }
            let mut total: u64 = 0;
            for value in domain.values()? {
                values
                    .entry(dim.pass.clone())
                    .or_default()
                    .insert(dim.option.clone(), value);
                total = total.checked_add(count(rest, values)?)?;
            }
            if let Some(opts) = values.get_mut(&dim.pass) {
                opts.remove(&dim.option);
            }
            Some(total)
        }
        count(&self.dimensions, &mut self.fixed.clone())
    }

    /// Every point of the space, in declaration order.
    ///
    /// # Errors
    /// Returns `ConfigurationError` if a continuous range is active or the
    /// space exceeds [`MAX_ENUMERATED_POINTS`].
    pub fn enumerate(&self) -> Result<Vec<SearchPoint>> {
        match self.cardinality() {
            Some(n) if n <= MAX_ENUMERATED_POINTS => {}
            Some(n) => {
                return Err(Error::config(format!(
                    "search space of flow '{}' has {n} points, too many to enumerate; use the tpe or random algorithm",
                    self.flow
                )))
            }
            None => {
                return Err(Error::config(format!(
                    "search space of flow '{}' has a continuous dimension; exhaustive search needs a step",
                    self.flow
                )))
            }
        }

        let mut points = Vec::new();
        let mut values = self.fixed.clone();
        self.enumerate_from(0, &mut values, &mut points);
        Ok(points)
    }

    fn enumerate_from(&self, index: usize, values: &mut PassValues, out: &mut Vec<SearchPoint>) {
        let Some(dim) = self.dimensions.get(index) else {
            let mut assignment = values.clone();
            assignment.retain(|_, opts| !opts.is_empty());
            out.push(SearchPoint::new(self.flow.clone(), assignment));
            return;
        };
        let assigned = values.get(&dim.pass).cloned().unwrap_or_default();
        let domain_values = dim.active_domain(&assigned).and_then(SearchParameter::values);
        let Some(domain_values) = domain_values else {
            self.enumerate_from(index + 1, values, out);
            return;
        };
        for value in domain_values {
            values
                .entry(dim.pass.clone())
                .or_default()
                .insert(dim.option.clone(), value);
            self.enumerate_from(index + 1, values, out);
        }
        if let Some(opts) = values.get_mut(&dim.pass) {
            opts.remove(&dim.option);
        }
    }

    /// Uniform random point.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> SearchPoint {
        let mut values = self.fixed.clone();
        for dim in &self.dimensions {
            let assigned = values.entry(dim.pass.clone()).or_default();
            if let Some(domain) = dim.active_domain(assigned).cloned() {
                let value = domain.sample(rng);
                assigned.insert(dim.option.clone(), value);
            }
        }
        values.retain(|_, opts| !opts.is_empty());
        SearchPoint::new(self.flow.clone(), values)
    }
}

/// Search space over all declared flows.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSpace {
    flows: Vec<FlowSpace>,
}

impl SearchSpace {
    /// Build from resolved flows.
    #[must_use]
    pub fn from_flows(flows: &[ResolvedFlow]) -> Self {
        Self {
            flows: flows.iter().map(FlowSpace::from_flow).collect(),
        }
    }

    /// Build from prepared flow spaces.
    #[must_use]
    pub const fn from_flow_spaces(flows: Vec<FlowSpace>) -> Self {
        Self { flows }
    }

    /// Flow sub-spaces; the index is the value of the flow dimension.
    #[must_use]
    pub fn flows(&self) -> &[FlowSpace] {
        &self.flows
    }

    /// Look up a flow space by identity.
    #[must_use]
    pub fn flow(&self, id: &str) -> Option<&FlowSpace> {
        self.flows.iter().find(|f| f.flow == id)
    }

    /// Every `(pass, option)` searchable anywhere in the space.
    #[must_use]
    pub fn option_keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<(String, String)> = self
            .flows
            .iter()
            .flat_map(|f| f.dimensions.iter().map(|d| (d.pass.clone(), d.option.clone())))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Total points over all flows (`None` if any flow is continuous).
    #[must_use]
    pub fn cardinality(&self) -> Option<u64> {
        self.flows
            .iter()
            .try_fold(0_u64, |acc, f| acc.checked_add(f.cardinality()?))
    }

    /// Every point, flow by flow.
    ///
    /// # Errors
    /// See [`FlowSpace::enumerate`].
    pub fn enumerate(&self) -> Result<Vec<SearchPoint>> {
        let mut points = Vec::new();
        for flow in &self.flows {
            points.extend(flow.enumerate()?);
        }
        Ok(points)
    }

    /// Uniform random point: pick a flow, then sample within it.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<SearchPoint> {
        if self.flows.is_empty() {
            return None;
        }
        let index = rng.gen_range(0..self.flows.len());
        Some(self.flows[index].sample(rng))
    }
}
