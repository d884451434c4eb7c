//! Search parameter domains
//!
//! A searchable pass option declares a domain instead of a fixed value.
//! Domains are either discrete (categorical, boolean, stepped ranges) or
//! continuous (float ranges without a step). `Conditional` picks a domain
//! based on the values of other options of the same pass.

use crate::value::OptionValue;
use crate::{Error, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Upper bound on the values a stepped range may expand to.
const MAX_RANGE_POINTS: u64 = 100_000;

/// One branch of a conditional domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalSupport {
    /// Parent values (same order as `parents`) selecting this branch
    pub when: Vec<OptionValue>,
    /// Domain used when the parents match
    pub domain: SearchParameter,
}

/// Domain of a searchable option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchParameter {
    /// Enumerated set of values
    Categorical {
        /// Candidate values, in declaration order
        values: Vec<OptionValue>,
    },
    /// `[false, true]`
    Boolean,
    /// Integers `low..=high` stepping by `step`
    IntRange {
        /// Inclusive lower bound
        low: i64,
        /// Inclusive upper bound
        high: i64,
        /// Step between values
        #[serde(default = "default_int_step")]
        step: i64,
    },
    /// Floats in `[low, high]`, optionally stepped or log-scaled
    FloatRange {
        /// Inclusive lower bound
        low: f64,
        /// Inclusive upper bound
        high: f64,
        /// Grid step; `None` means continuous
        #[serde(default)]
        step: Option<f64>,
        /// Sample uniformly in log space
        #[serde(default)]
        log: bool,
    },
    /// Domain chosen by the values of parent options
    Conditional {
        /// Parent option names (same pass, declared earlier)
        parents: Vec<String>,
        /// Branches keyed by parent values
        support: Vec<ConditionalSupport>,
        /// Domain when no branch matches; `None` deactivates the option
        #[serde(default)]
        default: Option<Box<SearchParameter>>,
    },
}

const fn default_int_step() -> i64 {
    1
}

impl SearchParameter {
    /// Categorical domain over the given values.
    pub fn categorical<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<OptionValue>,
    {
        Self::Categorical {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Integer range with unit step.
    #[must_use]
    pub const fn int_range(low: i64, high: i64) -> Self {
        Self::IntRange { low, high, step: 1 }
    }

    /// Continuous float range.
    #[must_use]
    pub const fn float_range(low: f64, high: f64, log: bool) -> Self {
        Self::FloatRange {
            low,
            high,
            step: None,
            log,
        }
    }

    /// Conditional domain on a single parent.
    pub fn conditional_on<I>(parent: impl Into<String>, branches: I) -> Self
    where
        I: IntoIterator<Item = (OptionValue, Self)>,
    {
        Self::Conditional {
            parents: vec![parent.into()],
            support: branches
                .into_iter()
                .map(|(when, domain)| ConditionalSupport {
                    when: vec![when],
                    domain,
                })
                .collect(),
            default: None,
        }
    }

    /// Check the domain is well formed.
    ///
    /// # Errors
    /// Returns `ConfigurationError` for empty sets, inverted bounds,
    /// non-positive steps, log ranges touching zero, or nested conditionals.
    pub fn validate(&self, name: &str) -> Result<()> {
        match self {
            Self::Categorical { values } if values.is_empty() => Err(Error::config(format!(
                "searchable option '{name}' has an empty categorical domain"
            ))),
            Self::Categorical { .. } | Self::Boolean => Ok(()),
            Self::IntRange { low, high, step } => {
                if low > high || *step <= 0 {
                    return Err(Error::config(format!(
                        "searchable option '{name}' has invalid int range {low}..={high} step {step}"
                    )));
                }
                Ok(())
            }
            Self::FloatRange {
                low,
                high,
                step,
                log,
            } => {
                if !(low.is_finite() && high.is_finite()) || low > high {
                    return Err(Error::config(format!(
                        "searchable option '{name}' has invalid float range [{low}, {high}]"
                    )));
                }
                if step.is_some_and(|s| s <= 0.0 || !s.is_finite()) {
                    return Err(Error::config(format!(
                        "searchable option '{name}' has non-positive step"
                    )));
                }
                if *log && *low <= 0.0 {
                    return Err(Error::config(format!(
                        "searchable option '{name}' uses log scale with non-positive lower bound"
                    )));
                }
                Ok(())
            }
            Self::Conditional {
                parents,
                support,
                default,
            } => {
                if parents.is_empty() {
                    return Err(Error::config(format!(
                        "conditional option '{name}' declares no parents"
                    )));
                }
                let branches = support
                    .iter()
                    .map(|branch| (branch.when.len(), &branch.domain))
                    .chain(default.iter().map(|d| (parents.len(), d.as_ref())));
                for (arity, domain) in branches {
                    if arity != parents.len() {
                        return Err(Error::config(format!(
                            "conditional option '{name}' has a branch with {arity} values for {} parents",
                            parents.len()
                        )));
                    }
                    if matches!(domain, Self::Conditional { .. }) {
                        return Err(Error::config(format!(
                            "conditional option '{name}' nests another conditional"
                        )));
                    }
                    domain.validate(name)?;
                }
                Ok(())
            }
        }
    }

    /// Whether the domain is conditional.
    #[must_use]
    pub const fn is_conditional(&self) -> bool {
        matches!(self, Self::Conditional { .. })
    }

    /// Parent option names (empty for non-conditional domains).
    #[must_use]
    pub fn parents(&self) -> &[String] {
        match self {
            Self::Conditional { parents, .. } => parents,
            _ => &[],
        }
    }

    /// Pick the branch for the given parent values.
    ///
    /// Non-conditional domains return themselves. `None` means the option
    /// is inactive for these parents.
    #[must_use]
    pub fn branch_for(&self, parent_values: &[OptionValue]) -> Option<&Self> {
        match self {
            Self::Conditional {
                support, default, ..
            } => support
                .iter()
                .find(|branch| branch.when == parent_values)
                .map(|branch| &branch.domain)
                .or(default.as_deref()),
            other => Some(other),
        }
    }

    /// Enumerate a discrete (non-conditional) domain.
    ///
    /// Returns `None` for continuous ranges and conditionals.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn values(&self) -> Option<Vec<OptionValue>> {
        match self {
            Self::Categorical { values } => Some(values.clone()),
            Self::Boolean => Some(vec![OptionValue::Bool(false), OptionValue::Bool(true)]),
            Self::IntRange { low, high, step } => {
                let count = self.cardinality()?;
                Some(
                    (0..count as i64)
                        .map(|k| OptionValue::Int(low + k * step))
                        .take_while(|v| v.as_i64().is_some_and(|i| i <= *high))
                        .collect(),
                )
            }
            Self::FloatRange {
                low, step: Some(step), ..
            } => {
                let count = self.cardinality()?;
                Some(
                    (0..count)
                        .map(|k| OptionValue::Float((k as f64).mul_add(*step, *low)))
                        .collect(),
                )
            }
            Self::FloatRange { step: None, .. } | Self::Conditional { .. } => None,
        }
    }

    /// Number of values in a discrete (non-conditional) domain.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn cardinality(&self) -> Option<u64> {
        match self {
            Self::Categorical { values } => Some(values.len() as u64),
            Self::Boolean => Some(2),
            Self::IntRange { low, high, step } => {
                let span = high.checked_sub(*low)?;
                let count = (span / step) as u64 + 1;
                (count <= MAX_RANGE_POINTS).then_some(count)
            }
            Self::FloatRange {
                low,
                high,
                step: Some(step),
                ..
            } => {
                let count = ((high - low) / step + 1e-9).floor() as u64 + 1;
                (count <= MAX_RANGE_POINTS).then_some(count)
            }
            Self::FloatRange { step: None, .. } | Self::Conditional { .. } => None,
        }
    }

    /// Whether `value` lies in this (non-conditional) domain.
    #[must_use]
    pub fn contains(&self, value: &OptionValue) -> bool {
        match self {
            Self::Categorical { values } => values.contains(value),
            Self::Boolean => value.as_bool().is_some(),
            Self::IntRange { low, high, step } => value
                .as_i64()
                .is_some_and(|v| v >= *low && v <= *high && (v - low) % step == 0),
            Self::FloatRange { low, high, .. } => value
                .as_f64()
                .is_some_and(|v| v >= *low - 1e-12 && v <= *high + 1e-12),
            Self::Conditional { .. } => false,
        }
    }

    /// Draw a uniform sample from a non-conditional domain.
    ///
    /// Conditionals must be resolved with [`Self::branch_for`] first; they
    /// sample as null.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> OptionValue {
        match self {
            Self::FloatRange {
                low,
                high,
                step: None,
                log,
            } => {
                if (high - low).abs() < f64::EPSILON {
                    return OptionValue::Float(*low);
                }
                if *log {
                    OptionValue::Float(rng.gen_range(low.ln()..=high.ln()).exp())
                } else {
                    OptionValue::Float(rng.gen_range(*low..=*high))
                }
            }
            Self::IntRange { low, high, step } => {
                let steps = (i128::from(*high) - i128::from(*low)) / i128::from(*step);
                let k = rng.gen_range(0..=steps.max(0));
                i64::try_from(i128::from(*low) + k * i128::from(*step))
                    .map_or(OptionValue::Int(*low), OptionValue::Int)
            }
            Self::FloatRange {
                low,
                high,
                step: Some(step),
                ..
            } => {
                let steps = ((high - low) / step + 1e-9).floor().max(0.0);
                let k = rng.gen_range(0.0..=steps).floor();
                OptionValue::Float(k.mul_add(*step, *low).min(*high))
            }
            Self::Conditional { .. } => OptionValue::Null,
            discrete => discrete
                .values()
                .and_then(|values| values.choose(rng).cloned())
                .unwrap_or(OptionValue::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_int_range_values() {
        let p = SearchParameter::IntRange {
            low: 1,
            high: 7,
            step: 3,
        };
        assert_eq!(
            p.values(),
            Some(vec![OptionValue::Int(1), OptionValue::Int(4), OptionValue::Int(7)])
        );
        assert!(p.contains(&OptionValue::Int(4)));
        assert!(!p.contains(&OptionValue::Int(5)));
    }

    #[test]
    fn test_wide_int_range_samples_in_domain() {
        let p = SearchParameter::IntRange {
            low: 0,
            high: 1_000_000,
            step: 5,
        };
        assert_eq!(p.values(), None);
        let mut rng = StdRng::seed_from_u64(7);
        let draws: Vec<OptionValue> = (0..50).map(|_| p.sample(&mut rng)).collect();
        assert!(draws.iter().all(|v| p.contains(v)));
        let distinct: std::collections::HashSet<_> = draws.iter().filter_map(OptionValue::as_i64).collect();
        assert!(distinct.len() > 1);
    }

    #[test]
    fn test_wide_stepped_float_range_samples_in_domain() {
        let p = SearchParameter::FloatRange {
            low: 0.0,
            high: 1000.0,
            step: Some(0.001),
            log: false,
        };
        assert_eq!(p.values(), None);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let v = p.sample(&mut rng).as_f64().unwrap();
            assert!((0.0..=1000.0).contains(&v));
            let k = v / 0.001;
            assert!((k - k.round()).abs() < 1e-3);
        }
    }

    #[test]
    fn test_stepped_float_range() {
        let p = SearchParameter::FloatRange {
            low: 0.0,
            high: 1.0,
            step: Some(0.25),
            log: false,
        };
        assert_eq!(p.cardinality(), Some(5));
    }

    #[test]
    fn test_continuous_range_not_enumerable() {
        let p = SearchParameter::float_range(1e-4, 1e-1, true);
        assert!(p.values().is_none());
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let v = p.sample(&mut rng).as_f64().unwrap();
            assert!((1e-4..=1e-1).contains(&v));
        }
    }

    #[test]
    fn test_conditional_branch() {
        let p = SearchParameter::conditional_on(
            "quant_mode",
            [(
                OptionValue::from("static"),
                SearchParameter::categorical(["MinMax", "Entropy"]),
            )],
        );
        assert!(p.branch_for(&[OptionValue::from("static")]).is_some());
        assert!(p.branch_for(&[OptionValue::from("dynamic")]).is_none());
        assert_eq!(p.parents(), ["quant_mode".to_string()]);
    }

    #[test]
    fn test_validation_errors() {
        assert!(SearchParameter::categorical(Vec::<i64>::new()).validate("x").is_err());
        assert!(SearchParameter::int_range(5, 1).validate("x").is_err());
        assert!(SearchParameter::float_range(0.0, 1.0, true).validate("x").is_err());
        assert!(SearchParameter::Boolean.validate("x").is_ok());
    }

    #[test]
    fn test_parameter_deserialization() {
        let p: SearchParameter =
            serde_json::from_str(r#"{"type": "int_range", "low": 0, "high": 4}"#).unwrap();
        assert_eq!(p.cardinality(), Some(5));
    }
}
