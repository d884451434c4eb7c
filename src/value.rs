//! Option values for pass configuration
//!
//! Pass options are loosely typed in the run document (any JSON value).
//! `OptionValue` is the tagged union they are parsed into, with one extra
//! variant for the input-model data config reference that is substituted
//! at resolution time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Sentinel string that resolves to the input model's data config.
pub const INPUT_MODEL_DATA_CONFIG: &str = "__input_model_data_config__";

/// A single configuration value.
///
/// Equality and hashing are structural; floats compare by bit pattern so
/// values can key hash maps and search point fingerprints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum OptionValue {
    /// JSON null
    Null,
    /// Boolean literal
    Bool(bool),
    /// Integer literal
    Int(i64),
    /// Floating point literal
    Float(f64),
    /// String literal
    String(String),
    /// Ordered list
    List(Vec<OptionValue>),
    /// Nested map (sorted keys)
    Map(BTreeMap<String, OptionValue>),
    /// Unresolved reference to the input model's data config
    InputModelDataConfig,
}

impl OptionValue {
    /// Get the value as a string slice, if it is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as a bool, if it is a bool.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get the value as an integer, if it is an integer.
    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get the value as a float. Integers widen.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Get the value as a map, if it is a map.
    #[must_use]
    pub const fn as_map(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Whether the value is null.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether the value (or anything nested in it) still holds an
    /// unresolved input-model data config reference.
    #[must_use]
    pub fn has_unresolved_reference(&self) -> bool {
        match self {
            Self::InputModelDataConfig => true,
            Self::List(items) => items.iter().any(Self::has_unresolved_reference),
            Self::Map(map) => map.values().any(Self::has_unresolved_reference),
            _ => false,
        }
    }

    /// Replace every input-model data config reference with `data_config`.
    #[must_use]
    pub fn substitute_reference(&self, data_config: &Self) -> Self {
        match self {
            Self::InputModelDataConfig => data_config.clone(),
            Self::List(items) => Self::List(
                items
                    .iter()
                    .map(|item| item.substitute_reference(data_config))
                    .collect(),
            ),
            Self::Map(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.substitute_reference(data_config)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Convert to a `serde_json::Value`. NaN and infinities become null.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
            Self::String(s) => Value::String(s.clone()),
            Self::List(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Self::InputModelDataConfig => Value::String(INPUT_MODEL_DATA_CONFIG.to_string()),
        }
    }

    /// Canonical JSON text (sorted keys), used for fingerprints.
    #[must_use]
    pub fn canonical(&self) -> String {
        self.to_json().to_string()
    }

    const fn tag(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::Float(_) => 3,
            Self::String(_) => 4,
            Self::List(_) => 5,
            Self::Map(_) => 6,
            Self::InputModelDataConfig => 7,
        }
    }
}

impl From<serde_json::Value> for OptionValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .unwrap_or(Self::Null),
            Value::String(s) if s == INPUT_MODEL_DATA_CONFIG => Self::InputModelDataConfig,
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => Self::Map(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect()),
        }
    }
}

impl From<OptionValue> for serde_json::Value {
    fn from(value: OptionValue) -> Self {
        value.to_json()
    }
}

impl From<bool> for OptionValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for OptionValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for OptionValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl PartialEq for OptionValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) | (Self::InputModelDataConfig, Self::InputModelDataConfig) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for OptionValue {}

impl Hash for OptionValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag().hash(state);
        match self {
            Self::Null | Self::InputModelDataConfig => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(i) => i.hash(state),
            Self::Float(f) => f.to_bits().hash(state),
            Self::String(s) => s.hash(state),
            Self::List(items) => items.hash(state),
            Self::Map(map) => {
                for (k, v) in map {
                    k.hash(state);
                    v.hash(state);
                }
            }
        }
    }
}

impl std::fmt::Display for OptionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            other => write!(f, "{}", other.canonical()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sentinel_parses_to_reference() {
        let value = OptionValue::from(json!("__input_model_data_config__"));
        assert_eq!(value, OptionValue::InputModelDataConfig);
        assert!(value.has_unresolved_reference());
    }

    #[test]
    fn test_nested_reference_substitution() {
        let value = OptionValue::from(json!({"data": ["__input_model_data_config__", 1]}));
        let resolved = value.substitute_reference(&OptionValue::from("glue"));
        assert!(!resolved.has_unresolved_reference());
        assert_eq!(resolved.canonical(), r#"{"data":["glue",1]}"#);
    }

    #[test]
    fn test_canonical_sorts_keys() {
        let a = OptionValue::from(json!({"b": 1, "a": 2}));
        assert_eq!(a.canonical(), r#"{"a":2,"b":1}"#);
    }

    #[test]
    fn test_float_equality_is_bitwise() {
        assert_eq!(OptionValue::Float(f64::NAN), OptionValue::Float(f64::NAN));
        assert_ne!(OptionValue::Float(1.0), OptionValue::Int(1));
    }

    #[test]
    fn test_hash_consistent_with_eq() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(OptionValue::from(json!({"x": [1.5, true]})));
        assert!(set.contains(&OptionValue::from(json!({"x": [1.5, true]}))));
    }

    #[test]
    fn test_int_widens_to_float() {
        assert_eq!(OptionValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(OptionValue::from("x").as_f64(), None);
    }
}
