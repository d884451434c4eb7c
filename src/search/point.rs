//! Search Point - one concrete assignment over a flow's search space

use crate::hash::Fingerprint;
use crate::value::OptionValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Values assigned to the searchable options of each pass, keyed by
/// logical pass name then option name.
pub type PassValues = BTreeMap<String, BTreeMap<String, OptionValue>>;

/// One concrete assignment of every active searchable option of a flow,
/// plus the flow identity. Immutable and hashable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchPoint {
    flow: String,
    values: PassValues,
}

impl SearchPoint {
    /// Create a search point.
    #[must_use]
    pub const fn new(flow: String, values: PassValues) -> Self {
        Self { flow, values }
    }

    /// Get the flow identity.
    #[must_use]
    pub fn flow(&self) -> &str {
        &self.flow
    }

    /// Get all assigned values.
    #[must_use]
    pub const fn values(&self) -> &PassValues {
        &self.values
    }

    /// Values assigned to one pass (empty if the pass has none).
    #[must_use]
    pub fn pass_values(&self, pass: &str) -> BTreeMap<String, OptionValue> {
        self.values.get(pass).cloned().unwrap_or_default()
    }

    /// Value of one option, if assigned.
    #[must_use]
    pub fn get(&self, pass: &str, option: &str) -> Option<&OptionValue> {
        self.values.get(pass).and_then(|opts| opts.get(option))
    }

    /// Stable fingerprint of flow and values.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let values = OptionValue::Map(
            self.values
                .iter()
                .map(|(pass, opts)| (pass.clone(), OptionValue::Map(opts.clone())))
                .collect(),
        );
        Fingerprint::of_parts(&["search-point", &self.flow, &values.canonical()])
    }
}

impl std::fmt::Display for SearchPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{{", self.flow)?;
        let mut first = true;
        for (pass, opts) in &self.values {
            for (option, value) in opts {
                if !first {
                    f.write_str(", ")?;
                }
                first = false;
                write!(f, "{pass}.{option}={value}")?;
            }
        }
        f.write_str("}")
    }
}
