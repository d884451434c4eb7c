//! Pass registry: type identifier to implementation

use super::{builtin_passes, Pass};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Registered pass types.
///
/// Filled while the engine is being built, read-only afterwards.
#[derive(Clone, Default)]
pub struct PassRegistry {
    passes: BTreeMap<String, Arc<dyn Pass>>,
}

impl PassRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in tool passes.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for pass in builtin_passes() {
            registry.register_arc(pass);
        }
        registry
    }

    /// Register (or replace) a pass under its own type identifier.
    pub fn register(&mut self, pass: impl Pass + 'static) {
        self.register_arc(Arc::new(pass));
    }

    /// Register a shared pass.
    pub fn register_arc(&mut self, pass: Arc<dyn Pass>) {
        self.passes.insert(pass.pass_type().to_string(), pass);
    }

    /// Look up a pass type.
    ///
    /// # Errors
    /// Returns `ConfigurationError` naming the registered types.
    pub fn get(&self, pass_type: &str) -> Result<Arc<dyn Pass>> {
        self.passes.get(pass_type).cloned().ok_or_else(|| {
            Error::config(format!(
                "unknown pass type '{pass_type}' (registered: {})",
                self.types().join(", ")
            ))
        })
    }

    /// Registered type identifiers.
    #[must_use]
    pub fn types(&self) -> Vec<&str> {
        self.passes.keys().map(String::as_str).collect()
    }

    /// Whether `pass_type` is registered.
    #[must_use]
    pub fn contains(&self, pass_type: &str) -> bool {
        self.passes.contains_key(pass_type)
    }
}

impl std::fmt::Debug for PassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassRegistry")
            .field("types", &self.types())
            .finish()
    }
}
