//! Exhaustive search: every point of the space, in declaration order

use super::{SearchAlgorithm, SearchPoint, SearchSpace, Trial};
use crate::Result;
use std::collections::VecDeque;

/// Deterministic Cartesian enumeration.
#[derive(Debug, Clone)]
pub struct ExhaustiveSearch {
    pending: VecDeque<SearchPoint>,
}

impl ExhaustiveSearch {
    /// Enumerate the space upfront.
    ///
    /// # Errors
    /// Returns `ConfigurationError` if the space is continuous or too large.
    pub fn new(space: &SearchSpace) -> Result<Self> {
        Ok(Self {
            pending: space.enumerate()?.into(),
        })
    }

    /// Points not yet proposed.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl SearchAlgorithm for ExhaustiveSearch {
    fn name(&self) -> &str {
        "exhaustive"
    }

    fn propose(&mut self, _history: &[Trial]) -> Option<SearchPoint> {
        self.pending.pop_front()
    }
}
