//! Random search: seeded uniform sampling without replacement

use super::{SearchAlgorithm, SearchPoint, SearchSpace, Trial};
use crate::hash::Fingerprint;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rustc_hash::FxHashSet;

/// Consecutive duplicate draws after which the space counts as exhausted.
const MAX_DUPLICATE_DRAWS: usize = 256;

/// Uniform random search.
#[derive(Debug)]
pub struct RandomSearch {
    space: SearchSpace,
    rng: StdRng,
    seen: FxHashSet<Fingerprint>,
    cardinality: Option<u64>,
}

impl RandomSearch {
    /// Create a sampler; the same seed yields the same proposal sequence.
    #[must_use]
    pub fn new(space: SearchSpace, seed: u64) -> Self {
        let cardinality = space.cardinality();
        Self {
            space,
            rng: StdRng::seed_from_u64(seed),
            seen: FxHashSet::default(),
            cardinality,
        }
    }
}

impl SearchAlgorithm for RandomSearch {
    fn name(&self) -> &str {
        "random"
    }

    fn propose(&mut self, _history: &[Trial]) -> Option<SearchPoint> {
        if self
            .cardinality
            .is_some_and(|n| self.seen.len() as u64 >= n)
        {
            return None;
        }
        for _ in 0..MAX_DUPLICATE_DRAWS {
            let point = self.space.sample(&mut self.rng)?;
            if self.seen.insert(point.fingerprint()) {
                return Some(point);
            }
        }
        None
    }
}
