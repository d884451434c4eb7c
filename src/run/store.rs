//! Run Store - the trials of one engine run

use super::{RunRecord, RunStatus};
use crate::error::TrialFailure;
use crate::hash::Fingerprint;
use std::collections::BTreeSet;

/// In-memory store of run records, in completion order.
///
/// Owned by the engine for the duration of a run. Records are appended
/// and never replaced.
#[derive(Debug, Clone, Default)]
pub struct RunStore {
    records: Vec<RunRecord>,
}

impl RunStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record.
    pub fn add(&mut self, record: RunRecord) {
        self.records.push(record);
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records.
    #[must_use]
    pub fn records(&self) -> &[RunRecord] {
        &self.records
    }

    /// First record for a search point fingerprint.
    #[must_use]
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&RunRecord> {
        self.records.iter().find(|r| &r.fingerprint() == fingerprint)
    }

    /// Records with the given status.
    #[must_use]
    pub fn with_status(&self, status: RunStatus) -> Vec<&RunRecord> {
        self.records.iter().filter(|r| r.status() == status).collect()
    }

    /// Causes of every failed trial.
    #[must_use]
    pub fn failures(&self) -> Vec<TrialFailure> {
        self.records
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| TrialFailure {
                point: r.fingerprint().to_short(),
                flow: r.flow().to_string(),
                cause: r.error().unwrap_or("unknown failure").to_string(),
            })
            .collect()
    }

    /// Up to `n` best successful records, best first.
    ///
    /// Results ranking equal keep completion order. A search point
    /// evaluated more than once appears once.
    #[must_use]
    pub fn best(&self, n: usize) -> Vec<&RunRecord> {
        let mut seen = BTreeSet::new();
        let mut ranked: Vec<&RunRecord> = self
            .records
            .iter()
            .filter(|r| r.is_success() && r.evaluation().is_some())
            .filter(|r| seen.insert(r.fingerprint()))
            .collect();
        ranked.sort_by(|a, b| match (b.evaluation(), a.evaluation()) {
            (Some(b), Some(a)) => b.compare(a),
            _ => std::cmp::Ordering::Equal,
        });
        ranked.truncate(n);
        ranked
    }
}
