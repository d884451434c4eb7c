//! Run records and the result manifest
//!
//! Every trial produces one [`RunRecord`]. The engine keeps them in a
//! [`RunStore`] for the run, persists each one to the cache keyed by its
//! search point fingerprint, and writes them all to the [`Manifest`] at
//! the end.

mod manifest;
mod record;
mod store;

pub use manifest::{Manifest, MANIFEST_FILE};
pub(crate) use manifest::write_json_atomic;
pub use record::{RunRecord, RunRecordBuilder, RunStatus};
pub use store::RunStore;
