//! Append-only entry stores
//!
//! Entries are written once under a key and never updated in place. A
//! second `put` under the same key leaves the first entry untouched and
//! reports `false`.

use crate::Result;
use dashmap::DashMap;

/// Byte store with put-if-absent semantics.
pub trait EntryStore: Send + Sync + std::fmt::Debug {
    /// Get the entry under `key`.
    ///
    /// # Errors
    /// Returns an IO error if an existing entry cannot be read.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert `bytes` under `key` unless an entry exists.
    ///
    /// Returns whether the entry was written. Readers never observe a
    /// partially written entry.
    ///
    /// # Errors
    /// Returns an IO error if the entry cannot be written.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<bool>;

    /// Remove the entry under `key`. No-op if absent.
    ///
    /// # Errors
    /// Returns an IO error if an existing entry cannot be removed.
    fn remove(&self, key: &str) -> Result<()>;

    /// Check if an entry exists.
    fn exists(&self, key: &str) -> bool;

    /// Number of entries.
    fn len(&self) -> usize;

    /// Check if the store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry.
    ///
    /// # Errors
    /// Returns an IO error if entries cannot be removed.
    fn clear(&self) -> Result<()>;
}

/// In-memory entry store using `DashMap`.
///
/// Entries are lost when the process exits.
///
/// # Example
///
/// ```rust
/// use passforge::cache::{EntryStore, MemoryStore};
///
/// let store = MemoryStore::new();
/// assert!(store.put("k", b"v1").unwrap());
/// assert!(!store.put("k", b"v2").unwrap());
/// assert_eq!(store.get("k").unwrap(), Some(b"v1".to_vec()));
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Create with pre-allocated capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: DashMap::with_capacity(capacity),
        }
    }

    /// Overwrite an entry in place. Only for tests simulating corruption.
    #[cfg(test)]
    pub(crate) fn corrupt(&self, key: &str, bytes: &[u8]) {
        self.entries.insert(key.to_string(), bytes.to_vec());
    }
}

impl EntryStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<bool> {
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(bytes.to_vec());
                Ok(true)
            }
        }
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_put_if_absent() {
        let store = MemoryStore::new();
        assert!(store.put("key", b"first").unwrap());
        assert!(!store.put("key", b"second").unwrap());
        assert_eq!(store.get("key").unwrap(), Some(b"first".to_vec()));
    }

    #[test]
    fn test_remove_and_exists() {
        let store = MemoryStore::new();
        assert!(!store.exists("key"));
        store.put("key", b"value").unwrap();
        assert!(store.exists("key"));
        store.remove("key").unwrap();
        assert!(!store.exists("key"));
        // Removing again is a no-op
        store.remove("key").unwrap();
    }

    #[test]
    fn test_clear() {
        let store = MemoryStore::with_capacity(4);
        store.put("a", b"1").unwrap();
        store.put("b", b"2").unwrap();
        assert_eq!(store.len(), 2);
        store.clear().unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_puts_single_winner() {
        let store = Arc::new(MemoryStore::new());
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let store = Arc::clone(&store);
                    scope.spawn(move || store.put("shared", format!("{i}").as_bytes()).unwrap())
                })
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });
        assert_eq!(winners, 1);
        assert_eq!(store.len(), 1);
    }
}
