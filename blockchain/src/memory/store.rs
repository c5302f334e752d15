use std::collections::HashMap;
use std::sync::RwLock;
use sync_extra::RwLockExtra;

use crate::{Store, StoreError};

/// A store that resides entirely in memory. Useful for testing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries written.
    pub fn len(&self) -> usize {
        self.entries.read_unwrap().len()
    }

    /// Whether nothing was written yet.
    pub fn is_empty(&self) -> bool {
        self.entries.read_unwrap().is_empty()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read_unwrap().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        self.entries.write_unwrap().insert(key.to_vec(), value);
        Ok(())
    }

    fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.entries.read_unwrap().contains_key(key))
    }
}
