use thiserror::Error;

/// Key-value persistence used to keep blocks beyond the in-memory cache.
///
/// Implementations must be safe to share between the network, sync and mining
/// threads.
pub trait Store: Send + Sync {
    /// Get a value by key. `None` if the key was never written.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a value, replacing any existing one.
    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError>;

    /// Whether the key was written.
    fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }
}

/// Store error.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend failed to serve the request. Usually retryable.
    #[error("storage backend failure: {0}")]
    Backend(String),
    /// The stored value could not be interpreted.
    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
}
