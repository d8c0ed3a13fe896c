//! Storage trait definitions.

use crate::StorageResult;

/// Trait for key-value storage backends.
///
/// Durable backends (browser `localStorage`, keychain, disk) and per-tab
/// transient backends (`sessionStorage`) both implement this trait; the
/// session engine is handed one instance of each.
pub trait KeyValueStorage: Send + Sync {
    /// Store a value under a key
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Retrieve a value
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Delete a value, returning whether it existed
    fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Check if a key exists
    fn has(&self, key: &str) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}
