//! Persistence layer for the authkit session manager.
//!
//! This crate provides:
//! - A `KeyValueStorage` trait hosts implement over whatever durable (or
//!   per-tab) store they have available
//! - `MemoryStorage`, the in-process reference backend
//! - The domain records persisted across reloads (`User`, `TokenPair`)
//! - `SessionVault`, the high-level API over the three session slots

mod keys;
mod memory;
mod records;
mod traits;
mod vault;

pub use keys::StorageKeys;
pub use memory::MemoryStorage;
pub use records::{AppMetadata, TokenPair, User, UserMetadata, UserRole, UserUpdate};
pub use traits::KeyValueStorage;
pub use vault::SessionVault;

use thiserror::Error;

/// Error type for storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend-specific storage error
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Encoding/decoding error
    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
