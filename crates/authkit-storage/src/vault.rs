//! High-level API for the persisted session slots.

use crate::{KeyValueStorage, StorageKeys, StorageResult, TokenPair, User};
use tracing::warn;

/// Durable projection of the current session: access token, refresh token,
/// and a JSON user snapshot, written as three independent entries.
///
/// Written on every successful authentication or refresh, cleared on logout
/// or unrecoverable refresh failure, read once at process start.
pub struct SessionVault {
    storage: Box<dyn KeyValueStorage>,
}

impl SessionVault {
    /// Create a vault over the given durable backend.
    pub fn new(storage: Box<dyn KeyValueStorage>) -> Self {
        Self { storage }
    }

    /// Persist the token pair and its user snapshot.
    pub fn save_tokens(&self, tokens: &TokenPair) -> StorageResult<()> {
        self.storage
            .set(StorageKeys::ACCESS_TOKEN, &tokens.access_token)?;
        self.storage
            .set(StorageKeys::REFRESH_TOKEN, &tokens.refresh_token)?;
        let json = serde_json::to_string(&tokens.user)
            .map_err(|e| crate::StorageError::Encoding(e.to_string()))?;
        self.storage.set(StorageKeys::USER, &json)
    }

    /// Stored access token, if any.
    pub fn access_token(&self) -> StorageResult<Option<String>> {
        self.storage.get(StorageKeys::ACCESS_TOKEN)
    }

    /// Stored refresh token, if any.
    pub fn refresh_token(&self) -> StorageResult<Option<String>> {
        self.storage.get(StorageKeys::REFRESH_TOKEN)
    }

    /// Stored user snapshot. A record that fails to parse is treated as
    /// absent, not as an error.
    pub fn user(&self) -> StorageResult<Option<User>> {
        match self.storage.get(StorageKeys::USER)? {
            Some(json) => match serde_json::from_str::<User>(&json) {
                Ok(user) => Ok(Some(user)),
                Err(e) => {
                    warn!(error = %e, "stored user snapshot is unparsable, treating as absent");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Whether both an access token and a user snapshot are stored.
    pub fn has_session(&self) -> StorageResult<bool> {
        let has_token = self.storage.has(StorageKeys::ACCESS_TOKEN)?;
        let has_user = self.storage.has(StorageKeys::USER)?;
        Ok(has_token && has_user)
    }

    /// Remove all three session entries.
    pub fn clear(&self) -> StorageResult<()> {
        let _ = self.storage.delete(StorageKeys::ACCESS_TOKEN);
        let _ = self.storage.delete(StorageKeys::REFRESH_TOKEN);
        let _ = self.storage.delete(StorageKeys::USER);
        Ok(())
    }
}
