//! Session error types.

use authkit_client::ClientError;
use authkit_storage::StorageError;
use thiserror::Error;

/// Session error type.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Malformed callback payload (missing token or authorization code)
    #[error("Invalid callback: {0}")]
    InvalidCallback(String),

    /// Server rejected credentials or a code exchange
    #[error("Authentication failed: {code}: {description}")]
    Authentication { code: String, description: String },

    /// Refresh failed or no refresh token was available
    #[error("Session expired")]
    SessionExpired,

    /// A token-requiring call was made without an active session
    #[error("Not authenticated")]
    NotAuthenticated,

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Collaborator unreachable
    #[error("Network error: {0}")]
    Network(String),
}

impl From<ClientError> for SessionError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Api { code, description } => {
                SessionError::Authentication { code, description }
            }
            ClientError::Http(e) => SessionError::Network(e.to_string()),
        }
    }
}

/// Result type alias using SessionError.
pub type SessionResult<T> = Result<T, SessionError>;
