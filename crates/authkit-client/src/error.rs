//! Client error types.

use thiserror::Error;

/// Uniform failure for auth server calls.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Server-reported failure with a machine-readable code
    #[error("{code}: {description}")]
    Api { code: String, description: String },

    /// Transport failure (collaborator unreachable, timeout, bad TLS)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ClientError {
    /// Shorthand for a server-reported failure.
    pub fn api(code: impl Into<String>, description: impl Into<String>) -> Self {
        ClientError::Api {
            code: code.into(),
            description: description.into(),
        }
    }
}

/// Result type alias using ClientError.
pub type ClientResult<T> = Result<T, ClientError>;
