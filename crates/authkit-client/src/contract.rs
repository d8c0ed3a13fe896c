//! The auth server contract the session engine consumes.

use crate::ClientResult;
use async_trait::async_trait;
use authkit_storage::{TokenPair, User, UserUpdate};
use serde::Serialize;
use std::fmt;

/// Email/password credentials for a password-grant login.
#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// Payload for account creation.
#[derive(Debug, Clone, Serialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

/// Supported OAuth providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthProvider {
    Google,
    Github,
}

impl OAuthProvider {
    /// Stable string form used in URLs and the transient provider marker.
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthProvider::Google => "google",
            OAuthProvider::Github => "github",
        }
    }

    /// Parse the stable string form back into a provider.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "google" => Some(OAuthProvider::Google),
            "github" => Some(OAuthProvider::Github),
            _ => None,
        }
    }
}

impl fmt::Display for OAuthProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract for the authentication server.
///
/// The session engine depends only on this trait; every network method
/// fails with the uniform [`crate::ClientError`] and is non-retryable
/// within the call.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Create an account, returning an initial token pair.
    async fn signup(&self, request: SignupRequest) -> ClientResult<TokenPair>;

    /// Password-grant login.
    async fn login(&self, credentials: Credentials) -> ClientResult<TokenPair>;

    /// Invalidate the session server-side.
    async fn logout(&self, access_token: &str) -> ClientResult<()>;

    /// Fetch the user record behind an access token.
    async fn get_user(&self, access_token: &str) -> ClientResult<User>;

    /// Exchange a refresh token for a new token pair.
    async fn refresh_token(&self, refresh_token: &str) -> ClientResult<TokenPair>;

    /// Authorization URL for the given provider. Pure, no network.
    fn oauth_url(&self, provider: OAuthProvider) -> String;

    /// Exchange an authorization code delivered on the callback URL.
    async fn exchange_code(
        &self,
        code: &str,
        provider: Option<OAuthProvider>,
    ) -> ClientResult<TokenPair>;

    /// List all users. Requires an admin-capable token.
    async fn list_users(&self, access_token: &str) -> ClientResult<Vec<User>>;

    /// Update a user record. Requires an admin-capable token.
    async fn admin_update_user(
        &self,
        user_id: &str,
        update: UserUpdate,
        access_token: &str,
    ) -> ClientResult<User>;
}
