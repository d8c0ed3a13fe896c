//! Domain records persisted across reloads.

use serde::{Deserialize, Serialize};

/// Role of an authenticated principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRole {
    /// Regular authenticated user
    #[serde(rename = "authenticated")]
    Standard,
    /// Administrative user (gates admin-only views)
    #[serde(rename = "supabase_admin")]
    Admin,
}

/// Profile fields set by the user or an OAuth provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Provider fields set by the authentication server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Primary authentication provider ("email", "google", "github")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// All providers linked to this account
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub providers: Vec<String>,
}

/// Profile of an authenticated principal, as issued by the server.
///
/// Immutable in place except through [`User::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub role: UserRole,
    #[serde(default)]
    pub email: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub last_sign_in_at: Option<String>,
    #[serde(default)]
    pub user_metadata: UserMetadata,
    #[serde(default)]
    pub app_metadata: AppMetadata,
}

impl User {
    /// Returns true for administrative users.
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    /// Display name, best available: full name, then first + last, then
    /// first name alone, then the local part of the email.
    pub fn display_name(&self) -> String {
        let meta = &self.user_metadata;

        if let Some(full) = non_empty(meta.full_name.as_deref()) {
            return full.to_string();
        }

        match (
            non_empty(meta.first_name.as_deref()),
            non_empty(meta.last_name.as_deref()),
        ) {
            (Some(first), Some(last)) => return format!("{} {}", first, last),
            (Some(first), None) => return first.to_string(),
            _ => {}
        }

        if let Some(email) = self.email.as_deref() {
            if let Some(local) = email.split('@').next() {
                if !local.is_empty() {
                    return local.to_string();
                }
            }
        }

        "user".to_string()
    }

    /// Avatar URL, if the profile carries one.
    pub fn avatar(&self) -> Option<&str> {
        non_empty(self.user_metadata.avatar_url.as_deref())
    }

    /// Primary authentication provider, falling back to the first linked
    /// provider and finally to "email".
    pub fn provider(&self) -> &str {
        self.app_metadata
            .provider
            .as_deref()
            .or_else(|| self.app_metadata.providers.first().map(String::as_str))
            .unwrap_or("email")
    }

    /// Shallow-merge an update into this record. Provided fields replace
    /// the current value wholesale; absent fields are untouched.
    pub fn apply(&mut self, update: UserUpdate) {
        if let Some(email) = update.email {
            self.email = Some(email);
        }
        if let Some(role) = update.role {
            self.role = role;
        }
        if let Some(last_sign_in_at) = update.last_sign_in_at {
            self.last_sign_in_at = Some(last_sign_in_at);
        }
        if let Some(user_metadata) = update.user_metadata {
            self.user_metadata = user_metadata;
        }
        if let Some(app_metadata) = update.app_metadata {
            self.app_metadata = app_metadata;
        }
    }
}

/// Partial user record for shallow merges and admin updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<UserRole>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sign_in_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_metadata: Option<UserMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_metadata: Option<AppMetadata>,
}

/// Token pair issued by the authentication server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Lifetime of the access token in seconds
    pub expires_in: i64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Absolute expiry as unix seconds; servers may omit it, in which case
    /// the session engine computes it at adoption time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    /// User snapshot issued alongside the tokens
    pub user: User,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
