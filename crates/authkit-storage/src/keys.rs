//! Storage slot constants.

/// Storage slots used by the session manager
pub struct StorageKeys;

impl StorageKeys {
    /// Access token (raw string, durable)
    pub const ACCESS_TOKEN: &'static str = "auth_access_token";

    /// Refresh token (raw string, durable)
    pub const REFRESH_TOKEN: &'static str = "auth_refresh_token";

    /// User snapshot (JSON, durable)
    pub const USER: &'static str = "auth_user";

    /// OAuth provider marker (per-tab transient store, not durable)
    pub const OAUTH_PROVIDER: &'static str = "oauth_provider";
}
