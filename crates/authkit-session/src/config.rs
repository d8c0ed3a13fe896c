//! Session engine configuration.

use std::time::Duration;

/// Configuration for the session engine.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Path the router is sent to after an authentication failure.
    pub login_path: String,
    /// Path the router is sent to after a successful OAuth callback.
    pub home_path: String,
    /// Path the OAuth provider redirects back to.
    pub callback_path: String,
    /// Interval between token liveness checks.
    pub monitor_interval: Duration,
    /// A token within this many seconds of its deadline is treated as stale.
    pub expiry_skew_secs: i64,
    /// Access token lifetime assumed when the transport omits `expires_in`.
    pub default_expires_in: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            login_path: "/login".to_string(),
            home_path: "/home".to_string(),
            callback_path: "/callback".to_string(),
            monitor_interval: Duration::from_secs(5 * 60),
            expiry_skew_secs: 60,
            default_expires_in: 3600,
        }
    }
}
