//! OAuth callback parsing.
//!
//! Redirects arrive in one of three transport encodings: an authorization
//! code in the query string, tokens directly in the query string, or tokens
//! in the URL fragment. Parsing is pure (URL in, variant out); the session
//! manager applies the effects.

use std::collections::HashMap;
use url::Url;

/// What a post-redirect URL carries, in resolution precedence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackSource {
    /// The provider reported a failure (`?error=...`)
    Failed {
        error: String,
        description: Option<String>,
    },
    /// Tokens delivered directly in the query string
    QueryTokens {
        access_token: String,
        refresh_token: Option<String>,
        expires_in: Option<i64>,
    },
    /// An authorization code to exchange server-side
    AuthorizationCode { code: String },
    /// Tokens delivered in the URL fragment
    FragmentTokens {
        access_token: String,
        refresh_token: Option<String>,
        expires_in: Option<i64>,
    },
    /// No callback is in progress
    NoCallback,
}

/// Extract the callback payload from a URL.
///
/// Sources are checked in precedence order, stopping at the first that
/// yields usable data: error parameter, query tokens, authorization code,
/// fragment tokens. Empty parameter values count as absent.
pub fn parse_callback(url: &Url) -> CallbackSource {
    let query: HashMap<String, String> = url.query_pairs().into_owned().collect();

    if let Some(error) = present(&query, "error") {
        return CallbackSource::Failed {
            error,
            description: present(&query, "error_description"),
        };
    }

    if let Some(access_token) = present(&query, "access_token") {
        return CallbackSource::QueryTokens {
            access_token,
            refresh_token: present(&query, "refresh_token"),
            expires_in: parse_expires_in(&query),
        };
    }

    if let Some(code) = present(&query, "code") {
        return CallbackSource::AuthorizationCode { code };
    }

    if let Some(fragment) = url.fragment() {
        let pairs: HashMap<String, String> = url::form_urlencoded::parse(fragment.as_bytes())
            .into_owned()
            .collect();
        if let Some(access_token) = present(&pairs, "access_token") {
            return CallbackSource::FragmentTokens {
                access_token,
                refresh_token: present(&pairs, "refresh_token"),
                expires_in: parse_expires_in(&pairs),
            };
        }
    }

    CallbackSource::NoCallback
}

fn present(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params.get(key).filter(|v| !v.is_empty()).cloned()
}

fn parse_expires_in(params: &HashMap<String, String>) -> Option<i64> {
    params.get("expires_in").and_then(|v| v.parse().ok())
}
