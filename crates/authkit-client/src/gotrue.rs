//! HTTP client for a GoTrue-style authentication server.

use crate::{AuthApi, ClientError, ClientResult, Credentials, OAuthProvider, SignupRequest};
use async_trait::async_trait;
use authkit_storage::{TokenPair, User, UserUpdate};
use reqwest::{Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

/// HTTP client against the authentication server's REST surface.
#[derive(Clone)]
pub struct GotrueClient {
    http_client: reqwest::Client,
    base_url: String,
    redirect_url: String,
}

#[derive(Debug, Serialize)]
struct SignupBody<'a> {
    email: &'a str,
    password: &'a str,
    data: SignupProfile<'a>,
}

#[derive(Debug, Serialize)]
struct SignupProfile<'a> {
    first_name: &'a str,
    last_name: &'a str,
}

#[derive(Debug, Serialize)]
struct RefreshBody<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
struct ExchangeCodeBody<'a> {
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<&'a str>,
}

/// Error body shape the server reports failures with.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl GotrueClient {
    /// Create a new client.
    ///
    /// # Arguments
    /// * `base_url` - The auth server base URL (e.g. `http://localhost:9999`)
    /// * `redirect_url` - Where the provider should send the browser back to
    ///   (the host application's callback page)
    pub fn new(base_url: impl Into<String>, redirect_url: impl Into<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            redirect_url: redirect_url.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn bearer(token: &str) -> String {
        format!("Bearer {}", token)
    }

    async fn parse_response<T: DeserializeOwned>(&self, response: Response) -> ClientResult<T> {
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        Ok(response.json().await?)
    }

    async fn expect_success(&self, response: Response) -> ClientResult<()> {
        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }
        Ok(())
    }

    async fn error_from_response(response: Response) -> ClientError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let (code, description) = parse_error_body(status, &body);
        warn!(status = %status, code = %code, "auth server request failed");
        ClientError::Api { code, description }
    }
}

/// Map a failure body to the uniform `{code, description}` pair. Non-JSON
/// bodies report `network_error` with the HTTP status line.
fn parse_error_body(status: StatusCode, body: &str) -> (String, String) {
    if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(body) {
        if parsed.error.is_some() || parsed.error_description.is_some() || parsed.message.is_some()
        {
            let code = parsed.error.unwrap_or_else(|| "server_error".to_string());
            let description = parsed
                .error_description
                .or(parsed.message)
                .unwrap_or_else(|| format!("HTTP {}", status));
            return (code, description);
        }
    }

    (
        "network_error".to_string(),
        format!(
            "HTTP {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or("unknown")
        ),
    )
}

#[async_trait]
impl AuthApi for GotrueClient {
    async fn signup(&self, request: SignupRequest) -> ClientResult<TokenPair> {
        let url = self.endpoint("/signup");
        debug!(url = %url, email = %request.email, "signing up");

        let response = self
            .http_client
            .post(&url)
            .json(&SignupBody {
                email: &request.email,
                password: &request.password,
                data: SignupProfile {
                    first_name: &request.first_name,
                    last_name: &request.last_name,
                },
            })
            .send()
            .await?;

        self.parse_response(response).await
    }

    async fn login(&self, credentials: Credentials) -> ClientResult<TokenPair> {
        let url = self.endpoint("/token?grant_type=password");
        debug!(url = %url, email = %credentials.email, "password login");

        let response = self.http_client.post(&url).json(&credentials).send().await?;
        self.parse_response(response).await
    }

    async fn logout(&self, access_token: &str) -> ClientResult<()> {
        let url = self.endpoint("/logout");
        debug!(url = %url, "logging out");

        let response = self
            .http_client
            .post(&url)
            .header("Authorization", Self::bearer(access_token))
            .send()
            .await?;

        self.expect_success(response).await
    }

    async fn get_user(&self, access_token: &str) -> ClientResult<User> {
        let url = self.endpoint("/user");

        let response = self
            .http_client
            .get(&url)
            .header("Authorization", Self::bearer(access_token))
            .send()
            .await?;

        self.parse_response(response).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> ClientResult<TokenPair> {
        let url = self.endpoint("/token?grant_type=refresh_token");
        debug!(url = %url, "refreshing token");

        let response = self
            .http_client
            .post(&url)
            .json(&RefreshBody { refresh_token })
            .send()
            .await?;

        self.parse_response(response).await
    }

    fn oauth_url(&self, provider: OAuthProvider) -> String {
        let redirect: String =
            url::form_urlencoded::byte_serialize(self.redirect_url.as_bytes()).collect();
        format!(
            "{}/authorize?provider={}&redirect_to={}",
            self.base_url,
            provider.as_str(),
            redirect
        )
    }

    async fn exchange_code(
        &self,
        code: &str,
        provider: Option<OAuthProvider>,
    ) -> ClientResult<TokenPair> {
        let url = self.endpoint("/callback");
        debug!(url = %url, provider = ?provider, "exchanging authorization code");

        let response = self
            .http_client
            .post(&url)
            .json(&ExchangeCodeBody {
                code,
                provider: provider.map(|p| p.as_str()),
            })
            .send()
            .await?;

        self.parse_response(response).await
    }

    async fn list_users(&self, access_token: &str) -> ClientResult<Vec<User>> {
        let url = self.endpoint("/admin/users");

        let response = self
            .http_client
            .get(&url)
            .header("Authorization", Self::bearer(access_token))
            .send()
            .await?;

        self.parse_response(response).await
    }

    async fn admin_update_user(
        &self,
        user_id: &str,
        update: UserUpdate,
        access_token: &str,
    ) -> ClientResult<User> {
        let url = self.endpoint(&format!("/admin/users/{}", user_id));
        debug!(url = %url, "updating user record");

        let response = self
            .http_client
            .put(&url)
            .header("Authorization", Self::bearer(access_token))
            .json(&update)
            .send()
            .await?;

        self.parse_response(response).await
    }
}
