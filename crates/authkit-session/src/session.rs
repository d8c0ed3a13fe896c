//! Session state machine.
//!
//! `SessionManager` is the single process-wide authority over the
//! authenticated session: it owns the `{user, tokens, loading, redirect}`
//! snapshot, persists credentials across reloads, resolves OAuth callbacks,
//! and drives the token liveness monitor. All mutation goes through its
//! entry points; consumers observe transitions through the event channels.

use crate::callback::{parse_callback, CallbackSource};
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::events::{ErrorEvent, Publisher, Subscription};
use crate::history::UrlHistory;
use crate::monitor::MonitorHandle;
use authkit_client::{AuthApi, ClientError, Credentials, OAuthProvider, SignupRequest};
use authkit_storage::{
    KeyValueStorage, SessionVault, StorageKeys, StorageResult, TokenPair, User, UserUpdate,
};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

/// Immutable view of the session, published on every transition.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    /// Profile of the authenticated principal
    pub user: Option<User>,
    /// Current token pair; present iff authenticated, except during the
    /// short window while a background refresh result is being applied
    pub tokens: Option<TokenPair>,
    /// Derived: true iff `user` is present
    pub is_authenticated: bool,
    /// True while a bootstrap, login, or callback operation is in flight
    pub is_loading: bool,
    /// One-shot router signal; consumed via [`SessionManager::clear_redirect`]
    pub redirect_to: Option<String>,
}

impl SessionSnapshot {
    /// The anonymous baseline: no user, no tokens.
    pub fn anonymous(is_loading: bool) -> Self {
        Self {
            user: None,
            tokens: None,
            is_authenticated: false,
            is_loading,
            redirect_to: None,
        }
    }
}

/// Process-wide session authority. Constructed once at application start
/// and injected into the router and UI layer.
pub struct SessionManager {
    api: Arc<dyn AuthApi>,
    vault: SessionVault,
    /// Per-tab store for the OAuth provider marker
    transient: Box<dyn KeyValueStorage>,
    history: Box<dyn UrlHistory>,
    config: SessionConfig,
    state: Mutex<SessionSnapshot>,
    /// Bumped on every reset; in-flight results from before the bump are
    /// discarded at adoption so a pending login cannot outlive a logout
    epoch: AtomicU64,
    monitor: Mutex<Option<MonitorHandle>>,
    state_events: Publisher<SessionSnapshot>,
    error_events: Publisher<ErrorEvent>,
}

impl SessionManager {
    /// Create the session manager. The snapshot starts in the loading
    /// state until [`bootstrap`](Self::bootstrap) resolves it.
    pub fn new(
        api: Arc<dyn AuthApi>,
        vault: SessionVault,
        transient: Box<dyn KeyValueStorage>,
        history: Box<dyn UrlHistory>,
        config: SessionConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            vault,
            transient,
            history,
            config,
            state: Mutex::new(SessionSnapshot::anonymous(true)),
            epoch: AtomicU64::new(0),
            monitor: Mutex::new(None),
            state_events: Publisher::new(),
            error_events: Publisher::new(),
        })
    }

    // ==========================================
    // Observation
    // ==========================================

    /// Snapshot of the current session. The returned copy is detached;
    /// mutating it has no effect on the session.
    pub fn state(&self) -> SessionSnapshot {
        self.state.lock().unwrap().clone()
    }

    /// Subscribe to session transitions. Every handler receives the full
    /// new snapshot, synchronously, in subscription order.
    pub fn on_state_change(
        &self,
        handler: impl Fn(&SessionSnapshot) + Send + Sync + 'static,
    ) -> Subscription {
        self.state_events.subscribe(handler)
    }

    /// Subscribe to error events from bootstrap, callback resolution, and
    /// the liveness monitor.
    pub fn on_error(&self, handler: impl Fn(&ErrorEvent) + Send + Sync + 'static) -> Subscription {
        self.error_events.subscribe(handler)
    }

    /// Whether the liveness monitor is currently running.
    pub fn monitor_active(&self) -> bool {
        self.monitor
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|handle| handle.is_active())
    }

    /// Consume the one-shot `redirect_to` signal.
    pub fn clear_redirect(&self) {
        self.set_state(|state| state.redirect_to = None);
    }

    // ==========================================
    // Bootstrap
    // ==========================================

    /// Restore the session at process start.
    ///
    /// Reads the token store; a stored access token is validated against
    /// the server, falling back to a refresh when rejected. Ends with the
    /// OAuth callback resolver, which runs even when no prior session
    /// existed (a redirect may land on a fresh tab).
    pub async fn bootstrap(self: &Arc<Self>, current_url: &Url) {
        let epoch = self.current_epoch();

        let access_token = self.read_slot(self.vault.access_token(), "access_token");
        let refresh_token = self
            .read_slot(self.vault.refresh_token(), "refresh_token")
            .filter(|token| !token.is_empty());
        let cached_user = self.read_slot(self.vault.user(), "user");

        if let (Some(access), Some(_)) = (access_token, cached_user) {
            match self.api.get_user(&access).await {
                Ok(user) => {
                    let tokens = TokenPair {
                        access_token: access,
                        refresh_token: refresh_token.unwrap_or_default(),
                        expires_in: self.config.default_expires_in,
                        token_type: "bearer".to_string(),
                        expires_at: None,
                        user,
                    };
                    if self.adopt_session(epoch, &tokens) {
                        self.ensure_monitor();
                        info!(user_id = %tokens.user.id, "session restored from stored tokens");
                    }
                }
                Err(err) => {
                    debug!(error = %err, "stored access token rejected, attempting refresh");
                    match refresh_token {
                        Some(refresh) => match self.refresh_inner(epoch, &refresh).await {
                            Ok(tokens) => {
                                self.ensure_monitor();
                                info!(user_id = %tokens.user.id, "session restored via refresh");
                            }
                            Err(err) => self.fail_bootstrap(err),
                        },
                        None => self.fail_bootstrap(SessionError::SessionExpired),
                    }
                }
            }
        } else {
            self.set_state(|state| state.is_loading = false);
        }

        self.resolve_callback(current_url).await;
    }

    // ==========================================
    // Credential operations
    // ==========================================

    /// Password-grant login. The error is propagated to the caller for
    /// rendering; state transitions are published either way.
    pub async fn login(self: &Arc<Self>, email: &str, password: &str) -> SessionResult<()> {
        let epoch = self.current_epoch();
        self.set_state(|state| state.is_loading = true);

        debug!(email = %email, "attempting password login");
        let result = self
            .api
            .login(Credentials {
                email: email.to_string(),
                password: password.to_string(),
            })
            .await;

        match result {
            Ok(tokens) => {
                if self.adopt_session(epoch, &tokens) {
                    self.persist_tokens(&tokens);
                    self.ensure_monitor();
                    info!(user_id = %tokens.user.id, "login successful");
                }
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "login failed");
                self.set_state(|state| state.is_loading = false);
                Err(err.into())
            }
        }
    }

    /// Create an account and adopt the issued session.
    pub async fn signup(
        self: &Arc<Self>,
        email: &str,
        password: &str,
        first_name: &str,
        last_name: &str,
    ) -> SessionResult<()> {
        let epoch = self.current_epoch();
        self.set_state(|state| state.is_loading = true);

        debug!(email = %email, "attempting signup");
        let result = self
            .api
            .signup(SignupRequest {
                email: email.to_string(),
                password: password.to_string(),
                first_name: first_name.to_string(),
                last_name: last_name.to_string(),
            })
            .await;

        match result {
            Ok(tokens) => {
                if self.adopt_session(epoch, &tokens) {
                    self.persist_tokens(&tokens);
                    self.ensure_monitor();
                    info!(user_id = %tokens.user.id, "signup successful");
                }
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "signup failed");
                self.set_state(|state| state.is_loading = false);
                Err(err.into())
            }
        }
    }

    /// Clear the session. The server-side logout is best-effort; local
    /// state and storage are reset regardless.
    pub async fn logout(&self) {
        let access_token = self.current_access_token();

        if let Some(token) = access_token {
            if let Err(err) = self.api.logout(&token).await {
                warn!(error = %err, "server logout failed, clearing local session anyway");
            }
        }

        self.reset_to_anonymous();
        info!("logged out");
    }

    /// Record the chosen provider in the per-tab store and return the
    /// authorization URL for the caller to navigate to.
    pub fn login_with_oauth(&self, provider: OAuthProvider) -> SessionResult<String> {
        self.transient
            .set(StorageKeys::OAUTH_PROVIDER, provider.as_str())?;
        debug!(provider = %provider, "starting oauth flow");
        Ok(self.api.oauth_url(provider))
    }

    /// Exchange the refresh token for a new pair and adopt it.
    ///
    /// Silent: never flips `is_loading`, so a valid session is not forced
    /// into a loading UI. A server-rejected refresh clears the session; a
    /// transport failure leaves the last known-good state in place.
    pub async fn refresh(self: &Arc<Self>) -> SessionResult<()> {
        let epoch = self.current_epoch();
        let refresh_token = self
            .with_state(|state| state.tokens.as_ref().map(|t| t.refresh_token.clone()))
            .filter(|token| !token.is_empty());

        let Some(refresh_token) = refresh_token else {
            warn!("refresh requested without a refresh token, clearing session");
            self.reset_to_anonymous();
            return Err(SessionError::SessionExpired);
        };

        let tokens = self.refresh_inner(epoch, &refresh_token).await?;
        self.ensure_monitor();
        debug!(user_id = %tokens.user.id, "token pair refreshed");
        Ok(())
    }

    /// Shallow-merge the partial fields into the in-memory user record.
    ///
    /// Cache-only: no server call and no re-persist. The merge does not
    /// survive a reload; callers needing durability must follow with a
    /// fetch or refresh.
    pub fn update_user(&self, update: UserUpdate) -> SessionResult<()> {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            if !state.is_authenticated {
                return Err(SessionError::NotAuthenticated);
            }
            if let Some(user) = state.user.as_mut() {
                user.apply(update);
            }
            state.clone()
        };

        self.state_events.publish(&snapshot);
        Ok(())
    }

    // ==========================================
    // Admin surface
    // ==========================================

    /// List all users, forwarding the current access token.
    pub async fn list_users(&self) -> SessionResult<Vec<User>> {
        let token = self
            .current_access_token()
            .ok_or(SessionError::NotAuthenticated)?;
        Ok(self.api.list_users(&token).await?)
    }

    /// Update a user record, forwarding the current access token.
    pub async fn admin_update_user(
        &self,
        user_id: &str,
        update: UserUpdate,
    ) -> SessionResult<User> {
        let token = self
            .current_access_token()
            .ok_or(SessionError::NotAuthenticated)?;
        Ok(self.api.admin_update_user(user_id, update, &token).await?)
    }

    // ==========================================
    // Callback resolution
    // ==========================================

    /// Resolve a post-redirect URL into a session, if it carries one.
    ///
    /// Runs once per page load at the tail of [`bootstrap`](Self::bootstrap).
    /// Failures are reported on the error channel only; the resolver never
    /// leaves the session loading.
    pub async fn resolve_callback(self: &Arc<Self>, current_url: &Url) {
        let epoch = self.current_epoch();

        match parse_callback(current_url) {
            CallbackSource::NoCallback => {
                if current_url.path() == self.config.callback_path {
                    self.fail_callback(SessionError::InvalidCallback(
                        "no token or authorization code found".to_string(),
                    ));
                }
            }
            CallbackSource::Failed { error, description } => {
                warn!(error = %error, "oauth provider reported failure");
                self.fail_callback(SessionError::Authentication {
                    code: error,
                    description: description.unwrap_or_else(|| "oauth flow failed".to_string()),
                });
            }
            CallbackSource::AuthorizationCode { code } => {
                self.set_state(|state| state.is_loading = true);
                let provider = self.provider_marker();
                debug!(provider = ?provider, "exchanging authorization code from callback");

                match self.api.exchange_code(&code, provider).await {
                    Ok(tokens) => self.finish_callback(epoch, &tokens),
                    Err(err) => self.fail_callback(err.into()),
                }
            }
            CallbackSource::QueryTokens {
                access_token,
                refresh_token,
                expires_in,
            }
            | CallbackSource::FragmentTokens {
                access_token,
                refresh_token,
                expires_in,
            } => {
                self.set_state(|state| state.is_loading = true);
                debug!("adopting tokens delivered on callback url");

                match self
                    .complete_token_callback(access_token, refresh_token, expires_in)
                    .await
                {
                    Ok(tokens) => self.finish_callback(epoch, &tokens),
                    Err(err) => self.fail_callback(err),
                }
            }
        }
    }

    /// Fetch the user behind a transport-delivered token and assemble the
    /// full pair.
    async fn complete_token_callback(
        &self,
        access_token: String,
        refresh_token: Option<String>,
        expires_in: Option<i64>,
    ) -> SessionResult<TokenPair> {
        let user = self.api.get_user(&access_token).await?;
        Ok(TokenPair {
            access_token,
            refresh_token: refresh_token.unwrap_or_default(),
            expires_in: expires_in.unwrap_or(self.config.default_expires_in),
            token_type: "bearer".to_string(),
            expires_at: None,
            user,
        })
    }

    fn finish_callback(self: &Arc<Self>, epoch: u64, tokens: &TokenPair) {
        if !self.adopt_session(epoch, tokens) {
            return;
        }

        self.persist_tokens(tokens);
        let _ = self.transient.delete(StorageKeys::OAUTH_PROVIDER);
        self.history.replace(&self.config.home_path);
        let home = self.config.home_path.clone();
        self.set_state(|state| state.redirect_to = Some(home));
        self.ensure_monitor();
        info!(user_id = %tokens.user.id, "oauth callback login complete");
    }

    fn fail_callback(&self, err: SessionError) {
        let _ = self.transient.delete(StorageKeys::OAUTH_PROVIDER);
        self.history.replace(&self.config.login_path);
        let login = self.config.login_path.clone();
        self.set_state(|state| {
            state.is_loading = false;
            state.redirect_to = Some(login);
        });
        self.emit_error(err.to_string());
    }

    fn provider_marker(&self) -> Option<OAuthProvider> {
        match self.transient.get(StorageKeys::OAUTH_PROVIDER) {
            Ok(value) => value.as_deref().and_then(OAuthProvider::parse),
            Err(err) => {
                warn!(error = %err, "transient store read failed");
                None
            }
        }
    }

    // ==========================================
    // Liveness
    // ==========================================

    /// One liveness check: refresh a stale token, clear the session when
    /// that fails. Invoked by the monitor task.
    pub(crate) async fn liveness_tick(self: &Arc<Self>) {
        let tokens = self.with_state(|state| state.tokens.clone());
        let Some(tokens) = tokens else {
            return;
        };

        if !self.token_is_stale(&tokens) {
            return;
        }

        debug!("access token near expiry, refreshing");
        if let Err(err) = self.refresh().await {
            warn!(error = %err, "liveness refresh failed, clearing session");
            if !matches!(err, SessionError::SessionExpired) {
                self.reset_to_anonymous();
            }
            self.emit_error(err.to_string());
        }
    }

    fn token_is_stale(&self, tokens: &TokenPair) -> bool {
        match tokens.expires_at {
            Some(expires_at) => {
                expires_at - Utc::now().timestamp() < self.config.expiry_skew_secs
            }
            None => false,
        }
    }

    // ==========================================
    // Internal transitions
    // ==========================================

    /// Adopt a token pair as the current session. Returns false when the
    /// result is stale (a reset happened after the request started), in
    /// which case state is untouched.
    fn adopt_session(&self, epoch: u64, tokens: &TokenPair) -> bool {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            info!("auth result arrived after session reset, discarding");
            return false;
        }

        let mut tokens = tokens.clone();
        if tokens.expires_at.is_none() {
            tokens.expires_at = Some(Utc::now().timestamp() + tokens.expires_in);
        }

        self.set_state(|state| {
            state.user = Some(tokens.user.clone());
            state.tokens = Some(tokens);
            state.is_authenticated = true;
            state.is_loading = false;
        });
        true
    }

    /// Return to the anonymous baseline: stop the monitor, clear storage,
    /// reset state, and invalidate in-flight results.
    fn reset_to_anonymous(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.stop_monitor();
        if let Err(err) = self.vault.clear() {
            warn!(error = %err, "failed to clear token store");
        }
        self.set_state(|state| *state = SessionSnapshot::anonymous(false));
    }

    async fn refresh_inner(&self, epoch: u64, refresh_token: &str) -> SessionResult<TokenPair> {
        match self.api.refresh_token(refresh_token).await {
            Ok(tokens) => {
                if self.adopt_session(epoch, &tokens) {
                    self.persist_tokens(&tokens);
                    Ok(tokens)
                } else {
                    Err(SessionError::SessionExpired)
                }
            }
            Err(ClientError::Http(err)) => {
                warn!(error = %err, "token refresh unreachable, keeping current session");
                Err(SessionError::Network(err.to_string()))
            }
            Err(err) => {
                warn!(error = %err, "token refresh rejected, clearing session");
                self.reset_to_anonymous();
                Err(SessionError::SessionExpired)
            }
        }
    }

    fn fail_bootstrap(&self, err: SessionError) {
        self.reset_to_anonymous();
        let login = self.config.login_path.clone();
        self.set_state(|state| {
            state.is_loading = false;
            state.redirect_to = Some(login);
        });
        self.emit_error(err.to_string());
    }

    fn persist_tokens(&self, tokens: &TokenPair) {
        if let Err(err) = self.vault.save_tokens(tokens) {
            warn!(error = %err, "failed to persist session, continuing in memory");
        }
    }

    fn ensure_monitor(self: &Arc<Self>) {
        let mut slot = self.monitor.lock().unwrap();
        if slot.as_ref().is_some_and(|handle| handle.is_active()) {
            return;
        }
        if let Some(stale) = slot.take() {
            stale.stop();
        }
        *slot = Some(MonitorHandle::spawn(
            Arc::downgrade(self),
            self.config.monitor_interval,
        ));
    }

    fn stop_monitor(&self) {
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            handle.stop();
        }
    }

    fn set_state(&self, mutate: impl FnOnce(&mut SessionSnapshot)) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            mutate(&mut state);
            state.clone()
        };
        self.state_events.publish(&snapshot);
    }

    fn with_state<T>(&self, read: impl FnOnce(&SessionSnapshot) -> T) -> T {
        read(&self.state.lock().unwrap())
    }

    fn current_access_token(&self) -> Option<String> {
        self.with_state(|state| state.tokens.as_ref().map(|t| t.access_token.clone()))
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn read_slot<T>(&self, result: StorageResult<Option<T>>, slot: &'static str) -> Option<T> {
        result.unwrap_or_else(|err| {
            warn!(slot, error = %err, "token store read failed, treating as absent");
            None
        })
    }

    fn emit_error(&self, message: String) {
        self.error_events.publish(&ErrorEvent { message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use authkit_client::ClientResult;
    use authkit_storage::{MemoryStorage, UserMetadata, UserRole};
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn test_user(id: &str) -> User {
        User {
            id: id.to_string(),
            role: UserRole::Standard,
            email: Some("ada@example.com".to_string()),
            created_at: "2024-01-01T00:00:00Z".to_string(),
            last_sign_in_at: None,
            user_metadata: UserMetadata {
                first_name: Some("Ada".to_string()),
                ..Default::default()
            },
            app_metadata: Default::default(),
        }
    }

    fn test_tokens(access: &str) -> TokenPair {
        TokenPair {
            access_token: access.to_string(),
            refresh_token: "refresh-1".to_string(),
            expires_in: 3600,
            token_type: "bearer".to_string(),
            expires_at: None,
            user: test_user("user-1"),
        }
    }

    /// Scripted auth server double: records calls, issues canned token
    /// pairs, and fails or blocks where a test asks it to.
    #[derive(Default)]
    struct MockApi {
        calls: Mutex<Vec<String>>,
        fail_get_user: AtomicBool,
        fail_login: AtomicBool,
        fail_refresh: AtomicBool,
        issue_expires_at: Mutex<Option<i64>>,
        login_gate: Mutex<Option<Arc<Notify>>>,
    }

    impl MockApi {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn issue(&self, access: &str) -> TokenPair {
            let mut tokens = test_tokens(access);
            tokens.expires_at = *self.issue_expires_at.lock().unwrap();
            tokens
        }
    }

    #[async_trait]
    impl AuthApi for MockApi {
        async fn signup(&self, request: SignupRequest) -> ClientResult<TokenPair> {
            self.record(format!("signup:{}", request.email));
            Ok(self.issue("signup-access"))
        }

        async fn login(&self, credentials: Credentials) -> ClientResult<TokenPair> {
            self.record(format!("login:{}", credentials.email));
            let gate = self.login_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if self.fail_login.load(Ordering::SeqCst) {
                return Err(ClientError::api("invalid_grant", "bad credentials"));
            }
            Ok(self.issue("login-access"))
        }

        async fn logout(&self, access_token: &str) -> ClientResult<()> {
            self.record(format!("logout:{}", access_token));
            Ok(())
        }

        async fn get_user(&self, access_token: &str) -> ClientResult<User> {
            self.record(format!("get_user:{}", access_token));
            if self.fail_get_user.load(Ordering::SeqCst) {
                return Err(ClientError::api("invalid_token", "token rejected"));
            }
            Ok(test_user("user-1"))
        }

        async fn refresh_token(&self, refresh_token: &str) -> ClientResult<TokenPair> {
            self.record(format!("refresh:{}", refresh_token));
            if self.fail_refresh.load(Ordering::SeqCst) {
                return Err(ClientError::api("invalid_grant", "refresh rejected"));
            }
            Ok(self.issue("refreshed-access"))
        }

        fn oauth_url(&self, provider: OAuthProvider) -> String {
            format!("https://auth.local/authorize?provider={}", provider)
        }

        async fn exchange_code(
            &self,
            code: &str,
            provider: Option<OAuthProvider>,
        ) -> ClientResult<TokenPair> {
            self.record(format!(
                "exchange:{}:{}",
                code,
                provider.map(|p| p.as_str()).unwrap_or("none")
            ));
            Ok(self.issue("exchange-access"))
        }

        async fn list_users(&self, access_token: &str) -> ClientResult<Vec<User>> {
            self.record(format!("list_users:{}", access_token));
            Ok(vec![test_user("user-1")])
        }

        async fn admin_update_user(
            &self,
            user_id: &str,
            update: UserUpdate,
            access_token: &str,
        ) -> ClientResult<User> {
            self.record(format!("admin_update:{}:{}", user_id, access_token));
            let mut user = test_user(user_id);
            user.apply(update);
            Ok(user)
        }
    }

    /// Storage that keeps a probe handle for post-hoc assertions.
    #[derive(Clone, Default)]
    struct SharedStorage(Arc<MemoryStorage>);

    impl KeyValueStorage for SharedStorage {
        fn set(&self, key: &str, value: &str) -> StorageResult<()> {
            self.0.set(key, value)
        }
        fn get(&self, key: &str) -> StorageResult<Option<String>> {
            self.0.get(key)
        }
        fn delete(&self, key: &str) -> StorageResult<bool> {
            self.0.delete(key)
        }
    }

    #[derive(Clone, Default)]
    struct RecordingHistory(Arc<Mutex<Vec<String>>>);

    impl UrlHistory for RecordingHistory {
        fn replace(&self, path: &str) {
            self.0.lock().unwrap().push(path.to_string());
        }
    }

    struct Harness {
        api: Arc<MockApi>,
        session: Arc<SessionManager>,
        durable: SharedStorage,
        transient: SharedStorage,
        history: RecordingHistory,
    }

    impl Harness {
        fn vault(&self) -> SessionVault {
            SessionVault::new(Box::new(self.durable.clone()))
        }

        fn errors(&self) -> Arc<Mutex<Vec<String>>> {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = seen.clone();
            let _sub = self.session.on_error(move |event| {
                sink.lock().unwrap().push(event.message.clone());
            });
            seen
        }
    }

    fn harness() -> Harness {
        harness_with(MockApi::default())
    }

    fn harness_with(api: MockApi) -> Harness {
        let api = Arc::new(api);
        let durable = SharedStorage::default();
        let transient = SharedStorage::default();
        let history = RecordingHistory::default();
        let session = SessionManager::new(
            api.clone(),
            SessionVault::new(Box::new(durable.clone())),
            Box::new(transient.clone()),
            Box::new(history.clone()),
            SessionConfig::default(),
        );
        Harness {
            api,
            session,
            durable,
            transient,
            history,
        }
    }

    fn page(path_and_rest: &str) -> Url {
        Url::parse(&format!("https://app.local{}", path_and_rest)).unwrap()
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    // ==========================================
    // Bootstrap
    // ==========================================

    #[tokio::test]
    async fn test_bootstrap_without_stored_session_finishes_loading() {
        let h = harness();
        assert!(h.session.state().is_loading);

        h.session.bootstrap(&page("/home")).await;

        assert_eq!(h.session.state(), SessionSnapshot::anonymous(false));
        assert!(h.api.calls().is_empty());
        assert!(!h.session.monitor_active());
    }

    #[tokio::test]
    async fn test_bootstrap_restores_session_from_stored_tokens() {
        let h = harness();
        h.vault().save_tokens(&test_tokens("stored-access")).unwrap();

        h.session.bootstrap(&page("/home")).await;

        let state = h.session.state();
        assert!(state.is_authenticated);
        assert!(!state.is_loading);
        assert_eq!(state.user.unwrap().id, "user-1");
        assert_eq!(
            state.tokens.unwrap().access_token,
            "stored-access".to_string()
        );
        assert!(h.api.calls().contains(&"get_user:stored-access".to_string()));
        assert!(h.session.monitor_active());
    }

    #[tokio::test]
    async fn test_bootstrap_refreshes_when_stored_token_rejected() {
        let h = harness();
        h.api.fail_get_user.store(true, Ordering::SeqCst);
        h.vault().save_tokens(&test_tokens("stored-access")).unwrap();

        h.session.bootstrap(&page("/home")).await;

        let state = h.session.state();
        assert!(state.is_authenticated);
        assert_eq!(state.tokens.unwrap().access_token, "refreshed-access");
        assert!(h.api.calls().contains(&"refresh:refresh-1".to_string()));
        // Refreshed pair is persisted
        assert_eq!(
            h.vault().access_token().unwrap(),
            Some("refreshed-access".to_string())
        );
        assert!(h.session.monitor_active());
    }

    #[tokio::test]
    async fn test_bootstrap_clears_session_when_refresh_fails() {
        let h = harness();
        h.api.fail_get_user.store(true, Ordering::SeqCst);
        h.api.fail_refresh.store(true, Ordering::SeqCst);
        h.vault().save_tokens(&test_tokens("stored-access")).unwrap();
        let errors = h.errors();

        h.session.bootstrap(&page("/home")).await;

        let state = h.session.state();
        assert!(!state.is_authenticated);
        assert!(!state.is_loading);
        assert_eq!(state.redirect_to.as_deref(), Some("/login"));
        assert!(!errors.lock().unwrap().is_empty());
        assert_eq!(h.vault().access_token().unwrap(), None);
        assert!(!h.session.monitor_active());
    }

    #[tokio::test]
    async fn test_bootstrap_without_refresh_token_clears_session() {
        let h = harness();
        h.api.fail_get_user.store(true, Ordering::SeqCst);
        let mut tokens = test_tokens("stored-access");
        tokens.refresh_token = String::new();
        h.vault().save_tokens(&tokens).unwrap();

        h.session.bootstrap(&page("/home")).await;

        let state = h.session.state();
        assert!(!state.is_authenticated);
        assert_eq!(state.redirect_to.as_deref(), Some("/login"));
        // No refresh attempt was possible
        assert!(!h.api.calls().iter().any(|c| c.starts_with("refresh:")));
    }

    // ==========================================
    // Login / signup / logout
    // ==========================================

    #[tokio::test]
    async fn test_login_success_adopts_and_persists() {
        let h = harness();

        h.session.login("ada@example.com", "pw").await.unwrap();

        let state = h.session.state();
        assert!(state.is_authenticated);
        assert!(!state.is_loading);
        assert_eq!(state.tokens.unwrap().access_token, "login-access");
        assert_eq!(
            h.vault().access_token().unwrap(),
            Some("login-access".to_string())
        );
        assert!(h.session.monitor_active());
    }

    #[tokio::test]
    async fn test_login_failure_propagates_and_clears_loading() {
        let h = harness();
        h.api.fail_login.store(true, Ordering::SeqCst);

        let err = h.session.login("ada@example.com", "pw").await.unwrap_err();

        match err {
            SessionError::Authentication { code, .. } => assert_eq!(code, "invalid_grant"),
            other => panic!("expected Authentication, got {:?}", other),
        }
        let state = h.session.state();
        assert!(!state.is_authenticated);
        assert!(!state.is_loading);
    }

    #[tokio::test]
    async fn test_signup_success_adopts_session() {
        let h = harness();

        h.session
            .signup("ada@example.com", "pw", "Ada", "Lovelace")
            .await
            .unwrap();

        let state = h.session.state();
        assert!(state.is_authenticated);
        assert_eq!(state.tokens.unwrap().access_token, "signup-access");
        assert!(h.api.calls().contains(&"signup:ada@example.com".to_string()));
    }

    #[tokio::test]
    async fn test_login_then_logout_returns_to_anonymous_baseline() {
        let h = harness();

        h.session.login("ada@example.com", "pw").await.unwrap();
        h.session.logout().await;

        assert_eq!(h.session.state(), SessionSnapshot::anonymous(false));
        assert!(h.api.calls().contains(&"logout:login-access".to_string()));
        assert_eq!(h.vault().access_token().unwrap(), None);
        assert!(h.vault().user().unwrap().is_none());
        assert!(!h.session.monitor_active());
    }

    #[tokio::test]
    async fn test_stale_login_result_is_discarded() {
        let gate = Arc::new(Notify::new());
        let api = MockApi::default();
        *api.login_gate.lock().unwrap() = Some(gate.clone());
        let h = harness_with(api);

        let session = h.session.clone();
        let pending = tokio::spawn(async move { session.login("ada@example.com", "pw").await });
        settle().await;

        // Logout resolves while the login's network call is still pending
        h.session.logout().await;
        gate.notify_one();
        pending.await.unwrap().unwrap();

        assert_eq!(h.session.state(), SessionSnapshot::anonymous(false));
        assert_eq!(h.vault().access_token().unwrap(), None);
        assert!(!h.session.monitor_active());
    }

    // ==========================================
    // Snapshots and updates
    // ==========================================

    #[tokio::test]
    async fn test_mutating_snapshot_does_not_affect_state() {
        let h = harness();
        h.session.login("ada@example.com", "pw").await.unwrap();

        let mut snapshot = h.session.state();
        snapshot.user = None;
        snapshot.is_authenticated = false;

        assert!(h.session.state().is_authenticated);
        assert_eq!(h.session.state(), h.session.state());
    }

    #[tokio::test]
    async fn test_update_user_merges_in_memory_only() {
        let h = harness();
        h.session.login("ada@example.com", "pw").await.unwrap();

        h.session
            .update_user(UserUpdate {
                email: Some("new@example.com".to_string()),
                ..Default::default()
            })
            .unwrap();

        let state = h.session.state();
        assert_eq!(state.user.unwrap().email.as_deref(), Some("new@example.com"));
        // Cache-only: the persisted snapshot still holds the issued record
        assert_eq!(
            h.vault().user().unwrap().unwrap().email.as_deref(),
            Some("ada@example.com")
        );
    }

    #[tokio::test]
    async fn test_update_user_requires_active_session() {
        let h = harness();
        let err = h.session.update_user(UserUpdate::default()).unwrap_err();
        assert!(matches!(err, SessionError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_state_change_events_fire_in_order() {
        let h = harness();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = h.session.on_state_change(move |snapshot| {
            sink.lock()
                .unwrap()
                .push((snapshot.is_loading, snapshot.is_authenticated));
        });

        h.session.login("ada@example.com", "pw").await.unwrap();

        // Loading first, then the adopted session
        assert_eq!(*seen.lock().unwrap(), vec![(true, false), (false, true)]);
    }

    // ==========================================
    // Callback resolution
    // ==========================================

    #[tokio::test]
    async fn test_callback_code_takes_precedence_over_fragment() {
        let h = harness();

        h.session
            .bootstrap(&page("/callback?code=abc123#access_token=xyz"))
            .await;

        let calls = h.api.calls();
        assert!(calls.contains(&"exchange:abc123:none".to_string()));
        assert!(!calls.iter().any(|c| c.starts_with("get_user:xyz")));
        let state = h.session.state();
        assert!(state.is_authenticated);
        assert_eq!(state.tokens.unwrap().access_token, "exchange-access");
        assert_eq!(state.redirect_to.as_deref(), Some("/home"));
    }

    #[tokio::test]
    async fn test_callback_exchange_forwards_provider_marker() {
        let h = harness();
        h.session.login_with_oauth(OAuthProvider::Github).unwrap();

        h.session.bootstrap(&page("/callback?code=abc123")).await;

        assert!(h.api.calls().contains(&"exchange:abc123:github".to_string()));
        // Marker is consumed on success
        assert_eq!(
            h.transient.get(StorageKeys::OAUTH_PROVIDER).unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_callback_error_short_circuits() {
        let h = harness();
        h.session.login_with_oauth(OAuthProvider::Google).unwrap();
        let errors = h.errors();

        h.session
            .bootstrap(&page("/callback?error=access_denied"))
            .await;

        // No token exchange was attempted
        assert!(h.api.calls().is_empty());
        let state = h.session.state();
        assert!(!state.is_authenticated);
        assert!(!state.is_loading);
        assert_eq!(state.redirect_to.as_deref(), Some("/login"));
        assert!(errors.lock().unwrap()[0].contains("access_denied"));
        assert_eq!(
            h.transient.get(StorageKeys::OAUTH_PROVIDER).unwrap(),
            None
        );
        assert_eq!(h.history.0.lock().unwrap().last().unwrap(), "/login");
    }

    #[tokio::test]
    async fn test_fragment_only_callback_builds_token_pair() {
        let h = harness();

        h.session
            .bootstrap(&page(
                "/callback#access_token=tok123&refresh_token=ref456&expires_in=7200",
            ))
            .await;

        assert!(h.api.calls().contains(&"get_user:tok123".to_string()));
        let state = h.session.state();
        assert!(state.is_authenticated);
        let tokens = state.tokens.unwrap();
        assert_eq!(tokens.access_token, "tok123");
        assert_eq!(tokens.refresh_token, "ref456");
        assert_eq!(tokens.expires_in, 7200);
        assert_eq!(state.redirect_to.as_deref(), Some("/home"));
        assert_eq!(h.history.0.lock().unwrap().last().unwrap(), "/home");
    }

    #[tokio::test]
    async fn test_query_token_callback_defaults_expiry() {
        let h = harness();

        h.session
            .bootstrap(&page("/callback?access_token=tok&refresh_token=ref"))
            .await;

        let state = h.session.state();
        let tokens = state.tokens.unwrap();
        assert_eq!(tokens.access_token, "tok");
        assert_eq!(tokens.expires_in, 3600);
    }

    #[tokio::test]
    async fn test_callback_path_without_payload_reports_error() {
        let h = harness();
        let errors = h.errors();

        h.session.bootstrap(&page("/callback")).await;

        let state = h.session.state();
        assert!(!state.is_loading);
        assert_eq!(state.redirect_to.as_deref(), Some("/login"));
        assert!(errors.lock().unwrap()[0].contains("callback"));
    }

    #[tokio::test]
    async fn test_ordinary_page_without_payload_is_noop() {
        let h = harness();
        let errors = h.errors();

        h.session.bootstrap(&page("/home")).await;

        assert!(errors.lock().unwrap().is_empty());
        assert_eq!(h.session.state().redirect_to, None);
    }

    #[tokio::test]
    async fn test_clear_redirect_consumes_signal() {
        let h = harness();
        h.session
            .bootstrap(&page("/callback?error=access_denied"))
            .await;
        assert!(h.session.state().redirect_to.is_some());

        h.session.clear_redirect();

        assert_eq!(h.session.state().redirect_to, None);
    }

    #[tokio::test]
    async fn test_login_with_oauth_records_marker_and_returns_url() {
        let h = harness();

        let url = h.session.login_with_oauth(OAuthProvider::Github).unwrap();

        assert!(url.contains("provider=github"));
        assert_eq!(
            h.transient.get(StorageKeys::OAUTH_PROVIDER).unwrap(),
            Some("github".to_string())
        );
    }

    // ==========================================
    // Refresh
    // ==========================================

    #[tokio::test]
    async fn test_refresh_without_token_clears_and_errors() {
        let h = harness();

        let err = h.session.refresh().await.unwrap_err();

        assert!(matches!(err, SessionError::SessionExpired));
        assert_eq!(h.session.state(), SessionSnapshot::anonymous(false));
    }

    #[tokio::test]
    async fn test_refresh_is_silent() {
        let h = harness();
        h.session.login("ada@example.com", "pw").await.unwrap();

        let loading_seen = Arc::new(Mutex::new(Vec::new()));
        let sink = loading_seen.clone();
        let _sub = h.session.on_state_change(move |snapshot| {
            sink.lock().unwrap().push(snapshot.is_loading);
        });

        h.session.refresh().await.unwrap();

        // A valid session is never forced into a loading UI by refresh
        assert!(loading_seen.lock().unwrap().iter().all(|loading| !loading));
        let state = h.session.state();
        assert_eq!(state.tokens.unwrap().access_token, "refreshed-access");
        assert_eq!(
            h.vault().access_token().unwrap(),
            Some("refreshed-access".to_string())
        );
    }

    #[tokio::test]
    async fn test_refresh_rejection_clears_session() {
        let h = harness();
        h.session.login("ada@example.com", "pw").await.unwrap();
        h.api.fail_refresh.store(true, Ordering::SeqCst);

        let err = h.session.refresh().await.unwrap_err();

        assert!(matches!(err, SessionError::SessionExpired));
        assert_eq!(h.session.state(), SessionSnapshot::anonymous(false));
        assert_eq!(h.vault().access_token().unwrap(), None);
        assert!(!h.session.monitor_active());
    }

    // ==========================================
    // Liveness monitor
    // ==========================================

    #[tokio::test(start_paused = true)]
    async fn test_monitor_refreshes_stale_token() {
        let api = MockApi::default();
        *api.issue_expires_at.lock().unwrap() = Some(Utc::now().timestamp() - 10);
        let h = harness_with(api);
        h.session.login("ada@example.com", "pw").await.unwrap();
        settle().await;

        tokio::time::advance(Duration::from_secs(301)).await;
        settle().await;

        assert!(h
            .api
            .calls()
            .contains(&"refresh:refresh-1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_skips_fresh_token() {
        let h = harness();
        h.session.login("ada@example.com", "pw").await.unwrap();
        settle().await;

        tokio::time::advance(Duration::from_secs(301)).await;
        settle().await;

        assert!(!h.api.calls().iter().any(|c| c.starts_with("refresh:")));
        assert!(h.session.monitor_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_clears_session_when_refresh_fails() {
        let api = MockApi::default();
        *api.issue_expires_at.lock().unwrap() = Some(Utc::now().timestamp() - 10);
        api.fail_refresh.store(true, Ordering::SeqCst);
        let h = harness_with(api);
        h.session.login("ada@example.com", "pw").await.unwrap();
        let errors = h.errors();
        settle().await;

        tokio::time::advance(Duration::from_secs(301)).await;
        settle().await;

        assert_eq!(h.session.state(), SessionSnapshot::anonymous(false));
        assert!(!errors.lock().unwrap().is_empty());
        assert!(!h.session.monitor_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_stops_on_logout() {
        let api = MockApi::default();
        *api.issue_expires_at.lock().unwrap() = Some(Utc::now().timestamp() - 10);
        let h = harness_with(api);
        h.session.login("ada@example.com", "pw").await.unwrap();
        h.session.logout().await;

        let calls_before = h.api.calls().len();
        tokio::time::advance(Duration::from_secs(900)).await;
        settle().await;

        assert_eq!(h.api.calls().len(), calls_before);
        assert!(!h.session.monitor_active());
    }

    #[tokio::test]
    async fn test_monitor_follows_authenticated_transitions() {
        let h = harness();

        h.session.login("ada@example.com", "pw").await.unwrap();
        assert!(h.session.monitor_active());

        h.session.logout().await;
        settle().await;
        assert!(!h.session.monitor_active());

        h.session.login("ada@example.com", "pw").await.unwrap();
        assert!(h.session.monitor_active());

        h.session.logout().await;
        settle().await;
        assert!(!h.session.monitor_active());
    }

    // ==========================================
    // Admin surface
    // ==========================================

    #[tokio::test]
    async fn test_list_users_forwards_access_token() {
        let h = harness();
        h.session.login("ada@example.com", "pw").await.unwrap();

        let users = h.session.list_users().await.unwrap();

        assert_eq!(users.len(), 1);
        assert!(h
            .api
            .calls()
            .contains(&"list_users:login-access".to_string()));
    }

    #[tokio::test]
    async fn test_admin_surface_requires_session() {
        let h = harness();

        let err = h.session.list_users().await.unwrap_err();
        assert!(matches!(err, SessionError::NotAuthenticated));

        let err = h
            .session
            .admin_update_user("user-2", UserUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotAuthenticated));
    }

    #[tokio::test]
    async fn test_admin_update_user_applies_changes() {
        let h = harness();
        h.session.login("ada@example.com", "pw").await.unwrap();

        let updated = h
            .session
            .admin_update_user(
                "user-2",
                UserUpdate {
                    role: Some(UserRole::Admin),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.id, "user-2");
        assert!(updated.is_admin());
    }
}
