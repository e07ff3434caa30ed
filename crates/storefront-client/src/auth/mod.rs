//! Bearer token lifecycle.
//!
//! The [`TokenManager`] owns the access token, the refresh token and an estimate of when the
//! access token expires. Before a request goes out, [`TokenManager::get_valid_token`] validates
//! the current token against the API and, if it was rejected, exchanges the refresh token for a
//! new pair.
//!
//! Validation and refresh are single-flight: concurrent callers share one in-flight round trip
//! and all observe its outcome. A failed refresh ends the session. The tokens are wiped from
//! memory and from the [`TokenStore`], the [`SessionObserver`] is told to send the user back to
//! the login, and every later request fails immediately until the next login.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

mod endpoint;
mod store;

pub use endpoint::{AuthEndpoint, AuthFuture, HttpAuthEndpoint, TokenGrant};
pub use store::{
    FileTokenStore, MemoryTokenStore, TokenStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY,
    TOKEN_EXPIRY_KEY,
};

use crate::caching::RequestKey;
use crate::coalesce::RequestCoalescer;
use crate::config::AuthConfig;
use crate::error::ClientError;

/// An opaque bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    bearer_token: Arc<str>,
}

impl AccessToken {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self {
            bearer_token: token.into(),
        }
    }

    /// The raw token, without the `Bearer` scheme.
    pub fn as_str(&self) -> &str {
        &self.bearer_token
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(..)")
    }
}

/// The credentials exchanged for a token pair on login.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"********")
            .finish()
    }
}

/// The state of the session as far as it can be told without asking the API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// Nobody logged in.
    NoToken,
    /// There is an access token that is not known to expire soon.
    Valid,
    /// The access token expires within the configured buffer.
    Expiring,
    /// The access token is past its estimated expiry, or the session was ended by a failed
    /// refresh.
    Invalid,
}

/// Receives the side effects of a session that cannot be recovered.
pub trait SessionObserver: Send + Sync {
    /// The user has to log in again.
    fn redirect_to_login(&self);

    /// A message to surface to the user.
    fn notify(&self, _message: &str) {}
}

/// A [`SessionObserver`] that only logs.
#[derive(Debug, Default)]
pub struct LogSessionObserver;

impl SessionObserver for LogSessionObserver {
    fn redirect_to_login(&self) {
        tracing::warn!("Session ended, log in again to continue");
    }
}

/// The message passed to [`SessionObserver::notify`] when a session ends.
pub const SESSION_EXPIRED_MESSAGE: &str = "Your session has expired. Please log in again.";

#[derive(Debug, Default)]
struct TokenState {
    access_token: Option<AccessToken>,
    refresh_token: Option<Arc<str>>,
    expires_at: Option<DateTime<Utc>>,
    /// Set when a failed refresh ended the session, until the next login.
    invalidated: bool,
    /// Incremented whenever the tokens are replaced or cleared.
    ///
    /// Validations and refreshes are keyed by the generation they started from, so a caller
    /// that observed a token which was replaced in the meantime never triggers a second refresh.
    generation: u64,
}

impl TokenState {
    fn current(&self) -> Result<AccessToken, ClientError> {
        match &self.access_token {
            Some(token) => Ok(token.clone()),
            None if self.invalidated => Err(ClientError::AuthenticationExpired),
            None => Err(ClientError::NotAuthenticated),
        }
    }

    fn status(&self, now: DateTime<Utc>, buffer: Duration) -> TokenStatus {
        if self.access_token.is_none() {
            return match self.invalidated {
                true => TokenStatus::Invalid,
                false => TokenStatus::NoToken,
            };
        }

        let Some(expires_at) = self.expires_at else {
            return TokenStatus::Valid;
        };
        let buffer = chrono::Duration::from_std(buffer).unwrap_or_else(|_| chrono::Duration::zero());
        if expires_at <= now {
            TokenStatus::Invalid
        } else if expires_at - buffer <= now {
            TokenStatus::Expiring
        } else {
            TokenStatus::Valid
        }
    }
}

struct Inner {
    state: Mutex<TokenState>,
    endpoint: Arc<dyn AuthEndpoint>,
    store: Arc<dyn TokenStore>,
    observer: Arc<dyn SessionObserver>,
    validations: RequestCoalescer<bool>,
    refreshes: RequestCoalescer<AccessToken>,
    /// Applied to the refresh round trip itself, so that a timeout ends the session.
    refresh_timeout: Option<Duration>,
    expiry_buffer: Duration,
    trust_expiry: bool,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the tokens with a freshly issued pair.
    fn apply_grant(&self, grant: TokenGrant) -> AccessToken {
        let token = AccessToken::new(grant.access_token.as_str());
        let expires_at = grant.expires_at(Utc::now());

        let mut state = self.state();
        state.access_token = Some(token.clone());
        if let Some(refresh_token) = grant.refresh_token {
            state.refresh_token = Some(refresh_token.into());
        }
        state.expires_at = expires_at;
        state.invalidated = false;
        state.generation += 1;
        self.persist(&state);

        token
    }

    fn persist(&self, state: &TokenState) {
        let result = (|| {
            match &state.access_token {
                Some(token) => self.store.set(ACCESS_TOKEN_KEY, token.as_str())?,
                None => self.store.remove(ACCESS_TOKEN_KEY)?,
            }
            match &state.refresh_token {
                Some(token) => self.store.set(REFRESH_TOKEN_KEY, token)?,
                None => self.store.remove(REFRESH_TOKEN_KEY)?,
            }
            match state.expires_at {
                Some(expires_at) => self
                    .store
                    .set(TOKEN_EXPIRY_KEY, &expires_at.timestamp_millis().to_string())?,
                None => self.store.remove(TOKEN_EXPIRY_KEY)?,
            }
            Ok::<_, std::io::Error>(())
        })();

        if let Err(err) = result {
            let dynerr: &dyn std::error::Error = &err;
            tracing::error!(error = dynerr, "Failed to persist session tokens");
        }
    }

    /// Forgets all tokens, with `invalidated` marking a session that ended involuntarily.
    fn clear(&self, invalidated: bool) {
        let mut state = self.state();
        state.access_token = None;
        state.refresh_token = None;
        state.expires_at = None;
        state.invalidated = invalidated;
        state.generation += 1;
        self.persist(&state);
    }

    fn handle_expiration(&self) {
        tracing::info!("Session expired");
        self.clear(true);
        self.observer.notify(SESSION_EXPIRED_MESSAGE);
        self.observer.redirect_to_login();
    }

    async fn refresh(self: Arc<Self>, generation: u64) -> Result<AccessToken, ClientError> {
        let refresh_token = {
            let state = self.state();
            // somebody else already replaced the tokens this refresh was meant for
            if state.generation != generation {
                return state.current();
            }
            state.refresh_token.clone()
        };

        let Some(refresh_token) = refresh_token else {
            tracing::debug!("No refresh token available");
            self.handle_expiration();
            return Err(ClientError::AuthenticationExpired);
        };

        let refresh = self.endpoint.refresh(&refresh_token);
        let refreshed = match self.refresh_timeout {
            Some(timeout) => tokio::time::timeout(timeout, refresh)
                .await
                .unwrap_or(Err(ClientError::Timeout(timeout))),
            None => refresh.await,
        };

        match refreshed {
            Ok(grant) => {
                metric!(counter("auth.refresh") += 1, "result" => "success");
                tracing::debug!("Refreshed access token");
                Ok(self.apply_grant(grant))
            }
            Err(err) => {
                metric!(counter("auth.refresh") += 1, "result" => "failure");
                tracing::warn!(error = %err, "Failed to refresh access token");
                self.handle_expiration();
                Err(ClientError::AuthenticationExpired)
            }
        }
    }
}

/// Produces valid bearer tokens for outgoing requests.
///
/// Cloning the manager is cheap and yields a handle to the same session.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("status", &self.status())
            .finish()
    }
}

impl TokenManager {
    /// Creates a manager, restoring a previous session from `store` if there is one.
    ///
    /// With a `timeout`, validations that do not complete in time count as a rejected token, and
    /// refreshes that do not complete in time end the session like any other failed refresh.
    pub fn new(
        endpoint: Arc<dyn AuthEndpoint>,
        store: Arc<dyn TokenStore>,
        observer: Arc<dyn SessionObserver>,
        config: &AuthConfig,
        timeout: Option<Duration>,
    ) -> Self {
        let state = TokenState {
            access_token: store.get(ACCESS_TOKEN_KEY).map(AccessToken::new),
            refresh_token: store.get(REFRESH_TOKEN_KEY).map(Arc::from),
            expires_at: store
                .get(TOKEN_EXPIRY_KEY)
                .and_then(|millis| millis.parse().ok())
                .and_then(DateTime::<Utc>::from_timestamp_millis),
            ..Default::default()
        };
        if state.access_token.is_some() {
            tracing::debug!("Restored session from token store");
        }

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                endpoint,
                store,
                observer,
                validations: RequestCoalescer::new(timeout),
                refreshes: RequestCoalescer::new(None),
                refresh_timeout: timeout,
                expiry_buffer: config.expiry_buffer,
                trust_expiry: config.trust_expiry,
            }),
        }
    }

    pub fn status(&self) -> TokenStatus {
        self.inner
            .state()
            .status(Utc::now(), self.inner.expiry_buffer)
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state().access_token.is_some()
    }

    /// The estimated expiry of the current access token, if the server told us.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state().expires_at
    }

    /// Returns a token the API accepts, validating and refreshing as needed.
    ///
    /// Fails right away without a network round trip if nobody is logged in, or if a previous
    /// refresh failed.
    pub async fn get_valid_token(&self) -> Result<AccessToken, ClientError> {
        let (token, generation, status) = {
            let state = self.inner.state();
            let token = state.current()?;
            let status = state.status(Utc::now(), self.inner.expiry_buffer);
            (token, state.generation, status)
        };

        if self.inner.trust_expiry && status == TokenStatus::Valid && self.expires_at().is_some()
        {
            return Ok(token);
        }

        if self.validate(token.clone(), generation).await {
            return Ok(token);
        }

        tracing::debug!(?status, "Access token was rejected, refreshing");
        self.refresh_from(generation).await
    }

    /// Asks the API whether the current token is still accepted.
    ///
    /// Failed round trips count as a rejection.
    pub async fn validate_token(&self) -> bool {
        let current = {
            let state = self.inner.state();
            state
                .access_token
                .clone()
                .map(|token| (token, state.generation))
        };
        match current {
            Some((token, generation)) => self.validate(token, generation).await,
            None => false,
        }
    }

    async fn validate(&self, token: AccessToken, generation: u64) -> bool {
        let key = RequestKey::from(format!("validate/{generation}"));
        let endpoint = Arc::clone(&self.inner.endpoint);

        let result = self
            .inner
            .validations
            .dedupe(&key, move || async move {
                let valid = match endpoint.validate(&token).await {
                    Ok(valid) => valid,
                    Err(err) => {
                        tracing::debug!(error = %err, "Token validation failed");
                        false
                    }
                };
                metric!(counter("auth.validate") += 1, "valid" => if valid { "true" } else { "false" });
                Ok(valid)
            })
            .await;

        result.unwrap_or(false)
    }

    /// Exchanges the refresh token for a new token pair.
    ///
    /// Concurrent calls share one round trip. On failure, the session ends: all tokens are
    /// cleared and the [`SessionObserver`] is notified once.
    pub async fn refresh_token(&self) -> Result<AccessToken, ClientError> {
        let generation = {
            let state = self.inner.state();
            state.current()?;
            state.generation
        };
        self.refresh_from(generation).await
    }

    async fn refresh_from(&self, generation: u64) -> Result<AccessToken, ClientError> {
        let key = RequestKey::from(format!("refresh/{generation}"));
        let inner = Arc::clone(&self.inner);
        self.inner
            .refreshes
            .dedupe(&key, move || inner.refresh(generation))
            .await
    }

    /// Ends the session because it cannot be recovered.
    pub fn handle_expiration(&self) {
        self.inner.handle_expiration();
    }

    /// Exchanges `credentials` for a token pair and starts a new session.
    pub async fn login(&self, credentials: &Credentials) -> Result<AccessToken, ClientError> {
        let grant = self.inner.endpoint.login(credentials).await?;
        tracing::info!(email = %credentials.email, "Logged in");
        Ok(self.inner.apply_grant(grant))
    }

    /// Starts a session with tokens obtained elsewhere.
    pub fn set_tokens(&self, grant: TokenGrant) -> AccessToken {
        self.inner.apply_grant(grant)
    }

    /// Ends the session on request of the user.
    pub fn logout(&self) {
        self.inner.clear(false);
        self.inner.validations.clear();
        self.inner.refreshes.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use futures::future::join_all;

    use super::*;
    use crate::test::{MockAuthEndpoint, RecordingObserver};

    fn manager(
        endpoint: &MockAuthEndpoint,
        store: &Arc<MemoryTokenStore>,
        observer: &Arc<RecordingObserver>,
    ) -> TokenManager {
        TokenManager::new(
            Arc::new(endpoint.clone()),
            store.clone(),
            observer.clone(),
            &AuthConfig::default(),
            None,
        )
    }

    fn logged_in(endpoint: &MockAuthEndpoint) -> (TokenManager, Arc<MemoryTokenStore>, Arc<RecordingObserver>) {
        let store = Arc::new(MemoryTokenStore::new());
        let observer = Arc::new(RecordingObserver::default());
        let manager = manager(endpoint, &store, &observer);
        manager.set_tokens(TokenGrant {
            access_token: "access-0".into(),
            refresh_token: Some("refresh-0".into()),
            expires_in: Some(4 * 60),
        });
        (manager, store, observer)
    }

    #[tokio::test]
    async fn test_no_token() {
        let endpoint = MockAuthEndpoint::default();
        let store = Arc::new(MemoryTokenStore::new());
        let observer = Arc::new(RecordingObserver::default());
        let manager = manager(&endpoint, &store, &observer);

        assert_eq!(manager.status(), TokenStatus::NoToken);
        assert_eq!(
            manager.get_valid_token().await,
            Err(ClientError::NotAuthenticated)
        );
        assert!(!manager.validate_token().await);
        assert_eq!(endpoint.validations(), 0);
        assert_eq!(endpoint.refreshes(), 0);
    }

    #[tokio::test]
    async fn test_valid_token() {
        let endpoint = MockAuthEndpoint::default();
        let (manager, _store, _observer) = logged_in(&endpoint);

        let token = manager.get_valid_token().await.unwrap();
        assert_eq!(token.as_str(), "access-0");
        assert_eq!(endpoint.validations(), 1);
        assert_eq!(endpoint.refreshes(), 0);
    }

    #[tokio::test]
    async fn test_expiring_token_refreshes_once() {
        let endpoint = MockAuthEndpoint::default().with_delay(Duration::from_millis(20));
        let (manager, store, _observer) = logged_in(&endpoint);
        assert_eq!(manager.status(), TokenStatus::Expiring);
        endpoint.set_valid(false);

        let results = join_all((0..3).map(|_| manager.get_valid_token())).await;

        assert_eq!(endpoint.validations(), 1);
        assert_eq!(endpoint.refreshes(), 1);
        for result in results {
            assert_eq!(result.unwrap().as_str(), "access-1");
        }
        assert_eq!(store.get(ACCESS_TOKEN_KEY).as_deref(), Some("access-1"));
        assert_eq!(store.get(REFRESH_TOKEN_KEY).as_deref(), Some("refresh-1"));
        assert_eq!(manager.status(), TokenStatus::Valid);
    }

    #[tokio::test]
    async fn test_concurrent_refreshes() {
        let endpoint = MockAuthEndpoint::default().with_delay(Duration::from_millis(20));
        let (manager, _store, _observer) = logged_in(&endpoint);

        let results = join_all((0..5).map(|_| manager.refresh_token())).await;

        assert_eq!(endpoint.refreshes(), 1);
        for result in results {
            assert_eq!(result.unwrap().as_str(), "access-1");
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_ends_session() {
        let endpoint = MockAuthEndpoint::default().with_delay(Duration::from_millis(20));
        let (manager, store, observer) = logged_in(&endpoint);
        endpoint.set_valid(false);
        endpoint.set_refresh_ok(false);

        let results = join_all((0..3).map(|_| manager.get_valid_token())).await;
        for result in results {
            assert_eq!(result, Err(ClientError::AuthenticationExpired));
        }
        assert_eq!(endpoint.refreshes(), 1);
        assert_eq!(observer.redirects.load(Ordering::SeqCst), 1);
        assert_eq!(
            observer.messages.lock().unwrap().as_slice(),
            [SESSION_EXPIRED_MESSAGE]
        );
        assert_eq!(store.get(ACCESS_TOKEN_KEY), None);
        assert_eq!(store.get(REFRESH_TOKEN_KEY), None);
        assert_eq!(manager.status(), TokenStatus::Invalid);

        // no further round trips until the next login
        assert_eq!(
            manager.get_valid_token().await,
            Err(ClientError::AuthenticationExpired)
        );
        assert_eq!(endpoint.validations(), 1);
        assert_eq!(endpoint.refreshes(), 1);
        assert_eq!(observer.redirects.load(Ordering::SeqCst), 1);

        endpoint.set_valid(true);
        manager
            .login(&Credentials::new("admin@example.com", "hunter2"))
            .await
            .unwrap();
        assert_eq!(manager.status(), TokenStatus::Valid);
        assert!(manager.get_valid_token().await.is_ok());
    }

    #[tokio::test]
    async fn test_timed_out_refresh_ends_session() {
        let endpoint = MockAuthEndpoint::default().with_delay(Duration::from_millis(200));
        let store = Arc::new(MemoryTokenStore::new());
        let observer = Arc::new(RecordingObserver::default());
        let manager = TokenManager::new(
            Arc::new(endpoint.clone()),
            store.clone(),
            observer.clone(),
            &AuthConfig::default(),
            Some(Duration::from_millis(50)),
        );
        manager.set_tokens(TokenGrant {
            access_token: "access-0".into(),
            refresh_token: Some("refresh-0".into()),
            expires_in: Some(3600),
        });

        let results = join_all((0..2).map(|_| manager.refresh_token())).await;
        for result in results {
            assert_eq!(result, Err(ClientError::AuthenticationExpired));
        }

        assert_eq!(endpoint.refreshes(), 1);
        assert_eq!(manager.status(), TokenStatus::Invalid);
        assert_eq!(store.get(ACCESS_TOKEN_KEY), None);
        assert_eq!(observer.redirects.load(Ordering::SeqCst), 1);

        assert_eq!(
            manager.get_valid_token().await,
            Err(ClientError::AuthenticationExpired)
        );
        assert_eq!(endpoint.refreshes(), 1);
    }

    #[tokio::test]
    async fn test_validation_error_falls_back_to_refresh() {
        let endpoint = MockAuthEndpoint::default();
        let (manager, _store, _observer) = logged_in(&endpoint);
        endpoint.fail_validation(true);

        let token = manager.get_valid_token().await.unwrap();
        assert_eq!(token.as_str(), "access-1");
        assert_eq!(endpoint.refreshes(), 1);
    }

    #[tokio::test]
    async fn test_trust_expiry_skips_validation() {
        let endpoint = MockAuthEndpoint::default();
        let store = Arc::new(MemoryTokenStore::new());
        let config = AuthConfig {
            trust_expiry: true,
            ..Default::default()
        };
        let manager = TokenManager::new(
            Arc::new(endpoint.clone()),
            store,
            Arc::new(LogSessionObserver),
            &config,
            None,
        );

        manager.set_tokens(TokenGrant {
            access_token: "access-0".into(),
            refresh_token: Some("refresh-0".into()),
            expires_in: Some(3600),
        });
        manager.get_valid_token().await.unwrap();
        assert_eq!(endpoint.validations(), 0);

        // inside the buffer, the token is validated again
        manager.set_tokens(TokenGrant {
            access_token: "access-0".into(),
            refresh_token: None,
            expires_in: Some(60),
        });
        manager.get_valid_token().await.unwrap();
        assert_eq!(endpoint.validations(), 1);
    }

    #[tokio::test]
    async fn test_restores_from_store() {
        let endpoint = MockAuthEndpoint::default();
        let store = Arc::new(MemoryTokenStore::new());
        store.set(ACCESS_TOKEN_KEY, "stored").unwrap();
        store.set(REFRESH_TOKEN_KEY, "stored-refresh").unwrap();
        let observer = Arc::new(RecordingObserver::default());

        let manager = manager(&endpoint, &store, &observer);
        assert!(manager.is_authenticated());
        assert_eq!(manager.expires_at(), None);
        assert_eq!(manager.get_valid_token().await.unwrap().as_str(), "stored");

        manager.logout();
        assert_eq!(manager.status(), TokenStatus::NoToken);
        assert_eq!(store.get(REFRESH_TOKEN_KEY), None);
        assert_eq!(observer.redirects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let credentials = Credentials::new("admin@example.com", "hunter2");
        insta::assert_snapshot!(
            format!("{credentials:?} {:?}", AccessToken::new("secret")),
            @r#"Credentials { email: "admin@example.com", password: "********" } AccessToken(..)"#
        );
    }
}
