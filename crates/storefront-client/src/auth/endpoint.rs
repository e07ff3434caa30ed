use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Deserialize;
use serde_json::json;
use tower::ServiceExt;

use super::{AccessToken, Credentials};
use crate::config::AuthConfig;
use crate::error::ClientError;
use crate::transport::{ApiRequest, ApiResponse, Transport};

pub type AuthFuture<T> = BoxFuture<'static, Result<T, ClientError>>;

/// The token pair handed out by the login and refresh endpoints.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// A rotated refresh token. The previous one stays in use if this is missing.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// The lifetime of the access token in seconds.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl TokenGrant {
    /// The estimated expiry of the access token, counted from `now`.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let expires_in = chrono::Duration::from_std(Duration::from_secs(self.expires_in?)).ok()?;
        now.checked_add_signed(expires_in)
    }
}

/// The authentication round trips of the admin API.
pub trait AuthEndpoint: Send + Sync + 'static {
    /// Exchanges credentials for a token pair.
    fn login(&self, credentials: &Credentials) -> AuthFuture<TokenGrant>;

    /// Checks whether the server still accepts `token`.
    ///
    /// Errors are reserved for failed round trips; a rejected token resolves to `false`.
    fn validate(&self, token: &AccessToken) -> AuthFuture<bool>;

    /// Exchanges a refresh token for a new token pair.
    fn refresh(&self, refresh_token: &str) -> AuthFuture<TokenGrant>;
}

/// [`AuthEndpoint`] implementation using the JSON endpoints of the admin API.
#[derive(Clone, Debug)]
pub struct HttpAuthEndpoint<T> {
    transport: T,
    login_path: String,
    validate_path: String,
    refresh_path: String,
}

impl<T: Transport> HttpAuthEndpoint<T> {
    pub fn new(transport: T, config: &AuthConfig) -> Self {
        Self {
            transport,
            login_path: config.login_path.clone(),
            validate_path: config.validate_path.clone(),
            refresh_path: config.refresh_path.clone(),
        }
    }

    fn grant(&self, request: ApiRequest) -> AuthFuture<TokenGrant> {
        let transport = self.transport.clone();
        async move { transport.oneshot(request).await?.json() }.boxed()
    }
}

/// A successful validation response may still reject the token in its body.
fn accepts_token(response: &ApiResponse) -> bool {
    match response.json::<serde_json::Value>() {
        Ok(body) => body
            .get("valid")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true),
        Err(_) => true,
    }
}

impl<T: Transport> AuthEndpoint for HttpAuthEndpoint<T> {
    fn login(&self, credentials: &Credentials) -> AuthFuture<TokenGrant> {
        let request = ApiRequest::post(&self.login_path)
            .anonymous()
            .json(json!({
                "email": credentials.email,
                "password": credentials.password,
            }));
        self.grant(request)
    }

    fn validate(&self, token: &AccessToken) -> AuthFuture<bool> {
        let request = ApiRequest::get(&self.validate_path)
            .anonymous()
            .bearer_auth(token.as_str());
        let transport = self.transport.clone();

        async move {
            match transport.oneshot(request).await {
                Ok(response) => Ok(accepts_token(&response)),
                Err(err) if err.is_unauthorized() => Ok(false),
                Err(err) => Err(err),
            }
        }
        .boxed()
    }

    fn refresh(&self, refresh_token: &str) -> AuthFuture<TokenGrant> {
        let request = ApiRequest::post(&self.refresh_path)
            .anonymous()
            .json(json!({ "refresh_token": refresh_token }));
        self.grant(request)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::transport::TransportFuture;

    /// Answers every request with the same outcome and records what was sent.
    #[derive(Clone)]
    struct FixedTransport {
        outcome: Result<ApiResponse, ClientError>,
        sent: Arc<Mutex<Vec<ApiRequest>>>,
    }

    impl FixedTransport {
        fn new(outcome: Result<ApiResponse, ClientError>) -> Self {
            Self {
                outcome,
                sent: Default::default(),
            }
        }
    }

    impl tower_service::Service<ApiRequest> for FixedTransport {
        type Response = ApiResponse;
        type Error = ClientError;
        type Future = TransportFuture;

        fn poll_ready(
            &mut self,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn call(&mut self, request: ApiRequest) -> Self::Future {
            self.sent.lock().unwrap().push(request);
            futures::future::ready(self.outcome.clone()).boxed()
        }
    }

    fn endpoint(outcome: Result<ApiResponse, ClientError>) -> HttpAuthEndpoint<FixedTransport> {
        HttpAuthEndpoint::new(FixedTransport::new(outcome), &AuthConfig::default())
    }

    #[tokio::test]
    async fn test_login() {
        let body = json!({"access_token": "access-1", "refresh_token": "refresh-1", "expires_in": 900});
        let endpoint = endpoint(Ok(ApiResponse::from_json(&body)));

        let credentials = Credentials::new("admin@example.com", "hunter2");
        let grant = endpoint.login(&credentials).await.unwrap();
        assert_eq!(grant.access_token, "access-1");
        assert_eq!(grant.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(grant.expires_in, Some(900));

        let sent = endpoint.transport.sent.lock().unwrap();
        assert_eq!(sent[0].path, "auth/login");
        assert!(!sent[0].is_authenticated());
    }

    #[tokio::test]
    async fn test_validate() {
        let token = AccessToken::new("access-1");

        let accepted = endpoint(Ok(ApiResponse::new(200, "")));
        assert_eq!(accepted.validate(&token).await, Ok(true));
        let sent = accepted.transport.sent.lock().unwrap().clone();
        assert_eq!(
            sent[0].headers.get("authorization").map(String::as_str),
            Some("Bearer access-1")
        );

        let flagged = endpoint(Ok(ApiResponse::from_json(&json!({"valid": false}))));
        assert_eq!(flagged.validate(&token).await, Ok(false));

        let rejected = endpoint(Err(ClientError::Status {
            status: 401,
            body: "expired".into(),
        }));
        assert_eq!(rejected.validate(&token).await, Ok(false));

        let offline = endpoint(Err(ClientError::Network("connection refused".into())));
        assert!(offline.validate(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_without_rotation() {
        let endpoint = endpoint(Ok(ApiResponse::from_json(&json!({"access_token": "access-2"}))));

        let grant = endpoint.refresh("refresh-1").await.unwrap();
        assert_eq!(grant.access_token, "access-2");
        assert_eq!(grant.refresh_token, None);

        let sent = endpoint.transport.sent.lock().unwrap();
        assert_eq!(
            sent[0].body,
            Some(crate::transport::RequestBody::Json(
                json!({"refresh_token": "refresh-1"})
            ))
        );
    }

    #[test]
    fn test_grant_expiry() {
        let now = Utc::now();
        let grant = TokenGrant {
            access_token: "access-1".into(),
            refresh_token: None,
            expires_in: Some(60),
        };
        assert_eq!(grant.expires_at(now), Some(now + chrono::Duration::seconds(60)));

        let grant = TokenGrant {
            expires_in: None,
            ..grant
        };
        assert_eq!(grant.expires_at(now), None);
    }
}
