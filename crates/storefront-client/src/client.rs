use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use tower::util::BoxCloneService;
use tower::{ServiceBuilder, ServiceExt};

use crate::auth::{
    AccessToken, AuthEndpoint, Credentials, FileTokenStore, HttpAuthEndpoint, LogSessionObserver,
    MemoryTokenStore, SessionObserver, TokenManager, TokenStore,
};
use crate::caching::TtlCache;
use crate::coalesce::RequestCoalescer;
use crate::config::Config;
use crate::error::ClientError;
use crate::middleware::{AuthLayer, CacheLayer, MetricsLayer};
use crate::resources::{Resource, ResourceClient};
use crate::transport::{ApiRequest, ApiResponse, HttpTransport, Transport};

type BoxedService = BoxCloneService<ApiRequest, ApiResponse, ClientError>;

/// The client of the admin API.
///
/// One client owns one session: its response cache, its in-flight requests and its tokens. Create
/// it once and share it, for instance behind an [`Arc`], with everything issuing requests.
pub struct ApiClient {
    service: Mutex<BoxedService>,
    cache: TtlCache<ApiResponse>,
    coalescer: RequestCoalescer<ApiResponse>,
    tokens: TokenManager,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("cache", &self.cache)
            .field("coalescer", &self.coalescer)
            .field("tokens", &self.tokens)
            .finish()
    }
}

impl ApiClient {
    pub fn builder(config: Config) -> ApiClientBuilder {
        ApiClientBuilder {
            config,
            token_store: None,
            auth_endpoint: None,
            observer: None,
        }
    }

    /// Sends a request through the cache and the token gate.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        let service = self
            .service
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        service.oneshot(request).await
    }

    /// Sends a request and decodes the JSON response.
    pub async fn json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ClientError> {
        self.send(request).await?.json()
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, ClientError> {
        self.send(ApiRequest::get(path)).await
    }

    pub async fn post(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse, ClientError> {
        self.send(ApiRequest::post(path).json(body)).await
    }

    pub async fn put(&self, path: &str, body: serde_json::Value) -> Result<ApiResponse, ClientError> {
        self.send(ApiRequest::put(path).json(body)).await
    }

    pub async fn patch(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<ApiResponse, ClientError> {
        self.send(ApiRequest::patch(path).json(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ClientError> {
        self.send(ApiRequest::delete(path)).await
    }

    /// Typed access to one of the admin API resources.
    pub fn resource(&self, resource: Resource) -> ResourceClient<'_> {
        ResourceClient::new(self, resource)
    }

    /// Logs in, starting a new session with an empty cache.
    pub async fn login(&self, credentials: &Credentials) -> Result<AccessToken, ClientError> {
        let token = self.tokens.login(credentials).await?;
        self.cache.clear();
        Ok(token)
    }

    /// Ends the session and forgets everything cached on its behalf.
    pub fn logout(&self) {
        self.tokens.logout();
        self.cache.clear();
        self.coalescer.clear();
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub fn cache(&self) -> &TtlCache<ApiResponse> {
        &self.cache
    }

    pub fn coalescer(&self) -> &RequestCoalescer<ApiResponse> {
        &self.coalescer
    }
}

/// Forgets all responses of a session as soon as it ended involuntarily.
///
/// Cached reads are served without consulting the [`TokenManager`], so they have to go away
/// together with the session no matter which call ended it.
struct ClearOnExpiry {
    observer: Arc<dyn SessionObserver>,
    cache: TtlCache<ApiResponse>,
    coalescer: RequestCoalescer<ApiResponse>,
}

impl SessionObserver for ClearOnExpiry {
    fn redirect_to_login(&self) {
        self.cache.clear();
        self.coalescer.clear();
        self.observer.redirect_to_login();
    }

    fn notify(&self, message: &str) {
        self.observer.notify(message);
    }
}

/// Configures the collaborators of an [`ApiClient`].
///
/// Everything not set explicitly is derived from the [`Config`].
pub struct ApiClientBuilder {
    config: Config,
    token_store: Option<Arc<dyn TokenStore>>,
    auth_endpoint: Option<Arc<dyn AuthEndpoint>>,
    observer: Option<Arc<dyn SessionObserver>>,
}

impl ApiClientBuilder {
    /// Persists tokens to `store` instead of the configured session file.
    pub fn token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.token_store = Some(store);
        self
    }

    /// Uses `endpoint` for login, validation and refresh instead of the configured API paths.
    pub fn auth_endpoint(mut self, endpoint: Arc<dyn AuthEndpoint>) -> Self {
        self.auth_endpoint = Some(endpoint);
        self
    }

    /// Receives the side effects of a session that ended involuntarily.
    pub fn session_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Builds a client talking HTTP to the configured base URL.
    pub fn build(self) -> Result<ApiClient, ClientError> {
        let transport = HttpTransport::new(&self.config.api)?;
        self.build_with_transport(transport)
    }

    /// Builds a client sending its requests through `transport`.
    pub fn build_with_transport<T: Transport>(self, transport: T) -> Result<ApiClient, ClientError> {
        let Self {
            config,
            token_store,
            auth_endpoint,
            observer,
        } = self;

        let token_store: Arc<dyn TokenStore> = match (token_store, &config.session_file) {
            (Some(store), _) => store,
            (None, Some(path)) => {
                tracing::debug!(path = %path.display(), "Using session file");
                Arc::new(FileTokenStore::open(path).map_err(ClientError::from_std_error)?)
            }
            (None, None) => Arc::new(MemoryTokenStore::new()),
        };
        let auth_endpoint: Arc<dyn AuthEndpoint> = match auth_endpoint {
            Some(endpoint) => endpoint,
            None => Arc::new(HttpAuthEndpoint::new(transport.clone(), &config.auth)),
        };
        let observer: Arc<dyn SessionObserver> = match observer {
            Some(observer) => observer,
            None => Arc::new(LogSessionObserver),
        };

        let cache = TtlCache::from_config(&config.cache);
        let coalescer = RequestCoalescer::new(config.cache.request_timeout);
        let observer = Arc::new(ClearOnExpiry {
            observer,
            cache: cache.clone(),
            coalescer: coalescer.clone(),
        });
        let tokens = TokenManager::new(
            auth_endpoint,
            token_store,
            observer,
            &config.auth,
            config.cache.request_timeout,
        );

        let service = ServiceBuilder::new()
            .layer(MetricsLayer)
            .layer(CacheLayer::new(cache.clone(), coalescer.clone()))
            .layer(AuthLayer::new(tokens.clone()))
            .service(transport);

        Ok(ApiClient {
            service: Mutex::new(BoxCloneService::new(service)),
            cache,
            coalescer,
            tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use futures::future::join_all;
    use serde_json::{json, Value};

    use super::*;
    use crate::test::{MockAuthEndpoint, MockTransport, RecordingObserver};

    fn client(transport: &MockTransport, endpoint: &MockAuthEndpoint) -> ApiClient {
        client_with_observer(transport, endpoint, Arc::new(RecordingObserver::default()))
    }

    fn client_with_observer(
        transport: &MockTransport,
        endpoint: &MockAuthEndpoint,
        observer: Arc<RecordingObserver>,
    ) -> ApiClient {
        ApiClient::builder(Config::default())
            .auth_endpoint(Arc::new(endpoint.clone()))
            .session_observer(observer)
            .build_with_transport(transport.clone())
            .unwrap()
    }

    async fn logged_in(transport: &MockTransport, endpoint: &MockAuthEndpoint) -> ApiClient {
        let client = client(transport, endpoint);
        client
            .login(&Credentials::new("admin@example.com", "hunter2"))
            .await
            .unwrap();
        client
    }

    #[tokio::test]
    async fn test_requires_login() {
        let transport = MockTransport::default();
        let endpoint = MockAuthEndpoint::default();
        let client = client(&transport, &endpoint);

        assert_eq!(
            client.get("categories").await,
            Err(ClientError::NotAuthenticated)
        );
        assert!(transport.hits().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_reads_share_validation_and_request() {
        let transport = MockTransport::default().with_delay(Duration::from_millis(20));
        let endpoint = MockAuthEndpoint::default().with_delay(Duration::from_millis(20));
        let client = logged_in(&transport, &endpoint).await;

        let request = ApiRequest::get("categories").param("status", "active");
        let responses = join_all((0..3).map(|_| client.json::<Value>(request.clone()))).await;

        for response in responses {
            assert_eq!(response.unwrap()["call"], 1);
        }
        assert_eq!(transport.hits_for("categories"), 1);
        assert_eq!(endpoint.validations(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_token_gate() {
        let transport = MockTransport::default();
        let endpoint = MockAuthEndpoint::default();
        let client = logged_in(&transport, &endpoint).await;

        client.get("coupons").await.unwrap();
        client.get("coupons").await.unwrap();

        assert_eq!(transport.hits_for("coupons"), 1);
        assert_eq!(endpoint.validations(), 1);
    }

    #[tokio::test]
    async fn test_logout_clears_cache() {
        let transport = MockTransport::default();
        let endpoint = MockAuthEndpoint::default();
        let client = logged_in(&transport, &endpoint).await;

        client.get("orders").await.unwrap();
        let key = ApiRequest::get("orders").key();
        assert!(client.cache().get(&key).await.is_some());

        client.logout();
        assert!(client.cache().get(&key).await.is_none());
        assert_eq!(client.get("orders").await, Err(ClientError::NotAuthenticated));
        assert!(!client.tokens().is_authenticated());
    }

    #[tokio::test]
    async fn test_ended_session_drops_cached_reads() {
        let transport = MockTransport::default();
        let endpoint = MockAuthEndpoint::default();
        let observer = Arc::new(RecordingObserver::default());
        let client = client_with_observer(&transport, &endpoint, observer.clone());
        client
            .login(&Credentials::new("admin@example.com", "hunter2"))
            .await
            .unwrap();

        client.get("orders").await.unwrap();
        endpoint.set_refresh_ok(false);
        assert_eq!(
            client.tokens().refresh_token().await,
            Err(ClientError::AuthenticationExpired)
        );
        assert_eq!(observer.redirects.load(Ordering::SeqCst), 1);

        let key = ApiRequest::get("orders").key();
        assert!(client.cache().get(&key).await.is_none());
        assert_eq!(
            client.get("orders").await,
            Err(ClientError::AuthenticationExpired)
        );
        assert_eq!(transport.hits_for("orders"), 1);
    }

    #[tokio::test]
    async fn test_handle_expiration_drops_cached_reads() {
        let transport = MockTransport::default();
        let endpoint = MockAuthEndpoint::default();
        let client = logged_in(&transport, &endpoint).await;

        client.get("coupons").await.unwrap();
        client.tokens().handle_expiration();

        assert_eq!(
            client.get("coupons").await,
            Err(ClientError::AuthenticationExpired)
        );
        assert_eq!(transport.hits_for("coupons"), 1);
    }

    #[tokio::test]
    async fn test_mutation_round_trip() {
        let transport = MockTransport::default();
        let endpoint = MockAuthEndpoint::default();
        let client = logged_in(&transport, &endpoint).await;

        client.get("products/7").await.unwrap();
        let response = client
            .patch("products/7", json!({"price": 1999}))
            .await
            .unwrap();
        assert_eq!(response.json::<Value>().unwrap()["method"], "PATCH");
        client.get("products/7").await.unwrap();

        assert_eq!(transport.hits_for("products/7"), 3);
    }
}
