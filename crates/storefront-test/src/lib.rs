//! Helpers for testing the client against a real HTTP server.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. Session files written into a directory that was already
//!    dropped end up nowhere. Assign it to a variable in the test function (e.g.
//!    `let _session_dir = tempdir()`).
//!
//!  - When using [`MockApi`], make sure that it is held until all requests to it have been made.
//!    The server stops serving when it is dropped, and all later connections will be refused.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// The email accepted by the login endpoint of the [`MockApi`].
pub const ADMIN_EMAIL: &str = "admin@example.com";
/// The password accepted by the login endpoint of the [`MockApi`].
pub const ADMIN_PASSWORD: &str = "correct horse battery staple";

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `storefront_client` crate and
///    mutes all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("storefront_client=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`into_path`](TempDir::into_path) is called. Use it as a guard to automatically clean up after
/// tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Default)]
struct ApiState {
    hits: Mutex<BTreeMap<String, usize>>,
    latency: Mutex<Duration>,
    issued: AtomicUsize,
    access_tokens: Mutex<BTreeSet<String>>,
    refresh_tokens: Mutex<BTreeSet<String>>,
    categories: Mutex<BTreeMap<u64, Value>>,
    next_id: AtomicU64,
}

impl ApiState {
    fn issue_tokens(&self) -> Value {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let access_token = format!("access-{n}");
        let refresh_token = format!("refresh-{n}");
        self.access_tokens
            .lock()
            .unwrap()
            .insert(access_token.clone());
        self.refresh_tokens
            .lock()
            .unwrap()
            .insert(refresh_token.clone());

        json!({
            "access_token": access_token,
            "refresh_token": refresh_token,
            "expires_in": 3600,
        })
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), Response> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));

        match token {
            Some(token) if self.access_tokens.lock().unwrap().contains(token) => Ok(()),
            _ => Err((StatusCode::UNAUTHORIZED, "invalid or expired token").into_response()),
        }
    }
}

#[derive(Deserialize)]
struct LoginBody {
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct RefreshBody {
    refresh_token: String,
}

async fn count_hits(State(state): State<Arc<ApiState>>, request: Request, next: Next) -> Response {
    let key = format!("{} {}", request.method(), request.uri().path());
    *state.hits.lock().unwrap().entry(key).or_default() += 1;

    let latency = *state.latency.lock().unwrap();
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }

    next.run(request).await
}

async fn login(State(state): State<Arc<ApiState>>, Json(body): Json<LoginBody>) -> Response {
    if body.email != ADMIN_EMAIL || body.password != ADMIN_PASSWORD {
        return (StatusCode::UNAUTHORIZED, "invalid credentials").into_response();
    }
    Json(state.issue_tokens()).into_response()
}

async fn validate(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    match state.authorize(&headers) {
        Ok(()) => Json(json!({ "valid": true })).into_response(),
        Err(response) => response,
    }
}

async fn refresh(State(state): State<Arc<ApiState>>, Json(body): Json<RefreshBody>) -> Response {
    // refresh tokens are single use
    let known = state
        .refresh_tokens
        .lock()
        .unwrap()
        .remove(&body.refresh_token);
    if !known {
        return (StatusCode::UNAUTHORIZED, "invalid refresh token").into_response();
    }
    Json(state.issue_tokens()).into_response()
}

async fn list_categories(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(params): Query<BTreeMap<String, String>>,
) -> Response {
    if let Err(response) = state.authorize(&headers) {
        return response;
    }

    let categories = state.categories.lock().unwrap();
    let items: Vec<_> = categories
        .values()
        .filter(|category| match params.get("status") {
            Some(status) => category["status"] == status.as_str(),
            None => true,
        })
        .cloned()
        .collect();
    Json(items).into_response()
}

async fn create_category(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = state.authorize(&headers) {
        return response;
    }

    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
    let mut category = json!({ "id": id, "status": "active" });
    merge(&mut category, body);
    state
        .categories
        .lock()
        .unwrap()
        .insert(id, category.clone());
    (StatusCode::CREATED, Json(category)).into_response()
}

async fn show_category(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Response {
    if let Err(response) = state.authorize(&headers) {
        return response;
    }

    match state.categories.lock().unwrap().get(&id) {
        Some(category) => Json(category.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "no such category").into_response(),
    }
}

async fn update_category(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(body): Json<Value>,
) -> Response {
    if let Err(response) = state.authorize(&headers) {
        return response;
    }

    let mut categories = state.categories.lock().unwrap();
    match categories.get_mut(&id) {
        Some(category) => {
            merge(category, body);
            category["id"] = json!(id);
            Json(category.clone()).into_response()
        }
        None => (StatusCode::NOT_FOUND, "no such category").into_response(),
    }
}

async fn delete_category(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Response {
    if let Err(response) = state.authorize(&headers) {
        return response;
    }

    match state.categories.lock().unwrap().remove(&id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => (StatusCode::NOT_FOUND, "no such category").into_response(),
    }
}

async fn list_products(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    if let Err(response) = state.authorize(&headers) {
        return response;
    }
    Json(json!([
        { "id": 1, "name": "Trail Runner", "category_id": 1 },
        { "id": 2, "name": "Bucket Hat", "category_id": 2 },
    ]))
    .into_response()
}

fn merge(target: &mut Value, patch: Value) {
    if let (Some(target), Value::Object(patch)) = (target.as_object_mut(), patch) {
        target.extend(patch);
    }
}

/// An in-process rendition of the admin API.
///
/// Serves the authentication endpoints and a `categories` collection under `/api/`. Tokens are
/// issued as `access-N` and `refresh-N`, refresh tokens are single use. Every request is counted
/// by method and path, e.g. `GET /api/categories`.
///
/// The `categories` collection starts out with two entries: `1` (active) and `2` (hidden).
pub struct MockApi {
    server: Server,
    state: Arc<ApiState>,
}

impl MockApi {
    pub fn new() -> Self {
        let state = Arc::new(ApiState::default());
        {
            let mut categories = state.categories.lock().unwrap();
            categories.insert(1, json!({ "id": 1, "name": "Shoes", "status": "active" }));
            categories.insert(2, json!({ "id": 2, "name": "Hats", "status": "hidden" }));
        }
        state.next_id.store(3, Ordering::SeqCst);

        let router = Router::new()
            .route("/api/auth/login", post(login))
            .route("/api/auth/validate", get(validate))
            .route("/api/auth/refresh", post(refresh))
            .route(
                "/api/categories",
                get(list_categories).post(create_category),
            )
            .route(
                "/api/categories/:id",
                get(show_category)
                    .put(update_category)
                    .delete(delete_category),
            )
            .route("/api/products", get(list_products))
            .layer(middleware::from_fn_with_state(state.clone(), count_hits))
            .with_state(state.clone());

        let server = Server::with_router(router);

        Self { server, state }
    }

    /// The base URL of the API, to be used as `api.base_url` of the client.
    pub fn base_url(&self) -> String {
        self.server.url("api/").to_string()
    }

    /// Delays every response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock().unwrap() = latency;
    }

    /// The number of requests with the given method and path, e.g. `GET /api/categories`.
    pub fn hits(&self, route: &str) -> usize {
        self.state
            .hits
            .lock()
            .unwrap()
            .get(route)
            .copied()
            .unwrap_or_default()
    }

    /// The total number of requests received so far.
    pub fn accesses(&self) -> usize {
        self.state.hits.lock().unwrap().values().sum()
    }

    /// Rejects all access tokens issued so far, as if they expired.
    pub fn expire_access_tokens(&self) {
        self.state.access_tokens.lock().unwrap().clear();
    }

    /// Rejects all refresh tokens issued so far.
    pub fn revoke_refresh_tokens(&self) {
        self.state.refresh_tokens.lock().unwrap().clear();
    }

    /// The current state of a category, bypassing authentication.
    pub fn category(&self, id: u64) -> Option<Value> {
        self.state.categories.lock().unwrap().get(&id).cloned()
    }
}

impl Default for MockApi {
    fn default() -> Self {
        Self::new()
    }
}
