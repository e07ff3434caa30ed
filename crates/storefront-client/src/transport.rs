//! Requests, responses and the HTTP transport that carries them.
//!
//! The middleware chain is transport-agnostic: anything implementing [`Transport`] can sit at
//! its bottom. [`HttpTransport`] is the implementation talking to the admin API over `reqwest`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::header;
use serde::de::DeserializeOwned;
use tower_service::Service;
use url::Url;

use crate::caching::RequestKey;
use crate::config::ApiConfig;
use crate::error::ClientError;

/// The user agent sent with every request.
pub static USER_AGENT: &str = concat!("storefront-client/", env!("CARGO_PKG_VERSION"));

/// The future returned by every [`Transport`].
pub type TransportFuture = BoxFuture<'static, Result<ApiResponse, ClientError>>;

/// A service sending [`ApiRequest`]s to the admin API.
///
/// This is implemented for every cloneable [`Service`] with the right request, response and
/// future types, so a `tower::service_fn` closure works as transport as well.
pub trait Transport:
    Service<ApiRequest, Response = ApiResponse, Error = ClientError, Future = TransportFuture>
    + Clone
    + Send
    + Sync
    + 'static
{
}

impl<T> Transport for T where
    T: Service<ApiRequest, Response = ApiResponse, Error = ClientError, Future = TransportFuture>
        + Clone
        + Send
        + Sync
        + 'static
{
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Whether requests with this method change server state.
    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::Get)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_uppercase().as_str() {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "PATCH" => Self::Patch,
            "DELETE" => Self::Delete,
            _ => {
                return Err(ClientError::InvalidRequest(format!(
                    "unsupported method `{s}`"
                )))
            }
        })
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// The payload of a mutating request.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestBody {
    Json(serde_json::Value),
    /// Url-encoded form fields.
    Form(BTreeMap<String, String>),
}

/// A request against the admin API.
///
/// Paths are relative to the configured base URL.
#[derive(Clone, Debug, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<RequestBody>,
    cache: bool,
    authenticated: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
            cache: true,
            authenticated: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::Patch, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Adds a query parameter, replacing a previous one with the same name.
    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    pub fn params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn form<I, K, V>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields = fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.body = Some(RequestBody::Form(fields));
        self
    }

    /// Bypasses the response cache and the request coalescer for this read.
    pub fn no_cache(mut self) -> Self {
        self.cache = false;
        self
    }

    /// Sends this request without a bearer token.
    pub fn anonymous(mut self) -> Self {
        self.authenticated = false;
        self
    }

    /// Sets the `Authorization` header to the given bearer token.
    pub fn bearer_auth(mut self, token: &str) -> Self {
        self.headers.insert(
            header::AUTHORIZATION.as_str().to_owned(),
            format!("Bearer {token}"),
        );
        self
    }

    /// Whether the response to this request may be cached and coalesced.
    pub fn is_cacheable(&self) -> bool {
        self.cache && !self.method.is_mutating()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// The cache and coalescing key of this request.
    pub fn key(&self) -> RequestKey {
        RequestKey::new(&self.path, &self.params)
    }

    /// The resource a request operates on, which is the first segment of its path.
    ///
    /// `categories/5` and `categories?status=active` both belong to `categories`.
    pub fn resource_prefix(&self) -> &str {
        let path = self.path.trim_start_matches('/');
        let path = path.split('?').next().unwrap_or_default();
        path.split('/').next().unwrap_or_default()
    }
}

/// A successful response of the admin API.
///
/// Cloning is cheap, the body is reference counted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Builds a `200 OK` response with the given JSON body.
    pub fn from_json(value: &serde_json::Value) -> Self {
        Self::new(200, value.to_string())
    }

    /// Decodes the body as JSON.
    ///
    /// An empty body decodes as `null`, which is what `204 No Content` responses of deletions
    /// carry.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        if self.body.is_empty() {
            return Ok(serde_json::from_value(serde_json::Value::Null)?);
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Resolves relative paths against a base URL.
///
/// The base URL is treated as a directory, so `http://host/api` and `http://host/api/` behave
/// the same.
pub fn parse_base_url(base_url: &str) -> Result<Url, ClientError> {
    let mut url = Url::parse(base_url)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// The [`Transport`] sending requests over HTTP.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: Arc<Url>,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &ApiConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(ClientError::from_std_error)?;

        Ok(Self::with_client(
            client,
            parse_base_url(&config.base_url)?,
            config.request_timeout,
        ))
    }

    pub fn with_client(client: reqwest::Client, base_url: Url, request_timeout: Duration) -> Self {
        Self {
            client,
            base_url: Arc::new(base_url),
            request_timeout,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The full URL of `request`, including its query parameters.
    pub fn url(&self, request: &ApiRequest) -> Result<Url, ClientError> {
        let mut url = self.base_url.join(request.path.trim_start_matches('/'))?;
        if !request.params.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.params);
        }
        Ok(url)
    }

    fn map_error(&self, err: reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout(self.request_timeout)
        } else {
            ClientError::Network(err.to_string())
        }
    }

    async fn execute(self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        let url = self.url(&request)?;
        tracing::trace!(method = %request.method, %url, "Sending request");

        let mut builder = self
            .client
            .request(request.method.into(), url)
            .header(header::ACCEPT, "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = match &request.body {
            Some(RequestBody::Json(body)) => builder.json(body),
            Some(RequestBody::Form(fields)) => builder.form(fields),
            None => builder,
        };

        let response = builder.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;

        if status.is_success() {
            Ok(ApiResponse::new(status.as_u16(), body))
        } else {
            tracing::debug!(method = %request.method, path = %request.path, %status, "Request failed");
            Err(ClientError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            })
        }
    }
}

impl Service<ApiRequest> for HttpTransport {
    type Response = ApiResponse;
    type Error = ClientError;
    type Future = TransportFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ApiRequest) -> Self::Future {
        self.clone().execute(request).boxed()
    }
}
