use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

use crate::caching::TtlCache;
use crate::coalesce::RequestCoalescer;
use crate::error::ClientError;
use crate::transport::{ApiRequest, ApiResponse};

/// Serves reads from the [`TtlCache`] and invalidates cached reads on mutations.
///
/// See the [`caching`](crate::caching) module docs for the flow of a request.
#[derive(Clone, Debug)]
pub struct CacheLayer {
    cache: TtlCache<ApiResponse>,
    coalescer: RequestCoalescer<ApiResponse>,
}

impl CacheLayer {
    pub fn new(cache: TtlCache<ApiResponse>, coalescer: RequestCoalescer<ApiResponse>) -> Self {
        Self { cache, coalescer }
    }
}

impl<S> Layer<S> for CacheLayer {
    type Service = CacheService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CacheService {
            inner,
            cache: self.cache.clone(),
            coalescer: self.coalescer.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheService<S> {
    inner: S,
    cache: TtlCache<ApiResponse>,
    coalescer: RequestCoalescer<ApiResponse>,
}

impl<S> CacheService<S>
where
    S: Service<ApiRequest, Response = ApiResponse, Error = ClientError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    /// Coalesces identical reads and serves them from the cache when possible.
    async fn read(self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        let Self {
            inner,
            cache,
            coalescer,
        } = self;
        let key = request.key();

        let fetch_key = key.clone();
        let fetch = move || async move {
            if let Some(response) = cache.get(&fetch_key).await {
                return Ok(response);
            }

            let epoch = cache.epoch();
            let result = inner.oneshot(request).await;
            match &result {
                Ok(response) => {
                    cache
                        .set_unless_invalidated(fetch_key, response.clone(), epoch)
                        .await;
                }
                Err(ClientError::AuthenticationExpired) => cache.clear(),
                Err(_) => {}
            }
            result
        };

        coalescer.dedupe(&key, fetch).await
    }

    /// Sends a mutation and drops all cached reads of the affected resource.
    async fn write(self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        let prefix = request.resource_prefix().to_owned();
        let result = self.inner.oneshot(request).await;

        if matches!(result, Err(ClientError::AuthenticationExpired)) {
            self.cache.clear();
            self.coalescer.clear();
        } else {
            // a mutation that failed in flight may still have been applied
            self.cache.invalidate_prefix(&prefix).await;
            // reads sent before the mutation must not be joined by reads sent after it
            self.coalescer.forget_prefix(&prefix);
        }
        result
    }

    /// Sends a request past the cache.
    async fn bypass(self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        let result = self.inner.oneshot(request).await;
        if matches!(result, Err(ClientError::AuthenticationExpired)) {
            self.cache.clear();
        }
        result
    }
}

impl<S> Service<ApiRequest> for CacheService<S>
where
    S: Service<ApiRequest, Response = ApiResponse, Error = ClientError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ApiResponse;
    type Error = ClientError;
    type Future = BoxFuture<'static, Result<ApiResponse, ClientError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // cache hits never touch the inner service, which is driven by `oneshot` on a miss
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ApiRequest) -> Self::Future {
        let service = self.clone();
        if request.is_cacheable() {
            service.read(request).boxed()
        } else if request.method.is_mutating() {
            service.write(request).boxed()
        } else {
            service.bypass(request).boxed()
        }
    }
}
