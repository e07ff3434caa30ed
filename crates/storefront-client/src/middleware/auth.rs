use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

use crate::auth::TokenManager;
use crate::error::ClientError;
use crate::transport::{ApiRequest, ApiResponse};

/// Attaches a valid bearer token to every request that is not [`anonymous`].
///
/// A request is only sent once the [`TokenManager`] produced a token, so a session that cannot be
/// recovered fails requests without any network round trip.
///
/// [`anonymous`]: ApiRequest::anonymous
#[derive(Clone, Debug)]
pub struct AuthLayer {
    tokens: TokenManager,
}

impl AuthLayer {
    pub fn new(tokens: TokenManager) -> Self {
        Self { tokens }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            tokens: self.tokens.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuthService<S> {
    inner: S,
    tokens: TokenManager,
}

impl<S> Service<ApiRequest> for AuthService<S>
where
    S: Service<ApiRequest, Response = ApiResponse, Error = ClientError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = ApiResponse;
    type Error = ClientError;
    type Future = BoxFuture<'static, Result<ApiResponse, ClientError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // readiness of the inner service is driven by `oneshot` once a token is available
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ApiRequest) -> Self::Future {
        let inner = self.inner.clone();
        if !request.is_authenticated() {
            return inner.oneshot(request).boxed();
        }

        let tokens = self.tokens.clone();
        async move {
            let token = tokens.get_valid_token().await?;
            inner.oneshot(request.bearer_auth(token.as_str())).await
        }
        .boxed()
    }
}
