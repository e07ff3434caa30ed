use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower_layer::Layer;
use tower_service::Service as TowerService;

use crate::error::ClientError;
use crate::transport::{ApiRequest, ApiResponse, Method};

/// Records the duration and outcome of every request.
#[derive(Clone, Debug, Default)]
pub struct MetricsLayer;

#[derive(Clone, Debug)]
pub struct MetricsService<S> {
    service: S,
}

pub struct MetricsFuture<F> {
    start: Instant,
    method: Method,
    future: F,
}

impl<F> Future for MetricsFuture<F>
where
    F: Future<Output = Result<ApiResponse, ClientError>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let start = self.start;
        let method = self.method;
        // https://doc.rust-lang.org/std/pin/index.html#pinning-is-structural-for-field
        let future = unsafe { self.map_unchecked_mut(|s| &mut s.future) };
        let poll = future.poll(cx);
        if let Poll::Ready(ref res) = poll {
            metric!(
                timer("requests.duration") = start.elapsed(),
                "method" => method.as_str(),
            );
            match res {
                Ok(response) => metric!(
                    counter("responses.status_code") += 1,
                    "status" => &response.status.to_string(),
                ),
                Err(ClientError::Status { status, .. }) => metric!(
                    counter("responses.status_code") += 1,
                    "status" => &status.to_string(),
                ),
                Err(err) => metric!(
                    counter("responses.error") += 1,
                    "error" => err.metrics_tag(),
                ),
            }
        }
        poll
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        Self::Service { service }
    }
}

impl<S> TowerService<ApiRequest> for MetricsService<S>
where
    S: TowerService<ApiRequest, Response = ApiResponse, Error = ClientError>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = MetricsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: ApiRequest) -> Self::Future {
        Self::Future {
            start: Instant::now(),
            method: request.method,
            future: self.service.call(request),
        }
    }
}
