//! The layers every request passes through on its way to the [`Transport`].
//!
//! [`ApiClient`](crate::ApiClient) composes them from the outside in:
//!
//! 1. [`MetricsLayer`] times the request and counts its outcome, including cache hits.
//! 2. [`CacheLayer`] coalesces and caches reads, and invalidates cached reads after mutations.
//! 3. [`AuthLayer`] waits for a valid bearer token and attaches it.
//!
//! The cache sits outside of the token gate, so a cached read is served without validating the
//! session. The cache is cleared as soon as the gate reports that the session expired.
//!
//! [`Transport`]: crate::transport::Transport

mod auth;
mod cache;
mod metrics;

pub use auth::{AuthLayer, AuthService};
pub use cache::{CacheLayer, CacheService};
pub use metrics::{MetricsFuture, MetricsLayer, MetricsService};
