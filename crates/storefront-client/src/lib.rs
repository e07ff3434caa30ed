//! Client-side request layer for the storefront admin API.
//!
//! Reads are served from an in-memory TTL cache and concurrent identical reads are coalesced
//! into a single network round trip. Mutations invalidate the cached reads of the resource they
//! touch. Every request that reaches the network is gated by the [`TokenManager`], which
//! validates and, if needed, refreshes the bearer token in a single-flight fashion.
//!
//! The entry point is [`ApiClient`], an explicit context object owning one instance of each of
//! these components. See the [`caching`] module docs for how the layers fit together.

#[macro_use]
pub mod metrics;

pub mod auth;
pub mod caching;
pub mod client;
pub mod coalesce;
pub mod config;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod resources;
pub mod transport;


pub use auth::{AccessToken, Credentials, TokenManager, TokenStatus};
pub use client::{ApiClient, ApiClientBuilder};
pub use error::ClientError;
pub use resources::{Resource, ResourceClient};
pub use transport::{ApiRequest, ApiResponse, Method};
