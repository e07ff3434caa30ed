//! # Response caching
//!
//! Reads against the admin API are mostly repeated listings and detail lookups, issued by many
//! independent callers within a short time. This module holds the in-memory layer that absorbs
//! these repeated reads.
//!
//! ## Request flow
//!
//! A read request goes through the following steps, see [`CacheLayer`](crate::middleware::CacheLayer):
//!
//! - First, it checks the [`RequestCoalescer`](crate::coalesce::RequestCoalescer). If an
//!   identical request is already in flight, the caller awaits that one instead.
//! - Otherwise it looks the [`RequestKey`] up in the [`TtlCache`]. A fresh entry is returned as is.
//! - On miss, the request is sent over the network, and a successful response is written to the
//!   cache for subsequent reads.
//!
//! Errors are never cached. A mutating request (`POST`, `PUT`, `PATCH`, `DELETE`) invalidates
//! all entries whose key starts with the resource prefix of the request, once it completes.
//!
//! ## [`RequestKey`]
//!
//! The [`RequestKey`] is the signature of a read: the normalized path followed by the
//! url-encoded query parameters in sorted order. Two reads with the same path and the same
//! parameters produce the same key regardless of the order the parameters were added in.
//! The key intentionally does not contain the bearer token. The cache is cleared on logout and
//! when the session expires.
//!
//! ## Expiration and capacity
//!
//! Every entry carries its write time. An entry is never served once `cache.ttl` has passed
//! since it was written. The cache is additionally bounded by `cache.capacity` entries, beyond
//! which moka evicts the least valuable entries.
//!
//! ### Metrics
//!
//! - `cache.hit`: Reads served from the cache.
//! - `cache.miss`: Reads that went to the network, including stale entries (tagged `stale`).
//! - `cache.invalidate`: Prefix invalidations triggered by mutations.

mod cache_key;
mod memory;

pub use cache_key::RequestKey;
pub use memory::TtlCache;
