use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::RequestKey;
use crate::config::CacheConfig;

/// An item saved in the in-memory moka cache.
#[derive(Clone, Debug)]
struct CachedItem<V> {
    /// When this item was written.
    written_at: Instant,
    /// When to stop serving and evict this item.
    deadline: Instant,
    /// The actual data.
    value: V,
}

impl<V> CachedItem<V> {
    fn new(value: V, ttl: Duration) -> Self {
        let written_at = Instant::now();
        Self {
            written_at,
            deadline: written_at + ttl,
            value,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// A struct implementing [`moka::Expiry`] that uses the [`CachedItem`] deadline as the explicit
/// expiration time.
struct CacheExpiration;

/// Returns the duration between the `current_time` and `target_time` in the future.
/// In case the `target_time` is already elapsed (it is in the past relative to `current_time`), this
/// will return `Some(ZERO)`.
fn saturating_duration_since(current_time: Instant, target_time: Instant) -> Option<Duration> {
    Some(
        target_time
            .checked_duration_since(current_time)
            .unwrap_or_default(),
    )
}

impl<V> moka::Expiry<RequestKey, CachedItem<V>> for CacheExpiration {
    fn expire_after_create(
        &self,
        _key: &RequestKey,
        value: &CachedItem<V>,
        current_time: Instant,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }

    fn expire_after_update(
        &self,
        _key: &RequestKey,
        value: &CachedItem<V>,
        current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        saturating_duration_since(current_time, value.deadline)
    }
}

type InMemoryCache<V> = moka::future::Cache<RequestKey, CachedItem<V>>;

/// An in-memory cache of responses with a fixed time-to-live.
///
/// Cloning the cache is cheap and yields a handle to the same underlying storage.
pub struct TtlCache<V> {
    cache: InMemoryCache<V>,
    ttl: Duration,
    /// Bumped on every invalidation, see [`TtlCache::set_unless_invalidated`].
    epoch: Arc<AtomicU64>,
}

impl<V> Clone for TtlCache<V> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            ttl: self.ttl,
            epoch: Arc::clone(&self.epoch),
        }
    }
}

impl<V> fmt::Debug for TtlCache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.cache.entry_count())
            .finish()
    }
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        let cache = InMemoryCache::builder()
            .max_capacity(capacity)
            .name("responses")
            .expire_after(CacheExpiration)
            .build();

        Self {
            cache,
            ttl,
            epoch: Default::default(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttl, config.capacity)
    }

    /// The time-to-live applied by [`set`](Self::set).
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached value for `key` if it is present and has not expired.
    ///
    /// A stale entry is evicted as a side effect.
    pub async fn get(&self, key: &RequestKey) -> Option<V> {
        let Some(item) = self.cache.get(key).await else {
            metric!(counter("cache.miss") += 1, "stale" => "false");
            return None;
        };

        if item.is_expired(Instant::now()) {
            tracing::trace!(%key, age = ?item.written_at.elapsed(), "Evicting stale cache entry");
            metric!(counter("cache.miss") += 1, "stale" => "true");
            self.cache.invalidate(key).await;
            return None;
        }

        metric!(counter("cache.hit") += 1);
        Some(item.value)
    }

    /// Stores `value` under `key`, replacing any previous entry.
    pub async fn set(&self, key: RequestKey, value: V) {
        self.set_with_ttl(key, value, self.ttl).await
    }

    /// Stores `value` under `key` with a custom time-to-live.
    pub async fn set_with_ttl(&self, key: RequestKey, value: V, ttl: Duration) {
        self.cache.insert(key, CachedItem::new(value, ttl)).await;
    }

    /// The current invalidation epoch.
    ///
    /// Take this before starting a fetch and hand it to
    /// [`set_unless_invalidated`](Self::set_unless_invalidated) afterwards.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Stores `value` only if no invalidation happened since `epoch` was taken.
    ///
    /// A read that was in flight while a mutation invalidated its resource would otherwise write
    /// a response that predates the mutation. Returns whether the value was stored.
    pub async fn set_unless_invalidated(&self, key: RequestKey, value: V, epoch: u64) -> bool {
        if self.epoch() != epoch {
            tracing::trace!(%key, "Not caching response fetched before an invalidation");
            return false;
        }
        self.set(key, value).await;
        true
    }

    /// Removes the entry for `key`.
    pub async fn invalidate(&self, key: &RequestKey) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.cache.invalidate(key).await;
    }

    /// Removes all entries whose key starts with `prefix`.
    ///
    /// Once this returns, [`get`](Self::get) misses for all matching keys.
    pub async fn invalidate_prefix(&self, prefix: &str) {
        self.epoch.fetch_add(1, Ordering::AcqRel);

        let keys: Vec<_> = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key)
            .collect();

        metric!(counter("cache.invalidate") += 1);
        tracing::debug!(prefix, entries = keys.len(), "Invalidating cached responses");

        for key in keys {
            self.cache.invalidate(&*key).await;
        }
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.cache.invalidate_all();
    }

    /// The approximate number of entries.
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}
