//! Single-flight execution of identical concurrent operations.
//!
//! The [`RequestCoalescer`] keeps one pending operation per [`RequestKey`]. Callers arriving
//! while an operation for their key is in flight await that operation instead of starting their
//! own, and all of them observe the same result or the same error.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::caching::RequestKey;
use crate::error::ClientError;

type SharedOperation<V> = Shared<BoxFuture<'static, Result<V, ClientError>>>;

/// An operation currently in flight.
struct PendingRequest<V> {
    /// Distinguishes this operation from a later one registered under the same key.
    id: u64,
    operation: SharedOperation<V>,
}

type PendingMap<V> = HashMap<RequestKey, PendingRequest<V>>;

/// Removes a settled operation from the pending map, unless a newer one took its place.
struct Unregister<V> {
    pending: Arc<Mutex<PendingMap<V>>>,
    key: RequestKey,
    id: u64,
}

impl<V> Drop for Unregister<V> {
    fn drop(&mut self) {
        let removed = {
            let mut pending = lock(&self.pending);
            match pending.get(&self.key) {
                Some(request) if request.id == self.id => pending.remove(&self.key),
                _ => None,
            }
        };
        // dropped outside of the lock, it might be the last handle to the operation
        drop(removed);
    }
}

/// Deduplicates concurrent operations with an identical key.
///
/// Cloning the coalescer is cheap and yields a handle to the same set of pending operations.
pub struct RequestCoalescer<V> {
    pending: Arc<Mutex<PendingMap<V>>>,
    next_id: Arc<AtomicU64>,
    timeout: Option<Duration>,
}

impl<V> Clone for RequestCoalescer<V> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
            next_id: Arc::clone(&self.next_id),
            timeout: self.timeout,
        }
    }
}

impl<V> fmt::Debug for RequestCoalescer<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestCoalescer")
            .field("pending", &lock(&self.pending).len())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<V> Default for RequestCoalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(None)
    }
}

fn lock<V>(pending: &Mutex<PendingMap<V>>) -> MutexGuard<'_, PendingMap<V>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<V> RequestCoalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a coalescer.
    ///
    /// With a `timeout`, an operation that does not settle in time resolves to
    /// [`ClientError::Timeout`] for all of its callers.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            pending: Default::default(),
            next_id: Default::default(),
            timeout,
        }
    }

    /// Runs the operation produced by `factory`, unless one is already in flight for `key`.
    ///
    /// `factory` is only invoked when no operation is pending for `key`. The operation is
    /// unregistered as soon as it settles, successfully or not, so a later call starts afresh.
    ///
    /// If every caller goes away before the operation settles, it stays registered and the next
    /// caller for `key` resumes it.
    pub async fn dedupe<F, Fut>(&self, key: &RequestKey, factory: F) -> Result<V, ClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ClientError>> + Send + 'static,
    {
        let operation = {
            let mut pending = lock(&self.pending);
            match pending.get(key) {
                Some(request) => {
                    metric!(counter("coalesce.joined") += 1);
                    tracing::trace!(%key, "Joining in-flight request");
                    request.operation.clone()
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let operation = self.start(key.clone(), id, factory());
                    pending.insert(
                        key.clone(),
                        PendingRequest {
                            id,
                            operation: operation.clone(),
                        },
                    );
                    operation
                }
            }
        };

        operation.await
    }

    fn start<Fut>(&self, key: RequestKey, id: u64, operation: Fut) -> SharedOperation<V>
    where
        Fut: Future<Output = Result<V, ClientError>> + Send + 'static,
    {
        let done_token = Unregister {
            pending: Arc::clone(&self.pending),
            key,
            id,
        };

        let timeout = self.timeout;
        async move {
            let _done_token = done_token; // move into the future

            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, operation)
                    .await
                    .unwrap_or(Err(ClientError::Timeout(timeout))),
                None => operation.await,
            }
        }
        .boxed()
        .shared()
    }

    /// Whether an operation for `key` is currently in flight.
    pub fn is_pending(&self, key: &RequestKey) -> bool {
        lock(&self.pending).contains_key(key)
    }

    /// The number of operations currently in flight.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Forgets the pending operations whose key starts with `prefix`.
    ///
    /// Callers already awaiting one of them still receive its result, but new callers will start
    /// a fresh one.
    pub fn forget_prefix(&self, prefix: &str) {
        let forgotten: Vec<_> = {
            let mut pending = lock(&self.pending);
            let keys: Vec<_> = pending
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect();
            keys.iter().filter_map(|key| pending.remove(key)).collect()
        };
        if !forgotten.is_empty() {
            tracing::trace!(prefix, operations = forgotten.len(), "Forgetting in-flight requests");
        }
    }

    /// Forgets all pending operations.
    ///
    /// Callers already awaiting an operation still receive its result, but new callers will
    /// start a fresh one.
    pub fn clear(&self) {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        drop(drained);
    }
}
