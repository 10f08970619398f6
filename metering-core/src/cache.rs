use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use crate::error::Error;

/// Thin wrapper over a moka cache exposing an explicit
/// `get_or_compute(key, fn)` call site.
///
/// Fail-open behavior is visible at the caller: a compute failure is
/// returned with its original details intact, never swallowed, and
/// nothing is cached for the key.
pub struct Cache<K, V> {
    inner: moka::future::Cache<K, V>,
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let inner = moka::future::Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();
        Cache { inner }
    }

    /// Return the cached value for `key`, computing and caching it on a miss.
    /// Concurrent callers for the same key share one computation.
    pub async fn get_or_compute<F>(&self, key: K, compute: F) -> Result<V, Error>
    where
        F: Future<Output = Result<V, Error>>,
    {
        // moka shares the compute error behind an Arc; rebuild the error so
        // its variant and status code survive the trip through the cache.
        self.inner
            .try_get_with(key, compute)
            .await
            .map_err(|e| Error::new_without_logging(e.get_details().clone()))
    }

    pub async fn get(&self, key: &K) -> Option<V> {
        self.inner.get(key).await
    }

    pub async fn insert(&self, key: K, value: V) {
        self.inner.insert(key, value).await;
    }

    pub async fn invalidate(&self, key: &K) {
        self.inner.invalidate(key).await;
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}
