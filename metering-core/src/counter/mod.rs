pub mod memory;
pub mod redis;

pub use memory::InMemoryCounterStore;
pub use redis::RedisCounterStore;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::timeout;
use tracing::warn;

use crate::error::Error;
use crate::window::{counter_key, WindowKind};

/// Keyed atomic counter store backing the fast path.
///
/// Implementations must make `increment` a single atomic primitive: two
/// concurrent increments for the same key both land in the final count, and
/// racing to create the key never produces two records.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomic increment-or-create. A newly created record expires at
    /// `expire_at`; an existing record keeps its expiry.
    async fn increment(&self, key: &str, expire_at: DateTime<Utc>) -> Result<i64, Error>;

    async fn get(&self, key: &str) -> Result<Option<i64>, Error>;

    /// Overwrite the counter value, used by reconciliation only.
    async fn set(&self, key: &str, value: i64, expire_at: DateTime<Utc>) -> Result<(), Error>;

    async fn remove(&self, key: &str) -> Result<(), Error>;
}

/// Result of a fast-path increment.
///
/// Store failures surface as `Unavailable`, never as an error: every caller
/// must choose an explicit fallback (durable read or fail-open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterOutcome {
    Counted {
        count: i64,
        ttl_remaining: Duration,
    },
    Unavailable,
}

#[derive(Debug, Default)]
pub struct CounterMetrics {
    pub increments: AtomicU64,
    pub unavailable: AtomicU64,
    pub timeouts: AtomicU64,
}

impl CounterMetrics {
    pub fn record_increment(&self) {
        self.increments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unavailable(&self) {
        self.unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Windowed counter over a [`CounterStore`].
///
/// Computes the window key by truncating `now` to the window granularity and
/// bounds every store call with a short timeout; a slow fast store is an
/// unavailable fast store.
pub struct WindowCounter {
    store: Arc<dyn CounterStore>,
    op_timeout: Duration,
    metrics: Arc<CounterMetrics>,
}

impl WindowCounter {
    pub fn new(store: Arc<dyn CounterStore>, op_timeout: Duration) -> Self {
        WindowCounter {
            store,
            op_timeout,
            metrics: Arc::new(CounterMetrics::default()),
        }
    }

    pub fn metrics(&self) -> &Arc<CounterMetrics> {
        &self.metrics
    }

    /// Count one request against the window containing `now`.
    pub async fn increment(
        &self,
        identity: &str,
        kind: WindowKind,
        now: DateTime<Utc>,
    ) -> CounterOutcome {
        let window_start = kind.truncate(now);
        let key = counter_key(identity, kind, window_start);
        let expire_at = kind.end_of(window_start);

        match timeout(self.op_timeout, self.store.increment(&key, expire_at)).await {
            Ok(Ok(count)) => {
                self.metrics.record_increment();
                CounterOutcome::Counted {
                    count,
                    ttl_remaining: kind.ttl_from(now),
                }
            }
            Ok(Err(e)) => {
                self.metrics.record_unavailable();
                warn!(
                    identity = identity,
                    window = kind.as_str(),
                    error = %e,
                    "Counter store increment failed"
                );
                CounterOutcome::Unavailable
            }
            Err(_) => {
                self.metrics.record_timeout();
                warn!(
                    identity = identity,
                    window = kind.as_str(),
                    timeout_ms = self.op_timeout.as_millis() as u64,
                    "Counter store increment timed out"
                );
                CounterOutcome::Unavailable
            }
        }
    }

    /// Read the count for the window containing `now` without incrementing.
    /// Errors mean the fast store is unavailable; the caller decides the
    /// fallback.
    pub async fn current(
        &self,
        identity: &str,
        kind: WindowKind,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, Error> {
        let key = counter_key(identity, kind, kind.truncate(now));
        match timeout(self.op_timeout, self.store.get(&key)).await {
            Ok(result) => result,
            Err(_) => {
                self.metrics.record_timeout();
                Err(Error::new_without_logging(
                    crate::error::ErrorDetails::CounterStore {
                        message: format!(
                            "read timed out after {}ms",
                            self.op_timeout.as_millis()
                        ),
                    },
                ))
            }
        }
    }

    /// Force the fast count for a live window, taking the durable count as
    /// ground truth during reconciliation.
    pub async fn overwrite(
        &self,
        identity: &str,
        kind: WindowKind,
        window_start: DateTime<Utc>,
        count: i64,
    ) -> Result<(), Error> {
        let key = counter_key(identity, kind, window_start);
        timeout(
            self.op_timeout,
            self.store.set(&key, count, kind.end_of(window_start)),
        )
        .await
        .map_err(|_| {
            Error::new_without_logging(crate::error::ErrorDetails::CounterStore {
                message: "overwrite timed out".to_string(),
            })
        })?
    }

    /// Drop the counter for the window containing `now` (quota reset path).
    pub async fn clear(
        &self,
        identity: &str,
        kind: WindowKind,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let key = counter_key(identity, kind, kind.truncate(now));
        timeout(self.op_timeout, self.store.remove(&key))
            .await
            .map_err(|_| {
                Error::new_without_logging(crate::error::ErrorDetails::CounterStore {
                    message: "remove timed out".to_string(),
                })
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn counter() -> WindowCounter {
        WindowCounter::new(
            Arc::new(InMemoryCounterStore::new()),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_increment_counts_within_window() {
        let counter = counter();
        let now = Utc.with_ymd_and_hms(2025, 3, 15, 10, 42, 7).unwrap();

        for expected in 1..=3 {
            match counter.increment("user-1", WindowKind::Minute, now).await {
                CounterOutcome::Counted { count, ttl_remaining } => {
                    assert_eq!(count, expected);
                    assert!(ttl_remaining <= Duration::from_secs(60));
                }
                CounterOutcome::Unavailable => panic!("memory store never unavailable"),
            }
        }
    }

    #[tokio::test]
    async fn test_new_window_starts_fresh() {
        let counter = counter();
        let now = Utc.with_ymd_and_hms(2025, 3, 15, 10, 42, 7).unwrap();
        for kind in [WindowKind::Minute, WindowKind::Hour] {
            counter.increment("user-1", kind, now).await;
            counter.increment("user-1", kind, now).await;
        }

        let later = now + chrono::Duration::seconds(61);
        match counter.increment("user-1", WindowKind::Minute, later).await {
            CounterOutcome::Counted { count, .. } => assert_eq!(count, 1),
            CounterOutcome::Unavailable => panic!("memory store never unavailable"),
        }
        // The hour window spans both instants, so its count carries over.
        match counter.increment("user-1", WindowKind::Hour, later).await {
            CounterOutcome::Counted { count, .. } => assert_eq!(count, 3),
            CounterOutcome::Unavailable => panic!("memory store never unavailable"),
        }
    }

    #[tokio::test]
    async fn test_identities_are_isolated() {
        let counter = counter();
        let now = Utc.with_ymd_and_hms(2025, 3, 15, 10, 42, 7).unwrap();
        counter.increment("user-1", WindowKind::Minute, now).await;
        let outcome = counter.increment("user-2", WindowKind::Minute, now).await;
        assert!(matches!(outcome, CounterOutcome::Counted { count: 1, .. }));
    }

    #[tokio::test]
    async fn test_concurrent_increments_lose_nothing() {
        let counter = Arc::new(counter());
        let now = Utc.with_ymd_and_hms(2025, 3, 15, 10, 42, 7).unwrap();

        let mut handles = Vec::new();
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                counter.increment("user-1", WindowKind::Minute, now).await
            }));
        }
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                CounterOutcome::Counted { .. }
            ));
        }

        let count = counter
            .current("user-1", WindowKind::Minute, now)
            .await
            .unwrap();
        assert_eq!(count, Some(64));
    }
}
