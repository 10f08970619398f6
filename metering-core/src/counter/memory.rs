use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::counter::CounterStore;
use crate::error::Error;

#[derive(Debug, Clone, Copy)]
struct Slot {
    count: i64,
    expires_at: DateTime<Utc>,
}

/// In-process counter store over a sharded map.
///
/// Serves embedded single-node deployments and tests. The dashmap entry API
/// makes increment-or-create atomic: the shard lock is held across the read
/// and the write. Expired slots are not reaped on access (callers key
/// windows by start time, so a new window is always a new key); `prune`
/// exists for periodic housekeeping.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    slots: DashMap<String, Slot>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every slot whose expiry has passed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.expires_at > now);
        before - self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, expire_at: DateTime<Utc>) -> Result<i64, Error> {
        let mut slot = self
            .slots
            .entry(key.to_string())
            .or_insert(Slot {
                count: 0,
                expires_at: expire_at,
            });
        slot.count += 1;
        Ok(slot.count)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>, Error> {
        Ok(self.slots.get(key).map(|slot| slot.count))
    }

    async fn set(&self, key: &str, value: i64, expire_at: DateTime<Utc>) -> Result<(), Error> {
        self.slots.insert(
            key.to_string(),
            Slot {
                count: value,
                expires_at: expire_at,
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        self.slots.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn test_increment_or_create() {
        let store = InMemoryCounterStore::new();
        let expire = Utc.with_ymd_and_hms(2025, 3, 15, 10, 43, 0).unwrap();

        assert_eq!(store.increment("k", expire).await.unwrap(), 1);
        assert_eq!(store.increment("k", expire).await.unwrap(), 2);
        assert_eq!(store.get("k").await.unwrap(), Some(2));
        assert_eq!(store.get("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_and_remove() {
        let store = InMemoryCounterStore::new();
        let expire = Utc.with_ymd_and_hms(2025, 3, 15, 10, 43, 0).unwrap();

        store.set("k", 41, expire).await.unwrap();
        assert_eq!(store.increment("k", expire).await.unwrap(), 42);

        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_prune_drops_expired_slots() {
        let store = InMemoryCounterStore::new();
        let expire = Utc.with_ymd_and_hms(2025, 3, 15, 10, 43, 0).unwrap();
        store.increment("old", expire).await.unwrap();
        store
            .increment("live", expire + chrono::Duration::hours(1))
            .await
            .unwrap();

        let dropped = store.prune(expire + chrono::Duration::seconds(1));
        assert_eq!(dropped, 1);
        assert_eq!(store.get("live").await.unwrap(), Some(1));
    }
}
