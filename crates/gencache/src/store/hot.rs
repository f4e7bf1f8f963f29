//! In-process volatile tier on top of `moka`
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::sync::Cache;
use moka::Expiry;

use crate::error::{StoreError, StoreErrorKind, StoreResult, Tier};
use crate::store::KeyValueStore;

#[derive(Debug, Clone)]
enum HotValue {
    Blob(Vec<u8>),
    List(Vec<Vec<u8>>),
    Counter(i64),
}

impl HotValue {
    fn shape(&self) -> &'static str {
        match self {
            HotValue::Blob(_) => "blob",
            HotValue::List(_) => "list",
            HotValue::Counter(_) => "counter",
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    value: HotValue,
    ttl: Duration,
}

/// Each slot carries its own TTL; every write restarts it.
struct SlotExpiry;

impl Expiry<String, Slot> for SlotExpiry {
    fn expire_after_create(&self, _key: &String, slot: &Slot, _created_at: Instant) -> Option<Duration> {
        Some(slot.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        slot: &Slot,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(slot.ttl)
    }
}

fn wrong_type(key: &str, expected: &str, found: &str) -> StoreError {
    StoreError::new(
        Tier::Volatile,
        StoreErrorKind::WrongType,
        format!("key {} holds a {}, expected a {}", key, found, expected),
    )
}

/// Bounded in-memory [`KeyValueStore`]. Lists and counters are updated
/// through moka's per-key entry upsert, so each operation is atomic for its
/// key.
pub struct MokaKeyValueStore {
    cache: Cache<String, Slot>,
}

impl MokaKeyValueStore {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(SlotExpiry)
                .build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }
}

#[async_trait]
impl KeyValueStore for MokaKeyValueStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        match self.cache.get(key) {
            Some(Slot { value: HotValue::Blob(bytes), .. }) => Ok(Some(bytes)),
            Some(other) => Err(wrong_type(key, "blob", other.value.shape())),
            None => Ok(None),
        }
    }

    async fn set_with_expiry(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()> {
        self.cache.insert(key.to_string(), Slot { value: HotValue::Blob(value), ttl });
        Ok(())
    }

    async fn append_to_list(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<usize> {
        let mut found_shape: Option<&'static str> = None;
        let entry = self.cache.entry(key.to_string()).and_upsert_with(|existing| {
            match existing.map(|e| e.into_value()) {
                Some(Slot { value: HotValue::List(mut items), .. }) => {
                    items.push(value);
                    Slot { value: HotValue::List(items), ttl }
                }
                Some(other) => {
                    found_shape = Some(other.value.shape());
                    other
                }
                None => Slot { value: HotValue::List(vec![value]), ttl },
            }
        });

        if let Some(shape) = found_shape {
            return Err(wrong_type(key, "list", shape));
        }
        match entry.value().value {
            HotValue::List(ref items) => Ok(items.len()),
            ref other => Err(wrong_type(key, "list", other.shape())),
        }
    }

    async fn get_list(&self, key: &str) -> StoreResult<Vec<Vec<u8>>> {
        match self.cache.get(key) {
            Some(Slot { value: HotValue::List(items), .. }) => Ok(items),
            Some(other) => Err(wrong_type(key, "list", other.value.shape())),
            None => Ok(Vec::new()),
        }
    }

    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut found_shape: Option<&'static str> = None;
        let entry = self.cache.entry(key.to_string()).and_upsert_with(|existing| {
            match existing.map(|e| e.into_value()) {
                Some(Slot { value: HotValue::Counter(n), .. }) => Slot { value: HotValue::Counter(n + 1), ttl },
                Some(other) => {
                    found_shape = Some(other.value.shape());
                    other
                }
                None => Slot { value: HotValue::Counter(1), ttl },
            }
        });

        if let Some(shape) = found_shape {
            return Err(wrong_type(key, "counter", shape));
        }
        match entry.value().value {
            HotValue::Counter(n) => Ok(n),
            ref other => Err(wrong_type(key, "counter", other.shape())),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.cache.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn blobs_round_trip_and_delete() {
        let store = MokaKeyValueStore::new(100);
        store.set_with_expiry("k", b"v".to_vec(), TTL).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lists_keep_insertion_order() {
        let store = MokaKeyValueStore::new(100);
        assert_eq!(store.append_to_list("l", b"a".to_vec(), TTL).await.unwrap(), 1);
        assert_eq!(store.append_to_list("l", b"b".to_vec(), TTL).await.unwrap(), 2);
        assert_eq!(store.get_list("l").await.unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(store.get_list("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn counters_start_at_one() {
        let store = MokaKeyValueStore::new(100);
        assert_eq!(store.increment("c", TTL).await.unwrap(), 1);
        assert_eq!(store.increment("c", TTL).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn shape_mismatch_is_reported() {
        let store = MokaKeyValueStore::new(100);
        store.set_with_expiry("k", b"v".to_vec(), TTL).await.unwrap();
        let err = store.increment("k", TTL).await.unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::WrongType);
        // The blob survives the failed increment.
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert!(store.get_list("k").await.is_err());
    }

    #[tokio::test]
    async fn entries_expire_after_their_ttl() {
        let store = MokaKeyValueStore::new(100);
        store
            .set_with_expiry("short", b"v".to_vec(), Duration::from_millis(50))
            .await
            .unwrap();
        store.set_with_expiry("long", b"v".to_vec(), TTL).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
        assert!(store.get("long").await.unwrap().is_some());
    }
}
