//! Fire-and-forget access to the volatile tier
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{StoreError, Tier};
use crate::metrics;
use crate::store::{bounded, KeyValueStore};

/// Wraps a [`KeyValueStore`] so that no volatile failure reaches a caller.
/// Failed reads look like misses and failed writes are dropped; both are
/// logged and counted.
#[derive(Clone)]
pub struct AdvisoryTier {
    store: Arc<dyn KeyValueStore>,
    timeout: Duration,
}

impl AdvisoryTier {
    pub fn new(store: Arc<dyn KeyValueStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    fn absorb(op: &'static str, key: &str, err: &StoreError) {
        warn!("Volatile {} on {} failed, continuing without it: {}", op, key, err);
        metrics::inc_advisory_failure(op);
    }

    pub async fn read(&self, key: &str) -> Option<Vec<u8>> {
        match bounded(Tier::Volatile, "get", self.timeout, self.store.get(key)).await {
            Ok(value) => value,
            Err(e) => {
                Self::absorb("get", key, &e);
                None
            }
        }
    }

    /// Read and bincode-decode a value. Undecodable bytes are dropped from
    /// the tier and reported as a miss.
    pub async fn read_decoded<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.read(key).await?;
        match bincode::deserialize(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                Self::absorb("decode", key, &StoreError::corrupt(Tier::Volatile, e));
                self.delete(key).await;
                None
            }
        }
    }

    pub async fn read_list(&self, key: &str) -> Vec<Vec<u8>> {
        match bounded(Tier::Volatile, "get_list", self.timeout, self.store.get_list(key)).await {
            Ok(items) => items,
            Err(e) => {
                Self::absorb("get_list", key, &e);
                Vec::new()
            }
        }
    }

    /// Never fails; the outcome only shows up in the log.
    pub async fn write_advisory(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        if let Err(e) = bounded(
            Tier::Volatile,
            "set",
            self.timeout,
            self.store.set_with_expiry(key, value, ttl),
        )
        .await
        {
            Self::absorb("set", key, &e);
        }
    }

    pub async fn write_encoded<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match bincode::serialize(value) {
            Ok(bytes) => self.write_advisory(key, bytes, ttl).await,
            Err(e) => Self::absorb("encode", key, &StoreError::corrupt(Tier::Volatile, e)),
        }
    }

    /// Returns whether the tier accepted the item.
    pub async fn append(&self, key: &str, value: Vec<u8>, ttl: Duration) -> bool {
        match bounded(
            Tier::Volatile,
            "append",
            self.timeout,
            self.store.append_to_list(key, value, ttl),
        )
        .await
        {
            Ok(_) => true,
            Err(e) => {
                Self::absorb("append", key, &e);
                false
            }
        }
    }

    pub async fn increment(&self, key: &str, ttl: Duration) -> Option<i64> {
        match bounded(Tier::Volatile, "increment", self.timeout, self.store.increment(key, ttl)).await {
            Ok(n) => Some(n),
            Err(e) => {
                Self::absorb("increment", key, &e);
                None
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        match bounded(Tier::Volatile, "delete", self.timeout, self.store.delete(key)).await {
            Ok(existed) => existed,
            Err(e) => {
                Self::absorb("delete", key, &e);
                false
            }
        }
    }
}
