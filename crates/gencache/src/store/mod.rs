//! Store contracts for the volatile and durable tiers
//!
//! Both tiers are injected as trait objects. Every call returns an explicit
//! [`StoreResult`]; lookups carry `Option` inside it so that "absent" and
//! "failed" stay distinguishable.

pub mod hot;
pub mod keys;

pub use hot::MokaKeyValueStore;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::schema::*;
use crate::error::{StoreError, StoreResult, Tier};

/// Volatile key-value tier. Advisory: everything in it can be rebuilt from
/// the durable tier, so callers treat failures as misses.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn set_with_expiry(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()>;

    /// Push onto the tail of a list and reset its expiry. Returns the new length.
    async fn append_to_list(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<usize>;

    /// Whole list in insertion order; empty when the key is absent.
    async fn get_list(&self, key: &str) -> StoreResult<Vec<Vec<u8>>>;

    /// Add one to a counter, creating it at 1. Returns the new value.
    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<i64>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;
}

/// Durable relational tier, the source of truth. Multi-row writes are
/// single transactions.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn load_conversation(&self, id: &str, now: DateTime<Utc>) -> StoreResult<Option<ConversationSnapshot>>;

    async fn insert_conversation(&self, draft: ConversationDraft) -> StoreResult<ConversationSnapshot>;

    /// `Ok(None)` when the conversation is absent or expired.
    async fn append_messages(
        &self,
        id: &str,
        messages: Vec<NewMessage>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<Option<ConversationSnapshot>>;

    async fn session_conversations(&self, session_id: &str, now: DateTime<Utc>) -> StoreResult<Vec<String>>;

    async fn get_prompt(&self, request_hash: &str) -> StoreResult<Option<PromptCacheEntry>>;

    /// Count a hit on an existing entry; returns it after the increment.
    async fn touch_prompt(&self, request_hash: &str, now: DateTime<Utc>) -> StoreResult<Option<PromptCacheEntry>>;

    async fn upsert_prompt(&self, draft: PromptDraft) -> StoreResult<PromptUpsert>;

    async fn store_embeddings(
        &self,
        source_id: &str,
        model: &str,
        vectors: Vec<Vec<f32>>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<EmbeddingRecord>>;

    async fn embeddings_for(&self, source_id: &str) -> StoreResult<Vec<EmbeddingRecord>>;

    async fn record_metrics(&self, sample: MetricsSample) -> StoreResult<MetricsSnapshot>;

    async fn current_metrics(&self, now: DateTime<Utc>) -> StoreResult<Option<MetricsSnapshot>>;

    async fn append_ledger(&self, draft: LedgerDraft) -> StoreResult<MigrationLedgerEntry>;

    async fn transition_ledger(
        &self,
        id: i64,
        change: LedgerTransition,
        now: DateTime<Utc>,
    ) -> StoreResult<MigrationLedgerEntry>;

    async fn latest_ledger_entry(
        &self,
        migration_type: MigrationType,
        source: &str,
    ) -> StoreResult<Option<MigrationLedgerEntry>>;

    async fn list_ledger(&self, limit: usize) -> StoreResult<Vec<MigrationLedgerEntry>>;

    async fn count_guest_conversations(&self, guest_id: &str) -> StoreResult<i64>;

    /// Ownership transfer, hash backfill and guest import in one transaction.
    async fn reassign_guest(&self, request: ReassignRequest) -> StoreResult<ReassignOutcome>;

    async fn unsynced_conversations(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ConversationSnapshot>>;

    async fn unsynced_prompts(&self, cutoff: DateTime<Utc>, limit: usize) -> StoreResult<Vec<PromptCacheEntry>>;

    async fn mark_synced(&self, links: Vec<SyncedLink>, now: DateTime<Utc>) -> StoreResult<usize>;

    async fn content_link(&self, cache_type: CacheType, cache_id: &str) -> StoreResult<Option<CacheContentLink>>;

    async fn sweep(&self, policy: RetentionPolicy) -> StoreResult<SweepReport>;

    async fn stats(&self) -> StoreResult<DatabaseStats>;
}

/// Run a store call under a deadline, mapping expiry to a `Timeout` error.
pub async fn bounded<T, F>(tier: Tier, op: &str, limit: Duration, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::timeout(tier, op)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreErrorKind;

    #[tokio::test]
    async fn bounded_maps_elapsed_to_timeout() {
        let result: StoreResult<()> = bounded(Tier::Durable, "stall", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Timeout);
        assert_eq!(err.tier, Tier::Durable);
    }

    #[tokio::test]
    async fn bounded_passes_through_results() {
        let value = bounded(Tier::Volatile, "get", Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }
}
