//! Store doubles with switchable faults
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use gencache::db::schema::*;
use gencache::migration::{ExportBatch, JsonLinesWarehouse, Warehouse};
use gencache::{
    CoordinatorSettings, DurableStore, KeyValueStore, MokaKeyValueStore, SqliteDurableStore, StoreError,
    StoreResult, Tier,
};

/// Long enough to trip any deadline in [`fast_settings`].
pub const STALL: Duration = Duration::from_secs(30);

pub fn fast_settings() -> CoordinatorSettings {
    CoordinatorSettings {
        hot_timeout: Duration::from_millis(100),
        durable_timeout: Duration::from_millis(300),
        ..CoordinatorSettings::default()
    }
}

/// Moka store that can be switched off and that counts writes per key.
pub struct FlakyKv {
    inner: MokaKeyValueStore,
    pub down: AtomicBool,
    pub stall: AtomicBool,
    writes: DashMap<String, usize>,
}

impl FlakyKv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MokaKeyValueStore::new(10_000),
            down: AtomicBool::new(false),
            stall: AtomicBool::new(false),
            writes: DashMap::new(),
        })
    }

    pub fn writes_to(&self, key: &str) -> usize {
        self.writes.get(key).map(|n| *n).unwrap_or(0)
    }

    async fn gate(&self) -> StoreResult<()> {
        if self.stall.load(Ordering::SeqCst) {
            tokio::time::sleep(STALL).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(Tier::Volatile, "connection refused"));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FlakyKv {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.gate().await?;
        self.inner.get(key).await
    }

    async fn set_with_expiry(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<()> {
        self.gate().await?;
        *self.writes.entry(key.to_string()).or_insert(0) += 1;
        self.inner.set_with_expiry(key, value, ttl).await
    }

    async fn append_to_list(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StoreResult<usize> {
        self.gate().await?;
        self.inner.append_to_list(key, value, ttl).await
    }

    async fn get_list(&self, key: &str) -> StoreResult<Vec<Vec<u8>>> {
        self.gate().await?;
        self.inner.get_list(key).await
    }

    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        self.gate().await?;
        self.inner.increment(key, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.gate().await?;
        self.inner.delete(key).await
    }
}

/// SQLite store with injectable stalls and failures.
pub struct FaultyDurable {
    pub inner: SqliteDurableStore,
    pub stall_reads: AtomicBool,
    pub stall_writes: AtomicBool,
    pub down: AtomicBool,
    pub fail_reassign: AtomicBool,
    /// Holds the reassignment open this long before it commits.
    pub reassign_delay_ms: AtomicU64,
}

impl FaultyDurable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteDurableStore::in_memory().expect("in-memory store"),
            stall_reads: AtomicBool::new(false),
            stall_writes: AtomicBool::new(false),
            down: AtomicBool::new(false),
            fail_reassign: AtomicBool::new(false),
            reassign_delay_ms: AtomicU64::new(0),
        })
    }

    async fn read_gate(&self) -> StoreResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(Tier::Durable, "database is locked"));
        }
        if self.stall_reads.load(Ordering::SeqCst) {
            tokio::time::sleep(STALL).await;
        }
        Ok(())
    }

    async fn write_gate(&self) -> StoreResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(Tier::Durable, "database is locked"));
        }
        if self.stall_writes.load(Ordering::SeqCst) {
            tokio::time::sleep(STALL).await;
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FaultyDurable {
    async fn load_conversation(&self, id: &str, now: DateTime<Utc>) -> StoreResult<Option<ConversationSnapshot>> {
        self.read_gate().await?;
        self.inner.load_conversation(id, now).await
    }

    async fn insert_conversation(&self, draft: ConversationDraft) -> StoreResult<ConversationSnapshot> {
        self.write_gate().await?;
        self.inner.insert_conversation(draft).await
    }

    async fn append_messages(
        &self,
        id: &str,
        messages: Vec<NewMessage>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<Option<ConversationSnapshot>> {
        self.write_gate().await?;
        self.inner.append_messages(id, messages, now, expires_at).await
    }

    async fn session_conversations(&self, session_id: &str, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        self.read_gate().await?;
        self.inner.session_conversations(session_id, now).await
    }

    async fn get_prompt(&self, request_hash: &str) -> StoreResult<Option<PromptCacheEntry>> {
        self.read_gate().await?;
        self.inner.get_prompt(request_hash).await
    }

    async fn touch_prompt(&self, request_hash: &str, now: DateTime<Utc>) -> StoreResult<Option<PromptCacheEntry>> {
        self.read_gate().await?;
        self.inner.touch_prompt(request_hash, now).await
    }

    async fn upsert_prompt(&self, draft: PromptDraft) -> StoreResult<PromptUpsert> {
        self.write_gate().await?;
        self.inner.upsert_prompt(draft).await
    }

    async fn store_embeddings(
        &self,
        source_id: &str,
        model: &str,
        vectors: Vec<Vec<f32>>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<EmbeddingRecord>> {
        self.write_gate().await?;
        self.inner.store_embeddings(source_id, model, vectors, now).await
    }

    async fn embeddings_for(&self, source_id: &str) -> StoreResult<Vec<EmbeddingRecord>> {
        self.read_gate().await?;
        self.inner.embeddings_for(source_id).await
    }

    // Metrics and the ledger stay healthy so tests can observe faults elsewhere.
    async fn record_metrics(&self, sample: MetricsSample) -> StoreResult<MetricsSnapshot> {
        self.inner.record_metrics(sample).await
    }

    async fn current_metrics(&self, now: DateTime<Utc>) -> StoreResult<Option<MetricsSnapshot>> {
        self.inner.current_metrics(now).await
    }

    async fn append_ledger(&self, draft: LedgerDraft) -> StoreResult<MigrationLedgerEntry> {
        self.inner.append_ledger(draft).await
    }

    async fn transition_ledger(
        &self,
        id: i64,
        change: LedgerTransition,
        now: DateTime<Utc>,
    ) -> StoreResult<MigrationLedgerEntry> {
        self.inner.transition_ledger(id, change, now).await
    }

    async fn latest_ledger_entry(
        &self,
        migration_type: MigrationType,
        source: &str,
    ) -> StoreResult<Option<MigrationLedgerEntry>> {
        self.inner.latest_ledger_entry(migration_type, source).await
    }

    async fn list_ledger(&self, limit: usize) -> StoreResult<Vec<MigrationLedgerEntry>> {
        self.inner.list_ledger(limit).await
    }

    async fn count_guest_conversations(&self, guest_id: &str) -> StoreResult<i64> {
        self.inner.count_guest_conversations(guest_id).await
    }

    async fn reassign_guest(&self, request: ReassignRequest) -> StoreResult<ReassignOutcome> {
        self.write_gate().await?;
        if self.fail_reassign.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(Tier::Durable, "disk I/O error during reassignment"));
        }
        let delay = self.reassign_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.reassign_guest(request).await
    }

    async fn unsynced_conversations(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ConversationSnapshot>> {
        self.read_gate().await?;
        self.inner.unsynced_conversations(cutoff, limit).await
    }

    async fn unsynced_prompts(&self, cutoff: DateTime<Utc>, limit: usize) -> StoreResult<Vec<PromptCacheEntry>> {
        self.read_gate().await?;
        self.inner.unsynced_prompts(cutoff, limit).await
    }

    async fn mark_synced(&self, links: Vec<SyncedLink>, now: DateTime<Utc>) -> StoreResult<usize> {
        self.write_gate().await?;
        self.inner.mark_synced(links, now).await
    }

    async fn content_link(&self, cache_type: CacheType, cache_id: &str) -> StoreResult<Option<CacheContentLink>> {
        self.inner.content_link(cache_type, cache_id).await
    }

    async fn sweep(&self, policy: RetentionPolicy) -> StoreResult<SweepReport> {
        self.write_gate().await?;
        self.inner.sweep(policy).await
    }

    async fn stats(&self) -> StoreResult<DatabaseStats> {
        self.inner.stats().await
    }
}

/// JSON-lines warehouse that rejects a chosen batch.
pub struct FlakyWarehouse {
    inner: JsonLinesWarehouse,
    /// Zero-based call index to reject; `u32::MAX` never fails.
    pub fail_on_call: AtomicU32,
    calls: AtomicU32,
    pub rows_written: AtomicUsize,
}

impl FlakyWarehouse {
    pub fn new(dir: &std::path::Path, fail_on_call: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: JsonLinesWarehouse::new(dir),
            fail_on_call: AtomicU32::new(fail_on_call),
            calls: AtomicU32::new(0),
            rows_written: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Warehouse for FlakyWarehouse {
    async fn write_batch(&self, batch: &ExportBatch) -> StoreResult<Vec<String>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == self.fail_on_call.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(Tier::Warehouse, "warehouse rejected the batch"));
        }
        let ids = self.inner.write_batch(batch).await?;
        self.rows_written.fetch_add(ids.len(), Ordering::SeqCst);
        Ok(ids)
    }
}

pub fn conversation_draft(
    id: &str,
    owner: &str,
    ownership: SessionOwnership,
    created: DateTime<Utc>,
    messages: Vec<NewMessage>,
) -> ConversationDraft {
    ConversationDraft {
        id: id.to_string(),
        session_id: format!("session-{}", owner),
        owner_id: Some(owner.to_string()),
        ownership,
        platform: "blog".to_string(),
        tone: "casual".to_string(),
        title: None,
        messages,
        now: created,
        expires_at: created + chrono::Duration::days(365),
    }
}
