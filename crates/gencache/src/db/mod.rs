//! SQLite-backed durable tier
pub mod schema;
pub mod schema_migrations;
pub mod conversation_store;
pub mod prompt_store;
pub mod embedding_store;
pub mod metrics_store;
pub mod ledger_store;

pub use schema::*;
pub use schema_migrations::SchemaMigrator;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult, Tier};
use crate::store::DurableStore;

const BUSY_TIMEOUT_MS: u64 = 5000;

/// Timestamps are stored as RFC 3339 text with microsecond precision so that
/// lexical order matches time order.
pub(crate) fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(text: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(Tier::Durable, format!("bad timestamp '{}': {}", text, e)))
}

/// [`DurableStore`] over an r2d2 pool of SQLite connections.
///
/// Every call runs on the blocking thread pool so that callers can bound it
/// with a timeout. Multi-row writes use `BEGIN IMMEDIATE`.
#[derive(Clone)]
pub struct SqliteDurableStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteDurableStore {
    /// Open (or create) a database file, apply pending schema migrations and
    /// switch it to WAL.
    pub fn open(db_path: &Path, pool_size: u32) -> StoreResult<Self> {
        info!("Opening cache database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::unavailable(Tier::Durable, format!("create {}: {}", parent.display(), e))
                })?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(&format!(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = {};",
                    BUSY_TIMEOUT_MS
                ))
            });
        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;
        Self::from_pool(pool)
    }

    /// Private in-memory database. The pool holds a single long-lived
    /// connection so that every call sees the same data.
    pub fn in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| {
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
                BUSY_TIMEOUT_MS
            ))
        });
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(manager)?;
        Self::from_pool(pool)
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>) -> StoreResult<Self> {
        {
            let mut conn = pool.get()?;
            let version = SchemaMigrator::new(&mut conn).initialize_database()?;
            debug!("Cache schema at version {}", version);
        }
        info!("Cache database initialized successfully");
        Ok(Self { pool: Arc::new(pool) })
    }

    fn get_conn(pool: &Pool<SqliteConnectionManager>) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        pool.get_timeout(Duration::from_millis(BUSY_TIMEOUT_MS)).map_err(StoreError::from)
    }

    /// Run `f` with a pooled connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let mut conn = Self::get_conn(&pool)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::unavailable(Tier::Durable, format!("store task aborted: {}", e)))?
    }

    /// Run `f` inside one immediate transaction; any error rolls it back.
    async fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
        .await
    }
}

#[async_trait]
impl DurableStore for SqliteDurableStore {
    async fn load_conversation(&self, id: &str, now: DateTime<Utc>) -> StoreResult<Option<ConversationSnapshot>> {
        let id = id.to_string();
        self.blocking(move |conn| conversation_store::load_conversation(conn, &id, now))
            .await
    }

    async fn insert_conversation(&self, draft: ConversationDraft) -> StoreResult<ConversationSnapshot> {
        self.transaction(move |conn| conversation_store::insert_conversation(conn, &draft))
            .await
    }

    async fn append_messages(
        &self,
        id: &str,
        messages: Vec<NewMessage>,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<Option<ConversationSnapshot>> {
        let id = id.to_string();
        self.transaction(move |conn| conversation_store::append_messages(conn, &id, &messages, now, expires_at))
            .await
    }

    async fn session_conversations(&self, session_id: &str, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let session_id = session_id.to_string();
        self.blocking(move |conn| conversation_store::session_conversation_ids(conn, &session_id, now))
            .await
    }

    async fn get_prompt(&self, request_hash: &str) -> StoreResult<Option<PromptCacheEntry>> {
        let request_hash = request_hash.to_string();
        self.blocking(move |conn| prompt_store::get_prompt(conn, &request_hash))
            .await
    }

    async fn touch_prompt(&self, request_hash: &str, now: DateTime<Utc>) -> StoreResult<Option<PromptCacheEntry>> {
        let request_hash = request_hash.to_string();
        self.transaction(move |conn| prompt_store::touch_prompt(conn, &request_hash, now))
            .await
    }

    async fn upsert_prompt(&self, draft: PromptDraft) -> StoreResult<PromptUpsert> {
        self.transaction(move |conn| prompt_store::upsert_prompt(conn, &draft))
            .await
    }

    async fn store_embeddings(
        &self,
        source_id: &str,
        model: &str,
        vectors: Vec<Vec<f32>>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<EmbeddingRecord>> {
        let source_id = source_id.to_string();
        let model = model.to_string();
        self.transaction(move |conn| embedding_store::upsert_embeddings(conn, &source_id, &model, &vectors, now))
            .await
    }

    async fn embeddings_for(&self, source_id: &str) -> StoreResult<Vec<EmbeddingRecord>> {
        let source_id = source_id.to_string();
        self.blocking(move |conn| embedding_store::embeddings_for(conn, &source_id))
            .await
    }

    async fn record_metrics(&self, sample: MetricsSample) -> StoreResult<MetricsSnapshot> {
        self.transaction(move |conn| metrics_store::apply_sample(conn, &sample))
            .await
    }

    async fn current_metrics(&self, now: DateTime<Utc>) -> StoreResult<Option<MetricsSnapshot>> {
        self.blocking(move |conn| metrics_store::open_bucket(conn, now)).await
    }

    async fn append_ledger(&self, draft: LedgerDraft) -> StoreResult<MigrationLedgerEntry> {
        self.transaction(move |conn| ledger_store::append(conn, &draft)).await
    }

    async fn transition_ledger(
        &self,
        id: i64,
        change: LedgerTransition,
        now: DateTime<Utc>,
    ) -> StoreResult<MigrationLedgerEntry> {
        self.transaction(move |conn| ledger_store::transition(conn, id, &change, now))
            .await
    }

    async fn latest_ledger_entry(
        &self,
        migration_type: MigrationType,
        source: &str,
    ) -> StoreResult<Option<MigrationLedgerEntry>> {
        let source = source.to_string();
        self.blocking(move |conn| ledger_store::latest_for_source(conn, migration_type, &source))
            .await
    }

    async fn list_ledger(&self, limit: usize) -> StoreResult<Vec<MigrationLedgerEntry>> {
        self.blocking(move |conn| ledger_store::list(conn, limit)).await
    }

    async fn count_guest_conversations(&self, guest_id: &str) -> StoreResult<i64> {
        let guest_id = guest_id.to_string();
        self.blocking(move |conn| conversation_store::count_guest_conversations(conn, &guest_id))
            .await
    }

    async fn reassign_guest(&self, request: ReassignRequest) -> StoreResult<ReassignOutcome> {
        self.transaction(move |conn| conversation_store::reassign_guest(conn, &request))
            .await
    }

    async fn unsynced_conversations(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<ConversationSnapshot>> {
        self.blocking(move |conn| conversation_store::unsynced_before(conn, cutoff, limit))
            .await
    }

    async fn unsynced_prompts(&self, cutoff: DateTime<Utc>, limit: usize) -> StoreResult<Vec<PromptCacheEntry>> {
        self.blocking(move |conn| prompt_store::unsynced_before(conn, cutoff, limit))
            .await
    }

    async fn mark_synced(&self, links: Vec<SyncedLink>, now: DateTime<Utc>) -> StoreResult<usize> {
        self.transaction(move |conn| ledger_store::mark_synced(conn, &links, now))
            .await
    }

    async fn content_link(&self, cache_type: CacheType, cache_id: &str) -> StoreResult<Option<CacheContentLink>> {
        let cache_id = cache_id.to_string();
        self.blocking(move |conn| ledger_store::get_link(conn, cache_type, &cache_id))
            .await
    }

    async fn sweep(&self, policy: RetentionPolicy) -> StoreResult<SweepReport> {
        self.transaction(move |conn| {
            Ok(SweepReport {
                conversations_removed: conversation_store::delete_expired(conn, policy.now)?,
                prompts_removed: prompt_store::delete_stale(conn, policy.prompt_cutoff)?,
            })
        })
        .await
    }

    async fn stats(&self) -> StoreResult<DatabaseStats> {
        self.blocking(|conn| Ok(schema_migrations::get_database_stats(conn)?))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreErrorKind;
    use chrono::Duration as ChronoDuration;
    use rusqlite::params;

    fn draft(id: &str, owner: Option<&str>, ownership: SessionOwnership, messages: Vec<NewMessage>) -> ConversationDraft {
        let now = Utc::now();
        ConversationDraft {
            id: id.to_string(),
            session_id: "session-1".to_string(),
            owner_id: owner.map(str::to_string),
            ownership,
            platform: "blog".to_string(),
            tone: "casual".to_string(),
            title: None,
            messages,
            now,
            expires_at: now + ChronoDuration::days(30),
        }
    }

    fn prompt_draft(hash: &str, response: &str) -> PromptDraft {
        PromptDraft {
            request_hash: hash.to_string(),
            request_text: "write a blog about ai".to_string(),
            response_text: response.to_string(),
            response_hash: crate::utils::TextUtils::digest(response),
            model: "test-model".to_string(),
            metrics: GenerationMetrics { generation_time_ms: 120, input_tokens: 5, output_tokens: 40 },
            now: Utc::now(),
        }
    }

    #[tokio::test]
    async fn sequences_stay_contiguous_across_appends() {
        let store = SqliteDurableStore::in_memory().unwrap();
        let created = store
            .insert_conversation(draft(
                "c1",
                None,
                SessionOwnership::Guest,
                vec![NewMessage::user("hi"), NewMessage::assistant("hello")],
            ))
            .await
            .unwrap();
        assert_eq!(created.record.message_count, 2);

        let now = Utc::now();
        let appended = store
            .append_messages("c1", vec![NewMessage::user("more"), NewMessage::assistant("sure")], now, now + ChronoDuration::days(30))
            .await
            .unwrap()
            .unwrap();

        let sequences: Vec<i64> = appended.messages.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        assert_eq!(appended.record.message_count, 4);
        assert_ne!(appended.record.content_hash, created.record.content_hash);

        let missing = store
            .append_messages("nope", vec![NewMessage::user("x")], now, now)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn expired_conversations_are_invisible_and_swept() {
        let store = SqliteDurableStore::in_memory().unwrap();
        let mut d = draft("old", None, SessionOwnership::Guest, vec![NewMessage::user("hi")]);
        d.expires_at = d.now - ChronoDuration::seconds(1);
        store.insert_conversation(d).await.unwrap();
        store.store_embeddings("old", "m", vec![vec![0.1, 0.2]], Utc::now()).await.unwrap();

        assert!(store.load_conversation("old", Utc::now()).await.unwrap().is_none());

        let now = Utc::now();
        let report = store
            .sweep(RetentionPolicy { now, prompt_cutoff: now - ChronoDuration::days(90) })
            .await
            .unwrap();
        assert_eq!(report.conversations_removed, 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_embeddings, 0);
    }

    #[tokio::test]
    async fn prompt_upsert_bumps_on_conflict() {
        let store = SqliteDurableStore::in_memory().unwrap();
        let first = store.upsert_prompt(prompt_draft("h1", "first")).await.unwrap();
        assert!(first.created);
        assert_eq!(first.entry.hit_count, 1);

        let second = store.upsert_prompt(prompt_draft("h1", "second")).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.entry.hit_count, 2);
        assert_eq!(second.entry.response_text, "second");
        assert_eq!(second.entry.id, first.entry.id);

        let touched = store.touch_prompt("h1", Utc::now()).await.unwrap().unwrap();
        assert_eq!(touched.hit_count, 3);
        assert!(store.touch_prompt("h2", Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reassignment_backfills_legacy_hashes() {
        let store = SqliteDurableStore::in_memory().unwrap();
        store
            .insert_conversation(draft("g1", Some("guest-1"), SessionOwnership::Guest, vec![NewMessage::user("hi")]))
            .await
            .unwrap();
        store
            .blocking(|conn| {
                conn.execute(
                    "INSERT INTO messages (conversation_id, role, content, content_hash, sequence, token_estimate, created_at)
                     VALUES ('g1', 'assistant', 'legacy', NULL, 1, 2, ?1)",
                    params![ts(&Utc::now())],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let now = Utc::now();
        let outcome = store
            .reassign_guest(ReassignRequest {
                guest_id: "guest-1".into(),
                authenticated_id: "user-1".into(),
                pending_turns: Vec::new(),
                now,
                expires_at: now + ChronoDuration::days(30),
            })
            .await
            .unwrap();
        assert_eq!(outcome.conversations_reassigned, 1);
        assert_eq!(outcome.messages_backfilled, 1);

        let snapshot = store.load_conversation("g1", now).await.unwrap().unwrap();
        assert_eq!(snapshot.record.ownership, SessionOwnership::Authenticated);
        assert_eq!(snapshot.record.owner_id.as_deref(), Some("user-1"));
        assert!(snapshot.messages.iter().all(|m| m.content_hash.is_some()));
        assert_eq!(store.count_guest_conversations("guest-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bad_guest_turn_rolls_back_the_whole_transfer() {
        let store = SqliteDurableStore::in_memory().unwrap();
        store
            .insert_conversation(draft("g1", Some("guest-1"), SessionOwnership::Guest, vec![NewMessage::user("hi")]))
            .await
            .unwrap();

        let now = Utc::now();
        let err = store
            .reassign_guest(ReassignRequest {
                guest_id: "guest-1".into(),
                authenticated_id: "user-1".into(),
                pending_turns: vec![GuestTurn { role: "system".into(), content: "x".into(), timestamp: now }],
                now,
                expires_at: now + ChronoDuration::days(30),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Conflict);
        assert_eq!(store.count_guest_conversations("guest-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn terminal_ledger_entries_are_immutable() {
        let store = SqliteDurableStore::in_memory().unwrap();
        let entry = store
            .append_ledger(LedgerDraft {
                migration_type: MigrationType::GuestToAuthenticated,
                source: "guest:g".into(),
                destination: "user:u".into(),
                now: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(entry.status, MigrationStatus::Pending);

        store.transition_ledger(entry.id, LedgerTransition::Start, Utc::now()).await.unwrap();
        let done = store
            .transition_ledger(entry.id, LedgerTransition::Complete { records_migrated: 3 }, Utc::now())
            .await
            .unwrap();
        assert_eq!(done.status, MigrationStatus::Completed);
        assert!(done.completed_at.is_some());

        let err = store
            .transition_ledger(
                entry.id,
                LedgerTransition::Fail { records_migrated: 0, records_failed: 1, error: "late".into() },
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::InvalidTransition);

        // The trigger guards the row even against direct writes.
        let id = entry.id;
        let direct = store
            .blocking(move |conn| {
                conn.execute("UPDATE migration_ledger SET status = 'pending' WHERE id = ?1", [id])?;
                Ok(())
            })
            .await;
        assert!(direct.is_err());

        let latest = store
            .latest_ledger_entry(MigrationType::GuestToAuthenticated, "guest:g")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.records_migrated, 3);
    }

    #[tokio::test]
    async fn metrics_bucket_rolls_over_after_an_hour() {
        let store = SqliteDurableStore::in_memory().unwrap();
        let start = Utc::now() - ChronoDuration::hours(2);

        let first = store
            .record_metrics(MetricsSample { at: start, outcome: Some(LookupOutcome::Hit), latency_ms: Some(50.0) })
            .await
            .unwrap();
        let same = store
            .record_metrics(MetricsSample {
                at: start + ChronoDuration::minutes(10),
                outcome: Some(LookupOutcome::Miss),
                latency_ms: Some(150.0),
            })
            .await
            .unwrap();
        assert_eq!(first.id, same.id);
        assert_eq!(same.total_requests, 2);
        assert_eq!(same.hits + same.misses, same.total_requests);
        assert!((same.avg_latency_ms - 100.0).abs() < 1e-9);

        let later = store
            .record_metrics(MetricsSample {
                at: start + ChronoDuration::minutes(75),
                outcome: Some(LookupOutcome::Hit),
                latency_ms: None,
            })
            .await
            .unwrap();
        assert_ne!(later.id, first.id);
        assert_eq!(later.total_requests, 1);
    }

    #[tokio::test]
    async fn reembedding_replaces_every_chunk() {
        let store = SqliteDurableStore::in_memory().unwrap();
        store
            .insert_conversation(draft("c1", None, SessionOwnership::Guest, vec![NewMessage::user("hi")]))
            .await
            .unwrap();

        store
            .store_embeddings("c1", "m1", vec![vec![1.0, 0.0], vec![0.0, 1.0]], Utc::now())
            .await
            .unwrap();
        store
            .store_embeddings("c1", "m2", vec![vec![0.5, 0.5, 0.5]], Utc::now())
            .await
            .unwrap();

        // Fewer chunks than before: the old tail goes away.
        let stored = store.embeddings_for("c1").await.unwrap();
        let shape: Vec<(&str, i64)> = stored.iter().map(|e| (e.model.as_str(), e.dimension)).collect();
        assert_eq!(shape, vec![("m2", 3)]);

        store
            .store_embeddings("c1", "m3", vec![vec![1.0], vec![2.0], vec![3.0]], Utc::now())
            .await
            .unwrap();
        let stored = store.embeddings_for("c1").await.unwrap();
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|e| e.model == "m3" && e.dimension == 1));
        assert_eq!(stored[2].vector, vec![3.0]);

        let orphan = store.store_embeddings("missing", "m1", vec![vec![1.0]], Utc::now()).await;
        assert_eq!(orphan.unwrap_err().kind, StoreErrorKind::Conflict);
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/cache.db");
        {
            let store = SqliteDurableStore::open(&path, 2).unwrap();
            store
                .insert_conversation(draft("c1", Some("u1"), SessionOwnership::Authenticated, vec![NewMessage::user("hi")]))
                .await
                .unwrap();
        }

        let reopened = SqliteDurableStore::open(&path, 2).unwrap();
        let snapshot = reopened.load_conversation("c1", Utc::now()).await.unwrap().unwrap();
        assert_eq!(snapshot.messages.len(), 1);
        let mode: String = reopened
            .blocking(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn timestamps_sort_lexically() {
        let a = Utc::now();
        let b = a + ChronoDuration::microseconds(1);
        assert!(ts(&a) < ts(&b));
        assert_eq!(parse_ts(&ts(&a)).unwrap().timestamp_micros(), a.timestamp_micros());
        assert!(parse_ts("yesterday").is_err());
    }
}
