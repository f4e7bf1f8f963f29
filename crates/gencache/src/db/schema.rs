//! Record types shared by both tiers, and their tagged enumerations
use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use crate::error::{StoreError, StoreResult, Tier};

macro_rules! stored_tag {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }

            pub fn parse(value: &str) -> StoreResult<Self> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(StoreError::corrupt(
                        Tier::Durable,
                        format!("unknown {} tag '{}'", stringify!($name), other),
                    )),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Who a conversation belongs to. Only ever moves Guest -> Authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOwnership {
    Guest,
    Authenticated,
}
stored_tag!(SessionOwnership { Guest => "guest", Authenticated => "authenticated" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}
stored_tag!(MessageRole { User => "user", Assistant => "assistant" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}
stored_tag!(MigrationStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

impl MigrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationStatus::Completed | MigrationStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationType {
    GuestToAuthenticated,
    WarehouseExport,
}
stored_tag!(MigrationType {
    GuestToAuthenticated => "guest_to_authenticated",
    WarehouseExport => "warehouse_export",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    Conversation,
    Prompt,
}
stored_tag!(CacheType { Conversation => "conversation", Prompt => "prompt" });

/// One chat/content session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub owner_id: Option<String>,
    pub ownership: SessionOwnership,
    pub session_id: String,
    pub content_hash: String,
    pub message_count: i64,
    pub platform: String,
    pub tone: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One turn in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    /// `None` only for rows written before hashes were recorded.
    pub content_hash: Option<String>,
    pub sequence: i64,
    pub token_estimate: i64,
    pub created_at: DateTime<Utc>,
}

/// A conversation together with its ordered messages. This is the value
/// stored under `conv:hot:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub record: ConversationRecord,
    pub messages: Vec<MessageRecord>,
}

/// A turn supplied by the caller, before it has an id or sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: MessageRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: MessageRole::Assistant, content: content.into() }
    }
}

/// Everything needed to insert a new conversation
#[derive(Debug, Clone)]
pub struct ConversationDraft {
    pub id: String,
    pub session_id: String,
    pub owner_id: Option<String>,
    pub ownership: SessionOwnership,
    pub platform: String,
    pub tone: String,
    pub title: Option<String>,
    pub messages: Vec<NewMessage>,
    pub now: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Deduplicated request/response pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptCacheEntry {
    pub id: i64,
    pub request_hash: String,
    pub request_text: String,
    pub response_text: String,
    pub response_hash: String,
    pub model: String,
    pub hit_count: i64,
    pub generation_time_ms: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub last_accessed: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Hot-tier projection of a [`PromptCacheEntry`], stored under `prompt:{hash}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptProjection {
    pub request_hash: String,
    pub response_text: String,
    pub model: String,
    pub hit_count: i64,
}

impl From<&PromptCacheEntry> for PromptProjection {
    fn from(entry: &PromptCacheEntry) -> Self {
        Self {
            request_hash: entry.request_hash.clone(),
            response_text: entry.response_text.clone(),
            model: entry.model.clone(),
            hit_count: entry.hit_count,
        }
    }
}

/// Generation-side measurements handed over with a response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationMetrics {
    pub generation_time_ms: u64,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct PromptDraft {
    pub request_hash: String,
    pub request_text: String,
    pub response_text: String,
    pub response_hash: String,
    pub model: String,
    pub metrics: GenerationMetrics,
    pub now: DateTime<Utc>,
}

/// Result of an insert-or-bump on the prompt cache
#[derive(Debug, Clone)]
pub struct PromptUpsert {
    pub entry: PromptCacheEntry,
    /// `false` when another writer had already created the row.
    pub created: bool,
}

/// Vector representation of one chunk of a conversation
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub source_id: String,
    pub vector: Vec<f32>,
    pub model: String,
    pub dimension: i64,
    pub chunk_index: i64,
    pub created_at: DateTime<Utc>,
}

/// Aggregated lookup counters for one rolling hour
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub id: i64,
    pub hits: i64,
    pub misses: i64,
    pub total_requests: i64,
    pub avg_latency_ms: f64,
    pub recorded_at: DateTime<Utc>,
}

impl MetricsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        self.hits as f64 / self.total_requests.max(1) as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    Hit,
    Miss,
}

/// One update applied to the open metrics bucket
#[derive(Debug, Clone, Copy)]
pub struct MetricsSample {
    pub at: DateTime<Utc>,
    pub outcome: Option<LookupOutcome>,
    pub latency_ms: Option<f64>,
}

/// Audit record of a tier or ownership migration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationLedgerEntry {
    pub id: i64,
    pub migration_type: MigrationType,
    pub status: MigrationStatus,
    pub source: String,
    pub destination: String,
    pub records_migrated: i64,
    pub records_failed: i64,
    /// Resume marker for batched exports (last exported row).
    pub checkpoint: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct LedgerDraft {
    pub migration_type: MigrationType,
    pub source: String,
    pub destination: String,
    pub now: DateTime<Utc>,
}

/// Allowed status changes on a ledger entry
#[derive(Debug, Clone)]
pub enum LedgerTransition {
    Start,
    Progress { records_migrated: i64, checkpoint: Option<String> },
    Complete { records_migrated: i64 },
    Fail { records_migrated: i64, records_failed: i64, error: String },
}

impl LedgerTransition {
    pub fn target(&self) -> MigrationStatus {
        match self {
            LedgerTransition::Start | LedgerTransition::Progress { .. } => MigrationStatus::InProgress,
            LedgerTransition::Complete { .. } => MigrationStatus::Completed,
            LedgerTransition::Fail { .. } => MigrationStatus::Failed,
        }
    }

    /// Statuses this transition may start from.
    pub fn allowed_from(&self) -> &'static [MigrationStatus] {
        match self {
            LedgerTransition::Start => &[MigrationStatus::Pending],
            LedgerTransition::Progress { .. } => &[MigrationStatus::InProgress],
            LedgerTransition::Complete { .. } | LedgerTransition::Fail { .. } => {
                &[MigrationStatus::Pending, MigrationStatus::InProgress]
            }
        }
    }
}

/// Maps a cache entry to its exported counterpart
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheContentLink {
    pub cache_type: CacheType,
    pub cache_id: String,
    pub content_id: Option<String>,
    pub is_synced: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// One pre-authentication turn from `guest:{guest_id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestTurn {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReassignRequest {
    pub guest_id: String,
    pub authenticated_id: String,
    pub pending_turns: Vec<GuestTurn>,
    pub now: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReassignOutcome {
    pub conversations_reassigned: i64,
    /// Ids whose owner changed; their hot copies are stale.
    pub reassigned_ids: Vec<String>,
    pub messages_backfilled: i64,
    /// Id of the conversation built from the guest working set, if any.
    pub imported_conversation: Option<String>,
}

/// A row selected for warehouse export
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExportRow {
    Conversation(ConversationSnapshot),
    Prompt(PromptCacheEntry),
}

impl ExportRow {
    pub fn link_key(&self) -> (CacheType, String) {
        match self {
            ExportRow::Conversation(c) => (CacheType::Conversation, c.record.id.clone()),
            ExportRow::Prompt(p) => (CacheType::Prompt, p.request_hash.clone()),
        }
    }
}

/// Link rows to mark after a successful warehouse write
#[derive(Debug, Clone)]
pub struct SyncedLink {
    pub cache_type: CacheType,
    pub cache_id: String,
    pub content_id: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub now: DateTime<Utc>,
    /// Prompt entries last accessed before this instant are removed.
    pub prompt_cutoff: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub conversations_removed: usize,
    pub prompts_removed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DatabaseStats {
    pub total_conversations: i64,
    pub guest_conversations: i64,
    pub total_messages: i64,
    pub total_prompts: i64,
    pub total_embeddings: i64,
    pub total_ledger_entries: i64,
    pub database_size_bytes: i64,
}
