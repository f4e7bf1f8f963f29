//! Read-through / write-through orchestration across the two tiers
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::advisory::AdvisoryTier;
use crate::cache::dedup::{Deduplicator, RequestFingerprint};
use crate::cache::recorder::MetricsRecorder;
use crate::config::CacheConfig;
use crate::db::schema::*;
use crate::error::{CacheError, CacheResult, StoreResult, Tier};
use crate::metrics;
use crate::store::{bounded, keys, DurableStore, KeyValueStore};

/// Which tier answered a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServedFrom {
    Hot,
    Cold,
    Miss,
}

impl ServedFrom {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServedFrom::Hot => "hot",
            ServedFrom::Cold => "cold",
            ServedFrom::Miss => "miss",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedPrompt {
    pub response_text: String,
    pub hit_count: i64,
    pub served_from: ServedFrom,
}

/// What the serving layer hands back to its client
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServedPrompt {
    pub response_text: Option<String>,
    pub served_from: ServedFrom,
    pub hit_rate: f64,
}

#[derive(Debug, Clone)]
pub struct CacheConversationRequest {
    pub session_id: String,
    pub messages: Vec<NewMessage>,
    pub owner_id: Option<String>,
    pub ownership: SessionOwnership,
    pub platform: String,
    pub tone: String,
    pub title: Option<String>,
}

impl CacheConversationRequest {
    /// A guest-owned request with no title.
    pub fn guest(
        session_id: impl Into<String>,
        guest_id: impl Into<String>,
        platform: impl Into<String>,
        tone: impl Into<String>,
        messages: Vec<NewMessage>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            messages,
            owner_id: Some(guest_id.into()),
            ownership: SessionOwnership::Guest,
            platform: platform.into(),
            tone: tone.into(),
            title: None,
        }
    }
}

/// Lifetimes and bounds the coordinator works with
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub hot_ttl: Duration,
    pub session_ttl: Duration,
    pub guest_ttl: Duration,
    pub promotion_threshold: i64,
    pub hot_timeout: Duration,
    pub durable_timeout: Duration,
    pub conversation_retention: chrono::Duration,
    pub prompt_retention: chrono::Duration,
}

impl From<&CacheConfig> for CoordinatorSettings {
    fn from(config: &CacheConfig) -> Self {
        Self {
            hot_ttl: config.hot_ttl,
            session_ttl: config.session_ttl,
            guest_ttl: config.guest_ttl,
            promotion_threshold: config.promotion_threshold,
            hot_timeout: config.hot_timeout,
            durable_timeout: config.durable_timeout,
            conversation_retention: config.conversation_retention,
            prompt_retention: config.prompt_retention,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&CacheConfig::default())
    }
}

pub struct CacheCoordinator {
    hot: AdvisoryTier,
    durable: Arc<dyn DurableStore>,
    dedup: Deduplicator,
    recorder: MetricsRecorder,
    settings: CoordinatorSettings,
}

impl CacheCoordinator {
    pub fn new(
        hot: Arc<dyn KeyValueStore>,
        durable: Arc<dyn DurableStore>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            hot: AdvisoryTier::new(hot, settings.hot_timeout),
            dedup: Deduplicator::new(Arc::clone(&durable), settings.promotion_threshold, settings.durable_timeout),
            recorder: MetricsRecorder::new(Arc::clone(&durable), settings.durable_timeout),
            durable,
            settings,
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn hot_tier(&self) -> &AdvisoryTier {
        &self.hot
    }

    pub fn recorder(&self) -> &MetricsRecorder {
        &self.recorder
    }

    pub fn deduplicator(&self) -> &Deduplicator {
        &self.dedup
    }

    async fn durable_call<T, F>(&self, op: &str, call: F) -> StoreResult<T>
    where
        F: std::future::Future<Output = StoreResult<T>>,
    {
        bounded(Tier::Durable, op, self.settings.durable_timeout, call).await
    }

    async fn finish_lookup(&self, kind: &str, served_from: ServedFrom, started: Instant) {
        let elapsed = started.elapsed();
        metrics::inc_lookup(kind, served_from.as_str());
        metrics::observe_lookup_latency(elapsed.as_secs_f64());
        self.recorder
            .record_lookup(served_from != ServedFrom::Miss, elapsed.as_secs_f64() * 1000.0)
            .await;
    }

    /// Look a conversation up, hot tier first.
    ///
    /// A hot hit refreshes the key's TTL; a durable hit is promoted back
    /// into the hot tier. A durable timeout counts as a miss.
    pub async fn get_conversation(&self, conversation_id: &str) -> CacheResult<Option<ConversationSnapshot>> {
        let started = Instant::now();
        let key = keys::conversation(conversation_id);
        let now = Utc::now();

        if let Some(snapshot) = self.hot.read_decoded::<ConversationSnapshot>(&key).await {
            if snapshot.record.expires_at > now {
                self.hot.write_encoded(&key, &snapshot, self.settings.hot_ttl).await;
                debug!("Conversation {} served from hot tier", conversation_id);
                self.finish_lookup("conversation", ServedFrom::Hot, started).await;
                return Ok(Some(snapshot));
            }
            self.hot.delete(&key).await;
        }

        let loaded = self
            .durable_call("load_conversation", self.durable.load_conversation(conversation_id, now))
            .await;
        match loaded {
            Ok(Some(snapshot)) => {
                self.hot.write_encoded(&key, &snapshot, self.settings.hot_ttl).await;
                debug!("Conversation {} promoted from durable tier", conversation_id);
                self.finish_lookup("conversation", ServedFrom::Cold, started).await;
                Ok(Some(snapshot))
            }
            Ok(None) => {
                self.finish_lookup("conversation", ServedFrom::Miss, started).await;
                Ok(None)
            }
            Err(e) if e.is_timeout() => {
                warn!("Durable lookup of conversation {} timed out, reporting a miss", conversation_id);
                self.finish_lookup("conversation", ServedFrom::Miss, started).await;
                Ok(None)
            }
            Err(e) => {
                self.finish_lookup("conversation", ServedFrom::Miss, started).await;
                Err(e.into())
            }
        }
    }

    /// Persist a new conversation and mirror it into the hot tier.
    ///
    /// The id is returned once the durable write commits, whatever happens
    /// to the hot writes.
    pub async fn cache_conversation(&self, request: CacheConversationRequest) -> CacheResult<String> {
        if request.messages.is_empty() {
            return Err(CacheError::InvalidInput("a conversation needs at least one message".into()));
        }
        if request.session_id.trim().is_empty() {
            return Err(CacheError::InvalidInput("session_id must not be empty".into()));
        }

        let now = Utc::now();
        let session_id = request.session_id.clone();
        let draft = ConversationDraft {
            id: Uuid::new_v4().to_string(),
            session_id: request.session_id,
            owner_id: request.owner_id,
            ownership: request.ownership,
            platform: request.platform,
            tone: request.tone,
            title: request.title,
            messages: request.messages,
            now,
            expires_at: now + self.settings.conversation_retention,
        };

        let snapshot = self
            .durable_call("insert_conversation", self.durable.insert_conversation(draft))
            .await?;
        let id = snapshot.record.id.clone();

        self.hot
            .write_encoded(&keys::conversation(&id), &snapshot, self.settings.hot_ttl)
            .await;
        self.hot
            .append(&keys::session(&session_id), id.clone().into_bytes(), self.settings.session_ttl)
            .await;

        info!("Cached conversation {} ({} messages)", id, snapshot.messages.len());
        Ok(id)
    }

    /// Append turns and refresh the hot copy.
    pub async fn append_messages(
        &self,
        conversation_id: &str,
        messages: Vec<NewMessage>,
    ) -> CacheResult<ConversationSnapshot> {
        if messages.is_empty() {
            return Err(CacheError::InvalidInput("nothing to append".into()));
        }
        let now = Utc::now();
        let expires_at = now + self.settings.conversation_retention;

        let snapshot = self
            .durable_call(
                "append_messages",
                self.durable.append_messages(conversation_id, messages, now, expires_at),
            )
            .await?
            .ok_or_else(|| CacheError::ConversationNotFound(conversation_id.to_string()))?;

        self.hot
            .write_encoded(&keys::conversation(conversation_id), &snapshot, self.settings.hot_ttl)
            .await;
        Ok(snapshot)
    }

    /// Conversation ids of a session, oldest first.
    ///
    /// The durable tier answers; the hot list can miss ids after an eviction
    /// or a dropped append, so it is only re-seeded from that answer and
    /// served when the durable lookup times out.
    pub async fn session_conversations(&self, session_id: &str) -> CacheResult<Vec<String>> {
        let key = keys::session(session_id);
        let listed: Vec<String> = self
            .hot
            .read_list(&key)
            .await
            .into_iter()
            .filter_map(|bytes| String::from_utf8(bytes).ok())
            .collect();

        match self
            .durable_call("session_conversations", self.durable.session_conversations(session_id, Utc::now()))
            .await
        {
            Ok(ids) => {
                if ids != listed {
                    debug!("Re-seeding session list {} ({} hot, {} durable)", session_id, listed.len(), ids.len());
                    self.reseed_list(&key, &ids, self.settings.session_ttl).await;
                }
                Ok(ids)
            }
            Err(e) if e.is_timeout() => {
                warn!("Durable session lookup for {} timed out, serving the hot list", session_id);
                Ok(listed)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn reseed_list(&self, key: &str, ids: &[String], ttl: Duration) {
        self.hot.delete(key).await;
        for id in ids {
            if !self.hot.append(key, id.clone().into_bytes(), ttl).await {
                break;
            }
        }
    }

    async fn write_prompt_projection(&self, entry: &PromptCacheEntry) {
        self.hot
            .write_encoded(
                &keys::prompt(&entry.request_hash),
                &PromptProjection::from(entry),
                self.settings.hot_ttl,
            )
            .await;
    }

    /// Exact-match lookup of a previously generated response.
    pub async fn get_cached_prompt(&self, request_text: &str) -> CacheResult<Option<CachedPrompt>> {
        let started = Instant::now();
        let fingerprint = self.dedup.fingerprint(request_text);

        let hot_key = keys::prompt(&fingerprint.hash);
        if let Some(projection) = self.hot.read_decoded::<PromptProjection>(&hot_key).await {
            // The durable row stays the hit counter even when the hot tier answers.
            let hit_count = match self.dedup.record_hot_hit(&fingerprint, Utc::now()).await {
                Ok(Some(entry)) => Some(entry.hit_count),
                Ok(None) => None,
                Err(e) => {
                    warn!("Could not count hot hit on prompt {}: {}", fingerprint.hash, e);
                    Some(projection.hit_count)
                }
            };
            match hit_count {
                Some(hit_count) => {
                    self.finish_lookup("prompt", ServedFrom::Hot, started).await;
                    return Ok(Some(CachedPrompt {
                        response_text: projection.response_text,
                        hit_count,
                        served_from: ServedFrom::Hot,
                    }));
                }
                None => {
                    debug!("Dropping hot projection of swept prompt {}", fingerprint.hash);
                    self.hot.delete(&hot_key).await;
                }
            }
        }

        match self.dedup.lookup(&fingerprint, Utc::now()).await {
            Ok(Some(hit)) => {
                if hit.promote {
                    self.write_prompt_projection(&hit.entry).await;
                    info!(
                        "Promoted prompt {} to hot tier at {} hits",
                        fingerprint.hash, hit.entry.hit_count
                    );
                }
                self.finish_lookup("prompt", ServedFrom::Cold, started).await;
                Ok(Some(CachedPrompt {
                    response_text: hit.entry.response_text,
                    hit_count: hit.entry.hit_count,
                    served_from: ServedFrom::Cold,
                }))
            }
            Ok(None) => {
                self.finish_lookup("prompt", ServedFrom::Miss, started).await;
                Ok(None)
            }
            Err(e) if e.is_timeout() => {
                warn!("Durable prompt lookup {} timed out, reporting a miss", fingerprint.hash);
                self.finish_lookup("prompt", ServedFrom::Miss, started).await;
                Ok(None)
            }
            Err(e) => {
                self.finish_lookup("prompt", ServedFrom::Miss, started).await;
                Err(e.into())
            }
        }
    }

    /// Lookup shaped for the serving layer, with the current hit rate.
    pub async fn serve_prompt(&self, request_text: &str) -> CacheResult<ServedPrompt> {
        let cached = self.get_cached_prompt(request_text).await?;
        let hit_rate = self.recorder.hit_rate().await;
        Ok(match cached {
            Some(prompt) => ServedPrompt {
                response_text: Some(prompt.response_text),
                served_from: prompt.served_from,
                hit_rate,
            },
            None => ServedPrompt { response_text: None, served_from: ServedFrom::Miss, hit_rate },
        })
    }

    /// Record a freshly generated response under its request's fingerprint.
    ///
    /// A concurrent writer that lost the race bumps the existing row instead
    /// of failing.
    pub async fn cache_prompt_response(
        &self,
        request_text: &str,
        response_text: &str,
        model: &str,
        generation: GenerationMetrics,
    ) -> CacheResult<PromptCacheEntry> {
        let fingerprint: RequestFingerprint = self.dedup.fingerprint(request_text);
        if fingerprint.canonical.is_empty() {
            return Err(CacheError::InvalidInput("request text is empty".into()));
        }

        let upsert = self
            .dedup
            .store(&fingerprint, request_text, response_text, model, generation, Utc::now())
            .await?;

        if self.dedup.is_popular(&upsert.entry) {
            self.write_prompt_projection(&upsert.entry).await;
        }
        debug!(
            "Stored prompt {} (created {}, hit_count {})",
            fingerprint.hash, upsert.created, upsert.entry.hit_count
        );
        Ok(upsert.entry)
    }

    /// Append one pre-authentication turn to the guest working set.
    /// Returns whether the hot tier accepted it.
    pub async fn record_guest_turn(&self, guest_id: &str, role: MessageRole, content: &str) -> bool {
        let turn = GuestTurn {
            role: role.as_str().to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        match serde_json::to_vec(&turn) {
            Ok(bytes) => self.hot.append(&keys::guest(guest_id), bytes, self.settings.guest_ttl).await,
            Err(e) => {
                warn!("Could not encode guest turn for {}: {}", guest_id, e);
                false
            }
        }
    }

    pub async fn store_embeddings(
        &self,
        source_id: &str,
        model: &str,
        vectors: Vec<Vec<f32>>,
    ) -> CacheResult<Vec<EmbeddingRecord>> {
        if let Some(dimension) = vectors.first().map(Vec::len) {
            if dimension == 0 || vectors.iter().any(|v| v.len() != dimension) {
                return Err(CacheError::InvalidInput("embedding vectors must share a non-zero dimension".into()));
            }
        }
        Ok(self
            .durable_call(
                "store_embeddings",
                self.durable.store_embeddings(source_id, model, vectors, Utc::now()),
            )
            .await?)
    }

    pub async fn embeddings_for(&self, source_id: &str) -> CacheResult<Vec<EmbeddingRecord>> {
        Ok(self
            .durable_call("embeddings_for", self.durable.embeddings_for(source_id))
            .await?)
    }

    /// Drop expired conversations and prompt entries idle past retention.
    pub async fn sweep_retention(&self) -> CacheResult<SweepReport> {
        let now = Utc::now();
        let report = self
            .durable_call(
                "sweep",
                self.durable.sweep(RetentionPolicy {
                    now,
                    prompt_cutoff: now - self.settings.prompt_retention,
                }),
            )
            .await?;
        info!(
            "Retention sweep removed {} conversations and {} prompts",
            report.conversations_removed, report.prompts_removed
        );
        Ok(report)
    }

    /// Current metrics bucket.
    pub async fn metrics(&self) -> Option<MetricsSnapshot> {
        self.recorder.current().await
    }

    pub async fn stats(&self) -> CacheResult<DatabaseStats> {
        Ok(self.durable_call("stats", self.durable.stats()).await?)
    }
}
