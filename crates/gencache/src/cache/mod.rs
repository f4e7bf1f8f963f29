//! Tiered cache: hot-tier access, deduplication, metrics and the coordinator
pub mod advisory;
pub mod coordinator;
pub mod dedup;
pub mod recorder;

pub use advisory::AdvisoryTier;
pub use coordinator::{
    CacheConversationRequest, CacheCoordinator, CachedPrompt, CoordinatorSettings, ServedFrom, ServedPrompt,
};
pub use dedup::{DedupHit, Deduplicator, RequestFingerprint};
pub use recorder::MetricsRecorder;
