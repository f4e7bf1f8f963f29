//! Content-addressed request deduplication
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::db::schema::{GenerationMetrics, PromptCacheEntry, PromptDraft, PromptUpsert};
use crate::error::{StoreResult, Tier};
use crate::store::{bounded, DurableStore};
use crate::utils::TextUtils;

/// Canonical form of a request and the digest that keys it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFingerprint {
    pub canonical: String,
    pub hash: String,
}

impl RequestFingerprint {
    pub fn of(request_text: &str) -> Self {
        let canonical = TextUtils::canonicalize(request_text);
        let hash = TextUtils::digest(&canonical);
        Self { canonical, hash }
    }
}

/// A durable hit, after its hit count was bumped
#[derive(Debug, Clone)]
pub struct DedupHit {
    pub entry: PromptCacheEntry,
    /// This lookup moved the count onto the promotion threshold.
    pub promote: bool,
}

pub struct Deduplicator {
    durable: Arc<dyn DurableStore>,
    promotion_threshold: i64,
    timeout: Duration,
}

impl Deduplicator {
    pub fn new(durable: Arc<dyn DurableStore>, promotion_threshold: i64, timeout: Duration) -> Self {
        Self { durable, promotion_threshold: promotion_threshold.max(1), timeout }
    }

    pub fn fingerprint(&self, request_text: &str) -> RequestFingerprint {
        RequestFingerprint::of(request_text)
    }

    pub fn promotion_threshold(&self) -> i64 {
        self.promotion_threshold
    }

    /// True only for the single step that reaches the threshold.
    pub fn crossed_threshold(&self, before: i64, after: i64) -> bool {
        before < self.promotion_threshold && self.promotion_threshold <= after
    }

    /// Look the request up in the durable tier, counting a hit if found.
    pub async fn lookup(&self, fingerprint: &RequestFingerprint, now: DateTime<Utc>) -> StoreResult<Option<DedupHit>> {
        let touched = bounded(
            Tier::Durable,
            "touch_prompt",
            self.timeout,
            self.durable.touch_prompt(&fingerprint.hash, now),
        )
        .await?;

        Ok(touched.map(|entry| {
            let promote = self.crossed_threshold(entry.hit_count - 1, entry.hit_count);
            debug!(
                "Durable prompt hit {} (hit_count {}, promote {})",
                fingerprint.hash, entry.hit_count, promote
            );
            DedupHit { entry, promote }
        }))
    }

    /// Count a hit that the hot projection answered. `Ok(None)` means the
    /// durable row is gone and the projection is stale.
    pub async fn record_hot_hit(
        &self,
        fingerprint: &RequestFingerprint,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<PromptCacheEntry>> {
        bounded(
            Tier::Durable,
            "touch_prompt",
            self.timeout,
            self.durable.touch_prompt(&fingerprint.hash, now),
        )
        .await
    }

    /// Insert the pair, or count a duplicate writer against the existing row.
    pub async fn store(
        &self,
        fingerprint: &RequestFingerprint,
        request_text: &str,
        response_text: &str,
        model: &str,
        metrics: GenerationMetrics,
        now: DateTime<Utc>,
    ) -> StoreResult<PromptUpsert> {
        let draft = PromptDraft {
            request_hash: fingerprint.hash.clone(),
            request_text: request_text.to_string(),
            response_text: response_text.to_string(),
            response_hash: TextUtils::digest(response_text),
            model: model.to_string(),
            metrics,
            now,
        };
        bounded(Tier::Durable, "upsert_prompt", self.timeout, self.durable.upsert_prompt(draft)).await
    }

    /// Entry at or past the threshold, which keeps it mirrored in the hot tier.
    pub fn is_popular(&self, entry: &PromptCacheEntry) -> bool {
        entry.hit_count >= self.promotion_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDurableStore;

    fn dedup(threshold: i64) -> Deduplicator {
        Deduplicator::new(Arc::new(SqliteDurableStore::in_memory().unwrap()), threshold, Duration::from_secs(5))
    }

    #[test]
    fn variants_share_a_fingerprint() {
        let a = RequestFingerprint::of("Write a blog about AI");
        let b = RequestFingerprint::of("write a blog about ai ");
        let c = RequestFingerprint::of("write  a\tblog about\nAI");
        assert_eq!(a, b);
        assert_eq!(a.hash, c.hash);
        assert_ne!(a.hash, RequestFingerprint::of("write a blog about ML").hash);
    }

    #[test]
    fn threshold_is_crossed_once() {
        let d = dedup(5);
        assert!(!d.crossed_threshold(3, 4));
        assert!(d.crossed_threshold(4, 5));
        assert!(!d.crossed_threshold(5, 6));
        assert!(d.crossed_threshold(3, 7));
    }

    #[tokio::test]
    async fn lookups_promote_exactly_at_the_threshold() {
        let d = dedup(3);
        let fp = d.fingerprint("hello there");
        assert!(d.lookup(&fp, Utc::now()).await.unwrap().is_none());

        d.store(&fp, "Hello there", "hi", "m", GenerationMetrics::default(), Utc::now())
            .await
            .unwrap();

        let promotions: Vec<bool> = {
            let mut seen = Vec::new();
            for _ in 0..4 {
                seen.push(d.lookup(&fp, Utc::now()).await.unwrap().unwrap().promote);
            }
            seen
        };
        // Counts go 2, 3, 4, 5; only the step onto 3 promotes.
        assert_eq!(promotions, vec![false, true, false, false]);
    }
}
