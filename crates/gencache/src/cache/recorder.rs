//! Persisted hit/miss/latency buckets
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::db::schema::{LookupOutcome, MetricsSample, MetricsSnapshot};
use crate::error::Tier;
use crate::store::{bounded, DurableStore};

/// Aggregates lookups into one durable snapshot per rolling hour.
///
/// Recording never fails the caller: errors are logged and the call returns
/// `None`.
#[derive(Clone)]
pub struct MetricsRecorder {
    durable: Arc<dyn DurableStore>,
    timeout: Duration,
}

impl MetricsRecorder {
    pub fn new(durable: Arc<dyn DurableStore>, timeout: Duration) -> Self {
        Self { durable, timeout }
    }

    async fn apply(&self, sample: MetricsSample) -> Option<MetricsSnapshot> {
        match bounded(Tier::Durable, "record_metrics", self.timeout, self.durable.record_metrics(sample)).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!("Failed to record cache metrics: {}", e);
                None
            }
        }
    }

    pub async fn record_hit(&self) -> Option<MetricsSnapshot> {
        self.record_hit_at(Utc::now()).await
    }

    pub async fn record_hit_at(&self, at: DateTime<Utc>) -> Option<MetricsSnapshot> {
        self.apply(MetricsSample { at, outcome: Some(LookupOutcome::Hit), latency_ms: None })
            .await
    }

    pub async fn record_miss(&self) -> Option<MetricsSnapshot> {
        self.record_miss_at(Utc::now()).await
    }

    pub async fn record_miss_at(&self, at: DateTime<Utc>) -> Option<MetricsSnapshot> {
        self.apply(MetricsSample { at, outcome: Some(LookupOutcome::Miss), latency_ms: None })
            .await
    }

    pub async fn record_latency(&self, latency_ms: f64) -> Option<MetricsSnapshot> {
        self.record_latency_at(latency_ms, Utc::now()).await
    }

    pub async fn record_latency_at(&self, latency_ms: f64, at: DateTime<Utc>) -> Option<MetricsSnapshot> {
        self.apply(MetricsSample { at, outcome: None, latency_ms: Some(latency_ms) })
            .await
    }

    /// Outcome and latency of one lookup in a single transaction.
    pub async fn record_lookup(&self, hit: bool, latency_ms: f64) -> Option<MetricsSnapshot> {
        self.record_lookup_at(hit, latency_ms, Utc::now()).await
    }

    pub async fn record_lookup_at(&self, hit: bool, latency_ms: f64, at: DateTime<Utc>) -> Option<MetricsSnapshot> {
        let outcome = if hit { LookupOutcome::Hit } else { LookupOutcome::Miss };
        self.apply(MetricsSample { at, outcome: Some(outcome), latency_ms: Some(latency_ms) })
            .await
    }

    /// The open bucket, if one exists.
    pub async fn current(&self) -> Option<MetricsSnapshot> {
        self.current_at(Utc::now()).await
    }

    pub async fn current_at(&self, now: DateTime<Utc>) -> Option<MetricsSnapshot> {
        match bounded(Tier::Durable, "current_metrics", self.timeout, self.durable.current_metrics(now)).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Failed to read cache metrics: {}", e);
                None
            }
        }
    }

    /// Hit rate of the open bucket; 0 when there is none.
    pub async fn hit_rate(&self) -> f64 {
        self.current().await.map(|s| s.hit_rate()).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDurableStore;
    use chrono::Duration as ChronoDuration;

    fn recorder() -> MetricsRecorder {
        MetricsRecorder::new(Arc::new(SqliteDurableStore::in_memory().unwrap()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn latency_average_is_incremental() {
        let recorder = recorder();
        let now = Utc::now();
        recorder.record_lookup_at(true, 50.0, now).await.unwrap();
        let snapshot = recorder.record_lookup_at(false, 150.0, now).await.unwrap();
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.total_requests, 2);
        assert!((snapshot.avg_latency_ms - 100.0).abs() < 1e-9);
        assert!((snapshot.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn separate_counters_keep_totals_consistent() {
        let recorder = recorder();
        let now = Utc::now();
        recorder.record_hit_at(now).await.unwrap();
        recorder.record_hit_at(now).await.unwrap();
        recorder.record_miss_at(now).await.unwrap();
        let snapshot = recorder.record_latency_at(30.0, now).await.unwrap();
        assert_eq!(snapshot.hits + snapshot.misses, snapshot.total_requests);
        assert_eq!(snapshot.total_requests, 3);
        // n = 3 after three lookups: (0 * 2 + 30) / 3
        assert!((snapshot.avg_latency_ms - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn a_new_bucket_opens_each_hour() {
        let recorder = recorder();
        let earlier = Utc::now() - ChronoDuration::minutes(90);
        let old = recorder.record_hit_at(earlier).await.unwrap();
        assert!(recorder.current().await.is_none());

        let fresh = recorder.record_miss().await.unwrap();
        assert_ne!(old.id, fresh.id);
        assert_eq!(fresh.total_requests, 1);
        assert_eq!(recorder.hit_rate().await, 0.0);
    }
}
