//! Rolling one-hour lookup buckets
use crate::db::schema::{LookupOutcome, MetricsSample, MetricsSnapshot};
use crate::db::{parse_ts, ts};
use crate::error::StoreResult;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row};

const BUCKET_WIDTH_MINUTES: i64 = 60;

fn row_to_snapshot(row: &Row) -> StoreResult<MetricsSnapshot> {
    Ok(MetricsSnapshot {
        id: row.get(0)?,
        hits: row.get(1)?,
        misses: row.get(2)?,
        total_requests: row.get(3)?,
        avg_latency_ms: row.get(4)?,
        recorded_at: parse_ts(&row.get::<_, String>(5)?)?,
    })
}

/// The newest bucket opened within the last hour, if any.
pub(crate) fn open_bucket(conn: &Connection, now: DateTime<Utc>) -> StoreResult<Option<MetricsSnapshot>> {
    let window_start = now - Duration::minutes(BUCKET_WIDTH_MINUTES);
    let mut stmt = conn.prepare_cached(
        "SELECT id, hits, misses, total_requests, avg_latency_ms, recorded_at
         FROM metrics_snapshots
         WHERE recorded_at > ?1
         ORDER BY recorded_at DESC, id DESC
         LIMIT 1",
    )?;
    let mut rows = stmt.query([ts(&window_start)])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_snapshot(row)?)),
        None => Ok(None),
    }
}

/// Apply one sample to the open bucket, opening a fresh one when the last
/// has aged out. Caller owns the transaction.
pub(crate) fn apply_sample(conn: &Connection, sample: &MetricsSample) -> StoreResult<MetricsSnapshot> {
    let mut bucket = match open_bucket(conn, sample.at)? {
        Some(bucket) => bucket,
        None => {
            conn.execute(
                "INSERT INTO metrics_snapshots (hits, misses, total_requests, avg_latency_ms, recorded_at)
                 VALUES (0, 0, 0, 0, ?1)",
                [ts(&sample.at)],
            )?;
            MetricsSnapshot {
                id: conn.last_insert_rowid(),
                hits: 0,
                misses: 0,
                total_requests: 0,
                avg_latency_ms: 0.0,
                recorded_at: sample.at,
            }
        }
    };

    match sample.outcome {
        Some(LookupOutcome::Hit) => bucket.hits += 1,
        Some(LookupOutcome::Miss) => bucket.misses += 1,
        None => {}
    }
    bucket.total_requests = bucket.hits + bucket.misses;

    if let Some(latency) = sample.latency_ms {
        let n = bucket.total_requests.max(1) as f64;
        bucket.avg_latency_ms = (bucket.avg_latency_ms * (n - 1.0) + latency) / n;
    }

    conn.execute(
        "UPDATE metrics_snapshots
         SET hits = ?2, misses = ?3, total_requests = ?4, avg_latency_ms = ?5
         WHERE id = ?1",
        params![
            bucket.id,
            bucket.hits,
            bucket.misses,
            bucket.total_requests,
            bucket.avg_latency_ms
        ],
    )?;
    Ok(bucket)
}
