//! Embedding vectors attached to conversations
use crate::db::schema::EmbeddingRecord;
use crate::db::{parse_ts, ts};
use crate::error::{StoreError, StoreResult, Tier};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

/// Store one vector per chunk, replacing whatever was there for the same
/// `(source_id, chunk_index)`. Chunks past the new count are removed so a
/// source never mixes vectors from two runs.
pub(crate) fn upsert_embeddings(
    conn: &Connection,
    source_id: &str,
    model: &str,
    vectors: &[Vec<f32>],
    now: DateTime<Utc>,
) -> StoreResult<Vec<EmbeddingRecord>> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO embeddings (source_id, vector, model, dimension, chunk_index, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(source_id, chunk_index) DO UPDATE SET
             vector = excluded.vector,
             model = excluded.model,
             dimension = excluded.dimension,
             created_at = excluded.created_at
         RETURNING id",
    )?;
    let now_str = ts(&now);
    let mut stored = Vec::with_capacity(vectors.len());

    conn.execute(
        "DELETE FROM embeddings WHERE source_id = ?1 AND chunk_index >= ?2",
        params![source_id, vectors.len() as i64],
    )?;

    for (chunk_index, vector) in vectors.iter().enumerate() {
        let bytes = bincode::serialize(vector)
            .map_err(|e| StoreError::corrupt(Tier::Durable, format!("embedding encode: {}", e)))?;
        let id: i64 = stmt.query_row(
            params![source_id, bytes, model, vector.len() as i64, chunk_index as i64, &now_str],
            |row| row.get(0),
        )?;
        stored.push(EmbeddingRecord {
            id,
            source_id: source_id.to_string(),
            vector: vector.clone(),
            model: model.to_string(),
            dimension: vector.len() as i64,
            chunk_index: chunk_index as i64,
            created_at: now,
        });
    }
    Ok(stored)
}

pub(crate) fn embeddings_for(conn: &Connection, source_id: &str) -> StoreResult<Vec<EmbeddingRecord>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, source_id, vector, model, dimension, chunk_index, created_at
         FROM embeddings WHERE source_id = ?1 ORDER BY chunk_index",
    )?;
    let mut rows = stmt.query([source_id])?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        let bytes: Vec<u8> = row.get(2)?;
        let vector: Vec<f32> = bincode::deserialize(&bytes)
            .map_err(|e| StoreError::corrupt(Tier::Durable, format!("embedding decode: {}", e)))?;
        records.push(EmbeddingRecord {
            id: row.get(0)?,
            source_id: row.get(1)?,
            vector,
            model: row.get(3)?,
            dimension: row.get(4)?,
            chunk_index: row.get(5)?,
            created_at: parse_ts(&row.get::<_, String>(6)?)?,
        });
    }
    Ok(records)
}
