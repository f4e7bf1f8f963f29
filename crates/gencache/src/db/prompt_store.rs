//! Deduplicated prompt cache rows
use crate::db::schema::{PromptCacheEntry, PromptDraft, PromptUpsert};
use crate::db::{parse_ts, ts};
use crate::error::{StoreError, StoreResult, Tier};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

const PROMPT_COLUMNS: &str = "id, request_hash, request_text, response_text, response_hash, model, hit_count, \
     generation_time_ms, input_tokens, output_tokens, last_accessed, created_at";
const JOINED_PROMPT_COLUMNS: &str = "p.id, p.request_hash, p.request_text, p.response_text, p.response_hash, \
     p.model, p.hit_count, p.generation_time_ms, p.input_tokens, p.output_tokens, p.last_accessed, p.created_at";

fn row_to_prompt(row: &Row) -> StoreResult<PromptCacheEntry> {
    Ok(PromptCacheEntry {
        id: row.get(0)?,
        request_hash: row.get(1)?,
        request_text: row.get(2)?,
        response_text: row.get(3)?,
        response_hash: row.get(4)?,
        model: row.get(5)?,
        hit_count: row.get(6)?,
        generation_time_ms: row.get(7)?,
        input_tokens: row.get(8)?,
        output_tokens: row.get(9)?,
        last_accessed: parse_ts(&row.get::<_, String>(10)?)?,
        created_at: parse_ts(&row.get::<_, String>(11)?)?,
    })
}

pub(crate) fn get_prompt(conn: &Connection, request_hash: &str) -> StoreResult<Option<PromptCacheEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM prompt_cache WHERE request_hash = ?1",
        PROMPT_COLUMNS
    ))?;
    let mut rows = stmt.query([request_hash])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_prompt(row)?)),
        None => Ok(None),
    }
}

/// Count one more hit on an existing entry and return it after the bump.
pub(crate) fn touch_prompt(
    conn: &Connection,
    request_hash: &str,
    now: DateTime<Utc>,
) -> StoreResult<Option<PromptCacheEntry>> {
    let updated = conn.execute(
        "UPDATE prompt_cache SET hit_count = hit_count + 1, last_accessed = ?2 WHERE request_hash = ?1",
        params![request_hash, ts(&now)],
    )?;
    if updated == 0 {
        return Ok(None);
    }
    get_prompt(conn, request_hash)
}

/// Insert a new entry, or on a request-hash conflict bump the existing
/// row's hit count and replace its response.
pub(crate) fn upsert_prompt(conn: &Connection, draft: &PromptDraft) -> StoreResult<PromptUpsert> {
    let existed = get_prompt(conn, &draft.request_hash)?.is_some();
    let now = ts(&draft.now);

    conn.execute(
        "INSERT INTO prompt_cache
         (request_hash, request_text, response_text, response_hash, model, hit_count,
          generation_time_ms, input_tokens, output_tokens, last_accessed, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7, ?8, ?9, ?9)
         ON CONFLICT(request_hash) DO UPDATE SET
             hit_count = hit_count + 1,
             response_text = excluded.response_text,
             response_hash = excluded.response_hash,
             model = excluded.model,
             generation_time_ms = excluded.generation_time_ms,
             input_tokens = excluded.input_tokens,
             output_tokens = excluded.output_tokens,
             last_accessed = excluded.last_accessed",
        params![
            &draft.request_hash,
            &draft.request_text,
            &draft.response_text,
            &draft.response_hash,
            &draft.model,
            draft.metrics.generation_time_ms as i64,
            draft.metrics.input_tokens as i64,
            draft.metrics.output_tokens as i64,
            &now,
        ],
    )?;

    let entry = get_prompt(conn, &draft.request_hash)?.ok_or_else(|| {
        StoreError::corrupt(
            Tier::Durable,
            format!("prompt {} vanished after upsert", draft.request_hash),
        )
    })?;
    Ok(PromptUpsert { entry, created: !existed })
}

pub(crate) fn delete_stale(conn: &Connection, cutoff: DateTime<Utc>) -> StoreResult<usize> {
    Ok(conn.execute("DELETE FROM prompt_cache WHERE last_accessed < ?1", [ts(&cutoff)])?)
}

/// Prompt entries created before `cutoff` and not yet synced to the warehouse.
pub(crate) fn unsynced_before(
    conn: &Connection,
    cutoff: DateTime<Utc>,
    limit: usize,
) -> StoreResult<Vec<PromptCacheEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM prompt_cache p
         LEFT JOIN cache_content_links l
           ON l.cache_type = 'prompt' AND l.cache_id = p.request_hash
         WHERE p.created_at < ?1 AND COALESCE(l.is_synced, 0) = 0
         ORDER BY p.created_at, p.id
         LIMIT ?2",
        JOINED_PROMPT_COLUMNS
    ))?;
    let mut rows = stmt.query(params![ts(&cutoff), limit as i64])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        entries.push(row_to_prompt(row)?);
    }
    Ok(entries)
}
