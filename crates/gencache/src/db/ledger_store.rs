//! Migration ledger and export link bookkeeping
use crate::db::schema::*;
use crate::db::{parse_ts, ts};
use crate::error::{StoreError, StoreErrorKind, StoreResult, Tier};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tracing::debug;

const LEDGER_COLUMNS: &str = "id, migration_type, status, source, destination, records_migrated, \
     records_failed, checkpoint, error, started_at, completed_at";

fn row_to_entry(row: &Row) -> StoreResult<MigrationLedgerEntry> {
    let completed_at: Option<String> = row.get(10)?;
    Ok(MigrationLedgerEntry {
        id: row.get(0)?,
        migration_type: MigrationType::parse(&row.get::<_, String>(1)?)?,
        status: MigrationStatus::parse(&row.get::<_, String>(2)?)?,
        source: row.get(3)?,
        destination: row.get(4)?,
        records_migrated: row.get(5)?,
        records_failed: row.get(6)?,
        checkpoint: row.get(7)?,
        error: row.get(8)?,
        started_at: parse_ts(&row.get::<_, String>(9)?)?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
    })
}

pub(crate) fn get_entry(conn: &Connection, id: i64) -> StoreResult<Option<MigrationLedgerEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM migration_ledger WHERE id = ?1",
        LEDGER_COLUMNS
    ))?;
    let mut rows = stmt.query([id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_entry(row)?)),
        None => Ok(None),
    }
}

/// Append a new `pending` entry.
pub(crate) fn append(conn: &Connection, draft: &LedgerDraft) -> StoreResult<MigrationLedgerEntry> {
    conn.execute(
        "INSERT INTO migration_ledger (migration_type, status, source, destination, started_at)
         VALUES (?1, 'pending', ?2, ?3, ?4)",
        params![
            draft.migration_type.as_str(),
            &draft.source,
            &draft.destination,
            ts(&draft.now)
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!("Ledger entry {} opened for {} -> {}", id, draft.source, draft.destination);

    Ok(MigrationLedgerEntry {
        id,
        migration_type: draft.migration_type,
        status: MigrationStatus::Pending,
        source: draft.source.clone(),
        destination: draft.destination.clone(),
        records_migrated: 0,
        records_failed: 0,
        checkpoint: None,
        error: None,
        started_at: draft.now,
        completed_at: None,
    })
}

/// Move an entry along its lifecycle. Terminal entries are never touched.
pub(crate) fn transition(
    conn: &Connection,
    id: i64,
    change: &LedgerTransition,
    now: DateTime<Utc>,
) -> StoreResult<MigrationLedgerEntry> {
    let mut entry = get_entry(conn, id)?.ok_or_else(|| {
        StoreError::new(
            Tier::Durable,
            StoreErrorKind::InvalidTransition,
            format!("ledger entry {} does not exist", id),
        )
    })?;

    if !change.allowed_from().contains(&entry.status) {
        return Err(StoreError::new(
            Tier::Durable,
            StoreErrorKind::InvalidTransition,
            format!(
                "ledger entry {} cannot move from {} to {}",
                id,
                entry.status,
                change.target()
            ),
        ));
    }

    entry.status = change.target();
    match change {
        LedgerTransition::Start => {}
        LedgerTransition::Progress { records_migrated, checkpoint } => {
            entry.records_migrated = *records_migrated;
            entry.checkpoint = checkpoint.clone();
        }
        LedgerTransition::Complete { records_migrated } => {
            entry.records_migrated = *records_migrated;
            entry.completed_at = Some(now);
        }
        LedgerTransition::Fail { records_migrated, records_failed, error } => {
            entry.records_migrated = *records_migrated;
            entry.records_failed = *records_failed;
            entry.error = Some(error.clone());
            entry.completed_at = Some(now);
        }
    }

    conn.execute(
        "UPDATE migration_ledger
         SET status = ?2, records_migrated = ?3, records_failed = ?4,
             checkpoint = ?5, error = ?6, completed_at = ?7
         WHERE id = ?1",
        params![
            id,
            entry.status.as_str(),
            entry.records_migrated,
            entry.records_failed,
            &entry.checkpoint,
            &entry.error,
            entry.completed_at.as_ref().map(ts),
        ],
    )?;
    Ok(entry)
}

pub(crate) fn latest_for_source(
    conn: &Connection,
    migration_type: MigrationType,
    source: &str,
) -> StoreResult<Option<MigrationLedgerEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM migration_ledger
         WHERE migration_type = ?1 AND source = ?2
         ORDER BY id DESC LIMIT 1",
        LEDGER_COLUMNS
    ))?;
    let mut rows = stmt.query(params![migration_type.as_str(), source])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_entry(row)?)),
        None => Ok(None),
    }
}

/// Newest entries first.
pub(crate) fn list(conn: &Connection, limit: usize) -> StoreResult<Vec<MigrationLedgerEntry>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM migration_ledger ORDER BY id DESC LIMIT ?1",
        LEDGER_COLUMNS
    ))?;
    let mut rows = stmt.query([limit as i64])?;
    let mut entries = Vec::new();
    while let Some(row) = rows.next()? {
        entries.push(row_to_entry(row)?);
    }
    Ok(entries)
}

pub(crate) fn mark_synced(conn: &Connection, links: &[SyncedLink], now: DateTime<Utc>) -> StoreResult<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO cache_content_links (cache_type, cache_id, content_id, is_synced, last_synced_at)
         VALUES (?1, ?2, ?3, TRUE, ?4)
         ON CONFLICT(cache_type, cache_id) DO UPDATE SET
             content_id = excluded.content_id,
             is_synced = TRUE,
             last_synced_at = excluded.last_synced_at",
    )?;
    let now_str = ts(&now);
    let mut marked = 0;
    for link in links {
        marked += stmt.execute(params![
            link.cache_type.as_str(),
            &link.cache_id,
            &link.content_id,
            &now_str
        ])?;
    }
    Ok(marked)
}

pub(crate) fn get_link(
    conn: &Connection,
    cache_type: CacheType,
    cache_id: &str,
) -> StoreResult<Option<CacheContentLink>> {
    let mut stmt = conn.prepare_cached(
        "SELECT cache_type, cache_id, content_id, is_synced, last_synced_at
         FROM cache_content_links WHERE cache_type = ?1 AND cache_id = ?2",
    )?;
    let mut rows = stmt.query(params![cache_type.as_str(), cache_id])?;
    match rows.next()? {
        Some(row) => {
            let last_synced_at: Option<String> = row.get(4)?;
            Ok(Some(CacheContentLink {
                cache_type: CacheType::parse(&row.get::<_, String>(0)?)?,
                cache_id: row.get(1)?,
                content_id: row.get(2)?,
                is_synced: row.get(3)?,
                last_synced_at: last_synced_at.as_deref().map(parse_ts).transpose()?,
            }))
        }
        None => Ok(None),
    }
}
