//! Conversation and message rows, including guest ownership transfer
use crate::db::schema::*;
use crate::db::{parse_ts, ts};
use crate::error::{StoreError, StoreErrorKind, StoreResult, Tier};
use crate::utils::TextUtils;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

/// Platform tag given to conversations rebuilt from a guest working set.
pub const GUEST_IMPORT_PLATFORM: &str = "guest-import";
const GUEST_IMPORT_TONE: &str = "neutral";

const CONVERSATION_COLUMNS: &str = "id, owner_id, ownership, session_id, content_hash, message_count, \
     platform, tone, title, created_at, accessed_at, expires_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, role, content, content_hash, sequence, token_estimate, created_at";

fn row_to_conversation(row: &Row) -> StoreResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        ownership: SessionOwnership::parse(&row.get::<_, String>(2)?)?,
        session_id: row.get(3)?,
        content_hash: row.get(4)?,
        message_count: row.get(5)?,
        platform: row.get(6)?,
        tone: row.get(7)?,
        title: row.get(8)?,
        created_at: parse_ts(&row.get::<_, String>(9)?)?,
        accessed_at: parse_ts(&row.get::<_, String>(10)?)?,
        expires_at: parse_ts(&row.get::<_, String>(11)?)?,
    })
}

fn row_to_message(row: &Row) -> StoreResult<MessageRecord> {
    Ok(MessageRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: MessageRole::parse(&row.get::<_, String>(2)?)?,
        content: row.get(3)?,
        content_hash: row.get(4)?,
        sequence: row.get(5)?,
        token_estimate: row.get(6)?,
        created_at: parse_ts(&row.get::<_, String>(7)?)?,
    })
}

fn digest_messages(messages: &[NewMessage]) -> String {
    TextUtils::conversation_digest(messages.iter().map(|m| (m.role.as_str(), m.content.as_str())))
}

/// Insert turns starting at `first_sequence`. Caller owns the transaction.
fn insert_messages(
    conn: &Connection,
    conversation_id: &str,
    first_sequence: i64,
    messages: &[NewMessage],
    now: DateTime<Utc>,
) -> StoreResult<Vec<MessageRecord>> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO messages
         (conversation_id, role, content, content_hash, sequence, token_estimate, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    let now_str = ts(&now);
    let mut stored = Vec::with_capacity(messages.len());

    for (offset, message) in messages.iter().enumerate() {
        let sequence = first_sequence + offset as i64;
        let content_hash = TextUtils::digest(&message.content);
        let token_estimate = TextUtils::estimate_tokens(&message.content);
        let id = stmt.insert(params![
            conversation_id,
            message.role.as_str(),
            &message.content,
            &content_hash,
            sequence,
            token_estimate,
            &now_str,
        ])?;

        stored.push(MessageRecord {
            id,
            conversation_id: conversation_id.to_string(),
            role: message.role,
            content: message.content.clone(),
            content_hash: Some(content_hash),
            sequence,
            token_estimate,
            created_at: now,
        });
    }
    Ok(stored)
}

/// Insert a conversation and its messages (sequences `0..N-1`).
pub(crate) fn insert_conversation(
    conn: &Connection,
    draft: &ConversationDraft,
) -> StoreResult<ConversationSnapshot> {
    let content_hash = digest_messages(&draft.messages);
    let now_str = ts(&draft.now);

    conn.execute(
        &format!("INSERT INTO conversations ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)", CONVERSATION_COLUMNS),
        params![
            &draft.id,
            &draft.owner_id,
            draft.ownership.as_str(),
            &draft.session_id,
            &content_hash,
            draft.messages.len() as i64,
            &draft.platform,
            &draft.tone,
            &draft.title,
            &now_str,
            &now_str,
            ts(&draft.expires_at),
        ],
    )?;

    let messages = insert_messages(conn, &draft.id, 0, &draft.messages, draft.now)?;
    debug!("Stored conversation {} with {} messages", draft.id, messages.len());

    Ok(ConversationSnapshot {
        record: ConversationRecord {
            id: draft.id.clone(),
            owner_id: draft.owner_id.clone(),
            ownership: draft.ownership,
            session_id: draft.session_id.clone(),
            content_hash,
            message_count: messages.len() as i64,
            platform: draft.platform.clone(),
            tone: draft.tone.clone(),
            title: draft.title.clone(),
            created_at: draft.now,
            accessed_at: draft.now,
            expires_at: draft.expires_at,
        },
        messages,
    })
}

fn load_messages(conn: &Connection, conversation_id: &str) -> StoreResult<Vec<MessageRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM messages WHERE conversation_id = ?1 ORDER BY sequence",
        MESSAGE_COLUMNS
    ))?;
    let mut rows = stmt.query([conversation_id])?;
    let mut messages = Vec::new();
    while let Some(row) = rows.next()? {
        messages.push(row_to_message(row)?);
    }
    Ok(messages)
}

/// Load a live (unexpired) conversation with its messages in sequence order
pub(crate) fn load_conversation(
    conn: &Connection,
    conversation_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<Option<ConversationSnapshot>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM conversations WHERE id = ?1 AND expires_at > ?2",
        CONVERSATION_COLUMNS
    ))?;
    let mut rows = stmt.query(params![conversation_id, ts(&now)])?;
    let record = match rows.next()? {
        Some(row) => row_to_conversation(row)?,
        None => return Ok(None),
    };
    let messages = load_messages(conn, conversation_id)?;
    Ok(Some(ConversationSnapshot { record, messages }))
}

/// Append turns to an existing conversation.
///
/// The next sequence number and the message count are read from the stored
/// message rows inside the caller's transaction, never from a cached count.
pub(crate) fn append_messages(
    conn: &Connection,
    conversation_id: &str,
    messages: &[NewMessage],
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> StoreResult<Option<ConversationSnapshot>> {
    let live: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM conversations WHERE id = ?1 AND expires_at > ?2",
            params![conversation_id, ts(&now)],
            |row| row.get(0),
        )
        .optional()?;
    if live.is_none() {
        return Ok(None);
    }

    let next_sequence: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence) + 1, 0) FROM messages WHERE conversation_id = ?1",
        [conversation_id],
        |row| row.get(0),
    )?;
    insert_messages(conn, conversation_id, next_sequence, messages, now)?;

    let all_messages = load_messages(conn, conversation_id)?;
    let content_hash = TextUtils::conversation_digest(
        all_messages.iter().map(|m| (m.role.as_str(), m.content.as_str())),
    );
    conn.execute(
        "UPDATE conversations
         SET message_count = (SELECT COUNT(*) FROM messages WHERE conversation_id = ?1),
             content_hash = ?2, accessed_at = ?3, expires_at = ?4
         WHERE id = ?1",
        params![conversation_id, &content_hash, ts(&now), ts(&expires_at)],
    )?;

    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM conversations WHERE id = ?1",
        CONVERSATION_COLUMNS
    ))?;
    let mut rows = stmt.query([conversation_id])?;
    let record = match rows.next()? {
        Some(row) => row_to_conversation(row)?,
        None => return Ok(None),
    };
    Ok(Some(ConversationSnapshot { record, messages: all_messages }))
}

pub(crate) fn session_conversation_ids(
    conn: &Connection,
    session_id: &str,
    now: DateTime<Utc>,
) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id FROM conversations
         WHERE session_id = ?1 AND expires_at > ?2
         ORDER BY created_at, rowid",
    )?;
    let mut rows = stmt.query(params![session_id, ts(&now)])?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        ids.push(row.get(0)?);
    }
    Ok(ids)
}

pub(crate) fn count_guest_conversations(conn: &Connection, guest_id: &str) -> StoreResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM conversations WHERE owner_id = ?1 AND ownership = 'guest'",
        [guest_id],
        |row| row.get(0),
    )?)
}

/// Move every guest-tagged conversation of `guest_id` to the authenticated
/// identity, backfill missing message hashes, and import the guest working
/// set. Runs inside the caller's transaction; any error rolls all of it back.
pub(crate) fn reassign_guest(conn: &Connection, request: &ReassignRequest) -> StoreResult<ReassignOutcome> {
    let mut outcome = ReassignOutcome::default();

    let guest_conversations: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM conversations WHERE owner_id = ?1 AND ownership = 'guest' ORDER BY created_at",
        )?;
        let mut rows = stmt.query([&request.guest_id])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(row.get(0)?);
        }
        ids
    };

    if !guest_conversations.is_empty() {
        outcome.conversations_reassigned = conn.execute(
            "UPDATE conversations
             SET owner_id = ?2, ownership = 'authenticated', accessed_at = ?3
             WHERE owner_id = ?1 AND ownership = 'guest'",
            params![&request.guest_id, &request.authenticated_id, ts(&request.now)],
        )? as i64;

        let mut select = conn.prepare_cached(
            "SELECT id, content FROM messages WHERE conversation_id = ?1 AND content_hash IS NULL",
        )?;
        let mut update = conn.prepare_cached("UPDATE messages SET content_hash = ?1 WHERE id = ?2")?;
        for conversation_id in &guest_conversations {
            let mut legacy: Vec<(i64, String)> = Vec::new();
            let mut rows = select.query([conversation_id])?;
            while let Some(row) = rows.next()? {
                legacy.push((row.get(0)?, row.get(1)?));
            }
            for (message_id, content) in legacy {
                update.execute(params![TextUtils::digest(&content), message_id])?;
                outcome.messages_backfilled += 1;
            }
        }
        outcome.reassigned_ids = guest_conversations;
    }

    if !request.pending_turns.is_empty() {
        outcome.imported_conversation = import_guest_turns(conn, request)?;
    }

    info!(
        "Reassigned {} conversations from guest {} to {} ({} hashes backfilled)",
        outcome.conversations_reassigned,
        request.guest_id,
        request.authenticated_id,
        outcome.messages_backfilled
    );
    Ok(outcome)
}

fn import_guest_turns(conn: &Connection, request: &ReassignRequest) -> StoreResult<Option<String>> {
    let messages = request
        .pending_turns
        .iter()
        .map(|turn| {
            Ok(NewMessage {
                role: MessageRole::parse(&turn.role).map_err(|_| {
                    StoreError::new(
                        Tier::Durable,
                        StoreErrorKind::Conflict,
                        format!("guest turn has unsupported role '{}'", turn.role),
                    )
                })?,
                content: turn.content.clone(),
            })
        })
        .collect::<StoreResult<Vec<_>>>()?;

    let content_hash = digest_messages(&messages);
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM conversations WHERE owner_id = ?1 AND content_hash = ?2 LIMIT 1",
            params![&request.authenticated_id, &content_hash],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        debug!("Guest working set of {} already imported as {}", request.guest_id, id);
        return Ok(None);
    }

    let draft = ConversationDraft {
        id: Uuid::new_v4().to_string(),
        session_id: request.guest_id.clone(),
        owner_id: Some(request.authenticated_id.clone()),
        ownership: SessionOwnership::Authenticated,
        platform: GUEST_IMPORT_PLATFORM.to_string(),
        tone: GUEST_IMPORT_TONE.to_string(),
        title: None,
        messages,
        now: request.now,
        expires_at: request.expires_at,
    };
    let snapshot = insert_conversation(conn, &draft)?;
    Ok(Some(snapshot.record.id))
}

/// Delete conversations whose expiry has passed. Messages and embeddings
/// go with them through the foreign-key cascade.
pub(crate) fn delete_expired(conn: &Connection, now: DateTime<Utc>) -> StoreResult<usize> {
    Ok(conn.execute("DELETE FROM conversations WHERE expires_at <= ?1", [ts(&now)])?)
}

/// Conversations created before `cutoff` that have not been synced to the
/// warehouse yet, oldest first.
pub(crate) fn unsynced_before(
    conn: &Connection,
    cutoff: DateTime<Utc>,
    limit: usize,
) -> StoreResult<Vec<ConversationSnapshot>> {
    let ids: Vec<String> = {
        let mut stmt = conn.prepare_cached(
            "SELECT c.id FROM conversations c
             LEFT JOIN cache_content_links l
               ON l.cache_type = 'conversation' AND l.cache_id = c.id
             WHERE c.created_at < ?1 AND COALESCE(l.is_synced, 0) = 0
             ORDER BY c.created_at, c.id
             LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![ts(&cutoff), limit as i64])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            ids.push(row.get(0)?);
        }
        ids
    };

    let mut snapshots = Vec::with_capacity(ids.len());
    for id in ids {
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM conversations WHERE id = ?1",
            CONVERSATION_COLUMNS
        ))?;
        let mut rows = stmt.query([&id])?;
        if let Some(row) = rows.next()? {
            let record = row_to_conversation(row)?;
            let messages = load_messages(conn, &id)?;
            snapshots.push(ConversationSnapshot { record, messages });
        }
    }
    Ok(snapshots)
}
