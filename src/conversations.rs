//! Append-only conversation log
//!
//! Messages are pushed, never mutated or removed; `message_count` is kept
//! equal to the number of stored messages by bumping it in the same
//! transaction as every insert. Governance may archive whole
//! conversations, nothing else touches history.

use chrono::Utc;
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::error::{CortexError, Result};
use crate::outbox;
use crate::storage::parse_ts;
use crate::types::{
    Conversation, ConversationStatus, ConversationType, Message, MessageRole, OutboxOperation,
    Participant, MAX_CONTENT_BYTES,
};

fn conversation_from_row(row: &Row) -> rusqlite::Result<Conversation> {
    let type_str: String = row.get("conversation_type")?;
    let status_str: String = row.get("status")?;
    let participants_str: String = row.get("participants")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Conversation {
        conversation_id: row.get("id")?,
        memory_space_id: row.get("memory_space_id")?,
        conversation_type: type_str.parse().unwrap_or(ConversationType::UserAgent),
        participants: serde_json::from_str(&participants_str).unwrap_or_default(),
        message_count: row.get("message_count")?,
        status: status_str.parse().unwrap_or(ConversationStatus::Active),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    let role_str: String = row.get("role")?;
    let created_at: String = row.get("created_at")?;

    Ok(Message {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        role: role_str.parse().unwrap_or(MessageRole::User),
        content: row.get("content")?,
        participant_id: row.get("participant_id")?,
        created_at: parse_ts(&created_at),
    })
}

const CONVERSATION_COLUMNS: &str = "id, memory_space_id, conversation_type, participants, \
     message_count, status, created_at, updated_at";

/// Create a conversation in a memory space
pub fn create(
    conn: &Connection,
    space_id: &str,
    conversation_type: ConversationType,
    participants: Vec<Participant>,
) -> Result<Conversation> {
    let id = format!("conv-{}", Uuid::new_v4());
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO conversations (id, memory_space_id, conversation_type, participants, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            id,
            space_id,
            conversation_type.as_str(),
            serde_json::to_string(&participants)?,
            now,
            now
        ],
    )?;

    let conversation = require(conn, space_id, &id)?;

    let snapshot = serde_json::to_value(&conversation)?;
    outbox::enqueue(
        conn,
        "conversations",
        &id,
        OutboxOperation::Insert,
        Some(&snapshot),
        0,
    )?;

    tracing::debug!(conversation_id = %id, space_id, "created conversation");
    Ok(conversation)
}

/// Get a conversation, scoped to the given space
///
/// Returns None when the id is unknown or belongs to another space; a
/// read never leaks cross-tenant data.
pub fn get(conn: &Connection, space_id: &str, conversation_id: &str) -> Result<Option<Conversation>> {
    let sql = format!(
        "SELECT {} FROM conversations WHERE id = ? AND memory_space_id = ?",
        CONVERSATION_COLUMNS
    );
    match conn.query_row(&sql, params![conversation_id, space_id], conversation_from_row) {
        Ok(c) => Ok(Some(c)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn require(conn: &Connection, space_id: &str, conversation_id: &str) -> Result<Conversation> {
    get(conn, space_id, conversation_id)?
        .ok_or_else(|| CortexError::NotFound(format!("conversation {}", conversation_id)))
}

/// List conversations in a space, most recently updated first
pub fn list(conn: &Connection, space_id: &str, limit: i64) -> Result<Vec<Conversation>> {
    let sql = format!(
        "SELECT {} FROM conversations WHERE memory_space_id = ?
         ORDER BY updated_at DESC LIMIT ?",
        CONVERSATION_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let conversations = stmt
        .query_map(params![space_id, limit], conversation_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(conversations)
}

/// Append a message to a conversation
///
/// The message insert and the `message_count` bump commit together, so
/// the count always equals the number of stored messages. Appending to an
/// archived conversation is rejected.
pub fn append_message(
    conn: &Connection,
    space_id: &str,
    conversation_id: &str,
    role: MessageRole,
    content: &str,
    participant_id: Option<&str>,
) -> Result<Message> {
    if content.len() > MAX_CONTENT_BYTES {
        return Err(CortexError::InvalidInput(format!(
            "Message content exceeds {} bytes",
            MAX_CONTENT_BYTES
        )));
    }

    let conversation = require(conn, space_id, conversation_id)?;
    if conversation.status == ConversationStatus::Archived {
        return Err(CortexError::InvalidInput(format!(
            "conversation {} is archived",
            conversation_id
        )));
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO messages (conversation_id, memory_space_id, role, content, participant_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![conversation_id, space_id, role.as_str(), content, participant_id, now],
    )?;
    let message_id = conn.last_insert_rowid();

    conn.execute(
        "UPDATE conversations SET message_count = message_count + 1, updated_at = ? WHERE id = ?",
        params![now, conversation_id],
    )?;

    let message = conn.query_row(
        "SELECT id, conversation_id, role, content, participant_id, created_at
         FROM messages WHERE id = ?",
        params![message_id],
        message_from_row,
    )?;

    let snapshot = serde_json::to_value(&message)?;
    outbox::enqueue(
        conn,
        "messages",
        &message_id.to_string(),
        OutboxOperation::Insert,
        Some(&snapshot),
        0,
    )?;

    Ok(message)
}

/// Read messages in insertion order
pub fn messages(
    conn: &Connection,
    space_id: &str,
    conversation_id: &str,
    limit: Option<i64>,
) -> Result<Vec<Message>> {
    // Scope check first so a foreign conversation reads as empty
    if get(conn, space_id, conversation_id)?.is_none() {
        return Ok(vec![]);
    }

    let mut stmt = conn.prepare_cached(
        "SELECT id, conversation_id, role, content, participant_id, created_at
         FROM messages WHERE conversation_id = ? ORDER BY id ASC LIMIT ?",
    )?;
    let messages = stmt
        .query_map(params![conversation_id, limit.unwrap_or(i64::MAX)], message_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(messages)
}

/// Archive a conversation; history stays readable
pub fn archive(conn: &Connection, space_id: &str, conversation_id: &str) -> Result<Conversation> {
    let conversation = require(conn, space_id, conversation_id)?;
    if conversation.status == ConversationStatus::Archived {
        return Ok(conversation);
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE conversations SET status = 'archived', updated_at = ? WHERE id = ?",
        params![now, conversation_id],
    )?;

    let conversation = require(conn, space_id, conversation_id)?;
    let snapshot = serde_json::to_value(&conversation)?;
    outbox::enqueue(
        conn,
        "conversations",
        conversation_id,
        OutboxOperation::Update,
        Some(&snapshot),
        0,
    )?;

    Ok(conversation)
}
