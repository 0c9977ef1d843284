//! Memory space registry
//!
//! Tenancy and participant membership. A space is the unit of isolation:
//! one space with many agents is Hive mode, several spaces sharing a
//! context via grants is Collaboration mode. Spaces are archived, never
//! hard-deleted, so contained data stays addressable for audit.

use chrono::Utc;
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

use crate::error::{CortexError, Result};
use crate::outbox;
use crate::storage::parse_ts;
use crate::types::{
    normalize_space_id, MemorySpace, OutboxOperation, Participant, ParticipantKind, SpaceStatus,
    SpaceType,
};

fn space_from_row(row: &Row) -> rusqlite::Result<MemorySpace> {
    let space_type_str: String = row.get("space_type")?;
    let status_str: String = row.get("status")?;
    let participants_str: String = row.get("participants")?;
    let metadata_str: String = row.get("metadata")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(MemorySpace {
        memory_space_id: row.get("id")?,
        name: row.get("name")?,
        space_type: space_type_str.parse().unwrap_or(SpaceType::Custom),
        participants: serde_json::from_str(&participants_str).unwrap_or_default(),
        status: status_str.parse().unwrap_or(SpaceStatus::Active),
        metadata: serde_json::from_str(&metadata_str).unwrap_or_default(),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

const SPACE_COLUMNS: &str =
    "id, name, space_type, status, participants, metadata, created_at, updated_at";

fn enqueue_space(conn: &Connection, space: &MemorySpace, op: OutboxOperation) -> Result<()> {
    let snapshot = serde_json::to_value(space)?;
    outbox::enqueue(
        conn,
        "memory_spaces",
        &space.memory_space_id,
        op,
        Some(&snapshot),
        0,
    )?;
    Ok(())
}

/// Create a new memory space
///
/// When `space_id` is None a UUID-based id is generated. Fails with
/// `AlreadyExists` if the id is taken — the id is immutable once created.
pub fn create(
    conn: &Connection,
    space_id: Option<&str>,
    name: &str,
    space_type: SpaceType,
) -> Result<MemorySpace> {
    let id = match space_id {
        Some(raw) => normalize_space_id(raw)
            .map_err(|e| CortexError::InvalidInput(e.to_string()))?,
        None => format!("space-{}", Uuid::new_v4()),
    };

    if exists(conn, &id)? {
        return Err(CortexError::AlreadyExists(format!("memory space {}", id)));
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO memory_spaces (id, name, space_type, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?)",
        params![id, name, space_type.as_str(), now, now],
    )?;

    let space = get(conn, &id)?.ok_or_else(|| CortexError::NotFound(format!("memory space {}", id)))?;
    enqueue_space(conn, &space, OutboxOperation::Insert)?;

    tracing::info!(space_id = %id, space_type = space_type.as_str(), "created memory space");
    Ok(space)
}

/// Get a space by id
pub fn get(conn: &Connection, space_id: &str) -> Result<Option<MemorySpace>> {
    let sql = format!("SELECT {} FROM memory_spaces WHERE id = ?", SPACE_COLUMNS);
    match conn.query_row(&sql, params![space_id], space_from_row) {
        Ok(space) => Ok(Some(space)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Check whether a space id is taken
pub fn exists(conn: &Connection, space_id: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM memory_spaces WHERE id = ?",
        params![space_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Idempotent upsert: return the existing space unchanged, or create it
///
/// Defaults are deliberately ignored on a hit — merging them would let any
/// later caller silently rename or retype a shared space. Explicit
/// mutation APIs are the sanctioned path for that.
pub fn get_or_create(
    conn: &Connection,
    space_id: &str,
    default_name: &str,
    default_type: SpaceType,
) -> Result<MemorySpace> {
    let id = normalize_space_id(space_id)
        .map_err(|e| CortexError::InvalidInput(e.to_string()))?;

    if let Some(existing) = get(conn, &id)? {
        return Ok(existing);
    }

    create(conn, Some(&id), default_name, default_type)
}

/// Provision a space on first write
///
/// Writes never land in an unregistered partition: naming a space that
/// does not exist yet creates it with defaults, so `exists` and `list`
/// always cover every space that holds data. Expects an
/// already-normalized id.
pub fn ensure(conn: &Connection, space_id: &str) -> Result<MemorySpace> {
    get_or_create(conn, space_id, space_id, SpaceType::Custom)
}

/// List all spaces
pub fn list(conn: &Connection) -> Result<Vec<MemorySpace>> {
    let sql = format!(
        "SELECT {} FROM memory_spaces ORDER BY created_at DESC",
        SPACE_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let spaces = stmt
        .query_map([], space_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(spaces)
}

fn require(conn: &Connection, space_id: &str) -> Result<MemorySpace> {
    get(conn, space_id)?
        .ok_or_else(|| CortexError::NotFound(format!("memory space {}", space_id)))
}

fn save_participants(
    conn: &Connection,
    space_id: &str,
    participants: &[Participant],
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE memory_spaces SET participants = ?, updated_at = ? WHERE id = ?",
        params![serde_json::to_string(participants)?, now, space_id],
    )?;
    Ok(())
}

/// Add a participant to a space
///
/// Idempotent: adding an already-present participant id returns the space
/// unchanged and enqueues nothing.
pub fn add_participant(
    conn: &Connection,
    space_id: &str,
    participant_id: &str,
    kind: ParticipantKind,
) -> Result<MemorySpace> {
    let mut space = require(conn, space_id)?;

    if space.participants.iter().any(|p| p.id == participant_id) {
        return Ok(space);
    }

    space.participants.push(Participant {
        id: participant_id.to_string(),
        kind,
        joined_at: Utc::now(),
    });
    save_participants(conn, space_id, &space.participants)?;

    let space = require(conn, space_id)?;
    enqueue_space(conn, &space, OutboxOperation::Update)?;
    Ok(space)
}

/// Remove a participant from a space; a no-op when absent
pub fn remove_participant(
    conn: &Connection,
    space_id: &str,
    participant_id: &str,
) -> Result<MemorySpace> {
    let mut space = require(conn, space_id)?;

    let before = space.participants.len();
    space.participants.retain(|p| p.id != participant_id);
    if space.participants.len() == before {
        return Ok(space);
    }

    save_participants(conn, space_id, &space.participants)?;

    let space = require(conn, space_id)?;
    enqueue_space(conn, &space, OutboxOperation::Update)?;
    Ok(space)
}

/// Archive a space (soft-disable)
///
/// Does not cascade: contained facts, memories, and conversations remain
/// addressable for audit.
pub fn archive(conn: &Connection, space_id: &str) -> Result<MemorySpace> {
    let space = require(conn, space_id)?;
    if space.status == SpaceStatus::Archived {
        return Ok(space);
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE memory_spaces SET status = 'archived', updated_at = ? WHERE id = ?",
        params![now, space_id],
    )?;

    let space = require(conn, space_id)?;
    enqueue_space(conn, &space, OutboxOperation::Update)?;

    tracing::info!(space_id = %space_id, "archived memory space");
    Ok(space)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::pending_count;
    use crate::storage::Storage;

    fn test_storage() -> Storage {
        Storage::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_and_duplicate() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let space = create(conn, Some("team-alpha"), "Team Alpha", SpaceType::Team)?;
                assert_eq!(space.memory_space_id, "team-alpha");
                assert_eq!(space.status, SpaceStatus::Active);

                let err = create(conn, Some("team-alpha"), "Again", SpaceType::Team).unwrap_err();
                assert!(matches!(err, CortexError::AlreadyExists(_)));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_create_generates_id() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let space = create(conn, None, "Anonymous", SpaceType::Personal)?;
                assert!(space.memory_space_id.starts_with("space-"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_get_or_create_ignores_defaults_on_hit() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let first = get_or_create(conn, "proj-x", "Project X", SpaceType::Project)?;
                let second = get_or_create(conn, "proj-x", "Other Name", SpaceType::Team)?;
                assert_eq!(second.name, first.name);
                assert_eq!(second.space_type, SpaceType::Project);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_add_participant_idempotent() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                create(conn, Some("hive"), "Hive", SpaceType::Team)?;
                add_participant(conn, "hive", "agent-1", ParticipantKind::Agent)?;
                let space = add_participant(conn, "hive", "agent-1", ParticipantKind::Agent)?;

                let matching: Vec<_> = space
                    .participants
                    .iter()
                    .filter(|p| p.id == "agent-1")
                    .collect();
                assert_eq!(matching.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_remove_participant() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                create(conn, Some("hive"), "Hive", SpaceType::Team)?;
                add_participant(conn, "hive", "agent-1", ParticipantKind::Agent)?;
                add_participant(conn, "hive", "user-9", ParticipantKind::Human)?;
                let space = remove_participant(conn, "hive", "agent-1")?;
                assert_eq!(space.participants.len(), 1);
                assert_eq!(space.participants[0].id, "user-9");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_archive_keeps_row() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                create(conn, Some("old"), "Old", SpaceType::Project)?;
                let space = archive(conn, "old")?;
                assert_eq!(space.status, SpaceStatus::Archived);
                assert!(exists(conn, "old")?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_mutations_enqueue_outbox() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                create(conn, Some("s1"), "S1", SpaceType::Team)?;
                assert_eq!(pending_count(conn)?, 1);

                add_participant(conn, "s1", "a1", ParticipantKind::Agent)?;
                assert_eq!(pending_count(conn)?, 2);

                // Idempotent no-op adds nothing
                add_participant(conn, "s1", "a1", ParticipantKind::Agent)?;
                assert_eq!(pending_count(conn)?, 2);

                archive(conn, "s1")?;
                assert_eq!(pending_count(conn)?, 3);
                Ok(())
            })
            .unwrap();
    }
}
