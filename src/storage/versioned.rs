//! Shared versioned-record primitive
//!
//! Facts and memories never mutate in place: "update" inserts a new row
//! with `version + 1` and back-patches the old head's `superseded_by`,
//! forming a supersede chain. This module owns the chain mechanics so both
//! knowledge stores behave identically.
//!
//! Ordering is new-then-old-patch inside one transaction: a reader may
//! briefly see two rows without `superseded_by`, never zero.

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::error::{CortexError, Result};

/// Descriptor of a table that participates in supersede-chain versioning
#[derive(Debug, Clone, Copy)]
pub struct VersionedTable {
    /// Table name
    pub name: &'static str,
    /// Column stamped with "now" on the old head when it is superseded
    pub supersede_end_column: Option<&'static str>,
    /// Column stamped with "now" on soft delete
    pub delete_column: &'static str,
}

/// Fact rows: supersede and soft delete both end `valid_until`
pub const FACTS: VersionedTable = VersionedTable {
    name: "facts",
    supersede_end_column: Some("valid_until"),
    delete_column: "valid_until",
};

/// Memory rows: superseded rows stay valid for audit; only an explicit
/// soft delete stamps `deleted_at`
pub const MEMORIES: VersionedTable = VersionedTable {
    name: "memories",
    supersede_end_column: None,
    delete_column: "deleted_at",
};

/// Chain bookkeeping read from an existing row
#[derive(Debug, Clone)]
pub struct HeadMeta {
    pub id: i64,
    pub memory_space_id: String,
    pub version: i32,
    pub superseded_by: Option<i64>,
}

/// Read chain metadata for a row, or `NotFound`
pub fn head_meta(conn: &Connection, table: VersionedTable, id: i64) -> Result<HeadMeta> {
    let sql = format!(
        "SELECT id, memory_space_id, version, superseded_by FROM {} WHERE id = ?",
        table.name
    );
    match conn.query_row(&sql, params![id], |row| {
        Ok(HeadMeta {
            id: row.get(0)?,
            memory_space_id: row.get(1)?,
            version: row.get(2)?,
            superseded_by: row.get(3)?,
        })
    }) {
        Ok(meta) => Ok(meta),
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            Err(CortexError::NotFound(format!("{} {}", table.name, id)))
        }
        Err(e) => Err(e.into()),
    }
}

/// Revise a head row: insert the successor via `insert_new`, then patch the
/// old head's `superseded_by`
///
/// The caller-supplied closure receives the old head's metadata and must
/// insert the new row with `version = old.version + 1` and
/// `supersedes = old.id`, returning the new rowid.
///
/// Fails with `PermissionDenied` if `space_id` does not match the head's
/// space, and with retryable `Conflict` if the row was already superseded
/// by a concurrent revise (the optimistic check re-reads inside the write
/// transaction).
pub fn revise<F>(
    conn: &Connection,
    table: VersionedTable,
    head_id: i64,
    space_id: &str,
    insert_new: F,
) -> Result<i64>
where
    F: FnOnce(&Connection, &HeadMeta) -> Result<i64>,
{
    let meta = head_meta(conn, table, head_id)?;

    if meta.memory_space_id != space_id {
        return Err(CortexError::PermissionDenied(format!(
            "{} {} belongs to a different memory space",
            table.name, head_id
        )));
    }

    if let Some(successor) = meta.superseded_by {
        return Err(CortexError::Conflict(format!(
            "{} {} was already superseded by {}",
            table.name, head_id, successor
        )));
    }

    let new_id = insert_new(conn, &meta)?;

    let now = Utc::now().to_rfc3339();
    let patched = match table.supersede_end_column {
        Some(end_col) => conn.execute(
            &format!(
                "UPDATE {} SET superseded_by = ?, {} = ?, updated_at = ?
                 WHERE id = ? AND superseded_by IS NULL",
                table.name, end_col
            ),
            params![new_id, now, now, head_id],
        )?,
        None => conn.execute(
            &format!(
                "UPDATE {} SET superseded_by = ?, updated_at = ?
                 WHERE id = ? AND superseded_by IS NULL",
                table.name
            ),
            params![new_id, now, head_id],
        )?,
    };

    // Zero rows patched means another writer superseded the head between
    // the read above and this update.
    if patched == 0 {
        return Err(CortexError::Conflict(format!(
            "{} {} changed during revise",
            table.name, head_id
        )));
    }

    tracing::debug!(
        table = table.name,
        old_id = head_id,
        new_id,
        version = meta.version + 1,
        "revised versioned record"
    );

    Ok(new_id)
}

/// Soft-delete a row by stamping its end-of-validity marker
///
/// Idempotent: deleting an already-deleted row is a no-op. `NotFound` if
/// the id does not resolve, `PermissionDenied` on space mismatch.
pub fn soft_delete(
    conn: &Connection,
    table: VersionedTable,
    id: i64,
    space_id: &str,
) -> Result<()> {
    let meta = head_meta(conn, table, id)?;

    if meta.memory_space_id != space_id {
        return Err(CortexError::PermissionDenied(format!(
            "{} {} belongs to a different memory space",
            table.name, id
        )));
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        &format!(
            "UPDATE {} SET {} = ?, updated_at = ? WHERE id = ? AND {} IS NULL",
            table.name, table.delete_column, table.delete_column
        ),
        params![now, now, id],
    )?;

    Ok(())
}
