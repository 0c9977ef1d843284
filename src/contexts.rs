//! Hierarchical context tree
//!
//! Contexts coordinate multi-agent work: each node carries a purpose, a
//! parent link, derived `depth`/`root_id`, a status state machine, and
//! cross-space access grants. Grants are the only sanctioned way to see
//! another space's contexts; every other read path stays inside one space.

use chrono::Utc;
use rusqlite::{params, Connection, Row};

use crate::error::{CortexError, Result};
use crate::outbox;
use crate::storage::{parse_ts, parse_ts_opt};
use crate::types::{
    AccessGrant, Context, ContextId, ContextRevision, ContextStatus, GrantScope, OutboxOperation,
    Participant,
};

fn context_from_row(row: &Row) -> rusqlite::Result<Context> {
    let status_str: String = row.get("status")?;
    let child_ids_str: String = row.get("child_ids")?;
    let participants_str: String = row.get("participants")?;
    let granted_str: String = row.get("granted_access")?;
    let previous_str: String = row.get("previous_versions")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Context {
        context_id: row.get("id")?,
        memory_space_id: row.get("memory_space_id")?,
        purpose: row.get("purpose")?,
        parent_id: row.get("parent_id")?,
        root_id: row.get("root_id")?,
        depth: row.get("depth")?,
        child_ids: serde_json::from_str(&child_ids_str).unwrap_or_default(),
        status: status_str.parse().unwrap_or(ContextStatus::Active),
        participants: serde_json::from_str(&participants_str).unwrap_or_default(),
        granted_access: serde_json::from_str(&granted_str).unwrap_or_default(),
        version: row.get("version")?,
        previous_versions: serde_json::from_str(&previous_str).unwrap_or_default(),
        completed_at: parse_ts_opt(completed_at),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

const CONTEXT_COLUMNS: &str =
    "id, memory_space_id, purpose, parent_id, root_id, depth, child_ids, status, \
     participants, granted_access, version, previous_versions, \
     completed_at, created_at, updated_at";

fn get_any(conn: &Connection, id: ContextId) -> Result<Option<Context>> {
    let sql = format!("SELECT {} FROM contexts WHERE id = ?", CONTEXT_COLUMNS);
    match conn.query_row(&sql, params![id], context_from_row) {
        Ok(ctx) => Ok(Some(ctx)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn visible_from(ctx: &Context, space_id: &str) -> bool {
    ctx.memory_space_id == space_id
        || ctx
            .granted_access
            .iter()
            .any(|g| g.memory_space_id == space_id)
}

/// Get a context visible from the given space
///
/// Visible means same-space or carrying an access grant for the caller's
/// space; everything else reads as absent.
pub fn get(conn: &Connection, space_id: &str, id: ContextId) -> Result<Option<Context>> {
    Ok(get_any(conn, id)?.filter(|ctx| visible_from(ctx, space_id)))
}

fn require(conn: &Connection, space_id: &str, id: ContextId) -> Result<Context> {
    get(conn, space_id, id)?.ok_or_else(|| CortexError::NotFound(format!("context {}", id)))
}

fn writable_from(ctx: &Context, space_id: &str) -> bool {
    ctx.memory_space_id == space_id
        || ctx
            .granted_access
            .iter()
            .any(|g| g.memory_space_id == space_id && g.scope == GrantScope::ReadWrite)
}

fn enqueue_context(conn: &Connection, ctx: &Context, op: OutboxOperation) -> Result<()> {
    let snapshot = serde_json::to_value(ctx)?;
    outbox::enqueue(
        conn,
        "contexts",
        &ctx.context_id.to_string(),
        op,
        Some(&snapshot),
        0,
    )?;
    Ok(())
}

/// Walk the parent chain to the root, rejecting broken or circular links
fn check_ancestry(conn: &Connection, parent: &Context) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    seen.insert(parent.context_id);

    let mut current = parent.parent_id;
    while let Some(id) = current {
        if !seen.insert(id) {
            return Err(CortexError::CycleDetected(id));
        }
        match get_any(conn, id)? {
            Some(ancestor) => current = ancestor.parent_id,
            // A dangling link upward means the chain cannot terminate
            None => return Err(CortexError::CycleDetected(id)),
        }
    }
    Ok(())
}

/// Create a context, optionally under a parent
///
/// The parent must exist and be in the caller's space or carry a grant
/// for it. `depth` and `root_id` derive from the parent; the parent's
/// `child_ids` is updated in the same transaction and republished to the
/// outbox alongside the child's own entry, so the external index never
/// sees a child its parent does not link to.
pub fn create(
    conn: &Connection,
    space_id: &str,
    purpose: &str,
    parent_id: Option<ContextId>,
    participants: Vec<Participant>,
) -> Result<Context> {
    if purpose.trim().is_empty() {
        return Err(CortexError::InvalidInput(
            "Context purpose cannot be empty".to_string(),
        ));
    }

    let parent = match parent_id {
        Some(pid) => {
            let parent = get_any(conn, pid)?
                .ok_or_else(|| CortexError::NotFound(format!("context {}", pid)))?;
            if !visible_from(&parent, space_id) {
                return Err(CortexError::PermissionDenied(format!(
                    "context {} is not visible from space {}",
                    pid, space_id
                )));
            }
            check_ancestry(conn, &parent)?;
            Some(parent)
        }
        None => None,
    };

    let now = Utc::now().to_rfc3339();
    let (depth, root_id) = match &parent {
        Some(p) => (p.depth + 1, p.root_id),
        None => (0, 0),
    };

    conn.execute(
        "INSERT INTO contexts (memory_space_id, purpose, parent_id, root_id, depth,
                               participants, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            space_id,
            purpose,
            parent_id,
            root_id,
            depth,
            serde_json::to_string(&participants)?,
            now,
            now
        ],
    )?;
    let id = conn.last_insert_rowid();

    // Roots are their own root; the id only exists after the insert
    if parent.is_none() {
        conn.execute("UPDATE contexts SET root_id = ? WHERE id = ?", params![id, id])?;
    }

    if let Some(p) = &parent {
        let mut child_ids = p.child_ids.clone();
        child_ids.push(id);
        conn.execute(
            "UPDATE contexts SET child_ids = ?, updated_at = ? WHERE id = ?",
            params![serde_json::to_string(&child_ids)?, now, p.context_id],
        )?;
        let parent = require(conn, space_id, p.context_id)?;
        enqueue_context(conn, &parent, OutboxOperation::Update)?;
    }

    let ctx = require(conn, space_id, id)?;
    enqueue_context(conn, &ctx, OutboxOperation::Insert)?;

    tracing::debug!(context_id = id, space_id, depth, "created context");
    Ok(ctx)
}

/// List contexts owned by a space, roots first then by depth
pub fn list(conn: &Connection, space_id: &str, limit: i64) -> Result<Vec<Context>> {
    let sql = format!(
        "SELECT {} FROM contexts WHERE memory_space_id = ?
         ORDER BY depth ASC, id ASC LIMIT ?",
        CONTEXT_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let contexts = stmt
        .query_map(params![space_id, limit], context_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(contexts)
}

/// Grant another space visibility into a context
///
/// Idempotent per target space; re-granting updates the scope in place.
pub fn grant_access(
    conn: &Connection,
    space_id: &str,
    context_id: ContextId,
    target_space_id: &str,
    scope: GrantScope,
) -> Result<Context> {
    let mut ctx = require(conn, space_id, context_id)?;
    if ctx.memory_space_id != space_id {
        // Only the owning space hands out grants
        return Err(CortexError::PermissionDenied(format!(
            "context {} is owned by space {}",
            context_id, ctx.memory_space_id
        )));
    }

    let now = Utc::now();
    match ctx
        .granted_access
        .iter_mut()
        .find(|g| g.memory_space_id == target_space_id)
    {
        Some(existing) => existing.scope = scope,
        None => ctx.granted_access.push(AccessGrant {
            memory_space_id: target_space_id.to_string(),
            scope,
            granted_at: now,
        }),
    }

    conn.execute(
        "UPDATE contexts SET granted_access = ?, updated_at = ? WHERE id = ?",
        params![
            serde_json::to_string(&ctx.granted_access)?,
            now.to_rfc3339(),
            context_id
        ],
    )?;

    let ctx = require(conn, space_id, context_id)?;
    enqueue_context(conn, &ctx, OutboxOperation::Update)?;

    tracing::info!(context_id, target_space = target_space_id, "granted cross-space access");
    Ok(ctx)
}

/// Move a context through its status state machine
///
/// Each legal transition appends the prior `{version, status}` to
/// `previous_versions` and bumps `version`. Terminal states stay put.
/// Only the owning space or a `ReadWrite` grantee may transition; a plain
/// `Read` grant sees the context but cannot move it.
pub fn transition(
    conn: &Connection,
    space_id: &str,
    context_id: ContextId,
    new_status: ContextStatus,
) -> Result<Context> {
    let ctx = require(conn, space_id, context_id)?;

    if !writable_from(&ctx, space_id) {
        return Err(CortexError::PermissionDenied(format!(
            "space {} has read-only access to context {}",
            space_id, context_id
        )));
    }

    if !ctx.status.can_transition_to(new_status) {
        return Err(CortexError::InvalidTransition {
            from: ctx.status.as_str().to_string(),
            to: new_status.as_str().to_string(),
        });
    }

    let now = Utc::now();
    let mut history = ctx.previous_versions.clone();
    history.push(ContextRevision {
        version: ctx.version,
        status: ctx.status,
        at: now,
    });

    conn.execute(
        "UPDATE contexts
         SET status = ?, version = version + 1, previous_versions = ?,
             completed_at = ?, updated_at = ?
         WHERE id = ?",
        params![
            new_status.as_str(),
            serde_json::to_string(&history)?,
            if new_status == ContextStatus::Completed {
                Some(now.to_rfc3339())
            } else {
                None
            },
            now.to_rfc3339(),
            context_id
        ],
    )?;

    let ctx = require(conn, space_id, context_id)?;
    enqueue_context(conn, &ctx, OutboxOperation::Update)?;

    tracing::debug!(context_id, status = new_status.as_str(), "context transitioned");
    Ok(ctx)
}

/// Complete a context, stamping `completed_at`
pub fn complete(conn: &Connection, space_id: &str, context_id: ContextId) -> Result<Context> {
    transition(conn, space_id, context_id, ContextStatus::Completed)
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
    fn test_root_and_child_geometry() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let c1 = create(conn, "s1", "ship release", None, vec![])?;
                assert_eq!(c1.depth, 0);
                assert_eq!(c1.root_id, c1.context_id);
                assert_eq!(c1.status, ContextStatus::Active);

                let c2 = create(conn, "s1", "write changelog", Some(c1.context_id), vec![])?;
                assert_eq!(c2.depth, 1);
                assert_eq!(c2.root_id, c1.context_id);

                let c3 = create(conn, "s1", "review changelog", Some(c2.context_id), vec![])?;
                assert_eq!(c3.depth, 2);
                assert_eq!(c3.root_id, c1.context_id);

                let c1 = get(conn, "s1", c1.context_id)?.unwrap();
                assert_eq!(c1.child_ids, vec![c2.context_id]);
                let c2 = get(conn, "s1", c2.context_id)?.unwrap();
                assert_eq!(c2.child_ids, vec![c3.context_id]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_parent_in_foreign_space_needs_grant() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let parent = create(conn, "s1", "cross-team effort", None, vec![])?;

                let err =
                    create(conn, "s2", "sub task", Some(parent.context_id), vec![]).unwrap_err();
                assert!(matches!(err, CortexError::PermissionDenied(_)));

                grant_access(conn, "s1", parent.context_id, "s2", GrantScope::Read)?;
                let child = create(conn, "s2", "sub task", Some(parent.context_id), vec![])?;
                assert_eq!(child.memory_space_id, "s2");
                assert_eq!(child.root_id, parent.context_id);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_grant_visibility() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let ctx = create(conn, "s1", "shared", None, vec![])?;
                assert!(get(conn, "s2", ctx.context_id)?.is_none());

                grant_access(conn, "s1", ctx.context_id, "s2", GrantScope::Read)?;
                assert!(get(conn, "s2", ctx.context_id)?.is_some());

                // Granted spaces still cannot re-grant
                let err = grant_access(conn, "s2", ctx.context_id, "s3", GrantScope::Read)
                    .unwrap_err();
                assert!(matches!(err, CortexError::PermissionDenied(_)));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_read_grant_cannot_transition() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let ctx = create(conn, "owner", "shared plan", None, vec![])?;
                grant_access(conn, "owner", ctx.context_id, "guest", GrantScope::Read)?;

                // A read grant sees the context but cannot move it
                let err = transition(conn, "guest", ctx.context_id, ContextStatus::Cancelled)
                    .unwrap_err();
                assert!(matches!(err, CortexError::PermissionDenied(_)));
                let ctx = get(conn, "guest", ctx.context_id)?.unwrap();
                assert_eq!(ctx.status, ContextStatus::Active);

                grant_access(conn, "owner", ctx.context_id, "guest", GrantScope::ReadWrite)?;
                let ctx = transition(conn, "guest", ctx.context_id, ContextStatus::Cancelled)?;
                assert_eq!(ctx.status, ContextStatus::Cancelled);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_status_state_machine() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let ctx = create(conn, "s1", "task", None, vec![])?;

                let ctx = transition(conn, "s1", ctx.context_id, ContextStatus::Blocked)?;
                assert_eq!(ctx.status, ContextStatus::Blocked);
                assert_eq!(ctx.version, 2);
                assert_eq!(ctx.previous_versions.len(), 1);
                assert_eq!(ctx.previous_versions[0].status, ContextStatus::Active);

                // Blocked cannot complete directly
                let err = transition(conn, "s1", ctx.context_id, ContextStatus::Completed)
                    .unwrap_err();
                assert!(matches!(err, CortexError::InvalidTransition { .. }));

                let ctx = transition(conn, "s1", ctx.context_id, ContextStatus::Active)?;
                let ctx = complete(conn, "s1", ctx.context_id)?;
                assert_eq!(ctx.status, ContextStatus::Completed);
                assert!(ctx.completed_at.is_some());
                assert_eq!(ctx.version, 4);

                // Terminal states do not revert
                let err = transition(conn, "s1", ctx.context_id, ContextStatus::Active)
                    .unwrap_err();
                assert!(matches!(err, CortexError::InvalidTransition { .. }));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_broken_ancestry_detected() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let c1 = create(conn, "s1", "a", None, vec![])?;
                let c2 = create(conn, "s1", "b", Some(c1.context_id), vec![])?;

                // Corrupt the chain into a cycle
                conn.execute(
                    "UPDATE contexts SET parent_id = ? WHERE id = ?",
                    params![c2.context_id, c1.context_id],
                )?;

                let err = create(conn, "s1", "c", Some(c2.context_id), vec![]).unwrap_err();
                assert!(matches!(err, CortexError::CycleDetected(_)));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_mutations_enqueue_outbox() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let c1 = create(conn, "s1", "root", None, vec![])?;
                assert_eq!(pending_count(conn)?, 1);

                // Child create also republishes the parent's child_ids
                create(conn, "s1", "child", Some(c1.context_id), vec![])?;
                assert_eq!(pending_count(conn)?, 3);

                transition(conn, "s1", c1.context_id, ContextStatus::Blocked)?;
                assert_eq!(pending_count(conn)?, 4);
                Ok(())
            })
            .unwrap();
    }
}
