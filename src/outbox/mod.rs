//! Replication outbox
//!
//! Durable queue of pending changes to the external graph index. Every
//! mutating operation in the store enqueues one entry inside its own
//! transaction; an asynchronous consumer drains entries and marks them
//! synced only after the index confirms receipt. Delivery is at-least-once
//! and entries are never silently dropped — retry bookkeeping
//! (`failed_attempts`, `last_error`) is kept per entry and dead-letter
//! policy belongs to the consumer.

mod worker;

pub use worker::{OutboxWorker, OutboxWorkerConfig};

use chrono::Utc;
use rusqlite::{params, Connection, Row};

use crate::error::{CortexError, Result};
use crate::storage::{parse_ts, parse_ts_opt, Storage};
use crate::types::{OutboxEntry, OutboxId, OutboxOperation, OutboxStatus};

/// Delivery seam to the external graph index
///
/// Consumers must treat delivery as idempotent; the same entry may be
/// offered more than once after a crash or retry.
pub trait GraphIndexSink: Send + Sync {
    fn try_deliver(&self, entry: &OutboxEntry) -> Result<()>;
}

/// Outcome of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
}

fn entry_from_row(row: &Row) -> rusqlite::Result<OutboxEntry> {
    let operation_str: String = row.get("operation")?;
    let status_str: String = row.get("status")?;
    let snapshot_str: Option<String> = row.get("snapshot")?;
    let created_at: String = row.get("created_at")?;
    let synced_at: Option<String> = row.get("synced_at")?;

    Ok(OutboxEntry {
        id: row.get("id")?,
        table: row.get("entity_table")?,
        entity_id: row.get("entity_id")?,
        operation: operation_str.parse().unwrap_or(OutboxOperation::Update),
        snapshot: snapshot_str.and_then(|s| serde_json::from_str(&s).ok()),
        status: status_str.parse().unwrap_or(OutboxStatus::Pending),
        synced_at: parse_ts_opt(synced_at),
        failed_attempts: row.get("failed_attempts")?,
        last_error: row.get("last_error")?,
        priority: row.get("priority")?,
        created_at: parse_ts(&created_at),
    })
}

const ENTRY_COLUMNS: &str = "id, entity_table, entity_id, operation, snapshot, status, \
     synced_at, failed_attempts, last_error, priority, created_at";

/// Enqueue one replication entry
///
/// Called synchronously by every mutating store operation, inside the same
/// transaction as the mutation itself.
pub fn enqueue(
    conn: &Connection,
    table: &str,
    entity_id: &str,
    operation: OutboxOperation,
    snapshot: Option<&serde_json::Value>,
    priority: i32,
) -> Result<OutboxId> {
    let now = Utc::now().to_rfc3339();
    let snapshot_str = snapshot.map(|s| s.to_string());

    conn.execute(
        "INSERT INTO outbox (entity_table, entity_id, operation, snapshot, priority, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![table, entity_id, operation.as_str(), snapshot_str, priority, now],
    )?;

    Ok(conn.last_insert_rowid())
}

/// Get one entry by id
pub fn get(conn: &Connection, id: OutboxId) -> Result<OutboxEntry> {
    let sql = format!("SELECT {} FROM outbox WHERE id = ?", ENTRY_COLUMNS);
    match conn.query_row(&sql, params![id], entry_from_row) {
        Ok(entry) => Ok(entry),
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            Err(CortexError::NotFound(format!("outbox {}", id)))
        }
        Err(e) => Err(e.into()),
    }
}

/// Number of entries not yet synced
pub fn pending_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outbox WHERE status != 'synced'",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// List unsynced entries in drain order without claiming them
pub fn list_pending(conn: &Connection, limit: i64) -> Result<Vec<OutboxEntry>> {
    let sql = format!(
        "SELECT {} FROM outbox WHERE status = 'pending'
         ORDER BY priority DESC, created_at ASC, id ASC LIMIT ?",
        ENTRY_COLUMNS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let entries = stmt
        .query_map(params![limit], entry_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Claim a batch of pending entries, marking them `syncing`
pub fn claim_batch(conn: &Connection, batch_size: i64) -> Result<Vec<OutboxEntry>> {
    let entries = list_pending(conn, batch_size)?;

    for entry in &entries {
        conn.execute(
            "UPDATE outbox SET status = 'syncing' WHERE id = ? AND status = 'pending'",
            params![entry.id],
        )?;
    }

    Ok(entries)
}

/// Mark a claimed entry delivered
pub fn mark_synced(conn: &Connection, id: OutboxId) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE outbox SET status = 'synced', synced_at = ?, last_error = NULL WHERE id = ?",
        params![now, id],
    )?;
    Ok(())
}

/// Record a delivery failure and return the entry to `pending` for retry
pub fn mark_failed(conn: &Connection, id: OutboxId, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE outbox SET status = 'pending',
                failed_attempts = failed_attempts + 1,
                last_error = ?
         WHERE id = ?",
        params![error, id],
    )?;
    Ok(())
}

/// Return all `syncing` entries to `pending`
///
/// Run on consumer startup and cancellation so an interrupted drain never
/// strands claimed entries.
pub fn release_claimed(conn: &Connection) -> Result<usize> {
    let released = conn.execute(
        "UPDATE outbox SET status = 'pending' WHERE status = 'syncing'",
        [],
    )?;
    Ok(released)
}

/// Drop synced entries older than the given number of days; maintenance
/// only, the drain path never deletes
pub fn purge_synced(conn: &Connection, older_than_days: i64) -> Result<usize> {
    let cutoff = (Utc::now() - chrono::Duration::days(older_than_days)).to_rfc3339();
    let purged = conn.execute(
        "DELETE FROM outbox WHERE status = 'synced' AND synced_at < ?",
        params![cutoff],
    )?;
    Ok(purged)
}

/// One synchronous drain pass: claim up to `batch_size` entries, attempt
/// delivery, and record the outcome per entry
///
/// Failures are recorded and retried on a later pass, never surfaced to
/// the writer that originally enqueued the entry.
pub fn drain(storage: &Storage, sink: &dyn GraphIndexSink, batch_size: i64) -> Result<DrainReport> {
    let entries = storage.with_transaction(|conn| claim_batch(conn, batch_size))?;

    let mut report = DrainReport::default();

    for entry in entries {
        match sink.try_deliver(&entry) {
            Ok(()) => {
                storage.with_transaction(|conn| mark_synced(conn, entry.id))?;
                report.delivered += 1;
            }
            Err(e) => {
                tracing::warn!(
                    outbox_id = entry.id,
                    entity_table = %entry.table,
                    entity_id = %entry.entity_id,
                    error = %e,
                    "outbox delivery failed, will retry"
                );
                storage.with_transaction(|conn| mark_failed(conn, entry.id, &e.to_string()))?;
                report.failed += 1;
            }
        }
    }

    if report.delivered > 0 || report.failed > 0 {
        tracing::debug!(
            delivered = report.delivered,
            failed = report.failed,
            "outbox drain pass complete"
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSink {
        delivered: AtomicUsize,
        fail_first: AtomicUsize,
    }

    impl RecordingSink {
        fn new(fail_first: usize) -> Self {
            Self {
                delivered: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(fail_first),
            }
        }
    }

    impl GraphIndexSink for RecordingSink {
        fn try_deliver(&self, _entry: &OutboxEntry) -> Result<()> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(CortexError::DependencyUnavailable(
                    "graph index unreachable".to_string(),
                ));
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_storage() -> Storage {
        Storage::open_in_memory().unwrap()
    }

    #[test]
    fn test_enqueue_and_drain_order() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                enqueue(conn, "facts", "1", OutboxOperation::Insert, None, 0)?;
                enqueue(conn, "facts", "2", OutboxOperation::Insert, None, 0)?;
                enqueue(conn, "contexts", "9", OutboxOperation::Update, None, 5)?;
                Ok(())
            })
            .unwrap();

        let pending = storage
            .with_connection(|conn| list_pending(conn, 10))
            .unwrap();
        // Priority first, then creation order
        assert_eq!(pending[0].entity_id, "9");
        assert_eq!(pending[1].entity_id, "1");
        assert_eq!(pending[2].entity_id, "2");

        let sink = RecordingSink::new(0);
        let report = drain(&storage, &sink, 10).unwrap();
        assert_eq!(report, DrainReport { delivered: 3, failed: 0 });

        let remaining = storage.with_connection(|conn| pending_count(conn)).unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_failure_keeps_entry_for_retry() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                enqueue(conn, "memories", "7", OutboxOperation::Insert, None, 0)
            })
            .unwrap();

        let sink = RecordingSink::new(1);
        let report = drain(&storage, &sink, 10).unwrap();
        assert_eq!(report.failed, 1);

        let entry = storage
            .with_connection(|conn| list_pending(conn, 10))
            .unwrap()
            .remove(0);
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert_eq!(entry.failed_attempts, 1);
        assert!(entry.last_error.as_deref().unwrap().contains("unreachable"));

        // Retry succeeds and clears the error
        let report = drain(&storage, &sink, 10).unwrap();
        assert_eq!(report.delivered, 1);
        let entry = storage
            .with_connection(|conn| get(conn, entry.id))
            .unwrap();
        assert!(entry.is_synced());
        assert!(entry.last_error.is_none());
        assert!(entry.synced_at.is_some());
    }

    #[test]
    fn test_release_claimed() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                enqueue(conn, "facts", "1", OutboxOperation::Insert, None, 0)?;
                claim_batch(conn, 10)?;
                Ok(())
            })
            .unwrap();

        // Claimed entries are invisible to list_pending until released
        let pending = storage
            .with_connection(|conn| list_pending(conn, 10))
            .unwrap();
        assert!(pending.is_empty());

        let released = storage
            .with_transaction(|conn| release_claimed(conn))
            .unwrap();
        assert_eq!(released, 1);
        let pending = storage
            .with_connection(|conn| list_pending(conn, 10))
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let storage = test_storage();
        let snapshot = serde_json::json!({"content": "User prefers dark mode", "confidence": 90});
        let id = storage
            .with_transaction(|conn| {
                enqueue(
                    conn,
                    "facts",
                    "42",
                    OutboxOperation::Insert,
                    Some(&snapshot),
                    0,
                )
            })
            .unwrap();

        let entry = storage.with_connection(|conn| get(conn, id)).unwrap();
        assert_eq!(entry.snapshot.unwrap()["confidence"], 90);
    }

    #[test]
    fn test_purge_synced_only() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                enqueue(conn, "facts", "1", OutboxOperation::Insert, None, 0)?;
                enqueue(conn, "facts", "2", OutboxOperation::Insert, None, 0)?;
                Ok(())
            })
            .unwrap();

        let sink = RecordingSink::new(0);
        drain(&storage, &sink, 1).unwrap();

        // Nothing young enough to purge, and pending entries are never touched
        let purged = storage
            .with_transaction(|conn| purge_synced(conn, 1))
            .unwrap();
        assert_eq!(purged, 0);
        let purged = storage
            .with_transaction(|conn| purge_synced(conn, -1))
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(
            storage.with_connection(|conn| pending_count(conn)).unwrap(),
            1
        );
    }
}
