//! Fact store: versioned subject/predicate/object assertions
//!
//! "Update" never mutates a row: it inserts a successor and back-patches
//! the old head through the shared versioned primitive, so the full chain
//! stays queryable for audit. Default reads return heads only.

use chrono::Utc;
use rusqlite::{params, Connection, Row};

use crate::error::{CortexError, Result};
use crate::outbox;
use crate::storage::versioned::{self, FACTS};
use crate::storage::{parse_ts, parse_ts_opt};
use crate::types::{
    Fact, FactCategory, FactId, ListOptions, OutboxOperation, SearchHit, SearchOptions,
    SourceType, StoreFactInput, UpdateFactInput, MAX_CONTENT_BYTES,
};

pub(crate) fn fact_from_row(row: &Row) -> rusqlite::Result<Fact> {
    let category_str: String = row.get("category")?;
    let source_type_str: String = row.get("source_type")?;
    let tags_str: String = row.get("tags")?;
    let valid_from: String = row.get("valid_from")?;
    let valid_until: Option<String> = row.get("valid_until")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Fact {
        id: row.get("id")?,
        memory_space_id: row.get("memory_space_id")?,
        content: row.get("content")?,
        subject: row.get("subject")?,
        predicate: row.get("predicate")?,
        object: row.get("object")?,
        category: category_str.parse().unwrap_or(FactCategory::Custom),
        confidence: row.get("confidence")?,
        source_type: source_type_str.parse().unwrap_or(SourceType::Manual),
        source_ref: row.get("source_ref")?,
        tags: serde_json::from_str(&tags_str).unwrap_or_default(),
        version: row.get("version")?,
        supersedes: row.get("supersedes")?,
        superseded_by: row.get("superseded_by")?,
        valid_from: parse_ts(&valid_from),
        valid_until: parse_ts_opt(valid_until),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

pub(crate) const FACT_COLUMNS: &str =
    "id, memory_space_id, content, subject, predicate, object, category, confidence, \
     source_type, source_ref, tags, version, supersedes, superseded_by, \
     valid_from, valid_until, created_at, updated_at";

fn validate_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(CortexError::InvalidInput(
            "Fact content cannot be empty".to_string(),
        ));
    }
    if content.len() > MAX_CONTENT_BYTES {
        return Err(CortexError::InvalidInput(format!(
            "Fact content exceeds {} bytes",
            MAX_CONTENT_BYTES
        )));
    }
    Ok(())
}

fn validate_confidence(confidence: f64) -> Result<()> {
    if !(0.0..=100.0).contains(&confidence) {
        return Err(CortexError::InvalidInput(format!(
            "Confidence must be within [0, 100], got {}",
            confidence
        )));
    }
    Ok(())
}

fn enqueue_fact(conn: &Connection, fact: &Fact, op: OutboxOperation) -> Result<()> {
    let snapshot = serde_json::to_value(fact)?;
    outbox::enqueue(conn, "facts", &fact.id.to_string(), op, Some(&snapshot), 0)?;
    Ok(())
}

/// Store a new fact (version 1 of a fresh chain)
pub fn store(conn: &Connection, space_id: &str, input: &StoreFactInput) -> Result<Fact> {
    validate_content(&input.content)?;
    let confidence = input.confidence.unwrap_or(80.0);
    validate_confidence(confidence)?;

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO facts (memory_space_id, content, subject, predicate, object, category,
                            confidence, source_type, source_ref, tags,
                            valid_from, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            space_id,
            input.content,
            input.subject,
            input.predicate,
            input.object,
            input.category.as_str(),
            confidence,
            input.source_type.as_str(),
            input.source_ref,
            serde_json::to_string(&input.tags)?,
            now,
            now,
            now
        ],
    )?;
    let id = conn.last_insert_rowid();

    let fact = get_any(conn, id)?;
    enqueue_fact(conn, &fact, OutboxOperation::Insert)?;

    tracing::debug!(fact_id = id, space_id, "stored fact");
    Ok(fact)
}

/// Unscoped internal read (any version, any space)
fn get_any(conn: &Connection, id: FactId) -> Result<Fact> {
    let sql = format!("SELECT {} FROM facts WHERE id = ?", FACT_COLUMNS);
    match conn.query_row(&sql, params![id], fact_from_row) {
        Ok(fact) => Ok(fact),
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            Err(CortexError::NotFound(format!("fact {}", id)))
        }
        Err(e) => Err(e.into()),
    }
}

/// Get a fact by id, scoped to the given space
///
/// Returns None when the id is unknown or the row belongs to another
/// space; cross-tenant data never leaks through a read.
pub fn get(conn: &Connection, space_id: &str, id: FactId) -> Result<Option<Fact>> {
    match get_any(conn, id) {
        Ok(fact) if fact.memory_space_id == space_id => Ok(Some(fact)),
        Ok(_) => Ok(None),
        Err(CortexError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Revise a fact: new head row, old head marked superseded
///
/// Unset fields carry over from the current head. Fails with
/// `PermissionDenied` on space mismatch and retryable `Conflict` when the
/// head was superseded concurrently.
pub fn update(
    conn: &Connection,
    space_id: &str,
    id: FactId,
    patch: &UpdateFactInput,
) -> Result<Fact> {
    if let Some(ref content) = patch.content {
        validate_content(content)?;
    }
    if let Some(confidence) = patch.confidence {
        validate_confidence(confidence)?;
    }

    let old = get_any(conn, id)?;

    let new_id = versioned::revise(conn, FACTS, id, space_id, |conn, meta| {
        let now = Utc::now().to_rfc3339();
        let content = patch.content.as_deref().unwrap_or(&old.content);
        let subject = patch.subject.as_deref().or(old.subject.as_deref());
        let predicate = patch.predicate.as_deref().or(old.predicate.as_deref());
        let object = patch.object.as_deref().or(old.object.as_deref());
        let category = patch.category.unwrap_or(old.category);
        let confidence = patch.confidence.unwrap_or(old.confidence);
        let tags = patch.tags.as_ref().unwrap_or(&old.tags);

        conn.execute(
            "INSERT INTO facts (memory_space_id, content, subject, predicate, object, category,
                                confidence, source_type, source_ref, tags,
                                version, supersedes, valid_from, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                meta.memory_space_id,
                content,
                subject,
                predicate,
                object,
                category.as_str(),
                confidence,
                old.source_type.as_str(),
                old.source_ref,
                serde_json::to_string(tags)?,
                meta.version + 1,
                meta.id,
                now,
                now,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })?;

    let fact = get_any(conn, new_id)?;
    enqueue_fact(conn, &fact, OutboxOperation::Update)?;
    Ok(fact)
}

/// Soft-delete a fact head (`valid_until = now`); the row stays for audit
pub fn soft_delete(conn: &Connection, space_id: &str, id: FactId) -> Result<()> {
    versioned::soft_delete(conn, FACTS, id, space_id)?;
    let fact = get_any(conn, id)?;
    enqueue_fact(conn, &fact, OutboxOperation::Delete)?;
    Ok(())
}

fn push_filters(
    options: &ListOptions,
    sql: &mut String,
    params_vec: &mut Vec<Box<dyn rusqlite::ToSql>>,
) {
    if !options.include_superseded {
        sql.push_str(" AND superseded_by IS NULL AND valid_until IS NULL");
    }
    if let Some(category) = options.category {
        sql.push_str(" AND category = ?");
        params_vec.push(Box::new(category.as_str().to_string()));
    }
    if let Some(ref subject) = options.subject {
        sql.push_str(" AND subject = ?");
        params_vec.push(Box::new(subject.clone()));
    }
    if let Some(ref tags) = options.tags {
        for tag in tags {
            sql.push_str(" AND EXISTS (SELECT 1 FROM json_each(tags) WHERE json_each.value = ?)");
            params_vec.push(Box::new(tag.clone()));
        }
    }
}

/// List facts in a space, newest first; heads only unless
/// `include_superseded` is set
pub fn list(conn: &Connection, space_id: &str, options: &ListOptions) -> Result<Vec<Fact>> {
    let mut sql = format!(
        "SELECT {} FROM facts WHERE memory_space_id = ?",
        FACT_COLUMNS
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(space_id.to_string())];

    push_filters(options, &mut sql, &mut params_vec);

    sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?");
    params_vec.push(Box::new(options.limit.unwrap_or(100)));
    params_vec.push(Box::new(options.offset.unwrap_or(0)));

    let params_ref: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let facts = stmt
        .query_map(params_ref.as_slice(), fact_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(facts)
}

/// Entity-centric lookup over the `(memory_space_id, subject)` index
pub fn query_by_subject(
    conn: &Connection,
    space_id: &str,
    subject: &str,
    include_superseded: bool,
) -> Result<Vec<Fact>> {
    let options = ListOptions {
        subject: Some(subject.to_string()),
        include_superseded,
        ..Default::default()
    };
    list(conn, space_id, &options)
}

/// Escape a user query for FTS5: each whitespace token becomes a quoted
/// phrase, combined with implicit AND
pub(crate) fn fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Full-text search over fact content, restricted to one space
///
/// BM25 ranks (fts5 returns lower-is-better negatives; we flip the sign).
pub fn search(
    conn: &Connection,
    space_id: &str,
    query: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchHit<Fact>>> {
    let match_expr = fts_query(query);
    if match_expr.is_empty() {
        return Ok(vec![]);
    }

    // Columns qualified: both facts and facts_fts carry a `content` column
    let qualified = FACT_COLUMNS
        .split(", ")
        .map(|c| format!("facts.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "SELECT {}, bm25(facts_fts) AS rank
         FROM facts_fts
         JOIN facts ON facts.id = facts_fts.rowid
         WHERE facts_fts MATCH ?
           AND memory_space_id = ?
           AND superseded_by IS NULL AND valid_until IS NULL",
        qualified
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![
        Box::new(match_expr),
        Box::new(space_id.to_string()),
    ];

    if let Some(category) = options.category {
        sql.push_str(" AND category = ?");
        params_vec.push(Box::new(category.as_str().to_string()));
    }
    if let Some(ref tags) = options.tags {
        for tag in tags {
            sql.push_str(" AND EXISTS (SELECT 1 FROM json_each(tags) WHERE json_each.value = ?)");
            params_vec.push(Box::new(tag.clone()));
        }
    }

    sql.push_str(" ORDER BY rank LIMIT ?");
    params_vec.push(Box::new(options.limit.unwrap_or(20)));

    let params_ref: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let hits = stmt
        .query_map(params_ref.as_slice(), |row| {
            let fact = fact_from_row(row)?;
            let rank: f64 = row.get("rank")?;
            Ok(SearchHit {
                entry: fact,
                score: -rank,
                text_score: Some(-rank),
                semantic_score: None,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let min_score = options.min_score.unwrap_or(f64::MIN);
    Ok(hits.into_iter().filter(|h| h.score >= min_score).collect())
}

/// Bulk delete for cleanup; soft by default, hard when `hard` is set
///
/// Returns the number of rows affected. One outbox entry is enqueued per
/// affected row so the external index can evict them.
pub fn delete_many(
    conn: &Connection,
    space_id: &str,
    options: &ListOptions,
    hard: bool,
) -> Result<usize> {
    let mut sql = format!(
        "SELECT {} FROM facts WHERE memory_space_id = ?",
        FACT_COLUMNS
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(space_id.to_string())];
    push_filters(options, &mut sql, &mut params_vec);

    let params_ref: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let victims = stmt
        .query_map(params_ref.as_slice(), fact_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let now = Utc::now().to_rfc3339();
    for fact in &victims {
        if hard {
            conn.execute("DELETE FROM facts WHERE id = ?", params![fact.id])?;
        } else {
            conn.execute(
                "UPDATE facts SET valid_until = ?, updated_at = ? WHERE id = ? AND valid_until IS NULL",
                params![now, now, fact.id],
            )?;
        }
        outbox::enqueue(
            conn,
            "facts",
            &fact.id.to_string(),
            OutboxOperation::Delete,
            None,
            0,
        )?;
    }

    Ok(victims.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::pending_count;
    use crate::storage::Storage;

    fn test_storage() -> Storage {
        Storage::open_in_memory().unwrap()
    }

    fn sample_input(content: &str) -> StoreFactInput {
        StoreFactInput {
            content: content.to_string(),
            subject: Some("user".to_string()),
            confidence: Some(90.0),
            ..Default::default()
        }
    }

    #[test]
    fn test_store_and_get_scoped() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let fact = store(conn, "s1", &sample_input("User prefers dark mode"))?;
                assert_eq!(fact.version, 1);
                assert!(fact.is_head());

                assert!(get(conn, "s1", fact.id)?.is_some());
                // Foreign space reads as absent, not as an error
                assert!(get(conn, "s2", fact.id)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_update_builds_supersede_chain() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let f1 = store(conn, "s1", &sample_input("User prefers dark mode"))?;
                let f2 = update(
                    conn,
                    "s1",
                    f1.id,
                    &UpdateFactInput {
                        content: Some("User strongly prefers dark mode".to_string()),
                        confidence: Some(95.0),
                        ..Default::default()
                    },
                )?;

                assert_eq!(f2.version, 2);
                assert_eq!(f2.supersedes, Some(f1.id));
                assert_eq!(f2.confidence, 95.0);
                // Carried over from the head
                assert_eq!(f2.subject.as_deref(), Some("user"));

                let f1 = get(conn, "s1", f1.id)?.unwrap();
                assert_eq!(f1.superseded_by, Some(f2.id));
                assert!(f1.valid_until.is_some());

                // Default list shows the head only
                let heads = list(conn, "s1", &ListOptions::default())?;
                assert_eq!(heads.len(), 1);
                assert_eq!(heads[0].id, f2.id);

                let all = list(
                    conn,
                    "s1",
                    &ListOptions {
                        include_superseded: true,
                        ..Default::default()
                    },
                )?;
                assert_eq!(all.len(), 2);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_update_space_mismatch_denied() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let f1 = store(conn, "s1", &sample_input("fact"))?;
                let err = update(conn, "s2", f1.id, &UpdateFactInput::default()).unwrap_err();
                assert!(matches!(err, CortexError::PermissionDenied(_)));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_confidence_validation() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let mut input = sample_input("fact");
                input.confidence = Some(120.0);
                let err = store(conn, "s1", &input).unwrap_err();
                assert!(matches!(err, CortexError::InvalidInput(_)));

                input.confidence = Some(-1.0);
                assert!(store(conn, "s1", &input).is_err());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_query_by_subject() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                store(conn, "s1", &sample_input("User prefers dark mode"))?;
                let mut other = sample_input("Deploy happens on Fridays");
                other.subject = Some("deploys".to_string());
                store(conn, "s1", &other)?;

                let user_facts = query_by_subject(conn, "s1", "user", false)?;
                assert_eq!(user_facts.len(), 1);
                assert!(user_facts[0].content.contains("dark mode"));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_search_scoped_to_space() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                store(conn, "s1", &sample_input("User prefers dark mode themes"))?;
                store(conn, "s2", &sample_input("dark mode everywhere"))?;

                let hits = search(conn, "s1", "dark mode", &SearchOptions::default())?;
                assert_eq!(hits.len(), 1);
                assert_eq!(hits[0].entry.memory_space_id, "s1");
                assert!(hits[0].text_score.is_some());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_search_excludes_superseded() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let f1 = store(conn, "s1", &sample_input("User prefers dark mode"))?;
                update(
                    conn,
                    "s1",
                    f1.id,
                    &UpdateFactInput {
                        content: Some("User prefers light mode now".to_string()),
                        ..Default::default()
                    },
                )?;

                let hits = search(conn, "s1", "dark", &SearchOptions::default())?;
                assert!(hits.is_empty());
                let hits = search(conn, "s1", "light", &SearchOptions::default())?;
                assert_eq!(hits.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_delete_many_counts_and_enqueues() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                store(conn, "s1", &sample_input("a"))?;
                store(conn, "s1", &sample_input("b"))?;
                store(conn, "s2", &sample_input("c"))?;
                let before = pending_count(conn)?;

                let deleted = delete_many(conn, "s1", &ListOptions::default(), false)?;
                assert_eq!(deleted, 2);
                assert_eq!(pending_count(conn)?, before + 2);

                // Soft-deleted rows drop out of default lists
                assert!(list(conn, "s1", &ListOptions::default())?.is_empty());
                // Other space untouched
                assert_eq!(list(conn, "s2", &ListOptions::default())?.len(), 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_every_mutation_enqueues_one_entry() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let f1 = store(conn, "s1", &sample_input("fact"))?;
                assert_eq!(pending_count(conn)?, 1);
                let f2 = update(conn, "s1", f1.id, &UpdateFactInput::default())?;
                assert_eq!(pending_count(conn)?, 2);
                soft_delete(conn, "s1", f2.id)?;
                assert_eq!(pending_count(conn)?, 3);
                Ok(())
            })
            .unwrap();
    }
}
