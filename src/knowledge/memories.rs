//! Memory store: versioned experiential records with optional embeddings
//!
//! Same supersede discipline as facts, plus an inline `previous_versions`
//! history carried on the head for cheap "show me the edits" reads.
//! Embeddings are supplied by the caller and validated against the
//! configured dimension; search is FTS-first with optional cosine
//! re-ranking over the candidate set.

use chrono::Utc;
use rusqlite::{params, Connection, Row};

use crate::embedding::{self, check_dimensions, cosine_similarity};
use crate::error::{CortexError, Result};
use crate::outbox;
use crate::storage::versioned::{self, MEMORIES};
use crate::storage::{parse_ts, parse_ts_opt};
use crate::types::{
    ListOptions, Memory, MemoryId, MemoryKind, MemoryRevision, OutboxOperation, SearchHit,
    SearchOptions, SourceType, StoreMemoryInput, UpdateMemoryInput, MAX_CONTENT_BYTES,
};

pub(crate) fn memory_from_row(row: &Row) -> rusqlite::Result<Memory> {
    let kind_str: String = row.get("kind")?;
    let source_type_str: String = row.get("source_type")?;
    let tags_str: String = row.get("tags")?;
    let embedding_blob: Option<Vec<u8>> = row.get("embedding")?;
    let previous_str: String = row.get("previous_versions")?;
    let deleted_at: Option<String> = row.get("deleted_at")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(Memory {
        id: row.get("id")?,
        memory_space_id: row.get("memory_space_id")?,
        content: row.get("content")?,
        kind: kind_str.parse().unwrap_or(MemoryKind::Semantic),
        importance: row.get("importance")?,
        source_type: source_type_str.parse().unwrap_or(SourceType::Manual),
        source_ref: row.get("source_ref")?,
        tags: serde_json::from_str(&tags_str).unwrap_or_default(),
        embedding: embedding_blob.map(|b| embedding::from_blob(&b)),
        version: row.get("version")?,
        supersedes: row.get("supersedes")?,
        superseded_by: row.get("superseded_by")?,
        previous_versions: serde_json::from_str(&previous_str).unwrap_or_default(),
        deleted_at: parse_ts_opt(deleted_at),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

pub(crate) const MEMORY_COLUMNS: &str =
    "id, memory_space_id, content, kind, importance, source_type, source_ref, tags, \
     embedding, version, supersedes, superseded_by, previous_versions, \
     deleted_at, created_at, updated_at";

fn validate_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(CortexError::InvalidInput(
            "Memory content cannot be empty".to_string(),
        ));
    }
    if content.len() > MAX_CONTENT_BYTES {
        return Err(CortexError::InvalidInput(format!(
            "Memory content exceeds {} bytes",
            MAX_CONTENT_BYTES
        )));
    }
    Ok(())
}

fn validate_importance(importance: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&importance) {
        return Err(CortexError::InvalidInput(format!(
            "Importance must be within [0.0, 1.0], got {}",
            importance
        )));
    }
    Ok(())
}

fn enqueue_memory(conn: &Connection, memory: &Memory, op: OutboxOperation) -> Result<()> {
    let snapshot = serde_json::to_value(memory)?;
    outbox::enqueue(
        conn,
        "memories",
        &memory.id.to_string(),
        op,
        Some(&snapshot),
        0,
    )?;
    Ok(())
}

/// Store a new memory (version 1 of a fresh chain)
///
/// A supplied embedding must match `dimensions`; storing without one is
/// fine, the record simply never participates in vector re-ranking.
pub fn store(
    conn: &Connection,
    space_id: &str,
    input: &StoreMemoryInput,
    dimensions: usize,
) -> Result<Memory> {
    validate_content(&input.content)?;
    let importance = input.importance.unwrap_or(0.5);
    validate_importance(importance)?;
    if let Some(ref emb) = input.embedding {
        check_dimensions(emb, dimensions)?;
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO memories (memory_space_id, content, kind, importance, source_type,
                               source_ref, tags, embedding, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            space_id,
            input.content,
            input.kind.as_str(),
            importance,
            input.source_type.as_str(),
            input.source_ref,
            serde_json::to_string(&input.tags)?,
            input.embedding.as_deref().map(embedding::to_blob),
            now,
            now
        ],
    )?;
    let id = conn.last_insert_rowid();

    let memory = get_any(conn, id)?;
    enqueue_memory(conn, &memory, OutboxOperation::Insert)?;

    tracing::debug!(memory_id = id, space_id, kind = input.kind.as_str(), "stored memory");
    Ok(memory)
}

fn get_any(conn: &Connection, id: MemoryId) -> Result<Memory> {
    let sql = format!("SELECT {} FROM memories WHERE id = ?", MEMORY_COLUMNS);
    match conn.query_row(&sql, params![id], memory_from_row) {
        Ok(memory) => Ok(memory),
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            Err(CortexError::NotFound(format!("memory {}", id)))
        }
        Err(e) => Err(e.into()),
    }
}

/// Get a memory by id, scoped to the given space
pub fn get(conn: &Connection, space_id: &str, id: MemoryId) -> Result<Option<Memory>> {
    match get_any(conn, id) {
        Ok(memory) if memory.memory_space_id == space_id => Ok(Some(memory)),
        Ok(_) => Ok(None),
        Err(CortexError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Revise a memory: new head row carrying inline history of the old one
pub fn update(
    conn: &Connection,
    space_id: &str,
    id: MemoryId,
    patch: &UpdateMemoryInput,
    dimensions: usize,
) -> Result<Memory> {
    if let Some(ref content) = patch.content {
        validate_content(content)?;
    }
    if let Some(importance) = patch.importance {
        validate_importance(importance)?;
    }
    if let Some(ref emb) = patch.embedding {
        check_dimensions(emb, dimensions)?;
    }

    let old = get_any(conn, id)?;

    let new_id = versioned::revise(conn, MEMORIES, id, space_id, |conn, meta| {
        let now = Utc::now().to_rfc3339();
        let content = patch.content.as_deref().unwrap_or(&old.content);
        let kind = patch.kind.unwrap_or(old.kind);
        let importance = patch.importance.unwrap_or(old.importance);
        let tags = patch.tags.as_ref().unwrap_or(&old.tags);
        // An embedding describes one exact content; stale ones are dropped
        // rather than carried onto different text.
        let embedding = match (&patch.embedding, &patch.content) {
            (Some(emb), _) => Some(emb.clone()),
            (None, None) => old.embedding.clone(),
            (None, Some(_)) => None,
        };

        let mut history = old.previous_versions.clone();
        history.push(MemoryRevision {
            version: old.version,
            content: old.content.clone(),
            importance: old.importance,
            updated_at: old.updated_at,
        });

        conn.execute(
            "INSERT INTO memories (memory_space_id, content, kind, importance, source_type,
                                   source_ref, tags, embedding, version, supersedes,
                                   previous_versions, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                meta.memory_space_id,
                content,
                kind.as_str(),
                importance,
                old.source_type.as_str(),
                old.source_ref,
                serde_json::to_string(tags)?,
                embedding.as_deref().map(embedding::to_blob),
                meta.version + 1,
                meta.id,
                serde_json::to_string(&history)?,
                now,
                now
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })?;

    let memory = get_any(conn, new_id)?;
    enqueue_memory(conn, &memory, OutboxOperation::Update)?;
    Ok(memory)
}

/// Soft-delete a memory head (`deleted_at = now`)
pub fn soft_delete(conn: &Connection, space_id: &str, id: MemoryId) -> Result<()> {
    versioned::soft_delete(conn, MEMORIES, id, space_id)?;
    let memory = get_any(conn, id)?;
    enqueue_memory(conn, &memory, OutboxOperation::Delete)?;
    Ok(())
}

fn push_filters(
    options: &ListOptions,
    sql: &mut String,
    params_vec: &mut Vec<Box<dyn rusqlite::ToSql>>,
) {
    if !options.include_superseded {
        sql.push_str(" AND superseded_by IS NULL AND deleted_at IS NULL");
    }
    if let Some(kind) = options.kind {
        sql.push_str(" AND kind = ?");
        params_vec.push(Box::new(kind.as_str().to_string()));
    }
    if let Some(ref tags) = options.tags {
        for tag in tags {
            sql.push_str(" AND EXISTS (SELECT 1 FROM json_each(tags) WHERE json_each.value = ?)");
            params_vec.push(Box::new(tag.clone()));
        }
    }
}

/// List memories in a space, most important first, then newest
pub fn list(conn: &Connection, space_id: &str, options: &ListOptions) -> Result<Vec<Memory>> {
    let mut sql = format!(
        "SELECT {} FROM memories WHERE memory_space_id = ?",
        MEMORY_COLUMNS
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(space_id.to_string())];

    push_filters(options, &mut sql, &mut params_vec);

    sql.push_str(" ORDER BY importance DESC, created_at DESC, id DESC LIMIT ? OFFSET ?");
    params_vec.push(Box::new(options.limit.unwrap_or(100)));
    params_vec.push(Box::new(options.offset.unwrap_or(0)));

    let params_ref: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let memories = stmt
        .query_map(params_ref.as_slice(), memory_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(memories)
}

// Text and semantic contributions to the combined score. Text matching
// gets the edge because the hashing embedder in tests is weak.
const TEXT_WEIGHT: f64 = 0.5;
const SEMANTIC_WEIGHT: f64 = 0.5;

/// Search memories: FTS candidates, then optional cosine re-rank
///
/// When `options.embedding` is provided, candidates are fetched wide
/// (4x limit), scored as a weighted blend of normalized BM25 and cosine
/// similarity, and re-sorted. Candidates without a stored embedding keep
/// their text score only.
pub fn search(
    conn: &Connection,
    space_id: &str,
    query: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchHit<Memory>>> {
    let match_expr = super::facts::fts_query(query);
    if match_expr.is_empty() {
        return Ok(vec![]);
    }

    let limit = options.limit.unwrap_or(20);
    let fetch = if options.embedding.is_some() {
        limit.saturating_mul(4)
    } else {
        limit
    };

    // Columns qualified: both memories and memories_fts carry `content`
    let qualified = MEMORY_COLUMNS
        .split(", ")
        .map(|c| format!("memories.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "SELECT {}, bm25(memories_fts) AS rank
         FROM memories_fts
         JOIN memories ON memories.id = memories_fts.rowid
         WHERE memories_fts MATCH ?
           AND memory_space_id = ?
           AND superseded_by IS NULL AND deleted_at IS NULL",
        qualified
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![
        Box::new(match_expr),
        Box::new(space_id.to_string()),
    ];

    if let Some(kind) = options.kind {
        sql.push_str(" AND kind = ?");
        params_vec.push(Box::new(kind.as_str().to_string()));
    }
    if let Some(ref tags) = options.tags {
        for tag in tags {
            sql.push_str(" AND EXISTS (SELECT 1 FROM json_each(tags) WHERE json_each.value = ?)");
            params_vec.push(Box::new(tag.clone()));
        }
    }

    sql.push_str(" ORDER BY rank LIMIT ?");
    params_vec.push(Box::new(fetch));

    let params_ref: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let mut hits = stmt
        .query_map(params_ref.as_slice(), |row| {
            let memory = memory_from_row(row)?;
            let rank: f64 = row.get("rank")?;
            Ok(SearchHit {
                entry: memory,
                score: -rank,
                text_score: Some(-rank),
                semantic_score: None,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if let Some(ref query_emb) = options.embedding {
        // Normalize text scores into [0, 1] so the blend is stable across
        // corpora with very different BM25 magnitudes.
        let max_text = hits
            .iter()
            .filter_map(|h| h.text_score)
            .fold(f64::MIN, f64::max);

        for hit in &mut hits {
            let text_norm = match (hit.text_score, max_text > 0.0) {
                (Some(t), true) => t / max_text,
                _ => 0.0,
            };
            match hit.entry.embedding {
                Some(ref emb) if emb.len() == query_emb.len() => {
                    let cos = f64::from(cosine_similarity(query_emb, emb));
                    hit.semantic_score = Some(cos);
                    hit.score = TEXT_WEIGHT * text_norm + SEMANTIC_WEIGHT * cos;
                }
                _ => {
                    hit.score = TEXT_WEIGHT * text_norm;
                }
            }
        }

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit.max(0) as usize);
    }

    let min_score = options.min_score.unwrap_or(f64::MIN);
    Ok(hits.into_iter().filter(|h| h.score >= min_score).collect())
}

/// Bulk delete for cleanup; soft by default, hard when `hard` is set
pub fn delete_many(
    conn: &Connection,
    space_id: &str,
    options: &ListOptions,
    hard: bool,
) -> Result<usize> {
    let mut sql = format!(
        "SELECT {} FROM memories WHERE memory_space_id = ?",
        MEMORY_COLUMNS
    );
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(space_id.to_string())];
    push_filters(options, &mut sql, &mut params_vec);

    let params_ref: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let victims = stmt
        .query_map(params_ref.as_slice(), memory_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let now = Utc::now().to_rfc3339();
    for memory in &victims {
        if hard {
            conn.execute("DELETE FROM memories WHERE id = ?", params![memory.id])?;
        } else {
            conn.execute(
                "UPDATE memories SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
                params![now, now, memory.id],
            )?;
        }
        outbox::enqueue(
            conn,
            "memories",
            &memory.id.to_string(),
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
    use crate::embedding::{Embedder, HashingEmbedder};
    use crate::outbox::pending_count;
    use crate::storage::Storage;

    const DIMS: usize = 64;

    fn test_storage() -> Storage {
        Storage::open_in_memory().unwrap()
    }

    fn sample_input(content: &str) -> StoreMemoryInput {
        StoreMemoryInput {
            content: content.to_string(),
            kind: MemoryKind::Episodic,
            importance: Some(0.7),
            ..Default::default()
        }
    }

    #[test]
    fn test_store_and_importance_bounds() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let memory = store(conn, "s1", &sample_input("Deployed v2 at noon"), DIMS)?;
                assert_eq!(memory.version, 1);
                assert_eq!(memory.importance, 0.7);

                let mut bad = sample_input("too important");
                bad.importance = Some(1.5);
                assert!(matches!(
                    store(conn, "s1", &bad, DIMS).unwrap_err(),
                    CortexError::InvalidInput(_)
                ));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_embedding_dimension_enforced() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let mut input = sample_input("vectorized");
                input.embedding = Some(vec![0.1; DIMS + 1]);
                assert!(matches!(
                    store(conn, "s1", &input, DIMS).unwrap_err(),
                    CortexError::InvalidInput(_)
                ));

                input.embedding = Some(vec![0.1; DIMS]);
                let memory = store(conn, "s1", &input, DIMS)?;
                assert_eq!(memory.embedding.as_ref().map(Vec::len), Some(DIMS));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_update_carries_inline_history() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let m1 = store(conn, "s1", &sample_input("First draft"), DIMS)?;
                let m2 = update(
                    conn,
                    "s1",
                    m1.id,
                    &UpdateMemoryInput {
                        content: Some("Second draft".to_string()),
                        importance: Some(0.9),
                        ..Default::default()
                    },
                    DIMS,
                )?;

                assert_eq!(m2.version, 2);
                assert_eq!(m2.supersedes, Some(m1.id));
                assert_eq!(m2.previous_versions.len(), 1);
                assert_eq!(m2.previous_versions[0].version, 1);
                assert_eq!(m2.previous_versions[0].content, "First draft");

                let m3 = update(
                    conn,
                    "s1",
                    m2.id,
                    &UpdateMemoryInput {
                        content: Some("Third draft".to_string()),
                        ..Default::default()
                    },
                    DIMS,
                )?;
                assert_eq!(m3.previous_versions.len(), 2);
                assert_eq!(m3.previous_versions[1].content, "Second draft");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_update_drops_stale_embedding() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let embedder = HashingEmbedder::new(DIMS);
                let mut input = sample_input("original text");
                input.embedding = Some(embedder.embed("original text")?);
                let m1 = store(conn, "s1", &input, DIMS)?;

                // Content changed without a fresh embedding
                let m2 = update(
                    conn,
                    "s1",
                    m1.id,
                    &UpdateMemoryInput {
                        content: Some("entirely new text".to_string()),
                        ..Default::default()
                    },
                    DIMS,
                )?;
                assert!(m2.embedding.is_none());

                // Metadata-only patch keeps the embedding
                let m3 = update(
                    conn,
                    "s1",
                    m2.id,
                    &UpdateMemoryInput {
                        importance: Some(0.1),
                        ..Default::default()
                    },
                    DIMS,
                )?;
                assert_eq!(m3.embedding, None);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_soft_delete_hides_from_lists() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let m1 = store(conn, "s1", &sample_input("ephemeral"), DIMS)?;
                soft_delete(conn, "s1", m1.id)?;

                assert!(list(conn, "s1", &ListOptions::default())?.is_empty());
                // Still addressable directly
                let m1 = get(conn, "s1", m1.id)?.unwrap();
                assert!(m1.deleted_at.is_some());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_search_with_semantic_rerank() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let embedder = HashingEmbedder::new(DIMS);

                for text in [
                    "deploy pipeline failed on friday",
                    "deploy pipeline succeeded with the new cache",
                ] {
                    let mut input = sample_input(text);
                    input.embedding = Some(embedder.embed(text)?);
                    store(conn, "s1", &input, DIMS)?;
                }

                let query = "deploy pipeline failed";
                let hits = search(
                    conn,
                    "s1",
                    query,
                    &SearchOptions {
                        embedding: Some(embedder.embed(query)?),
                        ..Default::default()
                    },
                )?;

                assert_eq!(hits.len(), 2);
                assert!(hits[0].entry.content.contains("failed"));
                assert!(hits[0].semantic_score.is_some());
                assert!(hits[0].score >= hits[1].score);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_search_isolated_by_space() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                store(conn, "s1", &sample_input("shared secret phrase"), DIMS)?;
                store(conn, "s2", &sample_input("shared secret phrase"), DIMS)?;

                let hits = search(conn, "s1", "secret phrase", &SearchOptions::default())?;
                assert_eq!(hits.len(), 1);
                assert_eq!(hits[0].entry.memory_space_id, "s1");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_mutations_enqueue_outbox() {
        let storage = test_storage();
        storage
            .with_transaction(|conn| {
                let m1 = store(conn, "s1", &sample_input("m"), DIMS)?;
                assert_eq!(pending_count(conn)?, 1);
                let m2 = update(conn, "s1", m1.id, &UpdateMemoryInput::default(), DIMS)?;
                assert_eq!(pending_count(conn)?, 2);
                soft_delete(conn, "s1", m2.id)?;
                assert_eq!(pending_count(conn)?, 3);

                let deleted = delete_many(
                    conn,
                    "s1",
                    &ListOptions {
                        include_superseded: true,
                        ..Default::default()
                    },
                    true,
                )?;
                assert_eq!(deleted, 2);
                assert_eq!(pending_count(conn)?, 5);
                Ok(())
            })
            .unwrap();
    }
}
