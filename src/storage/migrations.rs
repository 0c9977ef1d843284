//! Database migrations for Cortex

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    if current_version < SCHEMA_VERSION {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Initial schema (v1): spaces, conversations, knowledge layers, outbox
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Memory spaces: the tenancy boundary
        CREATE TABLE IF NOT EXISTS memory_spaces (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            space_type TEXT NOT NULL DEFAULT 'personal',
            status TEXT NOT NULL DEFAULT 'active',
            participants TEXT NOT NULL DEFAULT '[]',
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        -- Append-only conversation log
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            memory_space_id TEXT NOT NULL,
            conversation_type TEXT NOT NULL DEFAULT 'user-agent',
            participants TEXT NOT NULL DEFAULT '[]',
            message_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id TEXT NOT NULL,
            memory_space_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            participant_id TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        );

        -- Facts: supersede chains of separate rows
        CREATE TABLE IF NOT EXISTS facts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            memory_space_id TEXT NOT NULL,
            content TEXT NOT NULL,
            subject TEXT,
            predicate TEXT,
            object TEXT,
            category TEXT NOT NULL DEFAULT 'knowledge',
            confidence REAL NOT NULL DEFAULT 80,
            source_type TEXT NOT NULL DEFAULT 'conversation',
            source_ref TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            version INTEGER NOT NULL DEFAULT 1,
            supersedes INTEGER,
            superseded_by INTEGER,
            valid_from TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            valid_until TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        -- Memories: supersede chains plus inline previous_versions history
        CREATE TABLE IF NOT EXISTS memories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            memory_space_id TEXT NOT NULL,
            content TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'semantic',
            importance REAL NOT NULL DEFAULT 0.5,
            source_type TEXT NOT NULL DEFAULT 'conversation',
            source_ref TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            embedding BLOB,
            version INTEGER NOT NULL DEFAULT 1,
            supersedes INTEGER,
            superseded_by INTEGER,
            previous_versions TEXT NOT NULL DEFAULT '[]',
            deleted_at TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        -- Replication outbox: one row per mutation, drained by the
        -- external graph-index consumer
        CREATE TABLE IF NOT EXISTS outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_table TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            snapshot TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            synced_at TEXT,
            failed_attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        -- Full-text search over fact and memory payloads
        CREATE VIRTUAL TABLE IF NOT EXISTS facts_fts USING fts5(
            content,
            content='facts',
            content_rowid='id',
            tokenize='porter unicode61'
        );

        CREATE TRIGGER IF NOT EXISTS facts_ai AFTER INSERT ON facts BEGIN
            INSERT INTO facts_fts(rowid, content) VALUES (NEW.id, NEW.content);
        END;

        CREATE TRIGGER IF NOT EXISTS facts_ad AFTER DELETE ON facts BEGIN
            INSERT INTO facts_fts(facts_fts, rowid, content)
            VALUES('delete', OLD.id, OLD.content);
        END;

        CREATE TRIGGER IF NOT EXISTS facts_au AFTER UPDATE OF content ON facts BEGIN
            INSERT INTO facts_fts(facts_fts, rowid, content)
            VALUES('delete', OLD.id, OLD.content);
            INSERT INTO facts_fts(rowid, content) VALUES (NEW.id, NEW.content);
        END;

        CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
            content,
            content='memories',
            content_rowid='id',
            tokenize='porter unicode61'
        );

        CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
            INSERT INTO memories_fts(rowid, content) VALUES (NEW.id, NEW.content);
        END;

        CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
            INSERT INTO memories_fts(memories_fts, rowid, content)
            VALUES('delete', OLD.id, OLD.content);
        END;

        CREATE TRIGGER IF NOT EXISTS memories_au AFTER UPDATE OF content ON memories BEGIN
            INSERT INTO memories_fts(memories_fts, rowid, content)
            VALUES('delete', OLD.id, OLD.content);
            INSERT INTO memories_fts(rowid, content) VALUES (NEW.id, NEW.content);
        END;

        -- Indexes for scoped and time-ordered reads
        CREATE INDEX IF NOT EXISTS idx_conversations_space ON conversations(memory_space_id);
        CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);
        CREATE INDEX IF NOT EXISTS idx_messages_space_created ON messages(memory_space_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_facts_space ON facts(memory_space_id);
        CREATE INDEX IF NOT EXISTS idx_facts_space_subject ON facts(memory_space_id, subject);
        CREATE INDEX IF NOT EXISTS idx_facts_space_created ON facts(memory_space_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_facts_head ON facts(memory_space_id, superseded_by);

        CREATE INDEX IF NOT EXISTS idx_memories_space ON memories(memory_space_id);
        CREATE INDEX IF NOT EXISTS idx_memories_space_created ON memories(memory_space_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_memories_head ON memories(memory_space_id, superseded_by);

        CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status, created_at);
        CREATE INDEX IF NOT EXISTS idx_outbox_entity ON outbox(entity_table, entity_id);

        INSERT INTO schema_version (version) VALUES (1);
        "#,
    )?;

    Ok(())
}

/// Context tree migration (v2)
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Hierarchical coordination nodes
        -- root_id is patched to the row's own id right after a root insert
        CREATE TABLE IF NOT EXISTS contexts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            memory_space_id TEXT NOT NULL,
            purpose TEXT NOT NULL,
            parent_id INTEGER,
            root_id INTEGER NOT NULL DEFAULT 0,
            depth INTEGER NOT NULL DEFAULT 0,
            child_ids TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'active',
            participants TEXT NOT NULL DEFAULT '[]',
            granted_access TEXT NOT NULL DEFAULT '[]',
            version INTEGER NOT NULL DEFAULT 1,
            previous_versions TEXT NOT NULL DEFAULT '[]',
            completed_at TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            FOREIGN KEY (parent_id) REFERENCES contexts(id)
        );

        CREATE INDEX IF NOT EXISTS idx_contexts_space ON contexts(memory_space_id);
        CREATE INDEX IF NOT EXISTS idx_contexts_parent ON contexts(parent_id);
        CREATE INDEX IF NOT EXISTS idx_contexts_root ON contexts(root_id);

        INSERT INTO schema_version (version) VALUES (2);
        "#,
    )?;

    Ok(())
}

/// Governance migration (v3); also adds outbox drain priority
fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS governance_policies (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            organization_id TEXT,
            memory_space_id TEXT,
            name TEXT NOT NULL,
            rules TEXT NOT NULL DEFAULT '[]',
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        -- Append-only enforcement audit log; one row per run, no-ops included
        CREATE TABLE IF NOT EXISTS governance_enforcements (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            policy_id INTEGER,
            organization_id TEXT,
            memory_space_id TEXT,
            layer_counts TEXT NOT NULL DEFAULT '{}',
            rules_applied TEXT NOT NULL DEFAULT '[]',
            versions_deleted INTEGER NOT NULL DEFAULT 0,
            records_purged INTEGER NOT NULL DEFAULT 0,
            storage_freed_bytes INTEGER NOT NULL DEFAULT 0,
            duration_ms REAL NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        CREATE INDEX IF NOT EXISTS idx_policies_space ON governance_policies(memory_space_id);
        CREATE INDEX IF NOT EXISTS idx_policies_org ON governance_policies(organization_id);
        CREATE INDEX IF NOT EXISTS idx_enforcements_created ON governance_enforcements(created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_enforcements_space ON governance_enforcements(memory_space_id);

        ALTER TABLE outbox ADD COLUMN priority INTEGER NOT NULL DEFAULT 0;
        CREATE INDEX IF NOT EXISTS idx_outbox_drain ON outbox(status, priority DESC, created_at);

        INSERT INTO schema_version (version) VALUES (3);
        "#,
    )?;

    Ok(())
}
