//! High-level store handle
//!
//! `Cortex` owns the storage engine and wraps every domain operation in
//! the right transaction scope, so callers get the "mutation and its
//! outbox entry commit together" guarantee without touching connections.
//! Caller-supplied space ids are canonicalized at this boundary, and the
//! first write naming a space provisions its registry row. Cloning is
//! cheap; clones share the same underlying database handle.

use std::sync::Arc;

use crate::contexts;
use crate::conversations;
use crate::error::{CortexError, Result};
use crate::governance;
use crate::knowledge::{facts, memories};
use crate::outbox::{self, DrainReport, GraphIndexSink, OutboxWorker, OutboxWorkerConfig};
use crate::spaces;
use crate::storage::{Storage, SCHEMA_VERSION};
use crate::types::{
    normalize_space_id, Context, ContextId, ContextStatus, Conversation, ConversationType, Fact,
    FactId, GovernanceEnforcement, GovernancePolicy, GrantScope, ListOptions, Memory, MemoryId,
    MemorySpace, Message, MessageRole, Participant, ParticipantKind, PolicyId, RetentionRule,
    SearchHit, SearchOptions, SpaceType, StorageConfig, StoreFactInput, StoreMemoryInput,
    StoreStats, UpdateFactInput, UpdateMemoryInput,
};

/// Canonicalize a caller-supplied space id before it becomes a partition
/// key; the raw form must never reach a query
fn scope(space_id: &str) -> Result<String> {
    normalize_space_id(space_id).map_err(|e| CortexError::InvalidInput(e.to_string()))
}

/// The layered knowledge store
#[derive(Clone)]
pub struct Cortex {
    storage: Storage,
    embedding_dimensions: usize,
}

impl Cortex {
    /// Open (or create) a store at the configured path and run migrations
    pub fn open(config: StorageConfig) -> Result<Self> {
        let embedding_dimensions = config.embedding_dimensions;
        let storage = Storage::open(config)?;
        tracing::info!(
            db_path = %storage.db_path(),
            schema_version = SCHEMA_VERSION,
            "cortex store opened"
        );
        Ok(Self {
            storage,
            embedding_dimensions,
        })
    }

    /// In-memory store for tests and ephemeral sessions
    pub fn open_in_memory() -> Result<Self> {
        Self::open(StorageConfig::default())
    }

    /// The underlying storage engine
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    // ------------------------------------------------------------------
    // Memory spaces
    // ------------------------------------------------------------------

    pub fn create_space(
        &self,
        space_id: Option<&str>,
        name: &str,
        space_type: SpaceType,
    ) -> Result<MemorySpace> {
        self.storage
            .with_transaction(|conn| spaces::create(conn, space_id, name, space_type))
    }

    pub fn get_or_create_space(
        &self,
        space_id: &str,
        default_name: &str,
        default_type: SpaceType,
    ) -> Result<MemorySpace> {
        self.storage
            .with_transaction(|conn| spaces::get_or_create(conn, space_id, default_name, default_type))
    }

    pub fn get_space(&self, space_id: &str) -> Result<Option<MemorySpace>> {
        let space_id = scope(space_id)?;
        self.storage.with_connection(|conn| spaces::get(conn, &space_id))
    }

    pub fn space_exists(&self, space_id: &str) -> Result<bool> {
        let space_id = scope(space_id)?;
        self.storage.with_connection(|conn| spaces::exists(conn, &space_id))
    }

    pub fn list_spaces(&self) -> Result<Vec<MemorySpace>> {
        self.storage.with_connection(spaces::list)
    }

    pub fn add_participant(
        &self,
        space_id: &str,
        participant_id: &str,
        kind: ParticipantKind,
    ) -> Result<MemorySpace> {
        let space_id = scope(space_id)?;
        self.storage
            .with_transaction(|conn| spaces::add_participant(conn, &space_id, participant_id, kind))
    }

    pub fn remove_participant(&self, space_id: &str, participant_id: &str) -> Result<MemorySpace> {
        let space_id = scope(space_id)?;
        self.storage
            .with_transaction(|conn| spaces::remove_participant(conn, &space_id, participant_id))
    }

    pub fn archive_space(&self, space_id: &str) -> Result<MemorySpace> {
        let space_id = scope(space_id)?;
        self.storage.with_transaction(|conn| spaces::archive(conn, &space_id))
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    pub fn create_conversation(
        &self,
        space_id: &str,
        conversation_type: ConversationType,
        participants: Vec<Participant>,
    ) -> Result<Conversation> {
        let space_id = scope(space_id)?;
        self.storage.with_transaction(|conn| {
            spaces::ensure(conn, &space_id)?;
            conversations::create(conn, &space_id, conversation_type, participants)
        })
    }

    pub fn get_conversation(
        &self,
        space_id: &str,
        conversation_id: &str,
    ) -> Result<Option<Conversation>> {
        let space_id = scope(space_id)?;
        self.storage
            .with_connection(|conn| conversations::get(conn, &space_id, conversation_id))
    }

    pub fn list_conversations(&self, space_id: &str, limit: i64) -> Result<Vec<Conversation>> {
        let space_id = scope(space_id)?;
        self.storage
            .with_connection(|conn| conversations::list(conn, &space_id, limit))
    }

    pub fn append_message(
        &self,
        space_id: &str,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
        participant_id: Option<&str>,
    ) -> Result<Message> {
        let space_id = scope(space_id)?;
        self.storage.with_transaction(|conn| {
            conversations::append_message(conn, &space_id, conversation_id, role, content, participant_id)
        })
    }

    pub fn messages(
        &self,
        space_id: &str,
        conversation_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<Message>> {
        let space_id = scope(space_id)?;
        self.storage
            .with_connection(|conn| conversations::messages(conn, &space_id, conversation_id, limit))
    }

    pub fn archive_conversation(
        &self,
        space_id: &str,
        conversation_id: &str,
    ) -> Result<Conversation> {
        let space_id = scope(space_id)?;
        self.storage
            .with_transaction(|conn| conversations::archive(conn, &space_id, conversation_id))
    }

    // ------------------------------------------------------------------
    // Facts
    // ------------------------------------------------------------------

    pub fn store_fact(&self, space_id: &str, input: &StoreFactInput) -> Result<Fact> {
        let space_id = scope(space_id)?;
        self.storage.with_transaction(|conn| {
            spaces::ensure(conn, &space_id)?;
            facts::store(conn, &space_id, input)
        })
    }

    pub fn update_fact(
        &self,
        space_id: &str,
        id: FactId,
        patch: &UpdateFactInput,
    ) -> Result<Fact> {
        let space_id = scope(space_id)?;
        self.storage
            .with_transaction(|conn| facts::update(conn, &space_id, id, patch))
    }

    pub fn get_fact(&self, space_id: &str, id: FactId) -> Result<Option<Fact>> {
        let space_id = scope(space_id)?;
        self.storage.with_connection(|conn| facts::get(conn, &space_id, id))
    }

    pub fn list_facts(&self, space_id: &str, options: &ListOptions) -> Result<Vec<Fact>> {
        let space_id = scope(space_id)?;
        self.storage
            .with_connection(|conn| facts::list(conn, &space_id, options))
    }

    pub fn search_facts(
        &self,
        space_id: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit<Fact>>> {
        let space_id = scope(space_id)?;
        self.storage
            .with_connection(|conn| facts::search(conn, &space_id, query, options))
    }

    pub fn query_facts_by_subject(&self, space_id: &str, subject: &str) -> Result<Vec<Fact>> {
        let space_id = scope(space_id)?;
        self.storage
            .with_connection(|conn| facts::query_by_subject(conn, &space_id, subject, false))
    }

    pub fn delete_fact(&self, space_id: &str, id: FactId) -> Result<()> {
        let space_id = scope(space_id)?;
        self.storage
            .with_transaction(|conn| facts::soft_delete(conn, &space_id, id))
    }

    pub fn delete_facts(
        &self,
        space_id: &str,
        options: &ListOptions,
        hard: bool,
    ) -> Result<usize> {
        let space_id = scope(space_id)?;
        self.storage
            .with_transaction(|conn| facts::delete_many(conn, &space_id, options, hard))
    }

    // ------------------------------------------------------------------
    // Memories
    // ------------------------------------------------------------------

    pub fn store_memory(&self, space_id: &str, input: &StoreMemoryInput) -> Result<Memory> {
        let space_id = scope(space_id)?;
        self.storage.with_transaction(|conn| {
            spaces::ensure(conn, &space_id)?;
            memories::store(conn, &space_id, input, self.embedding_dimensions)
        })
    }

    pub fn update_memory(
        &self,
        space_id: &str,
        id: MemoryId,
        patch: &UpdateMemoryInput,
    ) -> Result<Memory> {
        let space_id = scope(space_id)?;
        self.storage.with_transaction(|conn| {
            memories::update(conn, &space_id, id, patch, self.embedding_dimensions)
        })
    }

    pub fn get_memory(&self, space_id: &str, id: MemoryId) -> Result<Option<Memory>> {
        let space_id = scope(space_id)?;
        self.storage
            .with_connection(|conn| memories::get(conn, &space_id, id))
    }

    pub fn list_memories(&self, space_id: &str, options: &ListOptions) -> Result<Vec<Memory>> {
        let space_id = scope(space_id)?;
        self.storage
            .with_connection(|conn| memories::list(conn, &space_id, options))
    }

    pub fn search_memories(
        &self,
        space_id: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit<Memory>>> {
        let space_id = scope(space_id)?;
        self.storage
            .with_connection(|conn| memories::search(conn, &space_id, query, options))
    }

    pub fn delete_memory(&self, space_id: &str, id: MemoryId) -> Result<()> {
        let space_id = scope(space_id)?;
        self.storage
            .with_transaction(|conn| memories::soft_delete(conn, &space_id, id))
    }

    pub fn delete_memories(
        &self,
        space_id: &str,
        options: &ListOptions,
        hard: bool,
    ) -> Result<usize> {
        let space_id = scope(space_id)?;
        self.storage
            .with_transaction(|conn| memories::delete_many(conn, &space_id, options, hard))
    }

    // ------------------------------------------------------------------
    // Contexts
    // ------------------------------------------------------------------

    pub fn create_context(
        &self,
        space_id: &str,
        purpose: &str,
        parent_id: Option<ContextId>,
        participants: Vec<Participant>,
    ) -> Result<Context> {
        let space_id = scope(space_id)?;
        self.storage.with_transaction(|conn| {
            spaces::ensure(conn, &space_id)?;
            contexts::create(conn, &space_id, purpose, parent_id, participants)
        })
    }

    pub fn get_context(&self, space_id: &str, id: ContextId) -> Result<Option<Context>> {
        let space_id = scope(space_id)?;
        self.storage.with_connection(|conn| contexts::get(conn, &space_id, id))
    }

    pub fn list_contexts(&self, space_id: &str, limit: i64) -> Result<Vec<Context>> {
        let space_id = scope(space_id)?;
        self.storage
            .with_connection(|conn| contexts::list(conn, &space_id, limit))
    }

    pub fn grant_context_access(
        &self,
        space_id: &str,
        context_id: ContextId,
        target_space_id: &str,
        grant_scope: GrantScope,
    ) -> Result<Context> {
        let space_id = scope(space_id)?;
        let target_space_id = scope(target_space_id)?;
        self.storage.with_transaction(|conn| {
            contexts::grant_access(conn, &space_id, context_id, &target_space_id, grant_scope)
        })
    }

    pub fn transition_context(
        &self,
        space_id: &str,
        context_id: ContextId,
        new_status: ContextStatus,
    ) -> Result<Context> {
        let space_id = scope(space_id)?;
        self.storage
            .with_transaction(|conn| contexts::transition(conn, &space_id, context_id, new_status))
    }

    pub fn complete_context(&self, space_id: &str, context_id: ContextId) -> Result<Context> {
        let space_id = scope(space_id)?;
        self.storage
            .with_transaction(|conn| contexts::complete(conn, &space_id, context_id))
    }

    // ------------------------------------------------------------------
    // Governance
    // ------------------------------------------------------------------

    pub fn apply_policy(
        &self,
        organization_id: Option<&str>,
        memory_space_id: Option<&str>,
        name: &str,
        rules: &[RetentionRule],
    ) -> Result<GovernancePolicy> {
        let space_id = memory_space_id.map(scope).transpose()?;
        self.storage.with_transaction(|conn| {
            governance::apply_policy(conn, organization_id, space_id.as_deref(), name, rules)
        })
    }

    pub fn set_policy_active(&self, id: PolicyId, active: bool) -> Result<GovernancePolicy> {
        self.storage
            .with_transaction(|conn| governance::set_active(conn, id, active))
    }

    pub fn run_enforcement(
        &self,
        organization_id: Option<&str>,
        memory_space_id: Option<&str>,
    ) -> Result<GovernanceEnforcement> {
        let space_id = memory_space_id.map(scope).transpose()?;
        governance::run_enforcement(&self.storage, organization_id, space_id.as_deref())
    }

    pub fn list_enforcements(&self, limit: i64) -> Result<Vec<GovernanceEnforcement>> {
        self.storage
            .with_connection(|conn| governance::list_enforcements(conn, limit))
    }

    // ------------------------------------------------------------------
    // Replication
    // ------------------------------------------------------------------

    /// One synchronous drain pass against the given sink
    pub fn drain_outbox(&self, sink: &dyn GraphIndexSink, batch_size: i64) -> Result<DrainReport> {
        outbox::drain(&self.storage, sink, batch_size)
    }

    /// Spawn the background drain worker
    pub fn start_outbox_worker(
        &self,
        sink: Arc<dyn GraphIndexSink>,
        config: OutboxWorkerConfig,
    ) -> Result<OutboxWorker> {
        OutboxWorker::start(self.storage.clone(), sink, config)
    }

    /// Delete synced outbox entries older than the given age
    pub fn purge_synced_outbox(&self, older_than_days: i64) -> Result<usize> {
        self.storage
            .with_transaction(|conn| outbox::purge_synced(conn, older_than_days))
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    pub fn checkpoint(&self) -> Result<()> {
        self.storage.checkpoint()
    }

    pub fn vacuum(&self) -> Result<()> {
        self.storage.vacuum()
    }

    /// Store-wide counters for ops dashboards
    pub fn stats(&self) -> Result<StoreStats> {
        let db_size_bytes = self.storage.db_size()?;
        self.storage.with_connection(|conn| {
            let count = |sql: &str| -> Result<i64> {
                Ok(conn.query_row(sql, [], |row| row.get(0))?)
            };

            Ok(StoreStats {
                total_spaces: count("SELECT COUNT(*) FROM memory_spaces")?,
                total_conversations: count("SELECT COUNT(*) FROM conversations")?,
                total_messages: count("SELECT COUNT(*) FROM messages")?,
                total_facts: count("SELECT COUNT(*) FROM facts")?,
                fact_heads: count(
                    "SELECT COUNT(*) FROM facts WHERE superseded_by IS NULL AND valid_until IS NULL",
                )?,
                total_memories: count("SELECT COUNT(*) FROM memories")?,
                memory_heads: count(
                    "SELECT COUNT(*) FROM memories WHERE superseded_by IS NULL AND deleted_at IS NULL",
                )?,
                total_contexts: count("SELECT COUNT(*) FROM contexts")?,
                total_policies: count("SELECT COUNT(*) FROM governance_policies")?,
                total_enforcements: count("SELECT COUNT(*) FROM governance_enforcements")?,
                outbox_pending: count("SELECT COUNT(*) FROM outbox WHERE status != 'synced'")?,
                outbox_synced: count("SELECT COUNT(*) FROM outbox WHERE status = 'synced'")?,
                db_size_bytes,
                schema_version: SCHEMA_VERSION,
            })
        })
    }
}
