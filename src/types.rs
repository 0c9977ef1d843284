//! Core types for Cortex
//!
//! Every persisted entity carries an explicit `memory_space_id`; the
//! memory space is the unit of tenant isolation throughout the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Unique identifier for a fact row
pub type FactId = i64;
/// Unique identifier for a memory row
pub type MemoryId = i64;
/// Unique identifier for a context node
pub type ContextId = i64;
/// Unique identifier for a conversation message
pub type MessageId = i64;
/// Unique identifier for a governance policy
pub type PolicyId = i64;
/// Unique identifier for an outbox entry
pub type OutboxId = i64;

/// Maximum payload size for fact/memory content (bytes)
pub const MAX_CONTENT_BYTES: usize = 64 * 1024;

/// Maximum memory-space id length
pub const MAX_SPACE_ID_LENGTH: usize = 64;

/// Reserved memory-space id prefixes (system use)
pub const RESERVED_SPACE_PREFIX: &str = "_";

/// Space id validation error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpaceIdError {
    Empty,
    TooLong,
    InvalidChars,
    Reserved,
}

impl std::fmt::Display for SpaceIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpaceIdError::Empty => write!(f, "Memory space id cannot be empty"),
            SpaceIdError::TooLong => {
                write!(f, "Memory space id exceeds {} characters", MAX_SPACE_ID_LENGTH)
            }
            SpaceIdError::InvalidChars => write!(
                f,
                "Memory space id can only contain lowercase letters, numbers, hyphens, underscores, and colons"
            ),
            SpaceIdError::Reserved => write!(f, "Memory space id is reserved"),
        }
    }
}

impl std::error::Error for SpaceIdError {}

/// Normalize and validate a memory-space id
///
/// Rules:
/// - Trim whitespace and convert to lowercase
/// - Only allow [a-z0-9_:-] characters
/// - Max 64 characters
/// - Cannot start with underscore (reserved)
pub fn normalize_space_id(s: &str) -> std::result::Result<String, SpaceIdError> {
    let normalized = s.trim().to_lowercase();

    if normalized.is_empty() {
        return Err(SpaceIdError::Empty);
    }

    if normalized.len() > MAX_SPACE_ID_LENGTH {
        return Err(SpaceIdError::TooLong);
    }

    if !normalized
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_' || c == ':')
    {
        return Err(SpaceIdError::InvalidChars);
    }

    if normalized.starts_with(RESERVED_SPACE_PREFIX) {
        return Err(SpaceIdError::Reserved);
    }

    Ok(normalized)
}

// ============================================================================
// Memory spaces
// ============================================================================

/// A memory space: the tenancy/partition boundary for all stored data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySpace {
    /// Globally unique id, immutable once created
    pub memory_space_id: String,
    /// Human-readable name
    pub name: String,
    /// Space type
    #[serde(rename = "type")]
    pub space_type: SpaceType,
    /// Participants (agents/humans/services) with access
    #[serde(default)]
    pub participants: Vec<Participant>,
    /// Active or archived (soft-disabled, never hard-deleted)
    #[serde(default)]
    pub status: SpaceStatus,
    /// Arbitrary metadata as JSON
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Memory space type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpaceType {
    #[default]
    Personal,
    Team,
    Project,
    Custom,
}

impl SpaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceType::Personal => "personal",
            SpaceType::Team => "team",
            SpaceType::Project => "project",
            SpaceType::Custom => "custom",
        }
    }
}

impl std::str::FromStr for SpaceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "personal" => Ok(SpaceType::Personal),
            "team" => Ok(SpaceType::Team),
            "project" => Ok(SpaceType::Project),
            "custom" => Ok(SpaceType::Custom),
            _ => Err(format!("Unknown space type: {}", s)),
        }
    }
}

/// Memory space status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SpaceStatus {
    #[default]
    Active,
    Archived,
}

impl SpaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpaceStatus::Active => "active",
            SpaceStatus::Archived => "archived",
        }
    }
}

impl std::str::FromStr for SpaceStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(SpaceStatus::Active),
            "archived" => Ok(SpaceStatus::Archived),
            _ => Err(format!("Unknown space status: {}", s)),
        }
    }
}

/// A participant in a memory space or conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// Participant id (agent name, user id, service id)
    pub id: String,
    /// Kind of participant
    #[serde(rename = "type", default)]
    pub kind: ParticipantKind,
    /// When the participant joined
    pub joined_at: DateTime<Utc>,
}

/// Kind of participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantKind {
    #[default]
    Agent,
    Human,
    Service,
}

// ============================================================================
// Conversations
// ============================================================================

/// An append-only conversation, partitioned by memory space
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub memory_space_id: String,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    #[serde(default)]
    pub participants: Vec<Participant>,
    /// Must always equal the number of stored messages
    pub message_count: i64,
    #[serde(default)]
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Conversation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConversationType {
    #[default]
    UserAgent,
    AgentAgent,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationType::UserAgent => "user-agent",
            ConversationType::AgentAgent => "agent-agent",
        }
    }
}

impl std::str::FromStr for ConversationType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user-agent" => Ok(ConversationType::UserAgent),
            "agent-agent" => Ok(ConversationType::AgentAgent),
            _ => Err(format!("Unknown conversation type: {}", s)),
        }
    }
}

/// Conversation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    #[default]
    Active,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Active => "active",
            ConversationStatus::Archived => "archived",
        }
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(ConversationStatus::Active),
            "archived" => Ok(ConversationStatus::Archived),
            _ => Err(format!("Unknown conversation status: {}", s)),
        }
    }
}

/// A single message in a conversation (never mutated once written)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    /// Which participant produced the message (for agent-agent threads)
    pub participant_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Role of a message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    #[default]
    User,
    Assistant,
    Agent,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Agent => "agent",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" => Ok(MessageRole::System),
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "agent" => Ok(MessageRole::Agent),
            _ => Err(format!("Unknown message role: {}", s)),
        }
    }
}

// ============================================================================
// Facts
// ============================================================================

/// A versioned fact: a structured assertion scoped to one memory space
///
/// History is kept as a supersede chain of separate rows. Exactly one row
/// per chain has `superseded_by == None` (the head); default reads return
/// heads only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: FactId,
    pub memory_space_id: String,
    /// Assertion text (the searchable payload)
    pub content: String,
    /// Entity the assertion is about (secondary index key)
    pub subject: Option<String>,
    pub predicate: Option<String>,
    pub object: Option<String>,
    pub category: FactCategory,
    /// Confidence score, 0-100
    pub confidence: f64,
    pub source_type: SourceType,
    pub source_ref: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Version number, >= 1, strictly increasing along a chain
    pub version: i32,
    /// Prior version in the chain (None for version 1)
    pub supersedes: Option<FactId>,
    /// Next version in the chain (None for the head)
    pub superseded_by: Option<FactId>,
    pub valid_from: DateTime<Utc>,
    /// Set on soft delete or supersede; None while current
    pub valid_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Fact {
    /// Whether this row is the current head of its chain
    pub fn is_head(&self) -> bool {
        self.superseded_by.is_none()
    }
}

/// Fact category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FactCategory {
    Identity,
    Preference,
    #[default]
    Knowledge,
    Event,
    Relationship,
    Custom,
}

impl FactCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactCategory::Identity => "identity",
            FactCategory::Preference => "preference",
            FactCategory::Knowledge => "knowledge",
            FactCategory::Event => "event",
            FactCategory::Relationship => "relationship",
            FactCategory::Custom => "custom",
        }
    }
}

impl std::str::FromStr for FactCategory {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "identity" => Ok(FactCategory::Identity),
            "preference" => Ok(FactCategory::Preference),
            "knowledge" => Ok(FactCategory::Knowledge),
            "event" => Ok(FactCategory::Event),
            "relationship" => Ok(FactCategory::Relationship),
            "custom" => Ok(FactCategory::Custom),
            _ => Err(format!("Unknown fact category: {}", s)),
        }
    }
}

/// Where a fact or memory came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// Extracted from a conversation turn by the agent pipeline
    #[default]
    Conversation,
    Extraction,
    Manual,
    Import,
    System,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Conversation => "conversation",
            SourceType::Extraction => "extraction",
            SourceType::Manual => "manual",
            SourceType::Import => "import",
            SourceType::System => "system",
        }
    }
}

impl std::str::FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "conversation" => Ok(SourceType::Conversation),
            "extraction" => Ok(SourceType::Extraction),
            "manual" => Ok(SourceType::Manual),
            "import" => Ok(SourceType::Import),
            "system" => Ok(SourceType::System),
            _ => Err(format!("Unknown source type: {}", s)),
        }
    }
}

/// Input for storing a new fact
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreFactInput {
    pub content: String,
    pub subject: Option<String>,
    pub predicate: Option<String>,
    pub object: Option<String>,
    #[serde(default)]
    pub category: FactCategory,
    /// Confidence score, 0-100 (default 80)
    pub confidence: Option<f64>,
    #[serde(default)]
    pub source_type: SourceType,
    pub source_ref: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Partial update for a fact; unset fields carry over from the head
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateFactInput {
    pub content: Option<String>,
    pub subject: Option<String>,
    pub predicate: Option<String>,
    pub object: Option<String>,
    pub category: Option<FactCategory>,
    pub confidence: Option<f64>,
    pub tags: Option<Vec<String>>,
}

// ============================================================================
// Memories
// ============================================================================

/// A versioned free-text memory with optional embedding
///
/// Like facts, memories form supersede chains; in addition the head carries
/// an inline `previous_versions` history for cheap single-row reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub memory_space_id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MemoryKind,
    /// Importance score, 0.0-1.0
    pub importance: f64,
    pub source_type: SourceType,
    pub source_ref: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Fixed-dimension embedding, if one was supplied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub version: i32,
    pub supersedes: Option<MemoryId>,
    pub superseded_by: Option<MemoryId>,
    /// Inline history of prior versions, newest last
    #[serde(default)]
    pub previous_versions: Vec<MemoryRevision>,
    /// Set on soft delete; soft-deleted rows stay addressable for audit
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Memory {
    /// Whether this row is the current head of its chain
    pub fn is_head(&self) -> bool {
        self.superseded_by.is_none()
    }
}

/// One entry of a memory's inline version history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRevision {
    pub version: i32,
    pub content: String,
    pub importance: f64,
    pub updated_at: DateTime<Utc>,
}

/// Memory kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    /// Something that happened (temporal context)
    Episodic,
    /// Distilled knowledge
    #[default]
    Semantic,
    /// Learned patterns and workflows
    Procedural,
    /// Agent self-observations
    Reflection,
    Note,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Episodic => "episodic",
            MemoryKind::Semantic => "semantic",
            MemoryKind::Procedural => "procedural",
            MemoryKind::Reflection => "reflection",
            MemoryKind::Note => "note",
        }
    }
}

impl std::str::FromStr for MemoryKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "episodic" => Ok(MemoryKind::Episodic),
            "semantic" => Ok(MemoryKind::Semantic),
            "procedural" => Ok(MemoryKind::Procedural),
            "reflection" => Ok(MemoryKind::Reflection),
            "note" => Ok(MemoryKind::Note),
            _ => Err(format!("Unknown memory kind: {}", s)),
        }
    }
}

/// Input for storing a new memory
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreMemoryInput {
    pub content: String,
    #[serde(default, rename = "type")]
    pub kind: MemoryKind,
    /// Importance score, 0.0-1.0 (default 0.5)
    pub importance: Option<f64>,
    #[serde(default)]
    pub source_type: SourceType,
    pub source_ref: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Precomputed embedding from the external provider
    pub embedding: Option<Vec<f32>>,
}

/// Partial update for a memory; unset fields carry over from the head
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateMemoryInput {
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<MemoryKind>,
    pub importance: Option<f64>,
    pub tags: Option<Vec<String>>,
    /// New embedding matching the new content
    pub embedding: Option<Vec<f32>>,
}

// ============================================================================
// List / search options
// ============================================================================

/// Options for listing facts or memories
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListOptions {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// Filter by fact category (facts only)
    pub category: Option<FactCategory>,
    /// Filter by memory kind (memories only)
    pub kind: Option<MemoryKind>,
    pub subject: Option<String>,
    pub tags: Option<Vec<String>>,
    /// Include superseded (non-head) versions; default false
    #[serde(default)]
    pub include_superseded: bool,
}

/// Options for search operations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchOptions {
    pub limit: Option<i64>,
    pub category: Option<FactCategory>,
    pub kind: Option<MemoryKind>,
    pub tags: Option<Vec<String>>,
    /// Query embedding for vector re-ranking (memories only)
    pub embedding: Option<Vec<f32>>,
    /// Minimum combined score to include a result
    pub min_score: Option<f64>,
}

/// A scored search hit
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit<T> {
    pub entry: T,
    /// Combined relevance score (higher is better)
    pub score: f64,
    /// BM25-derived text score, if text matching contributed
    pub text_score: Option<f64>,
    /// Cosine similarity, if vector ranking contributed
    pub semantic_score: Option<f64>,
}

// ============================================================================
// Contexts
// ============================================================================

/// A hierarchical coordination node (task/goal chain)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub context_id: ContextId,
    pub memory_space_id: String,
    pub purpose: String,
    pub parent_id: Option<ContextId>,
    /// Topmost ancestor (self for roots)
    pub root_id: ContextId,
    /// 0 for roots, parent.depth + 1 otherwise
    pub depth: i32,
    #[serde(default)]
    pub child_ids: Vec<ContextId>,
    #[serde(default)]
    pub status: ContextStatus,
    #[serde(default)]
    pub participants: Vec<Participant>,
    /// Cross-space visibility grants; the only sanctioned way to read
    /// across memory-space boundaries
    #[serde(default)]
    pub granted_access: Vec<AccessGrant>,
    pub version: i32,
    #[serde(default)]
    pub previous_versions: Vec<ContextRevision>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Context status state machine
///
/// Allowed transitions: `active -> {completed, cancelled, blocked}`,
/// `blocked -> active`. Terminal states do not revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    #[default]
    Active,
    Completed,
    Cancelled,
    Blocked,
}

impl ContextStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextStatus::Active => "active",
            ContextStatus::Completed => "completed",
            ContextStatus::Cancelled => "cancelled",
            ContextStatus::Blocked => "blocked",
        }
    }

    /// Whether a transition to `target` is legal from this status
    pub fn can_transition_to(&self, target: ContextStatus) -> bool {
        use ContextStatus::*;
        matches!(
            (self, target),
            (Active, Completed) | (Active, Cancelled) | (Active, Blocked) | (Blocked, Active)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ContextStatus::Completed | ContextStatus::Cancelled)
    }
}

impl std::str::FromStr for ContextStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(ContextStatus::Active),
            "completed" => Ok(ContextStatus::Completed),
            "cancelled" => Ok(ContextStatus::Cancelled),
            "blocked" => Ok(ContextStatus::Blocked),
            _ => Err(format!("Unknown context status: {}", s)),
        }
    }
}

/// A temporary cross-space visibility grant attached to a context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub memory_space_id: String,
    #[serde(default)]
    pub scope: GrantScope,
    pub granted_at: DateTime<Utc>,
}

/// Scope of a cross-space grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GrantScope {
    #[default]
    Read,
    ReadWrite,
}

/// One entry of a context's version history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRevision {
    pub version: i32,
    pub status: ContextStatus,
    pub at: DateTime<Utc>,
}

// ============================================================================
// Governance
// ============================================================================

/// A governance/retention policy
///
/// Scoped by `organization_id` and/or `memory_space_id`; when both a
/// space-specific and an org-wide policy are active, the space-specific
/// one wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernancePolicy {
    pub id: PolicyId,
    pub organization_id: Option<String>,
    pub memory_space_id: Option<String>,
    pub name: String,
    pub rules: Vec<RetentionRule>,
    /// Toggled without deleting history
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single retention rule inside a policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RetentionRule {
    /// Purge superseded/expired facts older than `max_age_days` with
    /// confidence below `below_confidence`
    PurgeStaleFacts { max_age_days: i64, below_confidence: f64 },
    /// Purge non-head memory rows older than `max_age_days`
    PurgeSupersededMemories { max_age_days: i64 },
    /// Trim inline version history arrays to at most `max_entries`
    CapVersionHistory { max_entries: usize },
    /// Archive conversations idle for longer than `max_age_days`
    ExpireConversations { max_age_days: i64 },
}

impl RetentionRule {
    /// Stable identifier recorded in enforcement audit rows
    pub fn rule_id(&self) -> &'static str {
        match self {
            RetentionRule::PurgeStaleFacts { .. } => "purge_stale_facts",
            RetentionRule::PurgeSupersededMemories { .. } => "purge_superseded_memories",
            RetentionRule::CapVersionHistory { .. } => "cap_version_history",
            RetentionRule::ExpireConversations { .. } => "expire_conversations",
        }
    }
}

/// Append-only audit record of one enforcement run
///
/// Written even when the run touched nothing, so "no matching data" is
/// distinguishable from "enforcement never ran".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceEnforcement {
    pub id: i64,
    pub policy_id: Option<PolicyId>,
    pub organization_id: Option<String>,
    pub memory_space_id: Option<String>,
    /// Per-layer purge counts (facts, memories, conversations, contexts)
    #[serde(default)]
    pub layer_counts: HashMap<String, i64>,
    /// Rule ids that were evaluated
    #[serde(default)]
    pub rules_applied: Vec<String>,
    pub versions_deleted: i64,
    pub records_purged: i64,
    pub storage_freed_bytes: i64,
    pub duration_ms: f64,
    /// Present when the run failed partway; counts cover completed work
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Replication outbox
// ============================================================================

/// A pending change awaiting replication to the external graph index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: OutboxId,
    /// Logical table the change belongs to (e.g. "facts")
    pub table: String,
    /// Entity id within that table, stringified
    pub entity_id: String,
    pub operation: OutboxOperation,
    /// Snapshot of the entity at enqueue time
    pub snapshot: Option<serde_json::Value>,
    pub status: OutboxStatus,
    pub synced_at: Option<DateTime<Utc>>,
    pub failed_attempts: i32,
    pub last_error: Option<String>,
    /// Higher drains first
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn is_synced(&self) -> bool {
        self.status == OutboxStatus::Synced
    }
}

/// Outbox mutation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxOperation {
    Insert,
    Update,
    Delete,
}

impl OutboxOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxOperation::Insert => "insert",
            OutboxOperation::Update => "update",
            OutboxOperation::Delete => "delete",
        }
    }
}

impl std::str::FromStr for OutboxOperation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "insert" => Ok(OutboxOperation::Insert),
            "update" => Ok(OutboxOperation::Update),
            "delete" => Ok(OutboxOperation::Delete),
            _ => Err(format!("Unknown outbox operation: {}", s)),
        }
    }
}

/// Outbox delivery state machine: `pending -> syncing -> {synced, pending}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    #[default]
    Pending,
    Syncing,
    Synced,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Syncing => "syncing",
            OutboxStatus::Synced => "synced",
        }
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(OutboxStatus::Pending),
            "syncing" => Ok(OutboxStatus::Syncing),
            "synced" => Ok(OutboxStatus::Synced),
            _ => Err(format!("Unknown outbox status: {}", s)),
        }
    }
}

// ============================================================================
// Configuration & stats
// ============================================================================

/// Configuration for the storage engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database (":memory:" for tests)
    pub db_path: String,
    /// Fixed embedding dimension enforced on memory writes
    #[serde(default = "default_dimensions")]
    pub embedding_dimensions: usize,
}

fn default_dimensions() -> usize {
    384
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            embedding_dimensions: 384,
        }
    }
}

/// Snapshot of store-wide counts for operations dashboards
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreStats {
    pub total_spaces: i64,
    pub total_conversations: i64,
    pub total_messages: i64,
    pub total_facts: i64,
    pub fact_heads: i64,
    pub total_memories: i64,
    pub memory_heads: i64,
    pub total_contexts: i64,
    pub total_policies: i64,
    pub total_enforcements: i64,
    pub outbox_pending: i64,
    pub outbox_synced: i64,
    pub db_size_bytes: i64,
    pub schema_version: i32,
}
