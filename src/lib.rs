//! # Cortex
//!
//! Layered knowledge/memory store for AI agents, built on SQLite.
//!
//! The store keeps five layers over one database:
//! - **Memory spaces** — tenancy and participant membership; every other
//!   record belongs to exactly one space and reads never cross spaces
//!   without an explicit grant.
//! - **Conversations** — an append-only message log.
//! - **Facts and memories** — versioned records forming supersede chains;
//!   updates insert a successor and back-patch the old head, so each chain
//!   has exactly one head and history stays queryable.
//! - **Contexts** — a hierarchical coordination tree with a status state
//!   machine and cross-space access grants.
//! - **Governance** — retention policies whose enforcement runs always
//!   leave an audit row, matched data or not.
//!
//! Every mutation enqueues one replication outbox entry in the same
//! transaction; a background worker drains the outbox to an external
//! graph index with at-least-once delivery.
//!
//! ## Example
//!
//! ```no_run
//! use cortex::{Cortex, StorageConfig, StoreFactInput, SpaceType};
//!
//! # fn main() -> cortex::Result<()> {
//! let store = Cortex::open(StorageConfig {
//!     db_path: "cortex.db".to_string(),
//!     ..Default::default()
//! })?;
//!
//! let space = store.create_space(Some("team-alpha"), "Team Alpha", SpaceType::Team)?;
//! store.store_fact(
//!     &space.memory_space_id,
//!     &StoreFactInput {
//!         content: "User prefers dark mode".to_string(),
//!         subject: Some("user".to_string()),
//!         ..Default::default()
//!     },
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod contexts;
pub mod conversations;
pub mod embedding;
pub mod error;
pub mod governance;
pub mod knowledge;
pub mod outbox;
pub mod spaces;
pub mod storage;
pub mod store;
pub mod types;

pub use error::{CortexError, Result};
pub use store::Cortex;

pub use embedding::{cosine_similarity, Embedder, HashingEmbedder};
pub use outbox::{DrainReport, GraphIndexSink, OutboxWorker, OutboxWorkerConfig};
pub use storage::{Storage, SCHEMA_VERSION};
pub use types::{
    AccessGrant, Context, ContextId, ContextRevision, ContextStatus, Conversation,
    ConversationStatus, ConversationType, Fact, FactCategory, FactId, GovernanceEnforcement,
    GovernancePolicy, GrantScope, ListOptions, Memory, MemoryId, MemoryKind, MemoryRevision,
    MemorySpace, Message, MessageRole, OutboxEntry, OutboxOperation, OutboxStatus, Participant,
    ParticipantKind, PolicyId, RetentionRule, SearchHit, SearchOptions, SourceType, SpaceStatus,
    SpaceType, StorageConfig, StoreFactInput, StoreMemoryInput, StoreStats, UpdateFactInput,
    UpdateMemoryInput,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
