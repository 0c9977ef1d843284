//! Knowledge layer: the fact and memory stores
//!
//! Facts are discrete subject/predicate/object assertions with a
//! confidence score; memories are experiential records with an importance
//! score and optional embeddings. Both share the versioned supersede
//! discipline from `storage::versioned` and enqueue one replication
//! outbox entry per mutation.

pub mod facts;
pub mod memories;
