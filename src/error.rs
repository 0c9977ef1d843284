//! Error types for Cortex

use thiserror::Error;

/// Result type alias for Cortex operations
pub type Result<T> = std::result::Result<T, CortexError>;

/// Main error type for Cortex
#[derive(Error, Debug)]
pub enum CortexError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Cycle detected: context {0} would become its own ancestor")]
    CycleDetected(i64),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("Governance error: {0}")]
    Governance(String),

    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CortexError {
    /// Check if the error is safe to retry
    ///
    /// `Conflict` is an optimistic-concurrency collision: the head moved
    /// under the caller, who should re-read and retry. Delivery and
    /// dependency failures are transient by contract.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CortexError::Conflict(_)
                | CortexError::DependencyUnavailable(_)
                | CortexError::Replication(_)
        )
    }

    /// Whether a read path should map this error to an empty result
    /// instead of surfacing it to the caller
    pub fn is_empty_read(&self) -> bool {
        matches!(
            self,
            CortexError::NotFound(_) | CortexError::PermissionDenied(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CortexError::Conflict("head moved".into()).is_retryable());
        assert!(CortexError::DependencyUnavailable("index down".into()).is_retryable());
        assert!(!CortexError::NotFound("fact 1".into()).is_retryable());
        assert!(!CortexError::InvalidInput("bad confidence".into()).is_retryable());
    }

    #[test]
    fn test_empty_read_classification() {
        assert!(CortexError::NotFound("fact 1".into()).is_empty_read());
        assert!(CortexError::PermissionDenied("space mismatch".into()).is_empty_read());
        assert!(!CortexError::Conflict("x".into()).is_empty_read());
    }
}
