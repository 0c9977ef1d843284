//! Storage engine for Cortex
//!
//! SQLite connection management, versioned schema, and the shared
//! supersede-chain primitive used by both knowledge stores.

mod connection;
pub mod migrations;
pub mod versioned;

pub use connection::Storage;
pub use migrations::SCHEMA_VERSION;

use chrono::{DateTime, Utc};

/// Parse an RFC3339 timestamp from a TEXT column, tolerating the
/// `CURRENT_TIMESTAMP` fallback format
pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}

/// Parse an optional RFC3339 timestamp column
pub(crate) fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_ts(&s))
}
