//! Storage module for persisting harvest data
//!
//! This module handles all database operations, including:
//! - SQLite database initialization and schema management
//! - Target definitions (the polling subjects)
//! - Deduplicated post persistence and filtered reads
//! - Streaming JSONL export

mod schema;
mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Target not found: {0}")]
    TargetNotFound(i64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Kind of polling subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    User,
    Hashtag,
}

impl TargetKind {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Hashtag => "hashtag",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "hashtag" => Some(Self::Hashtag),
            _ => None,
        }
    }
}

/// A polling subject as stored in the database
#[derive(Debug, Clone, Serialize)]
pub struct TargetRecord {
    pub id: i64,
    pub kind: TargetKind,
    pub value: String,
    pub poll_interval_seconds: u64,
    /// Dedup key of the newest post seen in the last successful cycle
    pub last_fetched_key: Option<String>,
    pub last_fetched_at: Option<String>,
    pub created_at: String,
}

impl TargetRecord {
    /// Label used in logs and the fetch-once summary, e.g. "user:alice"
    pub fn label(&self) -> String {
        format!("{}:{}", self.kind.to_db_string(), self.value)
    }
}

/// A normalized post ready for insertion
#[derive(Debug, Clone)]
pub struct NewPost {
    /// Deterministic identifier; same logical post always yields the same key
    pub dedup_key: String,
    pub target_id: i64,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
    pub source_instance: String,
}

/// A post as stored in the database
#[derive(Debug, Clone, Serialize)]
pub struct PostRecord {
    pub id: i64,
    pub dedup_key: String,
    pub target_id: i64,
    pub content: String,
    pub created_at: Option<String>,
    pub fetched_at: String,
    pub source_instance: String,
}

/// Filter for timeline reads
#[derive(Debug, Clone, Default)]
pub struct PostFilter {
    /// Only posts belonging to this target
    pub target_id: Option<i64>,
    /// Case-insensitive substring match against content
    pub contains: Option<String>,
    /// Result cap; defaults to [`DEFAULT_QUERY_LIMIT`], clamped to [`MAX_QUERY_LIMIT`]
    pub limit: Option<usize>,
}

/// Default result cap for timeline reads
pub const DEFAULT_QUERY_LIMIT: usize = 50;

/// Hard cap for timeline reads, preventing unbounded scans
pub const MAX_QUERY_LIMIT: usize = 500;

impl PostFilter {
    pub(crate) fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT).min(MAX_QUERY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_kind_roundtrip() {
        for kind in &[TargetKind::User, TargetKind::Hashtag] {
            let db_str = kind.to_db_string();
            assert_eq!(Some(*kind), TargetKind::from_db_string(db_str));
        }
    }

    #[test]
    fn test_target_kind_invalid() {
        assert_eq!(TargetKind::from_db_string("account"), None);
    }

    #[test]
    fn test_effective_limit_defaults_and_caps() {
        let filter = PostFilter::default();
        assert_eq!(filter.effective_limit(), DEFAULT_QUERY_LIMIT);

        let filter = PostFilter {
            limit: Some(10),
            ..Default::default()
        };
        assert_eq!(filter.effective_limit(), 10);

        let filter = PostFilter {
            limit: Some(10_000),
            ..Default::default()
        };
        assert_eq!(filter.effective_limit(), MAX_QUERY_LIMIT);
    }

    #[test]
    fn test_target_label() {
        let target = TargetRecord {
            id: 1,
            kind: TargetKind::Hashtag,
            value: "rustlang".to_string(),
            poll_interval_seconds: 300,
            last_fetched_key: None,
            last_fetched_at: None,
            created_at: "2024-01-01T00:00:00Z".to_string(),
        };
        assert_eq!(target.label(), "hashtag:rustlang");
    }
}
