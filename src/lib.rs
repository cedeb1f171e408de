//! Mirror-Harvest: a polite feed harvester for mirrored social timelines
//!
//! This crate periodically fetches public posts for a set of targets (user
//! handles and hashtags) from a pool of interchangeable read-only mirror
//! instances, deduplicates them into a SQLite store, and fans out lifecycle
//! events to live subscribers.

pub mod config;
pub mod events;
pub mod fetcher;
pub mod pool;
pub mod scheduler;
pub mod storage;

use thiserror::Error;

/// Main error type for Mirror-Harvest operations
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid poll interval for target '{target}': {seconds}s (minimum is 60s)")]
    InvalidPollInterval { target: String, seconds: u64 },

    #[error("Target not found: {0}")]
    TargetNotFound(i64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid instance URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Mirror-Harvest operations
pub type Result<T> = std::result::Result<T, HarvestError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use events::{Event, EventBus};
pub use fetcher::ContentFetcher;
pub use pool::{FetchOutcome, InstanceLease, InstancePool};
pub use scheduler::{FetchOnceSummary, Scheduler};
pub use storage::{NewPost, PostFilter, SqliteStore, TargetKind, TargetRecord};
