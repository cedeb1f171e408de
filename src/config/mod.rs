//! Configuration module for Mirror-Harvest
//!
//! This module handles loading, parsing, and validating TOML configuration files.

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    Config, FetcherConfig, PoolConfig, SchedulerConfig, StorageConfig, TargetSeed,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash};

// Re-export validation entry points
pub use validation::{validate, MIN_POLL_INTERVAL_SECONDS};
