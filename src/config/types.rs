use crate::storage::TargetKind;
use serde::Deserialize;

/// Main configuration structure for Mirror-Harvest
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub pool: PoolConfig,
    pub fetcher: FetcherConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    #[serde(default, rename = "target")]
    pub targets: Vec<TargetSeed>,
}

/// Instance pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Base URLs of the upstream mirror instances
    pub instances: Vec<String>,

    /// Token bucket capacity and refill volume per instance
    #[serde(rename = "max-requests-per-minute")]
    pub max_requests_per_minute: u32,

    /// Base backoff applied after the first consecutive failure (seconds)
    #[serde(rename = "backoff-base-seconds")]
    pub backoff_base_seconds: u64,

    /// Upper bound for the exponential backoff (seconds)
    #[serde(rename = "backoff-max-seconds")]
    pub backoff_max_seconds: u64,
}

/// HTTP fetcher configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FetcherConfig {
    /// User agent string sent with every request
    #[serde(rename = "user-agent")]
    pub user_agent: String,

    /// Upper bound for a single network attempt (seconds)
    #[serde(rename = "request-timeout-seconds")]
    pub request_timeout_seconds: u64,
}

/// Scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Shortest retry delay when no instance is eligible (seconds)
    #[serde(rename = "cooldown-min-seconds", default = "default_cooldown_min")]
    pub cooldown_min_seconds: u64,

    /// Longest retry delay when no instance is eligible (seconds)
    #[serde(rename = "cooldown-max-seconds", default = "default_cooldown_max")]
    pub cooldown_max_seconds: u64,

    /// Concurrency bound for the manual fetch-once operation
    #[serde(
        rename = "fetch-once-concurrency",
        default = "default_fetch_once_concurrency"
    )]
    pub fetch_once_concurrency: usize,
}

fn default_cooldown_min() -> u64 {
    5
}

fn default_cooldown_max() -> u64 {
    15
}

fn default_fetch_once_concurrency() -> usize {
    4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cooldown_min_seconds: default_cooldown_min(),
            cooldown_max_seconds: default_cooldown_max(),
            fetch_once_concurrency: default_fetch_once_concurrency(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Keep only the newest N posts per target (no pruning when absent)
    #[serde(rename = "keep-last-per-target", default)]
    pub keep_last_per_target: Option<u32>,
}

/// A target seeded into the store on first boot
#[derive(Debug, Clone, Deserialize)]
pub struct TargetSeed {
    /// Target kind: "user" or "hashtag"
    pub kind: TargetKind,

    /// User handle or hashtag text (without '#')
    pub value: String,

    /// Polling cadence for this target (seconds, minimum 60)
    #[serde(rename = "poll-interval-seconds")]
    pub poll_interval_seconds: u64,
}
