use crate::config::types::{Config, FetcherConfig, PoolConfig, SchedulerConfig, TargetSeed};
use crate::ConfigError;
use url::Url;

/// Minimum allowed poll interval for a target, in seconds
pub const MIN_POLL_INTERVAL_SECONDS: u64 = 60;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_pool_config(&config.pool)?;
    validate_fetcher_config(&config.fetcher)?;
    validate_scheduler_config(&config.scheduler)?;

    if config.storage.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }

    for seed in &config.targets {
        validate_target_seed(seed)?;
    }

    Ok(())
}

/// Validates instance pool configuration
fn validate_pool_config(config: &PoolConfig) -> Result<(), ConfigError> {
    if config.instances.is_empty() {
        return Err(ConfigError::Validation(
            "at least one mirror instance is required".to_string(),
        ));
    }

    for instance in &config.instances {
        let url = Url::parse(instance)
            .map_err(|e| ConfigError::InvalidUrl(format!("'{}': {}", instance, e)))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::InvalidUrl(format!(
                "'{}': scheme must be http or https",
                instance
            )));
        }
    }

    if config.max_requests_per_minute < 1 {
        return Err(ConfigError::Validation(format!(
            "max-requests-per-minute must be >= 1, got {}",
            config.max_requests_per_minute
        )));
    }

    if config.backoff_base_seconds < 1 {
        return Err(ConfigError::Validation(format!(
            "backoff-base-seconds must be >= 1, got {}",
            config.backoff_base_seconds
        )));
    }

    if config.backoff_max_seconds < config.backoff_base_seconds {
        return Err(ConfigError::Validation(format!(
            "backoff-max-seconds ({}) must be >= backoff-base-seconds ({})",
            config.backoff_max_seconds, config.backoff_base_seconds
        )));
    }

    Ok(())
}

/// Validates fetcher configuration
fn validate_fetcher_config(config: &FetcherConfig) -> Result<(), ConfigError> {
    if config.user_agent.is_empty() {
        return Err(ConfigError::Validation(
            "user-agent cannot be empty".to_string(),
        ));
    }

    if config.request_timeout_seconds < 1 || config.request_timeout_seconds > 60 {
        return Err(ConfigError::Validation(format!(
            "request-timeout-seconds must be between 1 and 60, got {}",
            config.request_timeout_seconds
        )));
    }

    Ok(())
}

/// Validates scheduler configuration
fn validate_scheduler_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    if config.cooldown_min_seconds < 1 {
        return Err(ConfigError::Validation(format!(
            "cooldown-min-seconds must be >= 1, got {}",
            config.cooldown_min_seconds
        )));
    }

    if config.cooldown_max_seconds < config.cooldown_min_seconds {
        return Err(ConfigError::Validation(format!(
            "cooldown-max-seconds ({}) must be >= cooldown-min-seconds ({})",
            config.cooldown_max_seconds, config.cooldown_min_seconds
        )));
    }

    if config.fetch_once_concurrency < 1 || config.fetch_once_concurrency > 64 {
        return Err(ConfigError::Validation(format!(
            "fetch-once-concurrency must be between 1 and 64, got {}",
            config.fetch_once_concurrency
        )));
    }

    Ok(())
}

/// Validates a seeded target entry
fn validate_target_seed(seed: &TargetSeed) -> Result<(), ConfigError> {
    let value = seed.value.trim();

    if value.is_empty() {
        return Err(ConfigError::Validation(
            "target value cannot be empty".to_string(),
        ));
    }

    if value.starts_with('#') || value.starts_with('@') {
        return Err(ConfigError::Validation(format!(
            "target value '{}' must be given without a leading '#' or '@'",
            seed.value
        )));
    }

    if seed.poll_interval_seconds < MIN_POLL_INTERVAL_SECONDS {
        return Err(ConfigError::Validation(format!(
            "poll-interval-seconds for target '{}' must be >= {}, got {}",
            seed.value, MIN_POLL_INTERVAL_SECONDS, seed.poll_interval_seconds
        )));
    }

    Ok(())
}
