//! Engine configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the engine can start with zero
//! configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use missive_shared::constants::{
    ATTEMPT_TIMEOUT_MS, BACKOFF_BASE_MS, BACKOFF_CAP_MS, EVENT_BUFFER, MAX_QUEUE, MAX_RETRIES,
};

use crate::backoff::RetryPolicy;

/// Delivery engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// SQLite file holding the ledger and queue.
    /// Env: `MISSIVE_DB_PATH`
    /// Default: `None` (platform data directory)
    pub database_path: Option<PathBuf>,

    /// Offline queue capacity.
    /// Env: `MISSIVE_QUEUE_CAPACITY`
    /// Default: `3`
    pub queue_capacity: usize,

    /// Automatic retries before a queued message is marked failed.
    /// Env: `MISSIVE_MAX_RETRIES`
    /// Default: `3`
    pub max_retries: u32,

    /// Backoff between drain passes.
    /// Env: `MISSIVE_BACKOFF_BASE_MS`, `MISSIVE_BACKOFF_CAP_MS`
    /// Default: 1s doubling, capped at 30s
    pub retry: RetryPolicy,

    /// Bounded wait per send attempt.
    /// Env: `MISSIVE_ATTEMPT_TIMEOUT_MS`
    /// Default: 10s
    pub attempt_timeout: Duration,

    /// UI event channel capacity.
    /// Env: `MISSIVE_EVENT_BUFFER`
    /// Default: `256`
    pub event_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            queue_capacity: MAX_QUEUE,
            max_retries: MAX_RETRIES,
            retry: RetryPolicy::new(
                Duration::from_millis(BACKOFF_BASE_MS),
                Duration::from_millis(BACKOFF_CAP_MS),
            ),
            attempt_timeout: Duration::from_millis(ATTEMPT_TIMEOUT_MS),
            event_buffer: EVENT_BUFFER,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup("MISSIVE_DB_PATH") {
            if !path.is_empty() {
                config.database_path = Some(PathBuf::from(path));
            }
        }

        if let Some(n) = parse_var::<usize>(&lookup, "MISSIVE_QUEUE_CAPACITY") {
            if n == 0 {
                tracing::warn!("MISSIVE_QUEUE_CAPACITY must be at least 1, using default");
            } else {
                config.queue_capacity = n;
            }
        }

        if let Some(n) = parse_var::<u32>(&lookup, "MISSIVE_MAX_RETRIES") {
            config.max_retries = n;
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "MISSIVE_BACKOFF_BASE_MS") {
            config.retry.base = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "MISSIVE_BACKOFF_CAP_MS") {
            config.retry.cap = Duration::from_millis(ms);
        }

        if let Some(ms) = parse_var::<u64>(&lookup, "MISSIVE_ATTEMPT_TIMEOUT_MS") {
            config.attempt_timeout = Duration::from_millis(ms);
        }

        if let Some(n) = parse_var::<usize>(&lookup, "MISSIVE_EVENT_BUFFER") {
            config.event_buffer = n.max(1);
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = lookup(key)?;
    match value.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %value, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.queue_capacity, 3);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry.base, Duration::from_secs(1));
        assert_eq!(config.retry.cap, Duration::from_secs(30));
        assert_eq!(config.attempt_timeout, Duration::from_secs(10));
        assert!(config.database_path.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("MISSIVE_DB_PATH", "/tmp/missive.db"),
            ("MISSIVE_QUEUE_CAPACITY", "5"),
            ("MISSIVE_BACKOFF_BASE_MS", "20"),
            ("MISSIVE_ATTEMPT_TIMEOUT_MS", "250"),
        ]));
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/missive.db")));
        assert_eq!(config.queue_capacity, 5);
        assert_eq!(config.retry.base, Duration::from_millis(20));
        assert_eq!(config.attempt_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("MISSIVE_QUEUE_CAPACITY", "0"),
            ("MISSIVE_MAX_RETRIES", "many"),
        ]));
        assert_eq!(config.queue_capacity, 3);
        assert_eq!(config.max_retries, 3);
    }
}
