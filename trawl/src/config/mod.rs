//! Application configuration.
//!
//! Plain env-var backed settings, loaded once at startup (after `dotenvy`
//! has populated the environment) and passed down explicitly.

use std::path::PathBuf;

use crate::scheduler::DEFAULT_TICK_CRON;
use crate::{Error, Result};

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database URL.
    pub database_url: String,
    /// Base directory for result files (one subdirectory per platform).
    pub results_dir: PathBuf,
    /// Shell command invoking the external browser-automation backend.
    pub scrape_command: Option<String>,
    /// Number of concurrent worker loops.
    pub worker_count: usize,
    /// Maximum task starts per rolling rate-limit window.
    pub rate_limit_max_starts: u32,
    /// Rate-limit window length in seconds.
    pub rate_limit_window_secs: u64,
    /// Maximum queue delivery attempts per task.
    pub queue_max_attempts: i64,
    /// Base delay for queue retry backoff, in seconds.
    pub queue_backoff_base_secs: i64,
    /// Days a result file is retained before cleanup.
    pub result_retention_days: u64,
    /// Cron expression (UTC) for the daily recurrence tick.
    pub tick_cron: String,
    /// TTL for cancellation flags, in seconds.
    pub cancel_ttl_secs: u64,
    /// Optional directory for rotated log files.
    pub log_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:trawl.db?mode=rwc".to_string(),
            results_dir: PathBuf::from("./results"),
            scrape_command: None,
            worker_count: 2,
            rate_limit_max_starts: 2,
            rate_limit_window_secs: 60,
            queue_max_attempts: 3,
            queue_backoff_base_secs: 30,
            result_retention_days: 30,
            tick_cron: DEFAULT_TICK_CRON.to_string(),
            cancel_ttl_secs: 3600,
            log_dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            database_url: env_or("TRAWL_DATABASE_URL", defaults.database_url),
            results_dir: PathBuf::from(env_or(
                "TRAWL_RESULTS_DIR",
                defaults.results_dir.display().to_string(),
            )),
            scrape_command: std::env::var("TRAWL_SCRAPE_COMMAND").ok(),
            worker_count: env_parsed("TRAWL_WORKER_COUNT", defaults.worker_count)?,
            rate_limit_max_starts: env_parsed(
                "TRAWL_RATE_LIMIT_MAX_STARTS",
                defaults.rate_limit_max_starts,
            )?,
            rate_limit_window_secs: env_parsed(
                "TRAWL_RATE_LIMIT_WINDOW_SECS",
                defaults.rate_limit_window_secs,
            )?,
            queue_max_attempts: env_parsed("TRAWL_QUEUE_MAX_ATTEMPTS", defaults.queue_max_attempts)?,
            queue_backoff_base_secs: env_parsed(
                "TRAWL_QUEUE_BACKOFF_BASE_SECS",
                defaults.queue_backoff_base_secs,
            )?,
            result_retention_days: env_parsed(
                "TRAWL_RESULT_RETENTION_DAYS",
                defaults.result_retention_days,
            )?,
            tick_cron: env_or("TRAWL_TICK_CRON", defaults.tick_cron),
            cancel_ttl_secs: env_parsed("TRAWL_CANCEL_TTL_SECS", defaults.cancel_ttl_secs)?,
            log_dir: std::env::var("TRAWL_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| Error::config(format!("invalid value for {key}: {value}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.rate_limit_max_starts, 2);
        assert_eq!(config.rate_limit_window_secs, 60);
        assert_eq!(config.queue_max_attempts, 3);
        assert_eq!(config.result_retention_days, 30);
        assert_eq!(config.tick_cron, DEFAULT_TICK_CRON);
    }
}
