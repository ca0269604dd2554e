use std::path::PathBuf;
use std::time::Duration;

use crate::error::{QueueError, Result};

// Process-level settings, loaded once from the environment (and `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub zombie_sweep_secs: u64,
    pub zombie_threshold_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub log_dir: Option<PathBuf>,
    pub backup_dir: PathBuf,
    pub migrate_on_startup: bool,
    pub db_max_connections: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env_or_fallback("MEDIAFLOW_DATABASE_URL", "DATABASE_URL")
            .unwrap_or_else(|| "sqlite://mediaflow.db".to_string());

        let worker_id = env_or_fallback("MEDIAFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker".to_string());

        let workers = parse_env("MEDIAFLOW_WORKERS", "WORKERS")?.unwrap_or(2);
        if workers == 0 {
            return Err(QueueError::Config(
                "MEDIAFLOW_WORKERS must be at least 1".to_string(),
            ));
        }

        let poll_interval_ms = parse_env("MEDIAFLOW_POLL_INTERVAL_MS", "POLL_INTERVAL_MS")?
            .unwrap_or(1_000);

        let zombie_sweep_secs =
            parse_env("MEDIAFLOW_ZOMBIE_SWEEP_SECS", "ZOMBIE_SWEEP_SECS")?.unwrap_or(300);

        let zombie_threshold_secs =
            parse_env("MEDIAFLOW_ZOMBIE_THRESHOLD_SECS", "ZOMBIE_THRESHOLD_SECS")?
                .unwrap_or(60 * 60);

        let shutdown_timeout_secs =
            parse_env("MEDIAFLOW_SHUTDOWN_TIMEOUT_SECS", "SHUTDOWN_TIMEOUT_SECS")?.unwrap_or(30);

        let log_dir = env_or_fallback("MEDIAFLOW_LOG_DIR", "LOG_DIR").map(PathBuf::from);

        let backup_dir = env_or_fallback("MEDIAFLOW_BACKUP_DIR", "BACKUP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("backups"));

        let migrate_on_startup = env_bool("MEDIAFLOW_MIGRATE_ON_STARTUP").unwrap_or(true);

        let db_max_connections = parse_env("MEDIAFLOW_DB_MAX_CONNECTIONS", "DB_MAX_CONNECTIONS")?
            .unwrap_or(8u32)
            .clamp(1, 32);

        Ok(Self {
            database_url,
            worker_id,
            workers,
            poll_interval_ms,
            zombie_sweep_secs,
            zombie_threshold_secs,
            shutdown_timeout_secs,
            log_dir,
            backup_dir,
            migrate_on_startup,
            db_max_connections,
        })
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            worker_id: self.worker_id.clone(),
            workers: self.workers,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            zombie_sweep_interval: Duration::from_secs(self.zombie_sweep_secs),
            zombie_threshold: Duration::from_secs(self.zombie_threshold_secs),
            ..QueueConfig::default()
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Runtime knobs of a [`crate::service::QueueService`].
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Prefix for dispatcher unit ids; unit `n` runs as `{worker_id}-{n}`.
    pub worker_id: String,
    pub workers: usize,
    pub poll_interval: Duration,
    /// Upper bound of the random extra sleep added to each idle poll.
    pub poll_jitter: Duration,
    pub zombie_sweep_interval: Duration,
    pub zombie_threshold: Duration,
    /// Pause after a store error before the dispatcher tries again.
    pub error_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker".to_string(),
            workers: 2,
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::from_millis(100),
            zombie_sweep_interval: Duration::from_secs(300),
            zombie_threshold: Duration::from_secs(60 * 60),
            error_backoff: Duration::from_secs(1),
        }
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn parse_env<T: std::str::FromStr>(primary: &str, fallback: &str) -> Result<Option<T>> {
    match env_or_fallback(primary, fallback) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| QueueError::Config(format!("{primary}: cannot parse {raw:?}"))),
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}
