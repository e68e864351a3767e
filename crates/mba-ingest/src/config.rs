//! Configuration management
//!
//! Everything is read from the environment (after loading `.env` with
//! `dotenvy`) and may be overridden by command-line flags.

use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;

use crate::db::DbConfig;
use crate::etl::loader::{
    LoaderConfig, DEFAULT_BATCH_RETRIES, DEFAULT_BATCH_RETRY_DELAY, DEFAULT_BATCH_SIZE,
};
use crate::etl::schema::DEFAULT_SAMPLE_ROWS;
use crate::ingest::discovery::ScopeRules;
use crate::ingest::types::Scope;
use crate::ingest::worker::{
    WorkerConfig, DEFAULT_DEQUEUE_TIMEOUT, DEFAULT_FORCE_STOP_TIMEOUT, DEFAULT_HEARTBEAT_INTERVAL,
    DEFAULT_STALL_TIMEOUT, DEFAULT_WORKERS, MAX_WORKERS,
};
use crate::storage::retry::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY};
use crate::storage::{RetryPolicy, StorageConfig};

/// Default scope for files that match no known scope.
pub const DEFAULT_SCOPE: &str = "mba";

/// Default location of the duplicate cache.
pub const DEFAULT_CACHE_FILE: &str = ".mba-ingest-cache.json";

/// Default age after which a `started` audit record is considered abandoned.
pub const DEFAULT_DANGLING_AFTER_SECS: u64 = 3600;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub storage: StorageConfig,
    /// Only needed by the load commands
    pub database_url: Option<String>,

    pub workers: usize,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub stall_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub force_stop_timeout: Duration,
    pub remote_check: bool,
    pub verify_uploads: bool,

    pub scopes: Vec<Scope>,
    pub default_scope: Scope,
    pub include_extensions: Option<String>,
    pub exclude_extensions: Option<String>,
    pub cache_file: PathBuf,

    pub batch_size: usize,
    pub batch_retries: u32,
    pub sample_rows: usize,
    pub delimiter: Option<u8>,
    pub dangling_after: Duration,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    env_var(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("{name}={raw:?} is invalid: {e}"))
        })
        .transpose()
}

/// Parse a comma-separated scope list, ignoring blanks
pub fn parse_scopes(input: &str) -> anyhow::Result<Vec<Scope>> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Scope::new(s).with_context(|| format!("invalid scope {s:?}")))
        .collect()
}

/// A single-byte delimiter, accepting `\t` and `tab` for tab
pub fn parse_delimiter(input: &str) -> anyhow::Result<u8> {
    match input {
        "\\t" | "tab" | "\t" => Ok(b'\t'),
        s if s.len() == 1 && s.is_ascii() => Ok(s.as_bytes()[0]),
        other => anyhow::bail!("delimiter must be a single ASCII character, got {other:?}"),
    }
}

impl IngestConfig {
    /// Load configuration from `.env` and the environment
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let storage = StorageConfig::from_env().context("invalid storage configuration")?;
        let default_scope = Scope::new(env_var("INGEST_DEFAULT_SCOPE").unwrap_or_else(|| DEFAULT_SCOPE.to_string()))
            .context("invalid INGEST_DEFAULT_SCOPE")?;
        let scopes = match env_var("INGEST_SCOPES") {
            Some(list) => parse_scopes(&list)?,
            None => vec![default_scope.clone()],
        };
        let delimiter = env_var("ETL_DELIMITER")
            .map(|d| parse_delimiter(&d))
            .transpose()?;

        let config = Self {
            storage,
            database_url: env_var("DATABASE_URL"),
            workers: env_parse("INGEST_WORKERS")?.unwrap_or(DEFAULT_WORKERS),
            max_attempts: env_parse("INGEST_MAX_ATTEMPTS")?.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            retry_base_delay: env_parse("INGEST_RETRY_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_BASE_DELAY),
            stall_timeout: env_parse("INGEST_STALL_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_STALL_TIMEOUT),
            heartbeat_interval: env_parse("INGEST_HEARTBEAT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL),
            force_stop_timeout: env_parse("INGEST_FORCE_STOP_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_FORCE_STOP_TIMEOUT),
            remote_check: env_parse("INGEST_REMOTE_CHECK")?.unwrap_or(true),
            verify_uploads: env_parse("INGEST_VERIFY_UPLOADS")?.unwrap_or(true),
            scopes,
            default_scope,
            include_extensions: env_var("INGEST_INCLUDE"),
            exclude_extensions: env_var("INGEST_EXCLUDE"),
            cache_file: env_var("INGEST_CACHE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_FILE)),
            batch_size: env_parse("ETL_BATCH_SIZE")?.unwrap_or(DEFAULT_BATCH_SIZE),
            batch_retries: env_parse("ETL_BATCH_RETRIES")?.unwrap_or(DEFAULT_BATCH_RETRIES),
            sample_rows: env_parse("ETL_SAMPLE_ROWS")?.unwrap_or(DEFAULT_SAMPLE_ROWS),
            delimiter,
            dangling_after: env_parse("ETL_DANGLING_AFTER_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(DEFAULT_DANGLING_AFTER_SECS)),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.storage.validate()?;

        if self.workers == 0 || self.workers > MAX_WORKERS {
            anyhow::bail!("INGEST_WORKERS must be between 1 and {MAX_WORKERS}, got {}", self.workers);
        }
        if self.max_attempts == 0 {
            anyhow::bail!("INGEST_MAX_ATTEMPTS must be greater than 0");
        }
        if self.heartbeat_interval >= self.stall_timeout {
            anyhow::bail!(
                "heartbeat interval ({:?}) must be shorter than the stall timeout ({:?})",
                self.heartbeat_interval,
                self.stall_timeout
            );
        }
        if self.batch_size == 0 {
            anyhow::bail!("ETL_BATCH_SIZE must be greater than 0");
        }
        if self.sample_rows == 0 {
            anyhow::bail!("ETL_SAMPLE_ROWS must be greater than 0");
        }
        if self.scopes.is_empty() {
            tracing::warn!("No known scopes configured - every file uses the default scope");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.retry_base_delay, DEFAULT_MAX_DELAY)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            workers: self.workers,
            retry: self.retry_policy(),
            remote_check: self.remote_check,
            verify_uploads: self.verify_uploads,
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
            stall_timeout: self.stall_timeout,
            heartbeat_interval: self.heartbeat_interval,
            force_stop_timeout: self.force_stop_timeout,
        }
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            batch_size: self.batch_size,
            batch_retries: self.batch_retries,
            batch_retry_delay: DEFAULT_BATCH_RETRY_DELAY,
            sample_rows: self.sample_rows,
            declared_delimiter: self.delimiter,
            fetch_retry: self.retry_policy(),
        }
    }

    pub fn scope_rules(&self) -> ScopeRules {
        ScopeRules::new(self.scopes.clone(), self.default_scope.clone())
    }

    pub fn db_config(&self) -> anyhow::Result<DbConfig> {
        let url = self
            .database_url
            .clone()
            .context("DATABASE_URL must be set to load into PostgreSQL")?;
        let mut config = DbConfig::from_env().unwrap_or_default();
        config.url = url;
        Ok(config)
    }
}
