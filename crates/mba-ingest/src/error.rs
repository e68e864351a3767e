//! Error types for the upload pipeline and the CSV loader

use std::path::PathBuf;
use thiserror::Error;

use crate::storage::StoreError;

/// Upload pipeline errors (discovery, hashing, queue, workers)
#[derive(Error, Debug)]
pub enum IngestError {
    /// Local file could not be read. Not transient, never retried.
    #[error("Unreadable file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] mba_common::MbaError),

    #[error("Upload failed: {0}")]
    Upload(#[from] StoreError),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Job queue is closed")]
    QueueClosed,

    /// Persisted duplicate cache is unreadable; callers rebuild instead of aborting
    #[error("Duplicate cache corrupted: {0}")]
    CacheCorruption(String),

    #[error("Job stalled: {0}")]
    Stalled(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IngestError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Loader errors. Every variant is written to the audit trail before it is returned.
#[derive(Error, Debug)]
pub enum EtlError {
    /// Sample could not be parsed; no table mutation is attempted
    #[error("Schema inference failed: {0}")]
    SchemaInference(String),

    /// Inferred columns cannot be reconciled with the existing table
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Batch insert kept failing; rows from earlier batches stay committed
    #[error("Load failed after {committed_rows} committed rows: {message}")]
    LoadTransaction { committed_rows: u64, message: String },

    #[error("Row {row}, column {column}: cannot read {value:?} as {expected}")]
    Coercion {
        row: u64,
        column: String,
        value: String,
        expected: String,
    },

    #[error("Object store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("Audit record not found: {0}")]
    AuditNotFound(uuid::Uuid),
}

pub type IngestResult<T> = Result<T, IngestError>;
pub type EtlResult<T> = Result<T, EtlError>;
