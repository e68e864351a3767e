//! MBA Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Moves local files into S3-compatible object storage and loads stored CSV
//! objects into PostgreSQL.
//!
//! # Overview
//!
//! - **Ingestion** ([`ingest`]): discovery, a shared job queue, a worker pool
//!   with duplicate detection and bounded upload retry
//! - **Storage** ([`storage`]): the [`storage::ObjectStore`] trait with S3 and
//!   in-memory implementations
//! - **ETL** ([`etl`]): schema inference, type coercion, batched loads and an
//!   audit trail for every load
//! - **Database** ([`db`]): connection pool and embedded migrations
//!
//! # Example
//!
//! ```no_run
//! use mba_ingest::ingest::{DuplicateIndex, ExtensionFilter, JobQueue, Producer, WorkerPool};
//! use mba_ingest::{config::IngestConfig, storage::S3Store};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = IngestConfig::from_env()?;
//!     let store = Arc::new(S3Store::new(config.storage.clone()).await?);
//!     let index = Arc::new(DuplicateIndex::open(config.cache_file.clone()).await?);
//!     let queue = Arc::new(JobQueue::new());
//!
//!     let producer = Producer::new("./data", ExtensionFilter::new(None, None), config.scope_rules());
//!     producer.run(&queue).await?;
//!     queue.close();
//!
//!     let pool = WorkerPool::new(queue, store, index, config.worker_config());
//!     let summary = pool.run(CancellationToken::new()).await?;
//!     tracing::info!(succeeded = summary.stats.succeeded, "done");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod etl;
pub mod ingest;
pub mod storage;

pub use error::{EtlError, EtlResult, IngestError, IngestResult};
