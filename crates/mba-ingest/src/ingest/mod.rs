//! Local file ingestion
//!
//! The producer walks a directory tree and enqueues one [`Job`] per accepted
//! file. A [`WorkerPool`] drains the [`JobQueue`], skipping content the
//! [`DuplicateIndex`] already knows and uploading the rest.

pub mod dedup;
pub mod discovery;
pub mod queue;
pub mod types;
pub mod worker;

pub use dedup::{
    duplicate_report, find_similar_objects, similar_report, DuplicateIndex, ScanResult,
    SimilarObject, Similarity,
};
pub use discovery::{ExtensionFilter, Producer, ProducerReport, ScopeRules};
pub use queue::{JobFailure, JobQueue, QueueStats};
pub use types::{Category, Job, JobOutcome, JobStatus, Scope};
pub use worker::{RunSummary, WorkerConfig, WorkerPool};
