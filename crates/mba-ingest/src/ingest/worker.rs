//! Upload worker pool
//!
//! Workers pull jobs from the shared [`JobQueue`], fingerprint the file, consult
//! the [`DuplicateIndex`] and upload what is new. A supervisor task requeues
//! jobs whose worker stopped heart-beating.
//!
//! Shutdown is driven by a [`CancellationToken`]: on cancel the queue is closed,
//! workers keep draining what is left, and once the force-stop timeout passes
//! they stop taking new jobs and exit after their current one.

use mba_common::Fingerprint;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::dedup::DuplicateIndex;
use super::queue::{JobFailure, JobQueue, QueueStats};
use super::types::{Job, JobOutcome};
use crate::error::{IngestError, IngestResult};
use crate::etl::trigger::LoadTrigger;
use crate::storage::{put_with_retry, ObjectMetadata, ObjectStore, RetryPolicy};

pub const MAX_WORKERS: usize = 32;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_DEQUEUE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_FORCE_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    pub retry: RetryPolicy,
    /// Confirm cached duplicates against the store; off is the fast mode
    pub remote_check: bool,
    /// HEAD the object after upload and compare sizes
    pub verify_uploads: bool,
    pub dequeue_timeout: Duration,
    pub stall_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub force_stop_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            retry: RetryPolicy::default(),
            remote_check: true,
            verify_uploads: true,
            dequeue_timeout: DEFAULT_DEQUEUE_TIMEOUT,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            force_stop_timeout: DEFAULT_FORCE_STOP_TIMEOUT,
        }
    }
}

impl WorkerConfig {
    pub fn worker_count(&self) -> usize {
        self.workers.clamp(1, MAX_WORKERS)
    }
}

/// Outcome of one pool run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub stats: QueueStats,
    pub failures: Vec<JobFailure>,
    /// Freshly uploaded CSVs, ready for the loader
    pub load_triggers: Vec<LoadTrigger>,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

struct WorkerContext {
    queue: Arc<JobQueue>,
    store: Arc<dyn ObjectStore>,
    index: Arc<DuplicateIndex>,
    config: WorkerConfig,
}

pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        store: Arc<dyn ObjectStore>,
        index: Arc<DuplicateIndex>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerContext {
                queue,
                store,
                index,
                config,
            }),
        }
    }

    /// Run until the queue is closed and drained, or the force-stop timeout
    /// expires after `shutdown` fires. The caller closes the queue once
    /// production is finished.
    pub async fn run(&self, shutdown: CancellationToken) -> IngestResult<RunSummary> {
        let started = Instant::now();
        let worker_count = self.ctx.config.worker_count();
        let done = CancellationToken::new();
        let stop_taking = CancellationToken::new();

        info!(
            workers = worker_count,
            remote_check = self.ctx.config.remote_check,
            max_attempts = self.ctx.config.retry.max_attempts,
            "Starting worker pool"
        );

        let watcher = spawn_shutdown_watcher(
            self.ctx.queue.clone(),
            shutdown,
            done.clone(),
            stop_taking.clone(),
            self.ctx.config.force_stop_timeout,
        );
        let supervisor = spawn_stall_supervisor(
            self.ctx.queue.clone(),
            done.clone(),
            self.ctx.config.stall_timeout,
        );

        let handles: Vec<JoinHandle<Vec<LoadTrigger>>> = (0..worker_count)
            .map(|index| {
                let ctx = self.ctx.clone();
                let stop_taking = stop_taking.clone();
                let span = info_span!("worker", worker = index);
                tokio::spawn(worker_loop(ctx, stop_taking).instrument(span))
            })
            .collect();

        let mut load_triggers = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(triggers) => load_triggers.extend(triggers),
                Err(err) => error!(error = %err, "Worker task panicked"),
            }
        }

        done.cancel();
        if let Err(err) = watcher.await {
            warn!(error = %err, "Shutdown watcher task failed");
        }
        if let Err(err) = supervisor.await {
            warn!(error = %err, "Stall supervisor task failed");
        }

        if let Err(err) = self.ctx.index.flush().await {
            warn!(error = %err, "Could not flush duplicate cache");
        }

        let summary = RunSummary {
            stats: self.ctx.queue.stats(),
            failures: self.ctx.queue.failures(),
            load_triggers,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        };

        info!(
            submitted = summary.stats.submitted,
            succeeded = summary.stats.succeeded,
            failed = summary.stats.failed,
            duplicates_skipped = summary.stats.duplicates_skipped,
            requeued = summary.stats.requeued,
            elapsed_ms = summary.elapsed_ms,
            "Worker pool finished"
        );
        Ok(summary)
    }
}

fn spawn_shutdown_watcher(
    queue: Arc<JobQueue>,
    shutdown: CancellationToken,
    done: CancellationToken,
    stop_taking: CancellationToken,
    force_stop_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = shutdown.cancelled() => {},
        }

        info!("Shutdown requested, closing queue and draining");
        queue.close();

        tokio::select! {
            _ = done.cancelled() => {},
            _ = tokio::time::sleep(force_stop_timeout) => {
                warn!(
                    timeout_secs = force_stop_timeout.as_secs(),
                    "Force-stop timeout reached, workers stop taking jobs"
                );
                stop_taking.cancel();
            },
        }
    })
}

fn spawn_stall_supervisor(
    queue: Arc<JobQueue>,
    done: CancellationToken,
    stall_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval((stall_timeout / 4).max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = ticker.tick() => {
                    let report = queue.requeue_stalled(stall_timeout);
                    if report.requeued > 0 || report.failed > 0 {
                        warn!(requeued = report.requeued, failed = report.failed, "Stalled jobs handled");
                    }
                },
            }
        }
    })
}

async fn worker_loop(ctx: Arc<WorkerContext>, stop_taking: CancellationToken) -> Vec<LoadTrigger> {
    let mut triggers = Vec::new();

    loop {
        if stop_taking.is_cancelled() {
            debug!("Stopped taking new jobs");
            break;
        }
        if ctx.queue.is_closed() && ctx.queue.is_drained() {
            break;
        }

        let job = tokio::select! {
            _ = stop_taking.cancelled() => break,
            job = ctx.queue.dequeue(ctx.config.dequeue_timeout) => job,
        };
        let Some(mut job) = job else {
            continue;
        };

        let (job_id, lease) = (job.id, job.lease);
        let outcome = tokio::select! {
            outcome = process_job(&ctx, &mut job) => outcome,
            _ = heartbeat(&ctx.queue, job_id, lease, ctx.config.heartbeat_interval) => unreachable_heartbeat(),
        };

        let uploaded = outcome == JobOutcome::Uploaded;
        let key = job.destination_key.clone();
        let loadable = job.is_loadable();
        match &outcome {
            JobOutcome::Uploaded => info!(key = %key, attempts = job.attempts, "Uploaded"),
            JobOutcome::DuplicateSkipped { known_location } => {
                info!(key = %key, known_location = %known_location, "Skipped duplicate")
            },
            JobOutcome::Failed { error } => {
                warn!(key = %key, attempts = job.attempts, error = %error, "Upload failed")
            },
        }

        if ctx.queue.mark_done(job, outcome) && uploaded && loadable {
            triggers.push(LoadTrigger::new(ctx.store.bucket(), key));
        }
    }

    triggers
}

async fn heartbeat(queue: &JobQueue, job_id: Uuid, lease: u64, every: Duration) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if !queue.heartbeat(job_id, lease) {
            debug!(job_id = %job_id, lease, "Lease lost, heartbeat has no effect");
        }
    }
}

fn unreachable_heartbeat() -> JobOutcome {
    JobOutcome::Failed {
        error: "heartbeat loop ended unexpectedly".to_string(),
    }
}

/// Run one job to a verdict. Never panics and never returns early without one.
async fn process_job(ctx: &WorkerContext, job: &mut Job) -> JobOutcome {
    match try_process_job(ctx, job).await {
        Ok(outcome) => outcome,
        Err(err) => {
            let error = err.to_string();
            job.last_error = Some(error.clone());
            JobOutcome::Failed { error }
        },
    }
}

async fn try_process_job(ctx: &WorkerContext, job: &mut Job) -> IngestResult<JobOutcome> {
    let fingerprint = match &job.fingerprint {
        Some(fingerprint) => fingerprint.clone(),
        None => {
            let fingerprint = fingerprint_file(job).await?;
            job.fingerprint = Some(fingerprint.clone());
            fingerprint
        },
    };

    let size = tokio::fs::metadata(&job.source_path)
        .await
        .map_err(|e| IngestError::io(&job.source_path, e))?
        .len();

    // Identical content in the same run is decided one file at a time
    let _guard = ctx.index.lock_fingerprint(&fingerprint).await;

    let check = ctx
        .index
        .check(
            &fingerprint,
            &job.scope,
            size,
            &job.destination_key,
            ctx.store.as_ref(),
            ctx.config.remote_check,
        )
        .await;

    match check {
        Ok(check) if check.duplicate => {
            record_decision(ctx, &fingerprint, job, size, None).await;
            job.duplicate = true;
            return Ok(JobOutcome::DuplicateSkipped {
                known_location: check.known_location.unwrap_or_default(),
            });
        },
        Ok(_) => {},
        Err(err) => {
            warn!(key = %job.destination_key, error = %err, "Duplicate check failed, uploading anyway");
        },
    }

    let data = tokio::fs::read(&job.source_path)
        .await
        .map_err(|e| IngestError::io(&job.source_path, e))?;
    // The file may have been rewritten since it was fingerprinted
    fingerprint.verify(&data)?;
    let metadata = ObjectMetadata::for_upload(job.file_name(), &fingerprint);

    let (result, attempts) = put_with_retry(
        ctx.store.as_ref(),
        &ctx.config.retry,
        &job.destination_key,
        data,
        &metadata,
    )
    .await;
    job.attempts = attempts;
    let receipt = result?;

    if ctx.config.verify_uploads {
        let (exists, remote_size, _) = ctx.store.exists(&receipt.key).await?;
        if !exists || remote_size != size {
            return Ok(JobOutcome::Failed {
                error: format!(
                    "verification failed for {}: exists={}, remote size {} != local size {}",
                    receipt.key, exists, remote_size, size
                ),
            });
        }
    }

    record_decision(ctx, &fingerprint, job, size, Some(&receipt.key)).await;
    Ok(JobOutcome::Uploaded)
}

async fn fingerprint_file(job: &Job) -> IngestResult<Fingerprint> {
    let path = job.source_path.clone();
    let hashed = tokio::task::spawn_blocking(move || Fingerprint::from_file(&path))
        .await
        .map_err(|e| IngestError::Discovery(format!("hash task failed: {e}")))?;

    hashed.map_err(|err| match err {
        mba_common::MbaError::Io(source) => IngestError::io(&job.source_path, source),
        other => IngestError::Fingerprint(other),
    })
}

/// Cache writes are best effort; a failed flush never fails the job
async fn record_decision(
    ctx: &WorkerContext,
    fingerprint: &Fingerprint,
    job: &Job,
    size: u64,
    remote_key: Option<&str>,
) {
    if let Err(err) = ctx
        .index
        .record_local(fingerprint, &job.source_path, size)
        .await
    {
        warn!(error = %err, "Could not record local location");
    }
    if let Some(key) = remote_key {
        if let Err(err) = ctx.index.record_remote(fingerprint, key, size).await {
            warn!(error = %err, "Could not record remote location");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ingest::discovery::{discover, ExtensionFilter, ScopeRules};
    use crate::ingest::types::Scope;
    use crate::storage::{ListPage, MemoryStore, ObjectInfo, PutReceipt, StoreError};
    use async_trait::async_trait;
    use std::fs;
    use std::path::Path;

    /// Memory store whose uploads take `delay` to complete
    struct SlowStore {
        inner: MemoryStore,
        delay: Duration,
    }

    impl SlowStore {
        fn new(delay: Duration) -> Self {
            Self {
                inner: MemoryStore::new("mba-data"),
                delay,
            }
        }
    }

    #[async_trait]
    impl ObjectStore for SlowStore {
        fn bucket(&self) -> &str {
            self.inner.bucket()
        }

        async fn put(
            &self,
            key: &str,
            data: Vec<u8>,
            metadata: &ObjectMetadata,
        ) -> Result<PutReceipt, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.put(key, data, metadata).await
        }

        async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StoreError> {
            self.inner.head(key).await
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
            self.inner.get(key).await
        }

        async fn list_page(
            &self,
            prefix: &str,
            continuation: Option<String>,
            page_size: i32,
        ) -> Result<ListPage, StoreError> {
            self.inner.list_page(prefix, continuation, page_size).await
        }
    }

    fn config(workers: usize) -> WorkerConfig {
        WorkerConfig {
            workers,
            retry: RetryPolicy::immediate(3),
            dequeue_timeout: Duration::from_millis(20),
            ..WorkerConfig::default()
        }
    }

    fn enqueue_dir(queue: &JobQueue, root: &Path) {
        let rules = ScopeRules::new(vec![], Scope::new("mba").unwrap());
        for job in discover(root, &ExtensionFilter::default(), &rules, None).unwrap() {
            queue.enqueue(job).unwrap();
        }
        queue.close();
    }

    #[test]
    fn test_worker_count_clamped() {
        assert_eq!(config(0).worker_count(), 1);
        assert_eq!(config(100).worker_count(), MAX_WORKERS);
    }

    #[tokio::test]
    async fn test_uploads_and_emits_load_triggers() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("members.csv"), "id,name\n1,a\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let queue = Arc::new(JobQueue::new());
        enqueue_dir(&queue, dir.path());
        let store = Arc::new(MemoryStore::new("mba-data"));
        let pool = WorkerPool::new(
            queue.clone(),
            store.clone(),
            Arc::new(DuplicateIndex::in_memory()),
            config(2),
        );

        let summary = pool.run(CancellationToken::new()).await.unwrap();
        assert_eq!(summary.stats.succeeded, 2);
        assert!(summary.stats.is_consistent());
        assert_eq!(store.put_count(), 2);
        assert_eq!(summary.load_triggers.len(), 1);
        assert_eq!(summary.load_triggers[0].key, "mba/tabular/members.csv");
        assert_eq!(summary.load_triggers[0].source, "mba-data");

        let object = store.object("mba/text/notes.txt").await.unwrap();
        assert_eq!(object.data, b"hello");
        assert_eq!(object.metadata.user["original-filename"], "notes.txt");
    }

    #[tokio::test]
    async fn test_unreadable_file_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.pdf");
        fs::write(&path, "x").unwrap();

        let queue = Arc::new(JobQueue::new());
        enqueue_dir(&queue, dir.path());
        fs::remove_file(&path).unwrap();

        let store = Arc::new(MemoryStore::new("mba-data"));
        let pool = WorkerPool::new(
            queue,
            store.clone(),
            Arc::new(DuplicateIndex::in_memory()),
            config(1),
        );
        let summary = pool.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.stats.failed, 1);
        assert_eq!(summary.failures[0].attempts, 0);
        assert!(summary.failures[0].error.contains("Unreadable file"));
        assert_eq!(store.put_count(), 0);
    }

    #[tokio::test]
    async fn test_file_rewritten_after_fingerprint_is_not_uploaded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("plan.pdf"), b"rewritten").unwrap();

        let queue = Arc::new(JobQueue::new());
        let rules = ScopeRules::new(vec![], Scope::new("mba").unwrap());
        for mut job in discover(dir.path(), &ExtensionFilter::default(), &rules, None).unwrap() {
            job.fingerprint = Some(Fingerprint::from_bytes(b"original"));
            queue.enqueue(job).unwrap();
        }
        queue.close();

        let store = Arc::new(MemoryStore::new("mba-data"));
        let pool = WorkerPool::new(
            queue,
            store.clone(),
            Arc::new(DuplicateIndex::in_memory()),
            config(1),
        );
        let summary = pool.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.stats.failed, 1);
        assert!(summary.failures[0].error.contains("Checksum mismatch"));
        assert_eq!(store.put_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_queue() {
        let queue = Arc::new(JobQueue::new());
        let pool = WorkerPool::new(
            queue.clone(),
            Arc::new(MemoryStore::new("mba-data")),
            Arc::new(DuplicateIndex::in_memory()),
            config(3),
        );

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let summary = pool.run(shutdown).await.unwrap();

        assert!(queue.is_closed());
        assert_eq!(summary.stats, QueueStats::default());
    }

    #[tokio::test]
    async fn test_idle_worker_waits_for_busy_one_on_closed_queue() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("only.pdf"), b"%PDF").unwrap();

        let queue = Arc::new(JobQueue::new());
        enqueue_dir(&queue, dir.path());
        let store = Arc::new(SlowStore::new(Duration::from_millis(200)));
        let pool = WorkerPool::new(
            queue,
            store.clone(),
            Arc::new(DuplicateIndex::in_memory()),
            config(2),
        );

        let summary = tokio::time::timeout(Duration::from_secs(10), pool.run(CancellationToken::new()))
            .await
            .expect("pool finishes once the busy worker is done")
            .unwrap();
        assert_eq!(summary.stats.succeeded, 1);
        assert_eq!(store.inner.put_count(), 1);
        assert!(summary.elapsed_ms >= 200);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_worker_requeued_once_then_failed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("stuck.pdf"), b"%PDF stuck").unwrap();

        let queue = Arc::new(JobQueue::new());
        enqueue_dir(&queue, dir.path());
        let store = Arc::new(SlowStore::new(Duration::from_secs(10)));
        let pool = WorkerPool::new(
            queue.clone(),
            store.clone(),
            Arc::new(DuplicateIndex::in_memory()),
            WorkerConfig {
                stall_timeout: Duration::from_secs(2),
                // Only the first tick lands before the upload blocks
                heartbeat_interval: Duration::from_secs(3600),
                ..config(2)
            },
        );

        let summary = pool.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.stats.requeued, 1);
        assert_eq!(summary.stats.failed, 1);
        assert_eq!(summary.stats.succeeded, 0);
        assert!(summary.stats.is_consistent());
        assert!(summary.failures[0].error.contains("stalled"));
        // Late verdicts from both abandoned workers were ignored
        assert_eq!(queue.finished().len(), 1);
        assert!(queue.is_drained());
    }
}
