//! In-process job queue with in-flight tracking
//!
//! Every state transition happens under one lock, so a [`QueueStats`] snapshot
//! always satisfies `queued + in_progress + succeeded + failed == submitted`.
//! Dequeue moves a job into the in-flight table in the same critical section,
//! which makes the handoff exactly-once. Jobs whose worker stops heart-beating
//! are put back once by [`JobQueue::requeue_stalled`]; a second stall fails them.
//!
//! Each dequeue hands out a fresh lease. Heartbeats and completions carrying an
//! older lease belong to a worker the supervisor gave up on and are ignored.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use super::types::{Job, JobOutcome, JobStatus};
use crate::error::{IngestError, IngestResult};

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub submitted: u64,
    pub queued: u64,
    pub in_progress: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub duplicates_skipped: u64,
    pub requeued: u64,
}

impl QueueStats {
    pub fn is_consistent(&self) -> bool {
        self.queued + self.in_progress + self.succeeded + self.failed == self.submitted
    }
}

/// A job that ended in `failed`, with its last error verbatim
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub job_id: Uuid,
    pub source_path: PathBuf,
    pub destination_key: String,
    pub attempts: u32,
    pub error: String,
}

impl JobFailure {
    fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            source_path: job.source_path.clone(),
            destination_key: job.destination_key.clone(),
            attempts: job.attempts,
            error: job.last_error.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StallReport {
    pub requeued: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct InFlight {
    job: Job,
    lease: u64,
    last_heartbeat: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Job>,
    in_flight: HashMap<Uuid, InFlight>,
    stats: QueueStats,
    failures: Vec<JobFailure>,
    finished: Vec<Job>,
    next_lease: u64,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // Counters are only mutated together, so a poisoned guard is still consistent
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, mut job: Job) -> IngestResult<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(IngestError::QueueClosed);
            }
            job.status = JobStatus::Pending;
            state.pending.push_back(job);
            state.stats.submitted += 1;
            state.stats.queued += 1;
        }
        self.available.notify_one();
        Ok(())
    }

    fn try_take(&self) -> Option<Job> {
        let mut state = self.lock();
        let mut job = state.pending.pop_front()?;
        state.next_lease += 1;
        job.lease = state.next_lease;
        job.status = JobStatus::InProgress;
        state.stats.queued -= 1;
        state.stats.in_progress += 1;
        state.in_flight.insert(
            job.id,
            InFlight {
                job: job.clone(),
                lease: job.lease,
                last_heartbeat: Instant::now(),
            },
        );
        Some(job)
    }

    /// Wait up to `timeout` for a job. `None` on timeout, or at once when the
    /// queue is closed with nothing pending or in flight. While jobs are still in
    /// flight a closed queue keeps waiting, since a stalled one may come back.
    pub async fn dequeue(&self, timeout: Duration) -> Option<Job> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.try_take() {
                return Some(job);
            }
            {
                let state = self.lock();
                if state.closed && state.pending.is_empty() && state.in_flight.is_empty() {
                    return None;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Record a worker's verdict. Ignored (returns `false`) when the job is no
    /// longer in flight under this lease, e.g. because the supervisor requeued it.
    pub fn mark_done(&self, mut job: Job, outcome: JobOutcome) -> bool {
        let mut state = self.lock();
        let current = state.in_flight.get(&job.id).map(|entry| entry.lease);
        if current != Some(job.lease) {
            warn!(
                job_id = %job.id,
                key = %job.destination_key,
                lease = job.lease,
                "Completion for a job that is not in flight under this lease, ignoring"
            );
            return false;
        }
        state.in_flight.remove(&job.id);

        state.stats.in_progress -= 1;
        match outcome {
            JobOutcome::Uploaded => {
                job.status = JobStatus::Succeeded;
                state.stats.succeeded += 1;
            },
            JobOutcome::DuplicateSkipped { known_location } => {
                debug!(key = %job.destination_key, known_location, "Duplicate skipped");
                job.status = JobStatus::Succeeded;
                job.duplicate = true;
                state.stats.succeeded += 1;
                state.stats.duplicates_skipped += 1;
            },
            JobOutcome::Failed { error } => {
                job.status = JobStatus::Failed;
                job.last_error = Some(error);
                state.stats.failed += 1;
                state.failures.push(JobFailure::from_job(&job));
            },
        }
        state.finished.push(job);
        drop(state);

        self.available.notify_waiters();
        true
    }

    pub fn heartbeat(&self, job_id: Uuid, lease: u64) -> bool {
        let mut state = self.lock();
        match state.in_flight.get_mut(&job_id) {
            Some(entry) if entry.lease == lease => {
                entry.last_heartbeat = Instant::now();
                true
            },
            _ => false,
        }
    }

    /// Requeue in-flight jobs silent for longer than `stall_timeout`
    pub fn requeue_stalled(&self, stall_timeout: Duration) -> StallReport {
        let now = Instant::now();
        let mut report = StallReport::default();
        let mut state = self.lock();

        let stalled: Vec<Uuid> = state
            .in_flight
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_heartbeat) > stall_timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in stalled {
            let Some(InFlight { mut job, .. }) = state.in_flight.remove(&id) else {
                continue;
            };
            state.stats.in_progress -= 1;

            if job.requeued {
                let error = IngestError::Stalled(format!(
                    "no heartbeat for {}s after requeue",
                    stall_timeout.as_secs()
                ))
                .to_string();
                warn!(job_id = %job.id, key = %job.destination_key, "Job stalled twice, failing");
                job.status = JobStatus::Failed;
                job.last_error = Some(error);
                state.stats.failed += 1;
                state.failures.push(JobFailure::from_job(&job));
                state.finished.push(job);
                report.failed += 1;
            } else {
                warn!(job_id = %job.id, key = %job.destination_key, "Job stalled, requeueing");
                job.requeued = true;
                job.status = JobStatus::Pending;
                state.pending.push_back(job);
                state.stats.queued += 1;
                state.stats.requeued += 1;
                report.requeued += 1;
            }
        }
        drop(state);

        if report.requeued > 0 || report.failed > 0 {
            self.available.notify_waiters();
        }
        report
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats
    }

    pub fn failures(&self) -> Vec<JobFailure> {
        self.lock().failures.clone()
    }

    /// Jobs that reached `succeeded` or `failed`, in completion order
    pub fn finished(&self) -> Vec<Job> {
        self.lock().finished.clone()
    }

    /// Stop accepting new jobs; pending ones can still be dequeued
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Nothing pending and nothing in flight
    pub fn is_drained(&self) -> bool {
        let state = self.lock();
        state.pending.is_empty() && state.in_flight.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ingest::types::{Category, Scope};

    fn job(name: &str) -> Job {
        Job::new(
            PathBuf::from(format!("/in/{name}")),
            Scope::new("mba").unwrap(),
            Category::from_extension("pdf"),
            name,
        )
    }

    #[tokio::test]
    async fn test_fifo_and_counters() {
        let queue = JobQueue::new();
        queue.enqueue(job("a.pdf")).unwrap();
        queue.enqueue(job("b.pdf")).unwrap();

        let first = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.file_name(), "a.pdf");
        assert_eq!(first.status, JobStatus::InProgress);

        let stats = queue.stats();
        assert_eq!((stats.queued, stats.in_progress), (1, 1));
        assert!(stats.is_consistent());

        assert!(queue.mark_done(first, JobOutcome::Uploaded));
        let second = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert!(queue.mark_done(
            second,
            JobOutcome::DuplicateSkipped {
                known_location: "mba/documents/b.pdf".into()
            }
        ));

        let stats = queue.stats();
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.duplicates_skipped, 1);
        assert!(stats.is_consistent());
        assert!(queue.is_drained());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_times_out_on_empty_queue() {
        let queue = JobQueue::new();
        assert!(queue.dequeue(Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_and_drains() {
        let queue = JobQueue::new();
        queue.enqueue(job("a.pdf")).unwrap();
        queue.close();

        assert!(matches!(queue.enqueue(job("b.pdf")), Err(IngestError::QueueClosed)));
        let taken = queue.dequeue(Duration::from_secs(5)).await.unwrap();
        assert!(queue.mark_done(taken, JobOutcome::Uploaded));
        // Closed and empty returns without waiting for the timeout
        assert!(queue.dequeue(Duration::from_secs(3600)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_queue_waits_while_jobs_in_flight() {
        let queue = std::sync::Arc::new(JobQueue::new());
        queue.enqueue(job("a.pdf")).unwrap();
        queue.close();
        let taken = queue.dequeue(Duration::from_secs(5)).await.unwrap();

        let idle = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let job = queue.dequeue(Duration::from_secs(60)).await;
                (job, started.elapsed())
            })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!idle.is_finished());

        assert!(queue.mark_done(taken, JobOutcome::Uploaded));
        let (job, waited) = idle.await.unwrap();
        assert!(job.is_none());
        assert!(waited >= Duration::from_secs(2));
        assert!(waited < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_queue_hands_out_requeued_job() {
        let queue = JobQueue::new();
        queue.enqueue(job("slow.pdf")).unwrap();
        queue.close();
        let _taken = queue.dequeue(Duration::from_millis(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        queue.requeue_stalled(Duration::from_secs(60));

        let again = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert!(again.requeued);
    }

    #[tokio::test]
    async fn test_waiting_dequeue_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(JobQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(job("late.pdf")).unwrap();

        let taken = waiter.await.unwrap().unwrap();
        assert_eq!(taken.file_name(), "late.pdf");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_job_requeued_once_then_failed() {
        let queue = JobQueue::new();
        queue.enqueue(job("slow.pdf")).unwrap();

        let taken = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        let report = queue.requeue_stalled(Duration::from_secs(60));
        assert_eq!(report, StallReport { requeued: 1, failed: 0 });
        assert!(queue.stats().is_consistent());

        // Late completion from the original worker is ignored
        assert!(!queue.mark_done(taken.clone(), JobOutcome::Uploaded));
        assert_eq!(queue.stats().succeeded, 0);

        let again = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert!(again.requeued);
        assert_ne!(again.lease, taken.lease);
        tokio::time::advance(Duration::from_secs(61)).await;

        let report = queue.requeue_stalled(Duration::from_secs(60));
        assert_eq!(report, StallReport { requeued: 0, failed: 1 });

        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.requeued, 1);
        assert!(stats.is_consistent());
        assert!(queue.failures()[0].error.contains("stalled"));
        assert!(queue.is_drained());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_prevents_requeue() {
        let queue = JobQueue::new();
        queue.enqueue(job("busy.pdf")).unwrap();
        let taken = queue.dequeue(Duration::from_millis(10)).await.unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(queue.heartbeat(taken.id, taken.lease));
        tokio::time::advance(Duration::from_secs(50)).await;

        assert_eq!(queue.requeue_stalled(Duration::from_secs(60)), StallReport::default());
        assert!(queue.mark_done(taken, JobOutcome::Failed { error: "boom".into() }));
        assert_eq!(queue.failures()[0].error, "boom");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_lease_cannot_touch_requeued_copy() {
        let queue = JobQueue::new();
        queue.enqueue(job("contended.pdf")).unwrap();

        let stale = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        queue.requeue_stalled(Duration::from_secs(60));
        let current = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(current.id, stale.id);

        // The abandoned worker can neither keep the new copy alive nor finish it
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!queue.heartbeat(stale.id, stale.lease));
        assert!(!queue.mark_done(stale, JobOutcome::Uploaded));
        let stats = queue.stats();
        assert_eq!((stats.in_progress, stats.succeeded), (1, 0));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            queue.requeue_stalled(Duration::from_secs(60)),
            StallReport { requeued: 0, failed: 1 }
        );
        assert!(!queue.mark_done(current, JobOutcome::Uploaded));
        assert!(queue.stats().is_consistent());
    }
}
