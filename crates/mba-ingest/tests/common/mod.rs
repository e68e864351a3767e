//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use mba_ingest::etl::transform::CellValue;
use mba_ingest::etl::{InferredColumn, MemoryWarehouse, TableColumn, Warehouse};
use mba_ingest::ingest::{
    DuplicateIndex, ExtensionFilter, JobQueue, Producer, RunSummary, Scope, ScopeRules,
    WorkerConfig, WorkerPool,
};
use mba_ingest::storage::{
    ListPage, MemoryStore, ObjectInfo, ObjectMetadata, ObjectStore, PutReceipt, RetryPolicy,
    StoreError,
};
use mba_ingest::EtlResult;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const BUCKET: &str = "mba-data";

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,mba_ingest=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn worker_config(workers: usize) -> WorkerConfig {
    WorkerConfig {
        workers,
        retry: RetryPolicy::immediate(3),
        dequeue_timeout: Duration::from_millis(20),
        ..WorkerConfig::default()
    }
}

/// Discover `root` into a fresh queue, then drain it with a worker pool
pub async fn ingest_dir(
    root: &Path,
    scopes: ScopeRules,
    store: Arc<dyn ObjectStore>,
    index: Arc<DuplicateIndex>,
    config: WorkerConfig,
) -> (RunSummary, Arc<JobQueue>) {
    let queue = Arc::new(JobQueue::new());
    Producer::new(root, ExtensionFilter::default(), scopes)
        .run(&queue)
        .await
        .unwrap();
    queue.close();

    let pool = WorkerPool::new(queue.clone(), store, index, config);
    let summary = pool.run(CancellationToken::new()).await.unwrap();
    (summary, queue)
}

pub fn default_scopes() -> ScopeRules {
    ScopeRules::new(vec![], Scope::new("mba").unwrap())
}

/// Memory store whose first `put_failures` puts and `list_failures` listings
/// fail transiently
pub struct FlakyStore {
    pub inner: MemoryStore,
    put_failures: AtomicU32,
    list_failures: AtomicU32,
    pub put_calls: AtomicU32,
    pub list_calls: AtomicU32,
}

impl FlakyStore {
    pub fn new(put_failures: u32, list_failures: u32) -> Self {
        Self {
            inner: MemoryStore::new(BUCKET),
            put_failures: AtomicU32::new(put_failures),
            list_failures: AtomicU32::new(list_failures),
            put_calls: AtomicU32::new(0),
            list_calls: AtomicU32::new(0),
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        metadata: &ObjectMetadata,
    ) -> Result<PutReceipt, StoreError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.put_failures) {
            return Err(StoreError::Transient("503 slow down".to_string()));
        }
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
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.list_failures) {
            return Err(StoreError::Transient("connection reset".to_string()));
        }
        self.inner.list_page(prefix, continuation, page_size).await
    }
}

/// Warehouse that rejects every batch containing a marked integer value
pub struct PoisonedWarehouse {
    pub inner: MemoryWarehouse,
    pub poison: i64,
    pub attempts_on_poison: AtomicU32,
}

impl PoisonedWarehouse {
    pub fn new(poison: i64) -> Self {
        Self {
            inner: MemoryWarehouse::new(),
            poison,
            attempts_on_poison: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Warehouse for PoisonedWarehouse {
    async fn table_columns(&self, table: &str) -> EtlResult<Option<Vec<TableColumn>>> {
        self.inner.table_columns(table).await
    }

    async fn create_table(&self, table: &str, columns: &[InferredColumn]) -> EtlResult<()> {
        self.inner.create_table(table, columns).await
    }

    async fn delete_by_source(&self, table: &str, source_key: &str) -> EtlResult<u64> {
        self.inner.delete_by_source(table, source_key).await
    }

    async fn insert_batch(
        &self,
        table: &str,
        columns: &[TableColumn],
        source_key: &str,
        rows: &[Vec<CellValue>],
    ) -> EtlResult<u64> {
        let poisoned = rows
            .iter()
            .any(|row| row.first() == Some(&CellValue::Integer(self.poison)));
        if poisoned {
            self.attempts_on_poison.fetch_add(1, Ordering::SeqCst);
            return Err(mba_ingest::EtlError::Database(sqlx::Error::Protocol(
                "could not serialize access".to_string(),
            )));
        }
        self.inner
            .insert_batch(table, columns, source_key, rows)
            .await
    }
}
