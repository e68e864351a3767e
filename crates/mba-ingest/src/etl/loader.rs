//! CSV loader
//!
//! Moves one stored CSV object into a relational table:
//!
//! 1. open an audit record
//! 2. fetch the object and record its fingerprint and size
//! 3. infer the schema, or reconcile it with the existing table
//! 4. create the table when missing (existing tables are never altered)
//! 5. delete rows from a previous load of the same key, then insert in
//!    batches, one transaction per batch with bounded retry
//! 6. finalize the audit record
//!
//! Any failure after step 1 is written to the audit record before it is
//! returned.

use mba_common::Fingerprint;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::audit::{AuditLog, LoadStage};
use super::schema::{
    infer_schema, is_valid_identifier, table_name_for_key, InferredSchema, DEFAULT_SAMPLE_ROWS,
    SOURCE_KEY_COLUMN,
};
use super::transform::{coerce_row, CellValue};
use super::trigger::LoadTrigger;
use super::warehouse::{TableColumn, Warehouse};
use crate::error::{EtlError, EtlResult};
use crate::storage::{ObjectStore, RetryPolicy};

pub const DEFAULT_BATCH_SIZE: usize = 2000;
pub const DEFAULT_BATCH_RETRIES: u32 = 2;
pub const DEFAULT_BATCH_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Extra attempts for a failing batch
    pub batch_retries: u32,
    pub batch_retry_delay: Duration,
    pub sample_rows: usize,
    pub declared_delimiter: Option<u8>,
    pub fetch_retry: RetryPolicy,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_retries: DEFAULT_BATCH_RETRIES,
            batch_retry_delay: DEFAULT_BATCH_RETRY_DELAY,
            sample_rows: DEFAULT_SAMPLE_ROWS,
            declared_delimiter: None,
            fetch_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadOutcome {
    pub audit_id: Uuid,
    pub source_key: String,
    pub table: String,
    pub created_table: bool,
    pub rows_deleted: u64,
    pub rows_inserted: u64,
    pub batches: u64,
    pub retries: u32,
    pub duration_ms: u64,
}

/// Counters carried out of a failed load so the audit record can keep them
#[derive(Debug, Default)]
struct Progress {
    committed_rows: u64,
    retries: u32,
}

struct Loaded {
    created_table: bool,
    rows_deleted: u64,
    batches: u64,
}

pub struct CsvLoader {
    store: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn Warehouse>,
    audit: Arc<dyn AuditLog>,
    config: LoaderConfig,
}

impl CsvLoader {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        audit: Arc<dyn AuditLog>,
        config: LoaderConfig,
    ) -> Self {
        Self {
            store,
            warehouse,
            audit,
            config,
        }
    }

    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    /// Table a trigger loads into: the override when given, else the snake-cased file stem
    pub fn resolve_table(trigger: &LoadTrigger) -> EtlResult<String> {
        let table = match &trigger.table {
            Some(table) => table.clone(),
            None => table_name_for_key(&trigger.key),
        };
        if !is_valid_identifier(&table) {
            return Err(EtlError::InvalidTrigger(format!(
                "invalid table name {table:?}"
            )));
        }
        Ok(table)
    }

    #[instrument(skip(self, trigger), fields(key = %trigger.key))]
    pub async fn load(&self, trigger: &LoadTrigger) -> EtlResult<LoadOutcome> {
        if trigger.source != self.store.bucket() {
            return Err(EtlError::InvalidTrigger(format!(
                "source {:?} is not the configured bucket {:?}",
                trigger.source,
                self.store.bucket()
            )));
        }
        let table = Self::resolve_table(trigger)?;

        let started = Instant::now();
        let audit_id = self
            .audit
            .start(&trigger.source, &trigger.key, &table)
            .await?;
        let mut progress = Progress::default();

        match self.run(audit_id, &trigger.key, &table, &mut progress).await {
            Ok(loaded) => {
                self.audit
                    .succeed(audit_id, progress.committed_rows, progress.retries)
                    .await?;
                let outcome = LoadOutcome {
                    audit_id,
                    source_key: trigger.key.clone(),
                    table,
                    created_table: loaded.created_table,
                    rows_deleted: loaded.rows_deleted,
                    rows_inserted: progress.committed_rows,
                    batches: loaded.batches,
                    retries: progress.retries,
                    duration_ms: started.elapsed().as_millis() as u64,
                };
                info!(
                    table = %outcome.table,
                    rows = outcome.rows_inserted,
                    replaced = outcome.rows_deleted,
                    duration_ms = outcome.duration_ms,
                    "Load complete"
                );
                Ok(outcome)
            },
            Err(e) => {
                if let Err(audit_err) = self
                    .audit
                    .fail(
                        audit_id,
                        &e.to_string(),
                        progress.committed_rows,
                        progress.retries,
                    )
                    .await
                {
                    warn!(audit_id = %audit_id, error = %audit_err, "Could not record load failure");
                }
                Err(e)
            },
        }
    }

    async fn run(
        &self,
        audit_id: Uuid,
        key: &str,
        table: &str,
        progress: &mut Progress,
    ) -> EtlResult<Loaded> {
        let (fetched, attempts) = self
            .config
            .fetch_retry
            .run("get", |_| self.store.get(key))
            .await;
        progress.retries += attempts.saturating_sub(1);
        let content = fetched?;

        let fingerprint = Fingerprint::from_bytes(&content);
        self.audit
            .record_content(audit_id, &fingerprint, content.len() as u64)
            .await?;

        let schema = infer_schema(
            &content,
            self.config.declared_delimiter,
            self.config.sample_rows,
        )?;
        let existing = self.warehouse.table_columns(table).await?;
        let columns = match &existing {
            Some(existing) => reconcile(table, &schema, existing)?,
            None => schema.columns.iter().map(TableColumn::from).collect(),
        };
        self.audit.advance(audit_id, LoadStage::SchemaResolved).await?;

        let created_table = existing.is_none();
        if created_table {
            self.warehouse.create_table(table, &schema.columns).await?;
        }
        self.audit.advance(audit_id, LoadStage::TableReady).await?;

        let rows_deleted = self.warehouse.delete_by_source(table, key).await?;
        if rows_deleted > 0 {
            debug!(rows_deleted, "Removed rows from previous load");
        }
        self.audit.advance(audit_id, LoadStage::Loading).await?;

        let batches = self
            .insert_rows(&content, &schema, table, &columns, key, progress)
            .await?;

        Ok(Loaded {
            created_table,
            rows_deleted,
            batches,
        })
    }

    async fn insert_rows(
        &self,
        content: &[u8],
        schema: &InferredSchema,
        table: &str,
        columns: &[TableColumn],
        key: &str,
        progress: &mut Progress,
    ) -> EtlResult<u64> {
        let text = std::str::from_utf8(content)
            .map_err(|e| EtlError::SchemaInference(e.to_string()))?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(schema.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());

        let batch_size = self.config.batch_size.max(1);
        let mut batch: Vec<Vec<CellValue>> = Vec::with_capacity(batch_size);
        let mut batches = 0;
        let mut row_number = 0;

        for record in reader.records() {
            let record = record.map_err(|e| EtlError::LoadTransaction {
                committed_rows: progress.committed_rows,
                message: format!("malformed row after {row_number}: {e}"),
            })?;
            row_number += 1;
            batch.push(coerce_row(&record, columns, row_number)?);

            if batch.len() == batch_size {
                self.insert_batch(table, columns, key, &batch, progress).await?;
                batches += 1;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.insert_batch(table, columns, key, &batch, progress).await?;
            batches += 1;
        }
        Ok(batches)
    }

    async fn insert_batch(
        &self,
        table: &str,
        columns: &[TableColumn],
        key: &str,
        rows: &[Vec<CellValue>],
        progress: &mut Progress,
    ) -> EtlResult<()> {
        let mut attempt = 0;
        loop {
            match self.warehouse.insert_batch(table, columns, key, rows).await {
                Ok(inserted) => {
                    progress.committed_rows += inserted;
                    return Ok(());
                },
                Err(e) if attempt < self.config.batch_retries => {
                    attempt += 1;
                    progress.retries += 1;
                    warn!(
                        attempt,
                        committed = progress.committed_rows,
                        error = %e,
                        "Batch rolled back, retrying"
                    );
                    tokio::time::sleep(self.config.batch_retry_delay * attempt).await;
                },
                Err(e) => {
                    return Err(EtlError::LoadTransaction {
                        committed_rows: progress.committed_rows,
                        message: e.to_string(),
                    })
                },
            }
        }
    }
}

/// Map CSV columns onto an existing table's columns, in CSV order
fn reconcile(
    table: &str,
    schema: &InferredSchema,
    existing: &[TableColumn],
) -> EtlResult<Vec<TableColumn>> {
    if !existing.iter().any(|c| c.name == SOURCE_KEY_COLUMN) {
        return Err(EtlError::SchemaMismatch(format!(
            "table {table} has no {SOURCE_KEY_COLUMN} column"
        )));
    }

    let missing: Vec<&str> = schema
        .column_names()
        .filter(|name| !existing.iter().any(|c| c.name == *name))
        .collect();
    if !missing.is_empty() {
        return Err(EtlError::SchemaMismatch(format!(
            "table {table} lacks columns {}",
            missing.join(", ")
        )));
    }

    Ok(schema
        .columns
        .iter()
        .filter_map(|column| existing.iter().find(|c| c.name == column.name).cloned())
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::etl::audit::{AuditStatus, MemoryAuditLog};
    use crate::etl::schema::ColumnType;
    use crate::etl::warehouse::MemoryWarehouse;
    use crate::storage::{MemoryStore, ObjectMetadata};

    const KEY: &str = "mba/tabular/sales.csv";

    struct Fixture {
        store: Arc<MemoryStore>,
        warehouse: Arc<MemoryWarehouse>,
        audit: Arc<MemoryAuditLog>,
        loader: CsvLoader,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new("mba-data"));
        let warehouse = Arc::new(MemoryWarehouse::new());
        let audit = Arc::new(MemoryAuditLog::new());
        let loader = CsvLoader::new(
            store.clone(),
            warehouse.clone(),
            audit.clone(),
            LoaderConfig {
                batch_retry_delay: Duration::ZERO,
                ..LoaderConfig::default()
            },
        );
        Fixture {
            store,
            warehouse,
            audit,
            loader,
        }
    }

    async fn seed(store: &MemoryStore, key: &str, content: &str) {
        store
            .put(key, content.as_bytes().to_vec(), &ObjectMetadata::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_load_creates_table_and_audits() {
        let f = fixture();
        seed(&f.store, KEY, "id,region,amount\n1,north,10.5\n2,south,\n").await;

        let outcome = f.loader.load(&LoadTrigger::new("mba-data", KEY)).await.unwrap();
        assert_eq!(outcome.table, "sales");
        assert!(outcome.created_table);
        assert_eq!(outcome.rows_inserted, 2);
        assert_eq!(f.warehouse.row_count("sales").await, 2);

        let record = f.audit.get(outcome.audit_id).await.unwrap().unwrap();
        assert_eq!(record.status, AuditStatus::Success);
        assert_eq!(record.stage, LoadStage::Success);
        assert_eq!(record.rows_inserted, 2);
        assert!(record.fingerprint.is_some());
    }

    #[tokio::test]
    async fn test_rerun_replaces_rows() {
        let f = fixture();
        seed(&f.store, KEY, "id\n1\n2\n3\n").await;
        let trigger = LoadTrigger::new("mba-data", KEY);

        f.loader.load(&trigger).await.unwrap();
        let second = f.loader.load(&trigger).await.unwrap();
        assert!(!second.created_table);
        assert_eq!(second.rows_deleted, 3);
        assert_eq!(f.warehouse.row_count("sales").await, 3);
    }

    #[tokio::test]
    async fn test_wrong_bucket_is_rejected_before_audit() {
        let f = fixture();
        let err = f
            .loader
            .load(&LoadTrigger::new("elsewhere", KEY))
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::InvalidTrigger(_)));

        let bad_table = LoadTrigger::new("mba-data", KEY).with_table("Robert'); DROP");
        assert!(f.loader.load(&bad_table).await.is_err());
        assert!(f.audit.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_object_fails_audit() {
        let f = fixture();
        let err = f
            .loader
            .load(&LoadTrigger::new("mba-data", KEY))
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Store(_)));

        let records = f.audit.all().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, AuditStatus::Failed);
        assert_eq!(records[0].stage, LoadStage::Started);
    }

    #[tokio::test]
    async fn test_existing_table_without_csv_column_is_mismatch() {
        let f = fixture();
        f.warehouse
            .define_table(
                "sales",
                vec![
                    TableColumn {
                        name: "id".into(),
                        column_type: ColumnType::Integer,
                        nullable: false,
                        native_type: None,
                    },
                    TableColumn {
                        name: SOURCE_KEY_COLUMN.into(),
                        column_type: ColumnType::Text,
                        nullable: false,
                        native_type: None,
                    },
                ],
            )
            .await;
        seed(&f.store, KEY, "id,extra\n1,x\n").await;

        let err = f
            .loader
            .load(&LoadTrigger::new("mba-data", KEY))
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::SchemaMismatch(_)));
        assert_eq!(f.warehouse.row_count("sales").await, 0);
    }

    #[tokio::test]
    async fn test_existing_table_types_win() {
        let f = fixture();
        f.warehouse
            .define_table(
                "sales",
                vec![
                    TableColumn {
                        name: "code".into(),
                        column_type: ColumnType::Text,
                        nullable: true,
                        native_type: None,
                    },
                    TableColumn {
                        name: "note".into(),
                        column_type: ColumnType::Text,
                        nullable: true,
                        native_type: None,
                    },
                    TableColumn {
                        name: SOURCE_KEY_COLUMN.into(),
                        column_type: ColumnType::Text,
                        nullable: false,
                        native_type: None,
                    },
                ],
            )
            .await;
        seed(&f.store, KEY, "code\n001\n002\n").await;

        f.loader.load(&LoadTrigger::new("mba-data", KEY)).await.unwrap();
        let rows = f.warehouse.rows("sales").await;
        assert_eq!(rows[0].values["code"], CellValue::Text("001".into()));
        assert!(!rows[0].values.contains_key("note"));
    }

    #[tokio::test]
    async fn test_coercion_failure_is_not_retried() {
        let f = fixture();
        let mut csv = String::from("id\n");
        for i in 1..=5 {
            csv.push_str(&format!("{i}\n"));
        }
        csv.push_str("six\n");
        seed(&f.store, KEY, &csv).await;

        let loader = CsvLoader::new(
            f.store.clone(),
            f.warehouse.clone(),
            f.audit.clone(),
            LoaderConfig {
                batch_size: 2,
                sample_rows: 5,
                batch_retry_delay: Duration::ZERO,
                ..LoaderConfig::default()
            },
        );
        let err = loader.load(&LoadTrigger::new("mba-data", KEY)).await.unwrap_err();
        assert!(matches!(err, EtlError::Coercion { row: 6, .. }));

        let record = &f.audit.all().await[0];
        assert_eq!(record.status, AuditStatus::Failed);
        assert_eq!(record.stage, LoadStage::Loading);
        assert_eq!(record.rows_inserted, 4);
        assert_eq!(record.retry_count, 0);
    }
}
