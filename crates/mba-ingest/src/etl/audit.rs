//! Load audit trail
//!
//! One record per load. It is created when the load starts, follows the load
//! through its stages, and is finalized exactly once as `success` or `failed`.
//! Records left in `started` by a crashed loader are failed by
//! [`AuditLog::reconcile_dangling`] on the next start-up.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mba_common::Fingerprint;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, PgPool, Row};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::{EtlError, EtlResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Started,
    Success,
    Failed,
}

impl AuditStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AuditStatus::Started => "started",
            AuditStatus::Success => "success",
            AuditStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(AuditStatus::Started),
            "success" => Some(AuditStatus::Success),
            "failed" => Some(AuditStatus::Failed),
            _ => None,
        }
    }
}

/// Last stage a load reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStage {
    Started,
    SchemaResolved,
    TableReady,
    Loading,
    Success,
}

impl LoadStage {
    pub fn as_str(&self) -> &str {
        match self {
            LoadStage::Started => "started",
            LoadStage::SchemaResolved => "schema_resolved",
            LoadStage::TableReady => "table_ready",
            LoadStage::Loading => "loading",
            LoadStage::Success => "success",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(LoadStage::Started),
            "schema_resolved" => Some(LoadStage::SchemaResolved),
            "table_ready" => Some(LoadStage::TableReady),
            "loading" => Some(LoadStage::Loading),
            "success" => Some(LoadStage::Success),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub source: String,
    pub source_key: String,
    pub table_name: String,
    pub fingerprint: Option<Fingerprint>,
    pub bytes: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub rows_inserted: u64,
    pub status: AuditStatus,
    pub stage: LoadStage,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

impl AuditRecord {
    fn new(source: &str, source_key: &str, table_name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.to_string(),
            source_key: source_key.to_string(),
            table_name: table_name.to_string(),
            fingerprint: None,
            bytes: None,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            rows_inserted: 0,
            status: AuditStatus::Started,
            stage: LoadStage::Started,
            error_message: None,
            retry_count: 0,
        }
    }

    fn finish(&mut self, status: AuditStatus, rows_inserted: u64, retry_count: u32) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.rows_inserted = rows_inserted;
        self.retry_count = retry_count;
        self.status = status;
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn start(&self, source: &str, source_key: &str, table_name: &str) -> EtlResult<Uuid>;

    async fn record_content(&self, id: Uuid, fingerprint: &Fingerprint, bytes: u64) -> EtlResult<()>;

    async fn advance(&self, id: Uuid, stage: LoadStage) -> EtlResult<()>;

    /// Returns `false` when the record was already finalized
    async fn succeed(&self, id: Uuid, rows_inserted: u64, retry_count: u32) -> EtlResult<bool>;

    /// Returns `false` when the record was already finalized
    async fn fail(
        &self,
        id: Uuid,
        error_message: &str,
        rows_inserted: u64,
        retry_count: u32,
    ) -> EtlResult<bool>;

    async fn get(&self, id: Uuid) -> EtlResult<Option<AuditRecord>>;

    /// Most recent records first
    async fn recent(&self, limit: u32) -> EtlResult<Vec<AuditRecord>>;

    /// Fail records still `started` after `older_than`; returns how many
    async fn reconcile_dangling(&self, older_than: Duration) -> EtlResult<u64>;
}

pub const DANGLING_MESSAGE: &str = "load abandoned: loader stopped before finalizing";

// ============================================================================
// PostgreSQL
// ============================================================================

#[derive(Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const AUDIT_COLUMNS: &str = "id, source, source_key, table_name, fingerprint, bytes, started_at, \
     finished_at, duration_ms, rows_inserted, status, stage, error_message, retry_count";

fn record_from_row(row: &PgRow) -> EtlResult<AuditRecord> {
    let status: String = row.try_get("status")?;
    let stage: String = row.try_get("stage")?;
    let fingerprint: Option<String> = row.try_get("fingerprint")?;
    let bytes: Option<i64> = row.try_get("bytes")?;
    let duration_ms: Option<i64> = row.try_get("duration_ms")?;
    let rows_inserted: i64 = row.try_get("rows_inserted")?;
    let retry_count: i32 = row.try_get("retry_count")?;

    Ok(AuditRecord {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        source_key: row.try_get("source_key")?,
        table_name: row.try_get("table_name")?,
        fingerprint: fingerprint.and_then(|f| f.parse().ok()),
        bytes: bytes.map(|b| b.max(0) as u64),
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_ms: duration_ms.map(|d| d.max(0) as u64),
        rows_inserted: rows_inserted.max(0) as u64,
        status: AuditStatus::parse(&status).ok_or_else(|| {
            EtlError::Database(sqlx::Error::Decode(format!("unknown audit status {status:?}").into()))
        })?,
        stage: LoadStage::parse(&stage).ok_or_else(|| {
            EtlError::Database(sqlx::Error::Decode(format!("unknown load stage {stage:?}").into()))
        })?,
        error_message: row.try_get("error_message")?,
        retry_count: retry_count.max(0) as u32,
    })
}

impl PgAuditLog {
    async fn finalize(
        &self,
        id: Uuid,
        status: AuditStatus,
        error_message: Option<&str>,
        rows_inserted: u64,
        retry_count: u32,
    ) -> EtlResult<bool> {
        let stage_sql = if status == AuditStatus::Success {
            "stage = 'success',"
        } else {
            ""
        };
        let sql = format!(
            r#"
            UPDATE ingestion_audit
            SET status = $2,
                {stage_sql}
                error_message = $3,
                rows_inserted = $4,
                retry_count = $5,
                finished_at = NOW(),
                duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT
            WHERE id = $1 AND status = 'started'
            "#
        );

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(error_message)
            .bind(rows_inserted as i64)
            .bind(retry_count as i32)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!(audit_id = %id, "Audit record already finalized or missing");
            return Ok(false);
        }
        Ok(true)
    }
}

#[async_trait]
impl AuditLog for PgAuditLog {
    #[instrument(skip(self))]
    async fn start(&self, source: &str, source_key: &str, table_name: &str) -> EtlResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO ingestion_audit (id, source, source_key, table_name, status, stage)
            VALUES ($1, $2, $3, $4, 'started', 'started')
            "#,
        )
        .bind(id)
        .bind(source)
        .bind(source_key)
        .bind(table_name)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn record_content(&self, id: Uuid, fingerprint: &Fingerprint, bytes: u64) -> EtlResult<()> {
        sqlx::query("UPDATE ingestion_audit SET fingerprint = $2, bytes = $3 WHERE id = $1")
            .bind(id)
            .bind(fingerprint.as_str())
            .bind(bytes as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn advance(&self, id: Uuid, stage: LoadStage) -> EtlResult<()> {
        let result = sqlx::query(
            "UPDATE ingestion_audit SET stage = $2 WHERE id = $1 AND status = 'started'",
        )
        .bind(id)
        .bind(stage.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EtlError::AuditNotFound(id));
        }
        Ok(())
    }

    async fn succeed(&self, id: Uuid, rows_inserted: u64, retry_count: u32) -> EtlResult<bool> {
        self.finalize(id, AuditStatus::Success, None, rows_inserted, retry_count)
            .await
    }

    async fn fail(
        &self,
        id: Uuid,
        error_message: &str,
        rows_inserted: u64,
        retry_count: u32,
    ) -> EtlResult<bool> {
        self.finalize(
            id,
            AuditStatus::Failed,
            Some(error_message),
            rows_inserted,
            retry_count,
        )
        .await
    }

    async fn get(&self, id: Uuid) -> EtlResult<Option<AuditRecord>> {
        let sql = format!("SELECT {AUDIT_COLUMNS} FROM ingestion_audit WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn recent(&self, limit: u32) -> EtlResult<Vec<AuditRecord>> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM ingestion_audit ORDER BY started_at DESC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn reconcile_dangling(&self, older_than: Duration) -> EtlResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE ingestion_audit
            SET status = 'failed',
                error_message = $1,
                finished_at = NOW(),
                duration_ms = (EXTRACT(EPOCH FROM (NOW() - started_at)) * 1000)::BIGINT
            WHERE status = 'started'
              AND started_at < NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(DANGLING_MESSAGE)
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await?;

        let reconciled = result.rows_affected();
        if reconciled > 0 {
            warn!(reconciled, "Failed dangling audit records");
        }
        Ok(reconciled)
    }
}

// ============================================================================
// In memory
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    records: Mutex<BTreeMap<Uuid, AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<AuditRecord> {
        let mut records: Vec<_> = self.records.lock().await.values().cloned().collect();
        records.sort_by_key(|r| r.started_at);
        records
    }

    /// Backdate a record, to simulate a loader that died long ago
    pub async fn set_started_at(&self, id: Uuid, started_at: DateTime<Utc>) {
        if let Some(record) = self.records.lock().await.get_mut(&id) {
            record.started_at = started_at;
        }
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn start(&self, source: &str, source_key: &str, table_name: &str) -> EtlResult<Uuid> {
        let record = AuditRecord::new(source, source_key, table_name);
        let id = record.id;
        self.records.lock().await.insert(id, record);
        Ok(id)
    }

    async fn record_content(&self, id: Uuid, fingerprint: &Fingerprint, bytes: u64) -> EtlResult<()> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(&id).ok_or(EtlError::AuditNotFound(id))?;
        record.fingerprint = Some(fingerprint.clone());
        record.bytes = Some(bytes);
        Ok(())
    }

    async fn advance(&self, id: Uuid, stage: LoadStage) -> EtlResult<()> {
        let mut records = self.records.lock().await;
        match records.get_mut(&id) {
            Some(record) if record.status == AuditStatus::Started => {
                record.stage = stage;
                Ok(())
            },
            _ => Err(EtlError::AuditNotFound(id)),
        }
    }

    async fn succeed(&self, id: Uuid, rows_inserted: u64, retry_count: u32) -> EtlResult<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(&id) {
            Some(record) if record.status == AuditStatus::Started => {
                record.stage = LoadStage::Success;
                record.finish(AuditStatus::Success, rows_inserted, retry_count);
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn fail(
        &self,
        id: Uuid,
        error_message: &str,
        rows_inserted: u64,
        retry_count: u32,
    ) -> EtlResult<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(&id) {
            Some(record) if record.status == AuditStatus::Started => {
                record.error_message = Some(error_message.to_string());
                record.finish(AuditStatus::Failed, rows_inserted, retry_count);
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn get(&self, id: Uuid) -> EtlResult<Option<AuditRecord>> {
        Ok(self.records.lock().await.get(&id).cloned())
    }

    async fn recent(&self, limit: u32) -> EtlResult<Vec<AuditRecord>> {
        let mut records = self.all().await;
        records.reverse();
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn reconcile_dangling(&self, older_than: Duration) -> EtlResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let mut reconciled = 0;
        for record in self.records.lock().await.values_mut() {
            if record.status == AuditStatus::Started && record.started_at < cutoff {
                record.error_message = Some(DANGLING_MESSAGE.to_string());
                let rows = record.rows_inserted;
                let retries = record.retry_count;
                record.finish(AuditStatus::Failed, rows, retries);
                reconciled += 1;
            }
        }
        Ok(reconciled)
    }
}
