//! Relational destination for loaded rows
//!
//! The loader only talks to [`Warehouse`]. [`PgWarehouse`] is the PostgreSQL
//! implementation; [`MemoryWarehouse`] mirrors its semantics in process.

use async_trait::async_trait;
use serde::Serialize;

use super::schema::{ColumnType, InferredColumn};
use super::transform::CellValue;
use crate::error::EtlResult;

pub mod memory;
pub mod postgres;

pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

/// A column of an existing (or about to be created) table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    /// Declared type of an existing column outside the inferred types (uuid,
    /// jsonb, enums). Values are loaded as text and cast to it.
    pub native_type: Option<String>,
}

impl From<&InferredColumn> for TableColumn {
    fn from(column: &InferredColumn) -> Self {
        Self {
            name: column.name.clone(),
            column_type: column.column_type,
            nullable: column.nullable,
            native_type: None,
        }
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Columns in ordinal order, or `None` when the table does not exist
    async fn table_columns(&self, table: &str) -> EtlResult<Option<Vec<TableColumn>>>;

    /// Create the table with bookkeeping columns if it does not exist. Never alters.
    async fn create_table(&self, table: &str, columns: &[InferredColumn]) -> EtlResult<()>;

    /// Remove rows previously loaded from `source_key`; returns the count removed
    async fn delete_by_source(&self, table: &str, source_key: &str) -> EtlResult<u64>;

    /// Insert all rows in one transaction; nothing is kept on error
    async fn insert_batch(
        &self,
        table: &str,
        columns: &[TableColumn],
        source_key: &str,
        rows: &[Vec<CellValue>],
    ) -> EtlResult<u64>;
}
