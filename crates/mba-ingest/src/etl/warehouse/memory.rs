use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{TableColumn, Warehouse};
use crate::error::{EtlError, EtlResult};
use crate::etl::schema::{ColumnType, InferredColumn, LOADED_AT_COLUMN, SOURCE_KEY_COLUMN};
use crate::etl::transform::CellValue;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub source_key: String,
    pub values: BTreeMap<String, CellValue>,
}

#[derive(Debug, Default)]
struct MemoryTable {
    columns: Vec<TableColumn>,
    rows: Vec<StoredRow>,
}

/// In-process warehouse with the same contract as [`super::PgWarehouse`]
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: RwLock<HashMap<String, MemoryTable>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a table directly, e.g. to simulate one that predates the loader
    pub async fn define_table(&self, table: &str, columns: Vec<TableColumn>) {
        self.tables.write().await.insert(
            table.to_string(),
            MemoryTable {
                columns,
                rows: Vec::new(),
            },
        );
    }

    pub async fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .await
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    pub async fn rows(&self, table: &str) -> Vec<StoredRow> {
        self.tables
            .read()
            .await
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }
}

fn bookkeeping_columns() -> [TableColumn; 2] {
    [
        TableColumn {
            name: SOURCE_KEY_COLUMN.to_string(),
            column_type: ColumnType::Text,
            nullable: false,
            native_type: None,
        },
        TableColumn {
            name: LOADED_AT_COLUMN.to_string(),
            column_type: ColumnType::DateTime,
            nullable: false,
            native_type: None,
        },
    ]
}

fn missing_table(table: &str) -> EtlError {
    EtlError::Database(sqlx::Error::Protocol(format!("relation \"{table}\" does not exist")))
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn table_columns(&self, table: &str) -> EtlResult<Option<Vec<TableColumn>>> {
        Ok(self
            .tables
            .read()
            .await
            .get(table)
            .map(|t| t.columns.clone()))
    }

    async fn create_table(&self, table: &str, columns: &[InferredColumn]) -> EtlResult<()> {
        let mut tables = self.tables.write().await;
        tables.entry(table.to_string()).or_insert_with(|| MemoryTable {
            columns: columns
                .iter()
                .map(TableColumn::from)
                .chain(bookkeeping_columns())
                .collect(),
            rows: Vec::new(),
        });
        Ok(())
    }

    async fn delete_by_source(&self, table: &str, source_key: &str) -> EtlResult<u64> {
        let mut tables = self.tables.write().await;
        let target = tables.get_mut(table).ok_or_else(|| missing_table(table))?;
        let before = target.rows.len();
        target.rows.retain(|row| row.source_key != source_key);
        Ok((before - target.rows.len()) as u64)
    }

    async fn insert_batch(
        &self,
        table: &str,
        columns: &[TableColumn],
        source_key: &str,
        rows: &[Vec<CellValue>],
    ) -> EtlResult<u64> {
        let mut tables = self.tables.write().await;
        let target = tables.get_mut(table).ok_or_else(|| missing_table(table))?;

        // Validate the whole batch before touching the table
        let mut staged = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = BTreeMap::new();
            for (cell, column) in row.iter().zip(columns) {
                let target_column = target
                    .columns
                    .iter()
                    .find(|c| c.name == column.name)
                    .ok_or_else(|| {
                        EtlError::Database(sqlx::Error::Protocol(format!(
                            "column \"{}\" of relation \"{}\" does not exist",
                            column.name, table
                        )))
                    })?;
                if cell.is_null() && !target_column.nullable {
                    return Err(EtlError::Database(sqlx::Error::Protocol(format!(
                        "null value in column \"{}\" violates not-null constraint",
                        column.name
                    ))));
                }
                values.insert(column.name.clone(), cell.clone());
            }
            staged.push(StoredRow {
                source_key: source_key.to_string(),
                values,
            });
        }

        let inserted = staged.len() as u64;
        target.rows.extend(staged);
        Ok(inserted)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::etl::schema::infer_schema;

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let warehouse = MemoryWarehouse::new();
        let schema = infer_schema(b"id,name\n1,a\n2,b\n", None, 10).unwrap();
        warehouse.create_table("t", &schema.columns).await.unwrap();

        let columns: Vec<TableColumn> = schema.columns.iter().map(TableColumn::from).collect();
        let rows = vec![
            vec![CellValue::Integer(1), CellValue::Text("a".into())],
            vec![CellValue::Null, CellValue::Text("b".into())],
        ];
        assert!(warehouse.insert_batch("t", &columns, "k", &rows).await.is_err());
        assert_eq!(warehouse.row_count("t").await, 0);

        let inserted = warehouse.insert_batch("t", &columns, "k", &rows[..1]).await.unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(warehouse.delete_by_source("t", "k").await.unwrap(), 1);
        assert_eq!(warehouse.row_count("t").await, 0);
    }

    #[tokio::test]
    async fn test_create_is_idempotent_and_adds_bookkeeping() {
        let warehouse = MemoryWarehouse::new();
        let schema = infer_schema(b"id\n1\n", None, 10).unwrap();
        warehouse.create_table("t", &schema.columns).await.unwrap();
        warehouse.create_table("t", &[]).await.unwrap();

        let names: Vec<String> = warehouse
            .table_columns("t")
            .await
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["id", "_source_key", "_loaded_at"]);
        assert!(warehouse.table_columns("other").await.unwrap().is_none());
    }
}
