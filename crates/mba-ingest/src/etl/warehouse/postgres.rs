use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, instrument};

use super::{TableColumn, Warehouse};
use crate::error::EtlResult;
use crate::etl::schema::{create_table_sql, quote_ident, ColumnType, InferredColumn, SOURCE_KEY_COLUMN};
use crate::etl::transform::CellValue;

/// PostgreSQL caps a statement at 65535 bind parameters
const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Cast applied to each text-bound parameter
fn cast_for(column: &TableColumn) -> String {
    if let Some(native) = &column.native_type {
        return format!("::{native}");
    }
    match column.column_type {
        ColumnType::Integer => "::BIGINT",
        ColumnType::Decimal => "::NUMERIC",
        ColumnType::Boolean => "::BOOLEAN",
        ColumnType::Date => "::DATE",
        ColumnType::DateTime => "::TIMESTAMP",
        ColumnType::FixedText(_) | ColumnType::VarText(_) | ColumnType::Text => "::TEXT",
    }
    .to_string()
}

fn column_from_row(row: &PgRow) -> EtlResult<TableColumn> {
    let name: String = row.try_get("column_name")?;
    let data_type: String = row.try_get("data_type")?;
    let max_length: Option<i32> = row.try_get("character_maximum_length")?;
    let is_nullable: String = row.try_get("is_nullable")?;
    let udt_schema: String = row.try_get("udt_schema")?;
    let udt_name: String = row.try_get("udt_name")?;

    let (column_type, native_type) = match ColumnType::from_information_schema(&data_type, max_length) {
        Some(column_type) => (column_type, None),
        None => (
            ColumnType::Text,
            Some(format!("{}.{}", quote_ident(&udt_schema), quote_ident(&udt_name))),
        ),
    };

    Ok(TableColumn {
        name,
        column_type,
        nullable: is_nullable.eq_ignore_ascii_case("YES"),
        native_type,
    })
}

#[async_trait]
impl Warehouse for PgWarehouse {
    #[instrument(skip(self))]
    async fn table_columns(&self, table: &str) -> EtlResult<Option<Vec<TableColumn>>> {
        let rows = sqlx::query(
            r#"
            SELECT column_name::TEXT AS column_name,
                   data_type::TEXT AS data_type,
                   character_maximum_length::INT AS character_maximum_length,
                   is_nullable::TEXT AS is_nullable,
                   udt_schema::TEXT AS udt_schema,
                   udt_name::TEXT AS udt_name
            FROM information_schema.columns
            WHERE table_schema = current_schema() AND table_name = $1
            ORDER BY ordinal_position
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        if rows.is_empty() {
            return Ok(None);
        }
        let columns = rows.iter().map(column_from_row).collect::<EtlResult<Vec<_>>>()?;
        Ok(Some(columns))
    }

    #[instrument(skip(self, columns), fields(columns = columns.len()))]
    async fn create_table(&self, table: &str, columns: &[InferredColumn]) -> EtlResult<()> {
        let ddl = create_table_sql(table, columns);
        debug!(ddl = %ddl, "Creating table");
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_by_source(&self, table: &str, source_key: &str) -> EtlResult<u64> {
        let sql = format!(
            "DELETE FROM {} WHERE {} = $1",
            quote_ident(table),
            quote_ident(SOURCE_KEY_COLUMN)
        );
        let result = sqlx::query(&sql).bind(source_key).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, columns, rows), fields(rows = rows.len()))]
    async fn insert_batch(
        &self,
        table: &str,
        columns: &[TableColumn],
        source_key: &str,
        rows: &[Vec<CellValue>],
    ) -> EtlResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let column_list = columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .chain(std::iter::once(quote_ident(SOURCE_KEY_COLUMN)))
            .collect::<Vec<_>>()
            .join(", ");
        let rows_per_statement = (MAX_BIND_PARAMS / (columns.len() + 1)).max(1);

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in rows.chunks(rows_per_statement) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", quote_ident(table), column_list));

            builder.push_values(chunk.iter(), |mut values, row| {
                for (cell, column) in row.iter().zip(columns) {
                    values
                        .push_bind(cell.to_sql_text())
                        .push_unseparated(cast_for(column));
                }
                values.push_bind(source_key.to_string());
            });

            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(column_type: ColumnType, native_type: Option<&str>) -> TableColumn {
        TableColumn {
            name: "c".into(),
            column_type,
            nullable: true,
            native_type: native_type.map(str::to_string),
        }
    }

    #[test]
    fn test_casts() {
        assert_eq!(cast_for(&column(ColumnType::Integer, None)), "::BIGINT");
        assert_eq!(cast_for(&column(ColumnType::FixedText(4), None)), "::TEXT");
        assert_eq!(cast_for(&column(ColumnType::DateTime, None)), "::TIMESTAMP");
    }

    #[test]
    fn test_native_type_cast_wins() {
        let uuid = column(ColumnType::Text, Some("\"pg_catalog\".\"uuid\""));
        assert_eq!(cast_for(&uuid), "::\"pg_catalog\".\"uuid\"");
    }
}
