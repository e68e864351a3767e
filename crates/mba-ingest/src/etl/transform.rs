//! Row normalization and per-column type coercion

use chrono::{NaiveDate, NaiveDateTime};
use csv::StringRecord;
use serde::Serialize;

use super::schema::{
    is_null_token, parse_boolean, parse_date, parse_datetime, parse_decimal, parse_integer,
    ColumnType,
};
use super::warehouse::TableColumn;
use crate::error::{EtlError, EtlResult};

/// A typed cell ready for insertion
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CellValue {
    Null,
    Integer(i64),
    /// Kept as validated text so no precision is lost before the database casts it
    Decimal(String),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Text(String),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    /// Text form used when binding through a `::type` cast
    pub fn to_sql_text(&self) -> Option<String> {
        match self {
            CellValue::Null => None,
            CellValue::Integer(v) => Some(v.to_string()),
            CellValue::Decimal(v) => Some(v.clone()),
            CellValue::Boolean(v) => Some(v.to_string()),
            CellValue::Date(v) => Some(v.format("%Y-%m-%d").to_string()),
            CellValue::DateTime(v) => Some(v.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            CellValue::Text(v) => Some(v.clone()),
        }
    }
}

/// Trim and map null tokens to `None`
pub fn normalize(raw: Option<&str>) -> Option<&str> {
    let value = raw?.trim();
    (!is_null_token(value)).then_some(value)
}

/// Coerce one normalized value to a column type. `Err` carries what was expected.
pub fn coerce(value: Option<&str>, column: &TableColumn) -> Result<CellValue, String> {
    let Some(value) = value else {
        return if column.nullable {
            Ok(CellValue::Null)
        } else {
            Err("a non-null value".to_string())
        };
    };

    let expected = || column.column_type.name().to_string();
    match column.column_type {
        ColumnType::Integer => parse_integer(value).map(CellValue::Integer).ok_or_else(expected),
        ColumnType::Decimal => parse_decimal(value)
            .map(|_| CellValue::Decimal(value.to_string()))
            .ok_or_else(expected),
        ColumnType::Boolean => parse_boolean(value).map(CellValue::Boolean).ok_or_else(expected),
        ColumnType::Date => parse_date(value).map(CellValue::Date).ok_or_else(expected),
        ColumnType::DateTime => parse_datetime(value)
            .or_else(|| parse_date(value).and_then(|d| d.and_hms_opt(0, 0, 0)))
            .map(CellValue::DateTime)
            .ok_or_else(expected),
        ColumnType::FixedText(width) | ColumnType::VarText(width) => {
            if value.chars().count() <= width {
                Ok(CellValue::Text(value.to_string()))
            } else {
                Err(format!("text of at most {width} characters"))
            }
        },
        ColumnType::Text => Ok(CellValue::Text(value.to_string())),
    }
}

/// Normalize and coerce a CSV record against the target columns, in order.
/// Missing trailing fields are treated as null; extra fields are ignored.
pub fn coerce_row(record: &StringRecord, columns: &[TableColumn], row: u64) -> EtlResult<Vec<CellValue>> {
    columns
        .iter()
        .enumerate()
        .map(|(index, column)| {
            let raw = record.get(index);
            coerce(normalize(raw), column).map_err(|expected| EtlError::Coercion {
                row,
                column: column.name.clone(),
                value: raw.unwrap_or("").to_string(),
                expected,
            })
        })
        .collect()
}
