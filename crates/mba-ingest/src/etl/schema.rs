//! Relational schema inference from delimited text
//!
//! Each column is narrowed through the lattice integer, decimal, boolean,
//! datetime, date and finally text. Text columns become `CHAR(n)` when every
//! sampled value has the same short length, otherwise the smallest fitting
//! `VARCHAR` bucket, otherwise `TEXT`.

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use crate::error::{EtlError, EtlResult};

pub const DEFAULT_SAMPLE_ROWS: usize = 1000;
pub const DELIMITER_CANDIDATES: [u8; 4] = [b',', b'\t', b';', b'|'];
const DELIMITER_SAMPLE_LINES: usize = 20;

pub const VARCHAR_BUCKETS: [usize; 7] = [16, 32, 64, 128, 256, 512, 1024];
/// Longest value still stored as fixed width
pub const FIXED_WIDTH_MAX: usize = 32;

pub const SOURCE_KEY_COLUMN: &str = "_source_key";
pub const LOADED_AT_COLUMN: &str = "_loaded_at";

pub const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%d-%m-%Y %H:%M:%S"];
pub const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d-%m-%Y", "%m/%d/%Y", "%Y/%m/%d"];

const BOOLEAN_TRUE: [&str; 4] = ["true", "yes", "t", "y"];
const BOOLEAN_FALSE: [&str; 4] = ["false", "no", "f", "n"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "width", rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Decimal,
    Boolean,
    Date,
    DateTime,
    FixedText(usize),
    VarText(usize),
    Text,
}

impl ColumnType {
    pub fn sql_type(&self) -> String {
        match self {
            ColumnType::Integer => "BIGINT".to_string(),
            ColumnType::Decimal => "NUMERIC".to_string(),
            ColumnType::Boolean => "BOOLEAN".to_string(),
            ColumnType::Date => "DATE".to_string(),
            ColumnType::DateTime => "TIMESTAMP".to_string(),
            ColumnType::FixedText(width) => format!("CHAR({width})"),
            ColumnType::VarText(width) => format!("VARCHAR({width})"),
            ColumnType::Text => "TEXT".to_string(),
        }
    }

    /// Map an `information_schema.columns` type back onto the lattice. `None`
    /// for types the lattice has no member for (uuid, jsonb, user-defined).
    pub fn from_information_schema(data_type: &str, max_length: Option<i32>) -> Option<Self> {
        let width = max_length.filter(|w| *w > 0).map(|w| w as usize);
        let column_type = match data_type {
            "smallint" | "integer" | "bigint" => ColumnType::Integer,
            "numeric" | "real" | "double precision" => ColumnType::Decimal,
            "boolean" => ColumnType::Boolean,
            "date" => ColumnType::Date,
            "timestamp without time zone" | "timestamp with time zone" => ColumnType::DateTime,
            "character" => ColumnType::FixedText(width.unwrap_or(1)),
            "character varying" => width.map(ColumnType::VarText).unwrap_or(ColumnType::Text),
            "text" => ColumnType::Text,
            _ => return None,
        };
        Some(column_type)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Decimal => "decimal",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::DateTime => "datetime",
            ColumnType::FixedText(_) => "fixed-width text",
            ColumnType::VarText(_) => "variable text",
            ColumnType::Text => "unbounded text",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql_type())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InferredColumn {
    /// snake_case identifier used in the table
    pub name: String,
    pub source_header: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub max_width: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InferredSchema {
    pub delimiter: u8,
    pub columns: Vec<InferredColumn>,
    pub sampled_rows: usize,
}

impl InferredSchema {
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

/// Convert an arbitrary header into a lowercase snake_case identifier
///
/// `"First Name"` becomes `first_name`, `"123Data"` becomes `c_123data` and a
/// header with no usable characters becomes `col`.
pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_separator = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_separator && !out.is_empty() {
                out.push('_');
            }
            pending_separator = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }

    if out.is_empty() {
        return "col".to_string();
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "c_");
    }
    out
}

/// Snake-case every header and suffix repeats with `_2`, `_3`, ...
pub fn column_names(headers: &[&str]) -> Vec<String> {
    let mut seen = HashSet::new();
    headers
        .iter()
        .map(|header| {
            let base = to_snake_case(header);
            let mut name = base.clone();
            let mut suffix = 2;
            while !seen.insert(name.clone()) {
                name = format!("{base}_{suffix}");
                suffix += 1;
            }
            name
        })
        .collect()
}

/// Table name derived from an object key: the snake-cased file stem
pub fn table_name_for_key(key: &str) -> String {
    let stem = Path::new(key)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(key);
    to_snake_case(stem)
}

/// Lowercase identifier of at most 63 bytes starting with a letter or underscore
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name.starts_with(|c: char| c.is_ascii_lowercase() || c == '_')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Pick the delimiter whose modal field count (above one) covers the most of
/// the first lines. Ties keep the earlier candidate; comma when nothing fits.
pub fn detect_delimiter(text: &str) -> u8 {
    let sample: String = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .take(DELIMITER_SAMPLE_LINES)
        .collect::<Vec<_>>()
        .join("\n");

    let mut best: Option<(u8, usize)> = None;
    for candidate in DELIMITER_CANDIDATES {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(candidate)
            .has_headers(false)
            .flexible(true)
            .from_reader(sample.as_bytes());

        let mut frequency: BTreeMap<usize, usize> = BTreeMap::new();
        for record in reader.records().flatten() {
            *frequency.entry(record.len()).or_default() += 1;
        }

        let modal = frequency
            .iter()
            .filter(|(fields, _)| **fields > 1)
            .max_by_key(|(fields, lines)| (**lines, **fields));

        if let Some((_, &lines)) = modal {
            if best.map_or(true, |(_, best_lines)| lines > best_lines) {
                best = Some((candidate, lines));
            }
        }
    }

    best.map(|(delimiter, _)| delimiter).unwrap_or(b',')
}

/// Whether a trimmed value counts as SQL NULL
pub fn is_null_token(value: &str) -> bool {
    value.is_empty() || value == "NULL" || value == "null"
}

pub fn parse_boolean(value: &str) -> Option<bool> {
    let lower = value.to_ascii_lowercase();
    if BOOLEAN_TRUE.contains(&lower.as_str()) {
        Some(true)
    } else if BOOLEAN_FALSE.contains(&lower.as_str()) {
        Some(false)
    } else {
        None
    }
}

pub fn parse_integer(value: &str) -> Option<i64> {
    value.parse().ok()
}

/// Plain decimal notation only; rejects `inf`, `NaN` and friends
pub fn parse_decimal(value: &str) -> Option<f64> {
    let digits = value.chars().any(|c| c.is_ascii_digit());
    let plain = value
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'));
    if digits && plain {
        value.parse().ok()
    } else {
        None
    }
}

pub fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
}

#[derive(Debug)]
struct ColumnProfile {
    integer: bool,
    decimal: bool,
    boolean: bool,
    datetime: bool,
    date: bool,
    nullable: bool,
    non_null: usize,
    max_width: usize,
    uniform_width: Option<usize>,
    mixed_width: bool,
}

impl Default for ColumnProfile {
    fn default() -> Self {
        Self {
            integer: true,
            decimal: true,
            boolean: true,
            datetime: true,
            date: true,
            nullable: false,
            non_null: 0,
            max_width: 0,
            uniform_width: None,
            mixed_width: false,
        }
    }
}

impl ColumnProfile {
    fn observe(&mut self, raw: Option<&str>) {
        let value = raw.map(str::trim).unwrap_or("");
        if is_null_token(value) {
            self.nullable = true;
            return;
        }

        self.non_null += 1;
        let width = value.chars().count();
        self.max_width = self.max_width.max(width);
        match self.uniform_width {
            None => self.uniform_width = Some(width),
            Some(existing) if existing != width => self.mixed_width = true,
            Some(_) => {},
        }

        self.integer &= parse_integer(value).is_some();
        self.decimal &= parse_decimal(value).is_some();
        self.boolean &= parse_boolean(value).is_some();
        self.datetime &= parse_datetime(value).is_some();
        self.date &= parse_date(value).is_some();
    }

    fn column_type(&self) -> ColumnType {
        if self.non_null == 0 {
            return ColumnType::Text;
        }
        if self.integer {
            return ColumnType::Integer;
        }
        if self.decimal {
            return ColumnType::Decimal;
        }
        if self.boolean {
            return ColumnType::Boolean;
        }
        if self.datetime {
            return ColumnType::DateTime;
        }
        if self.date {
            return ColumnType::Date;
        }
        text_type(self.non_null, self.max_width, !self.mixed_width)
    }
}

fn text_type(values: usize, max_width: usize, uniform: bool) -> ColumnType {
    if values >= 2 && uniform && max_width > 0 && max_width <= FIXED_WIDTH_MAX {
        return ColumnType::FixedText(max_width);
    }
    VARCHAR_BUCKETS
        .iter()
        .find(|bucket| max_width <= **bucket)
        .map(|bucket| ColumnType::VarText(*bucket))
        .unwrap_or(ColumnType::Text)
}

/// Decode and trim a byte-order mark. Invalid UTF-8 is a schema error.
pub fn decode_text(content: &[u8]) -> EtlResult<&str> {
    let text = std::str::from_utf8(content).map_err(|e| {
        EtlError::SchemaInference(format!(
            "content is not valid UTF-8 (byte offset {})",
            e.valid_up_to()
        ))
    })?;
    Ok(text.strip_prefix('\u{feff}').unwrap_or(text))
}

/// Infer a schema from the header and the first `sample_rows` data rows
pub fn infer_schema(
    content: &[u8],
    declared_delimiter: Option<u8>,
    sample_rows: usize,
) -> EtlResult<InferredSchema> {
    let text = decode_text(content)?;
    if text.trim().is_empty() {
        return Err(EtlError::SchemaInference("content is empty".to_string()));
    }

    let delimiter = declared_delimiter.unwrap_or_else(|| detect_delimiter(text));
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| EtlError::SchemaInference(format!("cannot read header: {e}")))?
        .clone();
    if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
        return Err(EtlError::SchemaInference("missing header row".to_string()));
    }

    let header_refs: Vec<&str> = headers.iter().map(str::trim).collect();
    let names = column_names(&header_refs);
    let mut profiles: Vec<ColumnProfile> = names.iter().map(|_| ColumnProfile::default()).collect();

    let mut sampled_rows = 0;
    for record in reader.records().take(sample_rows) {
        let record = record.map_err(|e| EtlError::SchemaInference(format!("malformed row: {e}")))?;
        sampled_rows += 1;
        for (index, profile) in profiles.iter_mut().enumerate() {
            profile.observe(record.get(index));
        }
    }

    let columns = names
        .into_iter()
        .zip(header_refs)
        .zip(profiles)
        .map(|((name, header), profile)| InferredColumn {
            name,
            source_header: header.to_string(),
            column_type: profile.column_type(),
            // Header-only samples give no evidence either way
            nullable: profile.nullable || profile.non_null == 0,
            max_width: profile.max_width,
        })
        .collect();

    Ok(InferredSchema {
        delimiter,
        columns,
        sampled_rows,
    })
}

/// `CREATE TABLE IF NOT EXISTS` for the inferred columns plus bookkeeping columns
pub fn create_table_sql(table: &str, columns: &[InferredColumn]) -> String {
    let mut definitions: Vec<String> = columns
        .iter()
        .map(|column| {
            let null_sql = if column.nullable { "" } else { " NOT NULL" };
            format!(
                "    {} {}{}",
                quote_ident(&column.name),
                column.column_type.sql_type(),
                null_sql
            )
        })
        .collect();

    definitions.push(format!("    {} TEXT NOT NULL", quote_ident(SOURCE_KEY_COLUMN)));
    definitions.push(format!(
        "    {} TIMESTAMPTZ NOT NULL DEFAULT NOW()",
        quote_ident(LOADED_AT_COLUMN)
    ));

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        quote_ident(table),
        definitions.join(",\n")
    )
}
