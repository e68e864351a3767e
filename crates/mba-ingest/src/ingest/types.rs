//! Core types for the upload pipeline

use mba_common::Fingerprint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{IngestError, IngestResult};

/// Top-level key namespace, e.g. `mba` or `policy`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Scope(String);

impl Scope {
    pub fn new(name: impl Into<String>) -> IngestResult<Self> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty()
            || trimmed.contains('/')
            || trimmed.chars().any(char::is_whitespace)
        {
            return Err(IngestError::Config(format!("invalid scope {name:?}")));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key prefix covering every object in this scope
    pub fn prefix(&self) -> String {
        format!("{}/", self.0)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Scope {
    type Error = IngestError;

    fn try_from(value: String) -> IngestResult<Self> {
        Self::new(value)
    }
}

impl From<Scope> for String {
    fn from(value: Scope) -> Self {
        value.0
    }
}

/// Second key segment, derived from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Documents,
    Text,
    Tabular,
    Spreadsheets,
    Presentations,
    Images,
    Structured,
    Other,
}

impl Category {
    /// Extension lookup; accepts `pdf`, `.pdf` or `.PDF`
    pub fn from_extension(ext: &str) -> Self {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        match ext.as_str() {
            "pdf" | "doc" | "docx" => Category::Documents,
            "txt" | "md" | "log" => Category::Text,
            "csv" | "tsv" => Category::Tabular,
            "xls" | "xlsx" => Category::Spreadsheets,
            "ppt" | "pptx" => Category::Presentations,
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "tiff" => Category::Images,
            "json" | "xml" | "yaml" | "yml" => Category::Structured,
            _ => Category::Other,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(Category::Other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Documents => "documents",
            Category::Text => "text",
            Category::Tabular => "tabular",
            Category::Spreadsheets => "spreadsheets",
            Category::Presentations => "presentations",
            Category::Images => "images",
            Category::Structured => "structured",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upload job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

/// One local file to be uploaded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub source_path: PathBuf,
    pub scope: Scope,
    pub category: Category,
    /// `scope/category/filename`
    pub destination_key: String,
    /// Filled in by the worker unless discovery ran in eager mode
    pub fingerprint: Option<Fingerprint>,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub duplicate: bool,
    /// Set once the stall supervisor has put the job back on the queue
    pub requeued: bool,
    /// Handed out by the queue on every dequeue; stale leases are ignored
    #[serde(skip)]
    pub lease: u64,
}

impl Job {
    pub fn new(source_path: PathBuf, scope: Scope, category: Category, file_name: &str) -> Self {
        let destination_key = format!("{}/{}/{}", scope, category, file_name);
        Self {
            id: Uuid::new_v4(),
            source_path,
            scope,
            category,
            destination_key,
            fingerprint: None,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            duplicate: false,
            requeued: false,
            lease: 0,
        }
    }

    pub fn file_name(&self) -> &str {
        self.destination_key
            .rsplit('/')
            .next()
            .unwrap_or(&self.destination_key)
    }

    /// Uploaded CSVs feed the loader
    pub fn is_loadable(&self) -> bool {
        self.category == Category::Tabular
            && self
                .source_path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("csv"))
    }
}

/// Identity used when comparing discovery runs
impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.source_path == other.source_path
            && self.scope == other.scope
            && self.destination_key == other.destination_key
    }
}

/// Worker verdict handed to the queue when a job finishes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Uploaded,
    /// Content already present; nothing was sent
    DuplicateSkipped { known_location: String },
    Failed { error: String },
}
