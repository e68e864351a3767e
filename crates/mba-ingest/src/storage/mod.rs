//! Object-store access
//!
//! [`ObjectStore`] is the seam between the pipeline and the bucket. [`S3Store`]
//! talks to S3 or MinIO; [`MemoryStore`] keeps objects in process for tests and
//! dry runs. Retrying is never left to the SDK: callers go through
//! [`put_with_retry`] or [`KeyListing`], which apply a [`RetryPolicy`] to
//! transient failures only.

use async_trait::async_trait;
use mba_common::Fingerprint;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

pub mod config;
pub mod memory;
pub mod retry;
pub mod s3;

pub use config::StorageConfig;
pub use memory::MemoryStore;
pub use retry::RetryPolicy;
pub use s3::S3Store;

/// User metadata keys attached to every upload
pub const META_ORIGINAL_FILENAME: &str = "original-filename";
pub const META_CONTENT_SHA256: &str = "content-sha256";
pub const META_UPLOAD_TIMESTAMP: &str = "upload-timestamp";

pub const DEFAULT_LIST_PAGE_SIZE: i32 = 1000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Network failure, timeout, throttling or a 5xx response
    #[error("transient: {0}")]
    Transient(String),

    /// Bad key, missing bucket, denied permission and other 4xx responses
    #[error("permanent: {0}")]
    Permanent(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Classify an HTTP status code returned by the store
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => StoreError::NotFound(message),
            408 | 429 => StoreError::Transient(message),
            500..=599 => StoreError::Transient(message),
            _ => StoreError::Permanent(message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub content_type: Option<String>,
    pub user: BTreeMap<String, String>,
}

impl ObjectMetadata {
    /// Metadata recorded with every uploaded file
    pub fn for_upload(file_name: &str, fingerprint: &Fingerprint) -> Self {
        let mut user = BTreeMap::new();
        user.insert(META_ORIGINAL_FILENAME.to_string(), file_name.to_string());
        user.insert(META_CONTENT_SHA256.to_string(), fingerprint.to_string());
        user.insert(
            META_UPLOAD_TIMESTAMP.to_string(),
            chrono::Utc::now().to_rfc3339(),
        );
        Self {
            content_type: Some(content_type_for(file_name).to_string()),
            user,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    pub key: String,
    pub etag: Option<String>,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    /// Token for the following page; `None` once the listing is complete
    pub next_token: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        metadata: &ObjectMetadata,
    ) -> Result<PutReceipt, StoreError>;

    /// `Ok(None)` when the object does not exist
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<String>,
        page_size: i32,
    ) -> Result<ListPage, StoreError>;

    /// Existence check returning `(exists, size, etag)`
    async fn exists(&self, key: &str) -> Result<(bool, u64, Option<String>), StoreError> {
        Ok(match self.head(key).await? {
            Some(info) => (true, info.size, info.etag),
            None => (false, 0, None),
        })
    }
}

/// Upload with bounded retry. Returns the outcome and the attempts used.
pub async fn put_with_retry<S>(
    store: &S,
    policy: &RetryPolicy,
    key: &str,
    data: Vec<u8>,
    metadata: &ObjectMetadata,
) -> (Result<PutReceipt, StoreError>, u32)
where
    S: ObjectStore + ?Sized,
{
    policy
        .run("put", |_| store.put(key, data.clone(), metadata))
        .await
}

/// Lazy, restartable listing of keys under a prefix.
///
/// The last continuation token is kept between pages, so a transient failure
/// re-fetches only the page that failed.
pub struct KeyListing<'a, S: ?Sized> {
    store: &'a S,
    prefix: String,
    token: Option<String>,
    exhausted: bool,
    policy: RetryPolicy,
    page_size: i32,
}

impl<'a, S: ObjectStore + ?Sized> KeyListing<'a, S> {
    pub fn new(store: &'a S, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            token: None,
            exhausted: false,
            policy: RetryPolicy::default(),
            page_size: DEFAULT_LIST_PAGE_SIZE,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Resume a listing from a previously saved token
    pub fn resume_from(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn continuation_token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Next page of keys, or `None` when the listing is complete
    pub async fn next_page(&mut self) -> Result<Option<Vec<String>>, StoreError> {
        let page = self.next_objects().await?;
        Ok(page.map(|objects| objects.into_iter().map(|object| object.key).collect()))
    }

    /// Like [`Self::next_page`], keeping size and etag of each object
    pub async fn next_objects(&mut self) -> Result<Option<Vec<ObjectInfo>>, StoreError> {
        if self.exhausted {
            return Ok(None);
        }

        let store = self.store;
        let prefix = self.prefix.as_str();
        let token = self.token.clone();
        let page_size = self.page_size;
        let (result, _) = self
            .policy
            .run("list", |_| store.list_page(prefix, token.clone(), page_size))
            .await;
        let page = result?;

        self.exhausted = page.next_token.is_none();
        self.token = page.next_token;
        Ok(Some(page.objects))
    }

    pub async fn collect_all(mut self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        while let Some(page) = self.next_page().await? {
            keys.extend(page);
        }
        Ok(keys)
    }
}

/// Content type sent with an upload, derived from the file extension
pub fn content_type_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "ppt" => "application/vnd.ms-powerpoint",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "csv" => "text/csv",
        "tsv" => "text/tab-separated-values",
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "json" => "application/json",
        "xml" => "application/xml",
        "yaml" | "yml" => "application/yaml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "tiff" => "image/tiff",
        _ => "application/octet-stream",
    }
}
