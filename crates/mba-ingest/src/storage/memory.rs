//! In-process object store with the same semantics as [`super::S3Store`]

use async_trait::async_trait;
use mba_common::Fingerprint;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::{ListPage, ObjectInfo, ObjectMetadata, ObjectStore, PutReceipt, StoreError};

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub metadata: ObjectMetadata,
    pub etag: String,
}

#[derive(Debug)]
pub struct MemoryStore {
    bucket: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
    puts: AtomicUsize,
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
            puts: AtomicUsize::new(0),
        }
    }

    /// Number of successful `put` calls so far
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub async fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.read().await.get(key).cloned()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.keys().cloned().collect()
    }

    /// Seed an object without counting it as an upload
    pub async fn insert(&self, key: impl Into<String>, data: Vec<u8>) {
        let etag = etag_for(&data);
        self.objects.write().await.insert(
            key.into(),
            StoredObject {
                data,
                metadata: ObjectMetadata::default(),
                etag,
            },
        );
    }
}

fn etag_for(data: &[u8]) -> String {
    Fingerprint::from_bytes(data).as_str()[..32].to_string()
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() || key.starts_with('/') {
        return Err(StoreError::Permanent(format!("invalid object key {key:?}")));
    }
    Ok(())
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        metadata: &ObjectMetadata,
    ) -> Result<PutReceipt, StoreError> {
        validate_key(key)?;
        let size = data.len() as u64;
        let etag = etag_for(&data);

        self.objects.write().await.insert(
            key.to_string(),
            StoredObject {
                data,
                metadata: metadata.clone(),
                etag: etag.clone(),
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);

        Ok(PutReceipt {
            key: key.to_string(),
            etag: Some(etag),
            size,
        })
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StoreError> {
        Ok(self.objects.read().await.get(key).map(|object| ObjectInfo {
            key: key.to_string(),
            size: object.data.len() as u64,
            etag: Some(object.etag.clone()),
        }))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .read()
            .await
            .get(key)
            .map(|object| object.data.clone())
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", self.bucket, key)))
    }

    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<String>,
        page_size: i32,
    ) -> Result<ListPage, StoreError> {
        let page_size = page_size.max(1) as usize;
        let objects = self.objects.read().await;

        // The token is the last key of the previous page
        let start = match continuation {
            Some(token) => Bound::Excluded(token),
            None => Bound::Included(prefix.to_string()),
        };

        let mut matching = objects
            .range::<String, _>((start, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectInfo {
                key: key.clone(),
                size: object.data.len() as u64,
                etag: Some(object.etag.clone()),
            });

        let page: Vec<ObjectInfo> = matching.by_ref().take(page_size).collect();
        let next_token = match (page.last(), matching.next()) {
            (Some(last), Some(_)) => Some(last.key.clone()),
            _ => None,
        };

        Ok(ListPage {
            objects: page,
            next_token,
        })
    }
}
