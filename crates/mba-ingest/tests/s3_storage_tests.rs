//! S3 storage integration tests
//!
//! **Requirements**:
//! - MinIO or S3 must be running and accessible
//! - S3_ENDPOINT environment variable must be set (e.g., "http://localhost:9000")
//! - The bucket named by S3_BUCKET must exist
//! - Tests will be skipped if S3_ENDPOINT is not configured
//!
//! **Running tests**:
//! ```bash
//! # With MinIO running via docker-compose
//! cargo test --test s3_storage_tests
//! ```

use mba_common::Fingerprint;
use mba_ingest::storage::{KeyListing, ObjectMetadata, ObjectStore, S3Store, StorageConfig};
use uuid::Uuid;

/// Setup helper that creates a store if MinIO is available
async fn setup_store() -> Option<S3Store> {
    if std::env::var("S3_ENDPOINT").is_err() {
        return None;
    }

    let config = match StorageConfig::from_env() {
        Ok(cfg) => cfg,
        Err(_) => return None,
    };

    match S3Store::new(config).await {
        Ok(store) => Some(store),
        Err(e) => {
            eprintln!("Failed to create storage client: {}", e);
            None
        },
    }
}

fn test_prefix(test_name: &str) -> String {
    format!("test-{}/{}/", Uuid::new_v4().simple(), test_name)
}

#[tokio::test]
async fn test_put_then_exists_with_size() {
    let Some(store) = setup_store().await else {
        println!("Skipping test: S3_ENDPOINT not configured");
        return;
    };

    let key = format!("{}tabular/members.csv", test_prefix("put_exists"));
    let data = b"id,name\n1,ann\n".to_vec();
    let metadata = ObjectMetadata::for_upload("members.csv", &Fingerprint::from_bytes(&data));

    let receipt = store
        .put(&key, data.clone(), &metadata)
        .await
        .expect("Upload should succeed");
    assert_eq!(receipt.key, key);

    let (exists, size, _) = store.exists(&key).await.expect("HEAD should succeed");
    assert!(exists);
    assert_eq!(size, data.len() as u64);

    let body = store.get(&key).await.expect("GET should succeed");
    assert_eq!(body, data);

    let (missing, _, _) = store
        .exists(&format!("{key}.missing"))
        .await
        .expect("HEAD of a missing key is not an error");
    assert!(!missing);
}

#[tokio::test]
async fn test_paginated_listing() {
    let Some(store) = setup_store().await else {
        println!("Skipping test: S3_ENDPOINT not configured");
        return;
    };

    let prefix = test_prefix("listing");
    for i in 0..5 {
        store
            .put(
                &format!("{prefix}file_{i}.txt"),
                format!("{i}").into_bytes(),
                &ObjectMetadata::default(),
            )
            .await
            .expect("Upload should succeed");
    }

    let keys = KeyListing::new(&store, prefix.clone())
        .with_page_size(2)
        .collect_all()
        .await
        .expect("Listing should succeed");
    assert_eq!(keys.len(), 5);
    assert!(keys.iter().all(|k| k.starts_with(&prefix)));
}
