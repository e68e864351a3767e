//! S3 / MinIO implementation of [`ObjectStore`]

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    config::{http::HttpResponse, retry::RetryConfig, Region},
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
    types::ServerSideEncryption,
    Client,
};
use tracing::{debug, info, instrument};

use super::{config::StorageConfig, ListPage, ObjectInfo, ObjectMetadata, ObjectStore, PutReceipt, StoreError};

#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn new(config: StorageConfig) -> anyhow::Result<Self> {
        config.validate()?;
        debug!(
            bucket = %config.bucket,
            endpoint = ?config.endpoint,
            path_style = config.path_style,
            "Initializing S3 store"
        );

        let mut builder = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => {
                let credentials = Credentials::new(access_key, secret_key, None, None, "mba-storage");
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(credentials)
                    .region(Region::new(config.region.clone()))
            },
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        builder = builder
            .force_path_style(config.path_style)
            .retry_config(RetryConfig::disabled());

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());
        info!(bucket = %config.bucket, "S3 store initialized");

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

}

/// Map an SDK failure onto the transient/permanent split
fn classify<E>(err: SdkError<E, HttpResponse>, context: &str) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = format!("{context}: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::ServiceError(service) => {
            StoreError::from_status(service.raw().status().as_u16(), message)
        },
        SdkError::ResponseError(response) => {
            StoreError::from_status(response.raw().status().as_u16(), message)
        },
        SdkError::ConstructionFailure(_) => StoreError::Permanent(message),
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => StoreError::Transient(message),
        _ => StoreError::Transient(message),
    }
}

fn strip_etag(etag: Option<&str>) -> Option<String> {
    etag.map(|e| e.trim_matches('"').to_string())
}

#[async_trait]
impl ObjectStore for S3Store {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self, data, metadata), fields(bucket = %self.bucket, size = data.len()))]
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        metadata: &ObjectMetadata,
    ) -> Result<PutReceipt, StoreError> {
        let size = data.len() as u64;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .server_side_encryption(ServerSideEncryption::Aes256);

        if let Some(content_type) = &metadata.content_type {
            request = request.content_type(content_type);
        }
        for (name, value) in &metadata.user {
            request = request.metadata(name, value);
        }

        let output = request
            .send()
            .await
            .map_err(|e| classify(e, &format!("PUT s3://{}/{}", self.bucket, key)))?;

        debug!(key, size, "Uploaded object");

        Ok(PutReceipt {
            key: key.to_string(),
            etag: strip_etag(output.e_tag()),
            size,
        })
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, StoreError> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: output.content_length().unwrap_or(0).max(0) as u64,
                etag: strip_etag(output.e_tag()),
            })),
            Err(SdkError::ServiceError(service)) if service.err().is_not_found() => Ok(None),
            Err(err) => match classify(err, &format!("HEAD s3://{}/{}", self.bucket, key)) {
                StoreError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let context = format!("GET s3://{}/{}", self.bucket, key);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(e, &context))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Transient(format!("{context}: reading body: {e}")))?
            .into_bytes()
            .to_vec();

        debug!(key, size = data.len(), "Downloaded object");
        Ok(data)
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list_page(
        &self,
        prefix: &str,
        continuation: Option<String>,
        page_size: i32,
    ) -> Result<ListPage, StoreError> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(page_size)
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| classify(e, &format!("LIST s3://{}/{}", self.bucket, prefix)))?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|object| {
                object.key().map(|key| ObjectInfo {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    etag: strip_etag(object.e_tag()),
                })
            })
            .collect();

        let next_token = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ListPage { objects, next_token })
    }
}
