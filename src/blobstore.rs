//! Blob store abstraction over the content-addressed object store the
//! indexer/reader read from. Grounded on `common::s3`'s endpoint/credential
//! bootstrap, generalized into an injectable trait so the indexer and
//! reader do not depend on `aws-sdk-s3` directly.

use async_trait::async_trait;

use crate::err::{BioIndexError, Result};

#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub etag: String,
}

/// A single discovered object, with enough metadata for the indexer to
/// decide whether it needs (re)ingesting.
#[derive(Debug, Clone)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
    pub etag: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Lists objects directly under `prefix` (non-recursive, `/`-delimited).
    async fn list(&self, prefix: &str) -> Result<Vec<ListedObject>>;

    /// Returns size/etag without transferring the body.
    async fn head(&self, key: &str) -> Result<ObjectMeta>;

    /// Reads the half-open uncompressed byte range `[start, end)`.
    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>>;

    /// Reads the whole object.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;
}

pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    pub async fn from_env() -> Result<Self> {
        let bucket = std::env::var("BIOINDEX_S3_BUCKET")
            .map_err(|_| BioIndexError::BadRequest("BIOINDEX_S3_BUCKET is required".into()))?;
        let config = crate::common::s3::config_from_env()
            .await
            .map_err(BioIndexError::Other)?;
        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(config),
            bucket,
        })
    }

    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ListedObject>> {
        let mut objects = Vec::new();
        let mut continuation = None;
        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                req = req.continuation_token(token);
            }
            let resp = req.send().await.map_err(|e| BioIndexError::SourceReadFailed {
                blob_path: prefix.to_string(),
                message: e.to_string(),
            })?;

            for obj in resp.contents() {
                let key = obj.key().unwrap_or_default().to_string();
                let size = obj.size().unwrap_or_default().max(0) as u64;
                let etag = obj.e_tag().unwrap_or_default().trim_matches('"').to_string();
                objects.push(ListedObject { key, size, etag });
            }

            if resp.is_truncated().unwrap_or(false) {
                continuation = resp.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }
        Ok(objects)
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BioIndexError::SourceReadFailed {
                blob_path: key.to_string(),
                message: e.to_string(),
            })?;

        Ok(ObjectMeta {
            key: key.to_string(),
            size: resp.content_length().unwrap_or_default().max(0) as u64,
            etag: resp.e_tag().unwrap_or_default().trim_matches('"').to_string(),
        })
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let range = format!("bytes={start}-{}", end.saturating_sub(1));
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(range)
            .send()
            .await
            .map_err(|e| BioIndexError::SourceReadFailed {
                blob_path: key.to_string(),
                message: e.to_string(),
            })?;

        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| BioIndexError::SourceReadFailed {
                blob_path: key.to_string(),
                message: e.to_string(),
            })?
            .into_bytes();
        Ok(bytes.to_vec())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BioIndexError::SourceReadFailed {
                blob_path: key.to_string(),
                message: e.to_string(),
            })?;

        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| BioIndexError::SourceReadFailed {
                blob_path: key.to_string(),
                message: e.to_string(),
            })?
            .into_bytes();
        Ok(bytes.to_vec())
    }
}
