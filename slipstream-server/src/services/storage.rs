use std::{collections::BTreeMap, collections::HashMap, time::Duration};

use async_trait::async_trait;
use axum::body::Bytes;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object storage request failed: {0}")]
    Http(String),
    #[error("object {0} not found")]
    NotFound(String),
    #[error("object storage rejected the request: {0}")]
    Rejected(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Where the client should send the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUpload {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub expires_in: Duration,
}

/// Result of a HEAD against a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHead {
    pub size: u64,
    pub etag: Option<String>,
    pub version_id: Option<String>,
    pub content_type: Option<String>,
}

/// Object storage collaborator for attachments.
#[async_trait]
pub trait AttachmentStorage: Send + Sync {
    fn bucket(&self) -> &str;

    async fn presign_upload(
        &self,
        key: &str,
        mime: &str,
        expires_in: Duration,
    ) -> StorageResult<PresignedUpload>;

    /// Verifies an uploaded object exists and reads its metadata.
    async fn head_object(&self, key: &str) -> StorageResult<ObjectHead>;

    async fn presign_download(
        &self,
        key: &str,
        version_id: Option<&str>,
        expires_in: Duration,
    ) -> StorageResult<String>;

    async fn put_object(&self, key: &str, body: Bytes, mime: &str) -> StorageResult<ObjectHead>;

    /// Body and content type of a stored object.
    async fn get_object(&self, key: &str) -> StorageResult<(Bytes, String)>;
}

#[derive(Debug, Clone)]
struct StoredObject {
    body: Bytes,
    mime: String,
    version_id: String,
}

/// Process-local object store whose presigned URLs point back at this server's
/// `/objects/{key}` route.
#[derive(Debug)]
pub struct InMemoryStorage {
    bucket: String,
    public_url: String,
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl InMemoryStorage {
    #[must_use]
    pub fn new(bucket: impl Into<String>, public_url: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            public_url: public_url.into().trim_end_matches('/').to_string(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    fn object_url(&self, key: &str, expires_in: Duration) -> String {
        format!(
            "{}/objects/{key}?expires={}",
            self.public_url,
            expires_in.as_secs()
        )
    }
}

fn head_of(object: &StoredObject) -> ObjectHead {
    ObjectHead {
        size: object.body.len() as u64,
        etag: Some(format!("\"{:x}\"", object.body.len())),
        version_id: Some(object.version_id.clone()),
        content_type: Some(object.mime.clone()),
    }
}

#[async_trait]
impl AttachmentStorage for InMemoryStorage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn presign_upload(
        &self,
        key: &str,
        mime: &str,
        expires_in: Duration,
    ) -> StorageResult<PresignedUpload> {
        if key.is_empty() {
            return Err(StorageError::Rejected("empty object key".to_string()));
        }

        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), mime.to_string());

        Ok(PresignedUpload {
            method: "PUT".to_string(),
            url: self.object_url(key, expires_in),
            headers,
            expires_in,
        })
    }

    async fn head_object(&self, key: &str) -> StorageResult<ObjectHead> {
        let objects = self.objects.read().await;
        objects
            .get(key)
            .map(head_of)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn presign_download(
        &self,
        key: &str,
        _version_id: Option<&str>,
        expires_in: Duration,
    ) -> StorageResult<String> {
        if !self.objects.read().await.contains_key(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(self.object_url(key, expires_in))
    }

    async fn put_object(&self, key: &str, body: Bytes, mime: &str) -> StorageResult<ObjectHead> {
        let object = StoredObject {
            body,
            mime: mime.to_string(),
            version_id: Uuid::new_v4().simple().to_string(),
        };
        let head = head_of(&object);
        debug!(key, size = head.size, "stored object");
        self.objects.write().await.insert(key.to_string(), object);
        Ok(head)
    }

    async fn get_object(&self, key: &str) -> StorageResult<(Bytes, String)> {
        let objects = self.objects.read().await;
        objects
            .get(key)
            .map(|object| (object.body.clone(), object.mime.clone()))
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}
