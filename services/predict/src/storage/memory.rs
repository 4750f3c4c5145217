use super::{ObjectStore, StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    content_type: String,
    public: bool,
}

/// In-process object store, used by tests and local runs without a bucket
#[derive(Debug, Default)]
pub struct MemoryStore {
    bucket: String,
    objects: RwLock<BTreeMap<String, StoredObject>>,
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Raw object content, if present
    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.read().get(key).map(|o| o.data.clone())
    }

    /// Content type recorded at upload
    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.read().get(key).map(|o| o.content_type.clone())
    }

    /// Whether the object has been made public
    pub fn is_public(&self, key: &str) -> bool {
        self.objects.read().get(key).map(|o| o.public).unwrap_or(false)
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn put(&self, key: &str, data: Bytes, content_type: &str) {
        self.objects.write().insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
                public: false,
            },
        );
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
        public: bool,
    ) -> StorageResult<Option<String>> {
        let data = tokio::fs::read(path).await?;
        self.put(key, Bytes::from(data), content_type);
        debug!(key = %key, path = %path.display(), "File stored in memory");

        if public {
            self.make_public(key).await.map(Some)
        } else {
            Ok(None)
        }
    }

    async fn upload_bytes(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        public: bool,
    ) -> StorageResult<Option<String>> {
        self.put(key, data, content_type);
        debug!(key = %key, "Stream stored in memory");

        if public {
            self.make_public(key).await.map(Some)
        } else {
            Ok(None)
        }
    }

    async fn download_to_path(&self, key: &str, path: &Path) -> StorageResult<u64> {
        let data = self
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, &data).await?;
        Ok(data.len() as u64)
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.objects.read().contains_key(key))
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn make_public(&self, key: &str) -> StorageResult<String> {
        let mut objects = self.objects.write();
        let object = objects
            .get_mut(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        object.public = true;
        Ok(self.public_url(key))
    }

    fn public_url(&self, key: &str) -> String {
        format!("memory://{}/{}", self.bucket, key)
    }

    async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        if !self.objects.read().contains_key(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let expires = Utc::now().timestamp() + expires_in.as_secs() as i64;
        Ok(format!("memory://{}/{}?expires={}", self.bucket, key, expires))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.objects
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
