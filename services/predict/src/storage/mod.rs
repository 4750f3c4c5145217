//! Object storage gateway.
//!
//! The prediction handler only talks to [`ObjectStore`]; provider errors are
//! folded into [`StorageError`] so backends can be swapped without touching
//! request handling.

mod memory;
mod s3;

pub use memory::MemoryStore;
pub use s3::S3Store;

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by storage backends
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to presign URL: {0}")]
    Presign(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Capability set over a bucket-style object store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file. Returns the public URL when `public` is set.
    async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
        public: bool,
    ) -> StorageResult<Option<String>>;

    /// Upload an in-memory buffer. Returns the public URL when `public` is set.
    async fn upload_bytes(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
        public: bool,
    ) -> StorageResult<Option<String>>;

    /// Download an object into a local file, returning the byte count
    async fn download_to_path(&self, key: &str, path: &Path) -> StorageResult<u64>;

    /// Check whether an object exists at exactly `key`
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// List object keys under a prefix
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Make an object publicly readable and return its public URL
    async fn make_public(&self, key: &str) -> StorageResult<String>;

    /// Public URL of an object (no access change)
    fn public_url(&self, key: &str) -> String;

    /// Time-limited download URL
    async fn signed_url(&self, key: &str, expires_in: Duration) -> StorageResult<String>;

    /// Delete one object
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Delete every object under a prefix, returning how many were removed
    async fn batch_delete(&self, prefix: &str) -> StorageResult<usize> {
        let keys = self.list(prefix).await?;
        for key in &keys {
            self.delete(key).await?;
        }
        tracing::info!(prefix = %prefix, deleted = keys.len(), "Batch deleted objects");
        Ok(keys.len())
    }

    /// Backend name for logs and health output
    fn backend(&self) -> &'static str;
}

/// Build an object key of the form `{prefix}/{id}/{filename}`
pub fn object_key(prefix: &str, id: &str, filename: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}", id, filename)
    } else {
        format!("{}/{}/{}", prefix, id, filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key() {
        assert_eq!(object_key("results", "abc_1", "dog.jpg"), "results/abc_1/dog.jpg");
        assert_eq!(object_key("results/", "abc_1", "dog.jpg"), "results/abc_1/dog.jpg");
        assert_eq!(object_key("", "abc_1", "dog.jpg"), "abc_1/dog.jpg");
    }
}
