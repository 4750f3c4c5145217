//! Collision-free result identifiers.
//!
//! Local reservations are atomic (`create_dir` fails on an existing entry),
//! so two requests on the same host never share a directory. The cloud check
//! is a plain lookup and can still race with another host.

use crate::storage::{ObjectStore, StorageError};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IdentifierError {
    #[error("No free identifier after {0} attempts")]
    Exhausted(u32),

    #[error("Failed to reserve result directory: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Collision domain for identifier generation
#[derive(Clone, Copy)]
pub enum Namespace<'a> {
    /// Directories under a local base path
    Local { base: &'a Path },
    /// Local directories plus objects under `{prefix}/{id}` in a store
    Cloud {
        base: &'a Path,
        prefix: &'a str,
        store: &'a dyn ObjectStore,
    },
}

type CandidateSource = Arc<dyn Fn() -> String + Send + Sync>;

/// Generates identifiers that are free in a namespace
#[derive(Clone)]
pub struct IdGenerator {
    max_attempts: u32,
    source: CandidateSource,
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl IdGenerator {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            source: Arc::new(candidate),
        }
    }

    /// Use a custom candidate source instead of time-ordered UUIDs
    pub fn with_source<F>(max_attempts: u32, source: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        Self {
            max_attempts,
            source: Arc::new(source),
        }
    }

    /// Generate an identifier and reserve `{base}/{id}` locally.
    ///
    /// The returned identifier's directory exists and belongs to the caller.
    pub async fn generate(&self, namespace: Namespace<'_>) -> Result<String, IdentifierError> {
        let base = match namespace {
            Namespace::Local { base } | Namespace::Cloud { base, .. } => base,
        };
        tokio::fs::create_dir_all(base).await?;

        for attempt in 1..=self.max_attempts {
            let id = (self.source)();

            let Some(dir) = reserve_dir(base, &id).await? else {
                debug!(id = %id, attempt, "Identifier taken locally, retrying");
                continue;
            };

            if let Namespace::Cloud { prefix, store, .. } = namespace {
                if cloud_taken(store, prefix, &id).await? {
                    debug!(id = %id, attempt, "Identifier taken in storage, retrying");
                    if let Err(e) = tokio::fs::remove_dir(&dir).await {
                        warn!(error = %e, dir = %dir.display(), "Failed to release reservation");
                    }
                    continue;
                }
            }

            return Ok(id);
        }

        Err(IdentifierError::Exhausted(self.max_attempts))
    }
}

/// A time-ordered UUID with hyphens normalized to underscores
pub fn candidate() -> String {
    Uuid::now_v7().to_string().replace('-', "_")
}

async fn reserve_dir(base: &Path, id: &str) -> Result<Option<PathBuf>, std::io::Error> {
    let dir = base.join(id);
    match tokio::fs::create_dir(&dir).await {
        Ok(()) => Ok(Some(dir)),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e),
    }
}

async fn cloud_taken(store: &dyn ObjectStore, prefix: &str, id: &str) -> Result<bool, StorageError> {
    let key = format!("{}/{}", prefix.trim_end_matches('/'), id);
    if store.exists(&key).await? {
        return Ok(true);
    }
    Ok(!store.list(&format!("{}/", key)).await?.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use bytes::Bytes;
    use std::sync::Mutex;

    fn scripted(ids: &[&str]) -> IdGenerator {
        let queue = Mutex::new(ids.iter().map(|s| s.to_string()).collect::<Vec<_>>());
        IdGenerator::with_source(8, move || {
            let mut queue = queue.lock().unwrap();
            if queue.is_empty() {
                "fallback".to_string()
            } else {
                queue.remove(0)
            }
        })
    }

    #[test]
    fn test_candidate_format() {
        let id = candidate();
        assert_eq!(id.len(), 36);
        assert!(!id.contains('-'));
        assert_eq!(id.matches('_').count(), 4);
    }

    #[test]
    fn test_candidates_are_time_ordered() {
        let first = candidate();
        let second = candidate();
        assert_ne!(first, second);
        assert!(first[..8] <= second[..8]);
    }

    #[tokio::test]
    async fn test_local_skips_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("taken")).unwrap();

        let id = scripted(&["taken", "free"])
            .generate(Namespace::Local { base: dir.path() })
            .await
            .unwrap();

        assert_eq!(id, "free");
        assert!(dir.path().join("free").is_dir());
    }

    #[tokio::test]
    async fn test_cloud_skips_existing_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new("bucket");
        store
            .upload_bytes("results/taken/dog.jpg", Bytes::from_static(b"x"), "image/jpeg", false)
            .await
            .unwrap();

        let id = scripted(&["taken", "free"])
            .generate(Namespace::Cloud {
                base: dir.path(),
                prefix: "results",
                store: &store,
            })
            .await
            .unwrap();

        assert_eq!(id, "free");
        // Released after the cloud collision
        assert!(!dir.path().join("taken").exists());
    }

    #[tokio::test]
    async fn test_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("same")).unwrap();

        let generator = IdGenerator::with_source(3, || "same".to_string());
        let result = generator.generate(Namespace::Local { base: dir.path() }).await;

        assert!(matches!(result, Err(IdentifierError::Exhausted(3))));
    }

    #[tokio::test]
    async fn test_generated_ids_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let generator = IdGenerator::new(4);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..20 {
            let id = generator
                .generate(Namespace::Local { base: dir.path() })
                .await
                .unwrap();
            assert!(seen.insert(id));
        }
    }
}
