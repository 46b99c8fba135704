use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::fs;
use tracing::error;

use crate::config;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),
    #[error("document not found: {0}")]
    NotFound(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    async fn put(&self, key: &str, bytes: &[u8], mime_type: &str) -> Result<(), StoreError>;
}

/// Filesystem-backed store rooted at `DOCUMENT_STORE_ROOT`. Writes go
/// through a sibling temp file so a crashed put never leaves a torn object.
pub struct LocalDocumentStore {
    root: PathBuf,
}

impl LocalDocumentStore {
    pub fn from_env() -> Self {
        Self {
            root: PathBuf::from(config::DOCUMENT_STORE_ROOT.as_str()),
        }
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.split('/').any(|part| part == "..") {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl DocumentStore for LocalDocumentStore {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(err) => {
                error!(?err, key, "document store read failed");
                Err(StoreError::Unavailable(err.to_string()))
            }
        }
    }

    async fn put(&self, key: &str, bytes: &[u8], _mime_type: &str) -> Result<(), StoreError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(())
    }
}

/// In-memory store used by tests and by deployments without blob storage.
#[derive(Default)]
pub struct MemoryDocumentStore {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, key: &str, bytes: Vec<u8>) -> Self {
        self.objects.insert(key.to_string(), bytes);
        self
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn fetch(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .get(key)
            .map(|entry| entry.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, bytes: &[u8], _mime_type: &str) -> Result<(), StoreError> {
        self.objects.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDocumentStore::new(dir.path());
        store
            .put("certs/2024/gas.pdf", b"%PDF-1.4", "application/pdf")
            .await
            .unwrap();
        let bytes = store.fetch("certs/2024/gas.pdf").await.unwrap();
        assert_eq!(bytes, b"%PDF-1.4");
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDocumentStore::new(dir.path());
        let err = store.fetch("nope.pdf").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDocumentStore::new(dir.path());
        assert!(store.fetch("../etc/passwd").await.is_err());
    }
}
