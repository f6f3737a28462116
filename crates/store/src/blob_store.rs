use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Result, StoreError};
use crate::models::BlobEntry;

/// The blob content store holding project files, per spec.md §6.3.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>>;
    async fn get(&self, path: &str) -> Result<Vec<u8>>;
    async fn put(&self, path: &str, bytes: Vec<u8>, upsert: bool) -> Result<()>;
    async fn delete(&self, paths: &[String]) -> Result<()>;
}

/// In-memory `BlobStore`, used in tests and for local single-node runs.
#[derive(Default, Clone)]
pub struct InMemoryBlobStore {
    inner: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
        let guard = self.inner.read().await;
        Ok(guard
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| BlobEntry {
                path: k.clone(),
                size: v.len() as u64,
            })
            .collect())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let guard = self.inner.read().await;
        guard.get(path).cloned().ok_or(StoreError::NotFound)
    }

    async fn put(&self, path: &str, bytes: Vec<u8>, upsert: bool) -> Result<()> {
        let mut guard = self.inner.write().await;
        if !upsert && guard.contains_key(path) {
            return Err(StoreError::Internal(format!(
                "blob already exists and upsert=false: {path}"
            )));
        }
        guard.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, paths: &[String]) -> Result<()> {
        let mut guard = self.inner.write().await;
        for p in paths {
            guard.remove(p);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_list_returns_entries_under_prefix() {
        let store = InMemoryBlobStore::new();
        store
            .put("proj/1/main.py", b"print('hi')".to_vec(), true)
            .await
            .unwrap();
        store
            .put("proj/1/lib.py", b"x = 1".to_vec(), true)
            .await
            .unwrap();
        store
            .put("proj/2/main.py", b"other".to_vec(), true)
            .await
            .unwrap();

        let entries = store.list("proj/1/").await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = InMemoryBlobStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn put_without_upsert_rejects_overwrite() {
        let store = InMemoryBlobStore::new();
        store.put("a", vec![1], true).await.unwrap();
        let err = store.put("a", vec![2], false).await.unwrap_err();
        assert!(matches!(err, StoreError::Internal(_)));
    }
}
