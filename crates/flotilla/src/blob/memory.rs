// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory blob store for testing and dry runs.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::traits::*;

#[derive(Debug, Clone)]
struct StoredBlob {
    bytes: Vec<u8>,
    modified: DateTime<Utc>,
}

/// In-memory blob store.
///
/// Cloning shares the underlying storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<BTreeMap<(String, String), StoredBlob>>>,
    failing_reads: Arc<Mutex<HashSet<String>>>,
    /// If true, every write fails with a backend error.
    pub fail_writes: bool,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose writes always fail.
    pub fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    /// Make reads of the given path fail with a backend error.
    pub async fn fail_reads_of(&self, path: &BlobPath) {
        self.failing_reads.lock().await.insert(path.to_string());
    }

    /// Number of stored blobs.
    pub async fn len(&self) -> usize {
        self.blobs.lock().await.len()
    }

    /// Whether the store holds no blobs.
    pub async fn is_empty(&self) -> bool {
        self.blobs.lock().await.is_empty()
    }

    /// Read a blob as UTF-8, if present.
    pub async fn get_string(&self, path: &BlobPath) -> Option<String> {
        self.blobs
            .lock()
            .await
            .get(&(path.bucket.clone(), path.key.clone()))
            .map(|b| String::from_utf8_lossy(&b.bytes).into_owned())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn store_type(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, path: &BlobPath, bytes: Vec<u8>) -> Result<()> {
        if self.fail_writes {
            return Err(BlobError::Backend(format!("write refused: {path}")));
        }
        self.blobs.lock().await.insert(
            (path.bucket.clone(), path.key.clone()),
            StoredBlob {
                bytes,
                modified: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, path: &BlobPath) -> Result<Vec<u8>> {
        if self.failing_reads.lock().await.contains(&path.to_string()) {
            return Err(BlobError::Backend(format!("read refused: {path}")));
        }
        self.blobs
            .lock()
            .await
            .get(&(path.bucket.clone(), path.key.clone()))
            .map(|b| b.bytes.clone())
            .ok_or_else(|| BlobError::NotFound(path.to_string()))
    }

    async fn list(&self, prefix: &BlobPath) -> Result<Vec<BlobEntry>> {
        let blobs = self.blobs.lock().await;
        Ok(blobs
            .iter()
            .filter(|((bucket, key), _)| *bucket == prefix.bucket && key.starts_with(&prefix.key))
            .map(|((_, key), blob)| BlobEntry {
                key: key.clone(),
                modified: Some(blob.modified),
                size: blob.bytes.len() as u64,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list() {
        let store = MemoryBlobStore::new();
        assert_eq!(store.store_type(), "memory");
        let a = BlobPath::new("b", "logs/x/a");
        let c = BlobPath::new("b", "other/c");
        store.put(&a, b"alpha".to_vec()).await.unwrap();
        store.put(&c, b"gamma".to_vec()).await.unwrap();

        assert_eq!(store.get(&a).await.unwrap(), b"alpha");
        let listed = store.list(&BlobPath::new("b", "logs/")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "logs/x/a");
        assert_eq!(listed[0].size, 5);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = MemoryBlobStore::new();
        let result = store.get(&BlobPath::new("b", "nope")).await;
        assert!(matches!(result, Err(BlobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failing_writes() {
        let store = MemoryBlobStore::failing_writes();
        let result = store.put(&BlobPath::new("b", "k"), Vec::new()).await;
        assert!(matches!(result, Err(BlobError::Backend(_))));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_failing_reads() {
        let store = MemoryBlobStore::new();
        let path = BlobPath::new("b", "k");
        store.put(&path, b"x".to_vec()).await.unwrap();
        store.fail_reads_of(&path).await;
        assert!(matches!(store.get(&path).await, Err(BlobError::Backend(_))));
    }
}
