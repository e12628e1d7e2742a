// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Blob store trait definitions.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from blob store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BlobError {
    /// The blob does not exist.
    #[error("Blob not found: {0}")]
    NotFound(String),

    /// The path could not be parsed.
    #[error("Invalid blob path: {0}")]
    InvalidPath(String),

    /// The storage backend reported an error.
    #[error("Backend error: {0}")]
    Backend(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for blob store operations.
pub type Result<T> = std::result::Result<T, BlobError>;

/// Location of a blob: bucket plus key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobPath {
    /// Bucket name.
    pub bucket: String,
    /// Key within the bucket (no leading `/`).
    pub key: String,
}

impl BlobPath {
    /// Create a path from bucket and key.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse `s3://bucket/key` (the scheme is optional).
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s.strip_prefix("s3://").unwrap_or(s);
        match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() => Ok(Self::new(bucket, key)),
            None if !rest.is_empty() => Ok(Self::new(rest, "")),
            _ => Err(BlobError::InvalidPath(s.to_string())),
        }
    }

    /// Path of another key in the same bucket.
    pub fn sibling(&self, key: impl Into<String>) -> Self {
        Self::new(self.bucket.clone(), key)
    }
}

impl fmt::Display for BlobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// One listed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    /// Full key within the bucket.
    pub key: String,
    /// Last modification time, when the backend reports it.
    pub modified: Option<DateTime<Utc>>,
    /// Size in bytes.
    pub size: u64,
}

/// Trait for blob stores.
///
/// Manifests and completion logs live here; the store is one half of the
/// launcher's source of truth (instance tags are the other).
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store type identifier (e.g., "s3", "memory").
    fn store_type(&self) -> &'static str;

    /// Write a blob, replacing any existing content.
    async fn put(&self, path: &BlobPath, bytes: Vec<u8>) -> Result<()>;

    /// Read a blob. Fails with [`BlobError::NotFound`] if it does not exist.
    async fn get(&self, path: &BlobPath) -> Result<Vec<u8>>;

    /// Recursively list blobs whose key starts with `prefix.key`.
    async fn list(&self, prefix: &BlobPath) -> Result<Vec<BlobEntry>>;
}
