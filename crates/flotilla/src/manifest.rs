// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Launch manifests.
//!
//! A manifest records everything needed to relaunch a batch. It is written
//! once per launch id, before any instance is provisioned, and read back by
//! `status`, `restart` and `params`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::blob::{BlobError, BlobStore};
use crate::error::{Error, Result};
use crate::layout;
use crate::provider::ProvisionParams;
use crate::tags::{LAUNCH_KEY, TagSet};

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

fn default_version() -> u32 {
    MANIFEST_VERSION
}

/// Parameters of one launched batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchBatch {
    /// Manifest format version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Launch id. Records written without it take the id from their path.
    #[serde(default)]
    pub launch_id: Uuid,
    /// Name given to every instance.
    pub name: String,
    /// One arg per instance.
    pub args: Vec<String>,
    /// One tag-safe label per arg.
    pub labels: Vec<String>,
    /// Command run in the foreground before `cmd`.
    #[serde(default)]
    pub pre_cmd: Option<String>,
    /// Command run in the background.
    pub cmd: String,
    /// Caller tags, `key=value`.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Stop instead of terminating when done.
    #[serde(default)]
    pub no_rm: bool,
    /// Bucket receiving logs.
    pub bucket: String,
    /// Provisioning parameters.
    #[serde(flatten)]
    pub provisioning: ProvisionParams,
}

impl LaunchBatch {
    /// Check the batch invariants.
    pub fn validate(&self) -> Result<()> {
        if self.args.len() != self.labels.len() {
            return Err(Error::InvalidBatch(format!(
                "there must be an equal number of args and labels, {} != {}",
                self.args.len(),
                self.labels.len()
            )));
        }
        if self.args.is_empty() {
            return Err(Error::InvalidBatch("no args to launch".to_string()));
        }
        if self.cmd.trim().is_empty() {
            return Err(Error::InvalidBatch("cmd is empty".to_string()));
        }
        TagSet::parse(&self.tags)?;
        Ok(())
    }

    /// `launch=<id>` tag of this batch.
    pub fn launch_tag(&self) -> String {
        format!("{LAUNCH_KEY}={}", self.launch_id)
    }

    /// Tags identifying this batch: the caller tags plus `launch=<id>`.
    pub fn launch_tags(&self) -> Result<TagSet> {
        Ok(TagSet::parse(&self.tags)?.with(LAUNCH_KEY, self.launch_id.to_string()))
    }

    /// `(arg, label)` pairs in manifest order.
    pub fn items(&self) -> impl Iterator<Item = (&str, &str)> {
        self.args
            .iter()
            .map(String::as_str)
            .zip(self.labels.iter().map(String::as_str))
    }
}

/// A manifest found by [`ManifestStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestListing {
    /// Launch id from the manifest key.
    pub launch_id: String,
    /// Upload time, when known.
    pub modified: Option<DateTime<Utc>>,
}

impl ManifestListing {
    /// `{date}T{time} launch={id}` line.
    pub fn to_line(&self) -> String {
        let when = self
            .modified
            .map(|m| m.format("%Y-%m-%dT%H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        format!("{when} {LAUNCH_KEY}={}", self.launch_id)
    }
}

/// Reads and writes manifests under one owner prefix.
#[derive(Clone)]
pub struct ManifestStore {
    store: Arc<dyn BlobStore>,
    bucket: String,
    owner: String,
}

impl ManifestStore {
    /// Create a manifest store.
    pub fn new(
        store: Arc<dyn BlobStore>,
        bucket: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            owner: owner.into(),
        }
    }

    /// Persist a batch.
    ///
    /// Fails with [`Error::StoreUnavailable`] if the write fails.
    pub async fn save(&self, batch: &LaunchBatch) -> Result<()> {
        let path = layout::manifest_path(&self.bucket, &self.owner, &batch.launch_id.to_string());
        let data = serde_json::to_vec_pretty(batch)?;
        self.store
            .put(&path, data)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("{path}: {e}")))?;
        info!(launch_id = %batch.launch_id, path = %path, "Saved manifest");
        Ok(())
    }

    /// Load the raw manifest document for the `launch=` tag in `tags`.
    pub async fn load_raw(&self, tags: &TagSet) -> Result<serde_json::Value> {
        let launch_id = tags.launch_id().ok_or_else(|| {
            Error::ManifestNotFound(format!("no {LAUNCH_KEY}= tag in: {tags}"))
        })?;
        let path = layout::manifest_path(&self.bucket, &self.owner, launch_id);
        debug!(path = %path, "Loading manifest");
        let bytes = self.store.get(&path).await.map_err(|e| match e {
            BlobError::NotFound(p) => Error::ManifestNotFound(p),
            other => Error::Blob(other),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Load the batch for the `launch=` tag in `tags`.
    pub async fn load(&self, tags: &TagSet) -> Result<LaunchBatch> {
        let value = self.load_raw(tags).await?;
        let mut batch: LaunchBatch = serde_json::from_value(value)?;
        if batch.launch_id.is_nil() {
            if let Some(id) = tags.launch_id().and_then(|id| Uuid::parse_str(id).ok()) {
                batch.launch_id = id;
            }
        }
        Ok(batch)
    }

    /// List manifests of the store's owner, newest first.
    pub async fn list(&self) -> Result<Vec<ManifestListing>> {
        let prefix = layout::owner_prefix(&self.bucket, &self.owner);
        let mut listings: Vec<ManifestListing> = self
            .store
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|entry| {
                let rest = entry.key.strip_prefix(&prefix.key)?;
                if rest.contains('/') {
                    return None;
                }
                let launch_id = layout::parse_manifest_key(rest)?.to_string();
                Some(ManifestListing {
                    launch_id,
                    modified: entry.modified,
                })
            })
            .collect();
        listings.sort_by(|a, b| b.modified.cmp(&a.modified).then(b.launch_id.cmp(&a.launch_id)));
        Ok(listings)
    }
}
