// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Blob key layout.
//!
//! Everything a launch leaves behind lives under one owner prefix:
//!
//! ```text
//! {bucket}/ec2_logs/{owner}/launch={launch_id}.json
//! {bucket}/ec2_logs/{owner}/{date}_{k=v,k=v,...}/nohup.out
//! {bucket}/ec2_logs/{owner}/{date}_{k=v,k=v,...}/nohup.out.tail
//! ```

use chrono::{DateTime, Utc};

use crate::blob::BlobPath;
use crate::tags::{LABEL_KEY, LAUNCH_KEY, TagSet};

/// Root directory of all launcher artifacts within a bucket.
pub const LOG_ROOT: &str = "ec2_logs";
/// Full log file name.
pub const LOG_FILE: &str = "nohup.out";
/// Tail log file name.
pub const TAIL_FILE: &str = "nohup.out.tail";
/// Number of lines kept in the tail log.
pub const TAIL_LINES: usize = 1000;
/// Date format used in log directory names.
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Prefix holding every artifact of `owner`.
pub fn owner_prefix(bucket: &str, owner: &str) -> BlobPath {
    BlobPath::new(bucket, format!("{LOG_ROOT}/{owner}/"))
}

/// Location of the manifest for `launch_id`.
pub fn manifest_path(bucket: &str, owner: &str, launch_id: &str) -> BlobPath {
    BlobPath::new(
        bucket,
        format!("{LOG_ROOT}/{owner}/{LAUNCH_KEY}={launch_id}.json"),
    )
}

/// Launch id of a manifest key, if `key` is one.
pub fn parse_manifest_key(key: &str) -> Option<&str> {
    let name = key.rsplit('/').next()?;
    name.strip_prefix(&format!("{LAUNCH_KEY}="))?
        .strip_suffix(".json")
        .filter(|id| !id.is_empty())
}

/// Directory receiving the logs of one instance.
pub fn log_dir(bucket: &str, owner: &str, date: DateTime<Utc>, tags: &TagSet) -> BlobPath {
    BlobPath::new(
        bucket,
        format!(
            "{LOG_ROOT}/{owner}/{}_{}",
            date.format(DATE_FORMAT),
            tags.encode_path_segment()
        ),
    )
}

/// A parsed log key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogKey {
    /// Full blob key.
    pub key: String,
    /// Date part of the directory name.
    pub date: String,
    /// Tags encoded in the directory name.
    pub tags: TagSet,
    /// Whether this is the tail file.
    pub tail: bool,
}

impl LogKey {
    /// Parse `.../{date}_{tags}/nohup.out[.tail]`.
    ///
    /// Returns `None` for any other key, including directories whose name
    /// does not split into exactly a date and a tag string.
    pub fn parse(key: &str) -> Option<Self> {
        let mut parts = key.rsplit('/');
        let file = parts.next()?;
        let dir = parts.next()?;
        let tail = match file {
            LOG_FILE => false,
            TAIL_FILE => true,
            _ => return None,
        };
        let mut fields = dir.split('_');
        let (date, tags) = (fields.next()?, fields.next()?);
        if fields.next().is_some() {
            return None;
        }
        Some(Self {
            key: key.to_string(),
            date: date.to_string(),
            tags: TagSet::decode(tags),
            tail,
        })
    }

    /// The `label` tag of this log.
    pub fn label(&self) -> Option<&str> {
        self.tags.get(LABEL_KEY)
    }

    /// The `launch` tag of this log.
    pub fn launch_id(&self) -> Option<&str> {
        self.tags.get(LAUNCH_KEY)
    }
}
