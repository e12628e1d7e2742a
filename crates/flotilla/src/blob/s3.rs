// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! S3 blob store backed by the `aws s3` command line tool.
//!
//! Credentials and region come from the usual AWS CLI configuration.

use async_trait::async_trait;
use chrono::{NaiveDateTime, TimeZone, Utc};
use tracing::debug;

use super::traits::*;
use crate::process::{CapturedOutput, run_captured};

/// Blob store that shells out to `aws s3`.
#[derive(Debug, Clone)]
pub struct S3CliStore {
    aws_bin: String,
}

impl Default for S3CliStore {
    fn default() -> Self {
        Self::new()
    }
}

impl S3CliStore {
    /// Create a store using `aws` from `PATH`.
    pub fn new() -> Self {
        Self {
            aws_bin: "aws".to_string(),
        }
    }

    /// Create a store from environment variables.
    ///
    /// - `FLOTILLA_AWS_BIN`: path to the aws executable (default: `aws`)
    pub fn from_env() -> Self {
        Self {
            aws_bin: std::env::var("FLOTILLA_AWS_BIN").unwrap_or_else(|_| "aws".to_string()),
        }
    }

    async fn aws(&self, args: &[String], stdin: Option<&[u8]>) -> Result<CapturedOutput> {
        Ok(run_captured(&self.aws_bin, args, stdin, None).await?)
    }
}

fn is_not_found(output: &CapturedOutput) -> bool {
    let stderr = output.stderr_str();
    stderr.contains("404") || stderr.contains("Not Found") || stderr.contains("does not exist")
}

/// Parse one line of `aws s3 ls --recursive` output:
/// `2024-01-02 03:04:05       1234 some/key`.
pub(crate) fn parse_ls_line(line: &str) -> Option<BlobEntry> {
    let mut parts = line.split_whitespace();
    let date = parts.next()?;
    let time = parts.next()?;
    let size = parts.next()?.parse::<u64>().ok()?;
    let key = parts.collect::<Vec<_>>().join(" ");
    if key.is_empty() {
        return None;
    }
    let modified = NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive));
    Some(BlobEntry {
        key,
        modified,
        size,
    })
}

#[async_trait]
impl BlobStore for S3CliStore {
    fn store_type(&self) -> &'static str {
        "s3"
    }

    async fn put(&self, path: &BlobPath, bytes: Vec<u8>) -> Result<()> {
        let args = vec![
            "s3".to_string(),
            "cp".to_string(),
            "-".to_string(),
            path.to_string(),
        ];
        let output = self.aws(&args, Some(&bytes)).await?;
        if !output.success() {
            return Err(BlobError::Backend(format!(
                "put {path}: {}",
                output.describe_failure()
            )));
        }
        debug!(path = %path, bytes = bytes.len(), "Uploaded blob");
        Ok(())
    }

    async fn get(&self, path: &BlobPath) -> Result<Vec<u8>> {
        let args = vec![
            "s3".to_string(),
            "cp".to_string(),
            path.to_string(),
            "-".to_string(),
        ];
        let output = self.aws(&args, None).await?;
        if output.success() {
            Ok(output.stdout)
        } else if is_not_found(&output) {
            Err(BlobError::NotFound(path.to_string()))
        } else {
            Err(BlobError::Backend(format!(
                "get {path}: {}",
                output.describe_failure()
            )))
        }
    }

    async fn list(&self, prefix: &BlobPath) -> Result<Vec<BlobEntry>> {
        let args = vec![
            "s3".to_string(),
            "ls".to_string(),
            prefix.to_string(),
            "--recursive".to_string(),
        ];
        let output = self.aws(&args, None).await?;
        // `aws s3 ls` exits 1 with no output when nothing matches the prefix.
        if !output.success() && !(output.stdout.is_empty() && output.stderr.is_empty()) {
            return Err(BlobError::Backend(format!(
                "list {prefix}: {}",
                output.describe_failure()
            )));
        }
        Ok(output
            .stdout_str()
            .lines()
            .filter_map(parse_ls_line)
            .filter(|entry| entry.key.starts_with(&prefix.key))
            .collect())
    }
}
