// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status reconciliation.
//!
//! A label's status is derived from three sources: the manifest (which
//! labels exist), completion logs (which finished and how) and live
//! instances (which are still running).

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::logs::{LogAggregator, LogFilter, LogRecord};
use crate::manifest::ManifestStore;
use crate::provider::{InstanceProvider, InstanceState};
use crate::tags::{LABEL_KEY, TagSet};

/// Status of one label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelStatus {
    /// A live instance carries the label.
    Running,
    /// The job logged `exited 0`.
    Done,
    /// The job logged a non-zero exit, or its log could not be read.
    Failed,
    /// No log and no live instance.
    Missing,
}

impl LabelStatus {
    /// Keyword used in status lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Missing => "missing",
        }
    }
}

impl fmt::Display for LabelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one manifest label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// Label.
    pub label: String,
    /// Status.
    pub status: LabelStatus,
}

impl fmt::Display for StatusEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {LABEL_KEY}={}", self.status, self.label)
    }
}

/// Classify every manifest label.
///
/// Precedence is failed, done, running, missing. The result is sorted by
/// status keyword descending, then by label.
pub fn classify<'a>(
    manifest_labels: impl IntoIterator<Item = &'a str>,
    logs: &[LogRecord],
    running_labels: &BTreeSet<String>,
) -> Vec<StatusEntry> {
    let done: BTreeSet<&str> = logs
        .iter()
        .filter(|r| r.is_done())
        .map(|r| r.label.as_str())
        .collect();
    let failed: BTreeSet<&str> = logs
        .iter()
        .filter(|r| !r.is_done())
        .map(|r| r.label.as_str())
        .collect();

    let labels: BTreeSet<&str> = manifest_labels.into_iter().collect();
    let mut entries: Vec<StatusEntry> = labels
        .into_iter()
        .map(|label| {
            let status = if failed.contains(label) {
                LabelStatus::Failed
            } else if done.contains(label) {
                LabelStatus::Done
            } else if running_labels.contains(label) {
                LabelStatus::Running
            } else {
                LabelStatus::Missing
            };
            StatusEntry {
                label: label.to_string(),
                status,
            }
        })
        .collect();
    entries.sort_by(|a, b| {
        b.status
            .as_str()
            .cmp(a.status.as_str())
            .then_with(|| a.label.cmp(&b.label))
    });
    entries
}

/// Labels to relaunch.
///
/// Failed and missing labels are always selected; running and done labels
/// only when `only_failed` is false.
pub fn select_for_restart(entries: &[StatusEntry], only_failed: bool) -> Vec<String> {
    entries
        .iter()
        .filter(|e| match e.status {
            LabelStatus::Failed | LabelStatus::Missing => true,
            LabelStatus::Running | LabelStatus::Done => !only_failed,
        })
        .map(|e| e.label.clone())
        .collect()
}

/// Reconciles manifest, logs and live instances into label statuses.
#[derive(Clone)]
pub struct StatusReconciler {
    manifests: ManifestStore,
    logs: LogAggregator,
    provider: Arc<dyn InstanceProvider>,
    max_concurrency: usize,
}

impl StatusReconciler {
    /// Create a reconciler.
    pub fn new(
        manifests: ManifestStore,
        logs: LogAggregator,
        provider: Arc<dyn InstanceProvider>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            manifests,
            logs,
            provider,
            max_concurrency,
        }
    }

    /// Labels of live instances carrying `tags`.
    pub async fn running_labels(&self, tags: &TagSet) -> Result<BTreeSet<String>> {
        Ok(self
            .provider
            .list(tags, &InstanceState::LIVE)
            .await?
            .into_iter()
            .filter_map(|i| i.tags.label().map(str::to_string))
            .collect())
    }

    /// Status of every label of the launch selected by `tags`.
    pub async fn status(&self, tags: &TagSet) -> Result<Vec<StatusEntry>> {
        let batch = self.manifests.load(tags).await?;
        let logs = self
            .logs
            .collect(tags, &LogFilter::Tail(1), self.max_concurrency, true)
            .await?;
        let running = self.running_labels(tags).await?;
        debug!(
            logs = logs.records.len(),
            failed_fetches = logs.failed,
            running = running.len(),
            "Reconciling status"
        );
        Ok(classify(
            batch.labels.iter().map(String::as_str),
            &logs.records,
            &running,
        ))
    }
}
