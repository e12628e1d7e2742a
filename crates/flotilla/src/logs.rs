// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Log aggregation.
//!
//! Logs are found purely by listing the owner prefix and decoding the tags
//! embedded in each log directory name.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::blob::{BlobEntry, BlobError, BlobPath, BlobStore};
use crate::error::{Error, Result};
use crate::layout::{self, LogKey};
use crate::process;
use crate::tags::{LABEL_KEY, LAUNCH_KEY, NAME_KEY, TagSet};

/// Default number of concurrent log fetches.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Marker of a successful fetch or job.
pub const EXITED_OK: &str = "exited 0";
/// Marker of a failed fetch.
pub const EXITED_FAILED: &str = "exited 1";

/// Tag keys not repeated in [`LaunchLogs::tags`].
const LISTING_HIDDEN_KEYS: [&str; 6] = [NAME_KEY, "arg", LABEL_KEY, LAUNCH_KEY, "nth", "num"];

/// Transformation applied to each fetched log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFilter {
    /// Keep the last `n` lines.
    Tail(usize),
    /// Pipe the log through `sh -c <cmd>`.
    Shell(String),
}

impl Default for LogFilter {
    fn default() -> Self {
        Self::Tail(1)
    }
}

impl LogFilter {
    async fn apply(&self, content: Vec<u8>) -> Result<String> {
        match self {
            Self::Tail(n) => {
                let text = String::from_utf8_lossy(&content);
                let lines: Vec<&str> = text.lines().collect();
                Ok(lines[lines.len().saturating_sub(*n)..].join("\n"))
            }
            Self::Shell(cmd) => {
                let output = process::run_shell(cmd, Some(&content), None).await?;
                if !output.success() {
                    return Err(Error::Io(std::io::Error::other(format!(
                        "log filter {cmd:?} failed: {}",
                        output.describe_failure()
                    ))));
                }
                Ok(output.stdout_str().trim_end().to_string())
            }
        }
    }
}

/// One fetched log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Label of the item that wrote the log.
    pub label: String,
    /// `exited 0` when the fetch succeeded, `exited 1` when it failed.
    pub exit_marker: Option<String>,
    /// Filtered log content.
    pub payload: String,
}

impl LogRecord {
    fn fetched(label: String, payload: String) -> Self {
        Self {
            label,
            exit_marker: Some(EXITED_OK.to_string()),
            payload,
        }
    }

    fn fetch_failed(label: String) -> Self {
        Self {
            label,
            exit_marker: Some(EXITED_FAILED.to_string()),
            payload: String::new(),
        }
    }

    /// Parse the `label=<label>::<marker>::<payload>` form.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, "::");
        let label = parts.next()?.strip_prefix(&format!("{LABEL_KEY}="))?;
        let marker = parts.next()?;
        let payload = parts.next().unwrap_or_default();
        Some(Self {
            label: label.to_string(),
            exit_marker: (!marker.is_empty()).then(|| marker.to_string()),
            payload: payload.to_string(),
        })
    }

    /// Whether the fetch itself succeeded.
    pub fn fetch_succeeded(&self) -> bool {
        self.exit_marker.as_deref() == Some(EXITED_OK)
    }

    /// Last line of the payload, which is `exited <code>` once the job ended.
    pub fn completion_marker(&self) -> Option<&str> {
        if !self.fetch_succeeded() {
            return None;
        }
        self.payload.lines().rev().find(|l| !l.trim().is_empty()).map(str::trim)
    }

    /// Whether the job finished with exit code 0.
    pub fn is_done(&self) -> bool {
        self.completion_marker() == Some(EXITED_OK)
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{LABEL_KEY}={}::{}::{}",
            self.label,
            self.exit_marker.as_deref().unwrap_or_default(),
            self.payload
        )
    }
}

/// Records of one aggregation, including failed fetches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogBatch {
    /// One record per matching log, sorted by label.
    pub records: Vec<LogRecord>,
    /// Number of failed fetches.
    pub failed: usize,
}

impl LogBatch {
    /// The records, or [`Error::LogFetchFailed`] if any fetch failed.
    pub fn into_result(self) -> Result<Vec<LogRecord>> {
        if self.failed > 0 {
            return Err(Error::LogFetchFailed {
                failed: self.failed,
                total: self.records.len(),
            });
        }
        Ok(self.records)
    }
}

/// Logs of one launch, as shown by `ls-logs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchLogs {
    /// Launch id.
    pub launch_id: String,
    /// Instance name.
    pub name: Option<String>,
    /// Date of the first log of the launch.
    pub date: String,
    /// Caller tags.
    pub tags: TagSet,
    /// Labels, sorted.
    pub labels: Vec<String>,
}

impl fmt::Display for LaunchLogs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {LAUNCH_KEY}={} date={}",
            self.name.as_deref().unwrap_or("-"),
            self.launch_id,
            self.date
        )?;
        if !self.tags.is_empty() {
            writeln!(f, " {}", self.tags.to_strings().join(" "))?;
        }
        for label in &self.labels {
            writeln!(f, "  {LABEL_KEY}={label}")?;
        }
        Ok(())
    }
}

async fn fetch_one(
    semaphore: Arc<Semaphore>,
    store: Arc<dyn BlobStore>,
    path: BlobPath,
    filter: LogFilter,
) -> Result<String> {
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    let content = store.get(&path).await?;
    filter.apply(content).await
}

/// Finds and fetches logs under one owner prefix.
#[derive(Clone)]
pub struct LogAggregator {
    store: Arc<dyn BlobStore>,
    bucket: String,
    owner: String,
}

impl LogAggregator {
    /// Create an aggregator.
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

    async fn log_keys(&self) -> Result<Vec<LogKey>> {
        let prefix = layout::owner_prefix(&self.bucket, &self.owner);
        let mut entries: Vec<BlobEntry> = self.store.list(&prefix).await?;
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries
            .iter()
            .filter_map(|entry| LogKey::parse(&entry.key))
            .collect())
    }

    /// Log keys whose tags include all of `tags`.
    pub async fn matching(&self, tags: &TagSet, tail_only: bool) -> Result<Vec<LogKey>> {
        if tags.is_empty() {
            return Err(Error::NoTags);
        }
        let wanted = tags.encoded();
        Ok(self
            .log_keys()
            .await?
            .into_iter()
            .filter(|key| key.tail == tail_only && wanted.matches(&key.tags))
            .collect())
    }

    /// Fetch and filter every matching log, keeping failed fetches as
    /// `exited 1` records.
    pub async fn collect(
        &self,
        tags: &TagSet,
        filter: &LogFilter,
        max_concurrency: usize,
        tail_only: bool,
    ) -> Result<LogBatch> {
        let keys = self.matching(tags, tail_only).await?;
        debug!(count = keys.len(), tags = %tags, "Fetching logs");
        let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));

        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            let semaphore = semaphore.clone();
            let store = self.store.clone();
            let filter = filter.clone();
            let path = BlobPath::new(self.bucket.clone(), key.key.clone());
            let label = key.label().unwrap_or_default().to_string();
            let handle = tokio::spawn(fetch_one(semaphore, store, path, filter));
            handles.push((label, handle));
        }

        let mut batch = LogBatch::default();
        for (label, handle) in handles {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::Io(std::io::Error::other(format!("Task panicked: {e}")))),
            };
            let record = match outcome {
                Ok(payload) => LogRecord::fetched(label, payload),
                Err(e) => {
                    warn!(label = %label, error = %e, "Log fetch failed");
                    batch.failed += 1;
                    LogRecord::fetch_failed(label)
                }
            };
            info!("{record}");
            batch.records.push(record);
        }
        batch.records.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(batch)
    }

    /// Fetch and filter every matching log.
    ///
    /// Fails with [`Error::LogFetchFailed`] once all fetches finished if any
    /// of them failed.
    pub async fn fetch_tails(
        &self,
        tags: &TagSet,
        filter: &LogFilter,
        max_concurrency: usize,
        tail_only: bool,
    ) -> Result<Vec<LogRecord>> {
        self.collect(tags, filter, max_concurrency, tail_only)
            .await?
            .into_result()
    }

    /// Full content of one matching log. `index` counts from the end when
    /// negative.
    pub async fn log(&self, tags: &TagSet, index: isize, tail_only: bool) -> Result<Vec<u8>> {
        let keys = self.matching(tags, tail_only).await?;
        let position = if index < 0 {
            keys.len().checked_sub(index.unsigned_abs())
        } else {
            Some(index.unsigned_abs()).filter(|i| *i < keys.len())
        };
        let key = position.and_then(|i| keys.get(i)).ok_or_else(|| {
            BlobError::NotFound(format!("no log at index {index} matching: {tags}"))
        })?;
        Ok(self
            .store
            .get(&BlobPath::new(self.bucket.clone(), key.key.clone()))
            .await?)
    }

    /// Launches that left logs, oldest first.
    pub async fn ls_logs(&self) -> Result<Vec<LaunchLogs>> {
        let mut launches: Vec<LaunchLogs> = Vec::new();
        for key in self.log_keys().await? {
            if key.tail {
                continue;
            }
            let Some(launch_id) = key.launch_id() else {
                continue;
            };
            let label = key.label().map(str::to_string);
            match launches.iter_mut().find(|l| l.launch_id == launch_id) {
                Some(launch) => launch.labels.extend(label),
                None => launches.push(LaunchLogs {
                    launch_id: launch_id.to_string(),
                    name: key.tags.get(NAME_KEY).map(str::to_string),
                    date: key.date.clone(),
                    tags: key
                        .tags
                        .iter()
                        .filter(|(k, _)| !LISTING_HIDDEN_KEYS.contains(k))
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                    labels: label.into_iter().collect(),
                }),
            }
        }
        for launch in &mut launches {
            launch.labels.sort();
        }
        launches.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(launches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::layout::{LOG_FILE, TAIL_FILE};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Store whose reads are slow and that records the peak number of reads
    /// in flight.
    struct SlowReads {
        inner: MemoryBlobStore,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl BlobStore for SlowReads {
        fn store_type(&self) -> &'static str {
            "slow"
        }

        async fn put(&self, path: &BlobPath, bytes: Vec<u8>) -> crate::blob::Result<()> {
            self.inner.put(path, bytes).await
        }

        async fn get(&self, path: &BlobPath) -> crate::blob::Result<Vec<u8>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.get(path).await
        }

        async fn list(&self, prefix: &BlobPath) -> crate::blob::Result<Vec<BlobEntry>> {
            self.inner.list(prefix).await
        }
    }

    async fn put_log(store: &MemoryBlobStore, day: u32, tags: &[&str], content: &str) {
        let date = Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap();
        let dir = layout::log_dir("bkt", "me", date, &TagSet::parse(tags).unwrap());
        for file in [LOG_FILE, TAIL_FILE] {
            store
                .put(
                    &dir.sibling(format!("{}/{file}", dir.key)),
                    content.as_bytes().to_vec(),
                )
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_record_text_form() {
        let record = LogRecord::fetched("a".into(), "exited 0".into());
        assert_eq!(record.to_string(), "label=a::exited 0::exited 0");
        assert_eq!(LogRecord::parse(&record.to_string()), Some(record.clone()));
        assert!(record.is_done());
        assert!(!LogRecord::fetch_failed("a".into()).is_done());
        assert!(!LogRecord::fetched("a".into(), "exited 2".into()).is_done());
        assert!(!LogRecord::fetched("a".into(), String::new()).is_done());
    }

    #[tokio::test]
    async fn test_tail_filter() {
        let out = LogFilter::Tail(2).apply(b"1\n2\n3\n".to_vec()).await.unwrap();
        assert_eq!(out, "2\n3");
        let out = LogFilter::Tail(5).apply(b"only".to_vec()).await.unwrap();
        assert_eq!(out, "only");
    }

    #[tokio::test]
    async fn test_shell_filter() {
        let out = LogFilter::Shell("grep b".into())
            .apply(b"a\nb\nc\n".to_vec())
            .await
            .unwrap();
        assert_eq!(out, "b");
        assert!(LogFilter::Shell("false".into()).apply(Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_collect_filters_by_tags() {
        let store = MemoryBlobStore::new();
        put_log(&store, 1, &["launch=L", "label=b"], "x\nexited 0\n").await;
        put_log(&store, 1, &["launch=L", "label=a"], "x\nexited 3\n").await;
        put_log(&store, 1, &["launch=M", "label=c"], "exited 0\n").await;
        let logs = LogAggregator::new(Arc::new(store), "bkt", "me");

        let records = logs
            .fetch_tails(&TagSet::parse(["launch=L"]).unwrap(), &LogFilter::default(), 10, true)
            .await
            .unwrap();
        let labels: Vec<&str> = records.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["a", "b"]);
        assert_eq!(records[0].payload, "exited 3");
        assert!(records[1].is_done());
    }

    #[tokio::test]
    async fn test_failed_fetch_counts() {
        let store = MemoryBlobStore::new();
        put_log(&store, 1, &["launch=L", "label=a"], "exited 0\n").await;
        put_log(&store, 1, &["launch=L", "label=b"], "exited 0\n").await;
        let keys = LogAggregator::new(Arc::new(store.clone()), "bkt", "me")
            .matching(&TagSet::parse(["label=b"]).unwrap(), false)
            .await
            .unwrap();
        store
            .fail_reads_of(&BlobPath::new("bkt", keys[0].key.clone()))
            .await;
        let logs = LogAggregator::new(Arc::new(store), "bkt", "me");
        let tags = TagSet::parse(["launch=L"]).unwrap();

        let batch = logs.collect(&tags, &LogFilter::default(), 1, false).await.unwrap();
        assert_eq!(batch.failed, 1);
        assert_eq!(batch.records[1].to_string(), "label=b::exited 1::");
        assert!(matches!(
            batch.into_result(),
            Err(Error::LogFetchFailed { failed: 1, total: 2 })
        ));
    }

    #[tokio::test]
    async fn test_log_index() {
        let store = MemoryBlobStore::new();
        put_log(&store, 1, &["launch=L", "label=a"], "first").await;
        put_log(&store, 2, &["launch=L", "label=a"], "second").await;
        let logs = LogAggregator::new(Arc::new(store), "bkt", "me");
        let tags = TagSet::parse(["label=a"]).unwrap();

        assert_eq!(logs.log(&tags, -1, false).await.unwrap(), b"second");
        assert_eq!(logs.log(&tags, 0, false).await.unwrap(), b"first");
        assert!(logs.log(&tags, 2, false).await.is_err());
        assert!(logs.log(&tags, -3, false).await.is_err());
        assert!(matches!(
            logs.log(&TagSet::new(), -1, false).await,
            Err(Error::NoTags)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetches_bounded_by_max_concurrency() {
        let inner = MemoryBlobStore::new();
        for label in ["a", "b", "c", "d", "e", "f"] {
            let label = format!("label={label}");
            put_log(&inner, 1, &["launch=L", label.as_str()], "exited 0\n").await;
        }
        let store = Arc::new(SlowReads {
            inner,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let logs = LogAggregator::new(store.clone(), "bkt", "me");

        let tags = TagSet::parse(["launch=L"]).unwrap();
        let records = logs
            .fetch_tails(&tags, &LogFilter::default(), 2, false)
            .await
            .unwrap();
        assert_eq!(records.len(), 6);
        assert!(records.iter().all(LogRecord::is_done));
        assert_eq!(store.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ls_logs_groups_by_launch() {
        let store = MemoryBlobStore::new();
        put_log(&store, 2, &["launch=L", "label=b", "Name=job", "team=x"], "").await;
        put_log(&store, 2, &["launch=L", "label=a", "Name=job", "team=x"], "").await;
        put_log(&store, 1, &["launch=K", "label=z", "Name=old"], "").await;
        let logs = LogAggregator::new(Arc::new(store), "bkt", "me");

        let launches = logs.ls_logs().await.unwrap();
        assert_eq!(launches.len(), 2);
        assert_eq!(launches[0].launch_id, "K");
        assert_eq!(launches[1].name.as_deref(), Some("job"));
        assert_eq!(launches[1].labels, vec!["a", "b"]);
        assert_eq!(launches[1].tags.to_strings(), vec!["team=x"]);
        assert!(launches[1].to_string().starts_with("job launch=L date=2024-01-02"));
    }
}
