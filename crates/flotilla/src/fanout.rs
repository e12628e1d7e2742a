// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote execution fan-out.
//!
//! One task per `(instance, arg, label)` triple. Each task runs the optional
//! foreground `pre_cmd`, starts the detached background job and finally tags
//! the instance. Failures are recorded per item and never affect siblings.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::command::{BackgroundJob, ExitAction, RemoteCommand, substitute};
use crate::provider::{InstanceProvider, ProviderError};
use crate::tags::{LABEL_KEY, NAME_KEY, TagSet};

/// Everything shared by the items of one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchSpec {
    /// Instance name, recorded in the log path tags.
    pub name: Option<String>,
    /// Command run in the foreground before `cmd`.
    pub pre_cmd: Option<String>,
    /// Command run in the background.
    pub cmd: String,
    /// Caller tags plus `launch=<id>`.
    pub tags: TagSet,
    /// Halt instead of terminating when done.
    pub no_rm: bool,
    /// Bucket receiving logs.
    pub bucket: String,
    /// Owner prefix of the log paths.
    pub owner: String,
    /// Date used in the log paths.
    pub date: DateTime<Utc>,
}

impl DispatchSpec {
    /// Tags applied to the instance carrying `label`.
    pub fn instance_tags(&self, label: &str) -> TagSet {
        self.tags.clone().with(LABEL_KEY, label)
    }

    /// Tags encoded into the log path of `label`.
    pub fn log_tags(&self, label: &str) -> TagSet {
        let tags = self.instance_tags(label);
        match &self.name {
            Some(name) => tags.with(NAME_KEY, name.as_str()),
            None => tags,
        }
    }
}

/// Step of the per-item sequence that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStage {
    /// Running `pre_cmd`.
    PreCommand,
    /// Starting the background job.
    Command,
    /// Tagging the instance.
    Tagging,
    /// The task itself panicked or was cancelled.
    Task,
}

impl fmt::Display for DispatchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PreCommand => "pre_cmd",
            Self::Command => "cmd",
            Self::Tagging => "tagging",
            Self::Task => "task",
        })
    }
}

/// An item whose job was started and whose instance was tagged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchedItem {
    /// Instance id.
    pub instance_id: String,
    /// Item label.
    pub label: String,
}

/// An item that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchFailure {
    /// Instance id.
    pub instance_id: String,
    /// Item label.
    pub label: String,
    /// Step that failed.
    pub stage: DispatchStage,
    /// Error chain.
    pub error: String,
}

impl fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} label={} failed at {}: {}",
            self.instance_id, self.label, self.stage, self.error
        )
    }
}

/// Outcome of a dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Items dispatched successfully, in input order.
    pub succeeded: Vec<DispatchedItem>,
    /// Failed items, in input order.
    pub failed: Vec<DispatchFailure>,
}

impl DispatchReport {
    /// Whether every item succeeded.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of items dispatched.
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

async fn dispatch_one(
    provider: &dyn InstanceProvider,
    instance_id: &str,
    arg: &str,
    label: &str,
    spec: &DispatchSpec,
) -> Result<(), (DispatchStage, ProviderError)> {
    if let Some(pre_cmd) = &spec.pre_cmd {
        let command = RemoteCommand::foreground(substitute(pre_cmd, arg));
        provider
            .run_remote(instance_id, &command)
            .await
            .map_err(|e| (DispatchStage::PreCommand, e))?;
    }

    let job = BackgroundJob::for_item(
        substitute(&spec.cmd, arg),
        &spec.bucket,
        &spec.owner,
        spec.date,
        &spec.log_tags(label),
    )
    .with_exit_action(ExitAction::from_no_rm(spec.no_rm));
    provider
        .run_remote(instance_id, &job.into_remote())
        .await
        .map_err(|e| (DispatchStage::Command, e))?;

    provider
        .tag(instance_id, &spec.instance_tags(label))
        .await
        .map_err(|e| (DispatchStage::Tagging, e))?;

    info!(instance_id = %instance_id, label = %label, "Ran cmd");
    Ok(())
}

/// Dispatch one item per instance.
///
/// `instances`, `args` and `labels` are zipped; extra entries of the longer
/// lists are ignored.
pub async fn dispatch(
    provider: Arc<dyn InstanceProvider>,
    instances: &[String],
    args: &[String],
    labels: &[String],
    spec: &DispatchSpec,
) -> DispatchReport {
    let spec = Arc::new(spec.clone());
    let handles: Vec<_> = instances
        .iter()
        .zip(args)
        .zip(labels)
        .map(|((instance_id, arg), label)| {
            let provider = provider.clone();
            let spec = spec.clone();
            let (instance_id, arg, label) = (instance_id.clone(), arg.clone(), label.clone());
            let item = DispatchedItem {
                instance_id: instance_id.clone(),
                label: label.clone(),
            };
            let handle = tokio::spawn(async move {
                dispatch_one(provider.as_ref(), &instance_id, &arg, &label, &spec).await
            });
            (item, handle)
        })
        .collect();

    let mut report = DispatchReport::default();
    for (item, handle) in handles {
        let failure = match handle.await {
            Ok(Ok(())) => {
                report.succeeded.push(item);
                continue;
            }
            Ok(Err((stage, e))) => (stage, error_chain(&e)),
            Err(join_error) => (DispatchStage::Task, join_error.to_string()),
        };
        let failure = DispatchFailure {
            instance_id: item.instance_id,
            label: item.label,
            stage: failure.0,
            error: failure.1,
        };
        error!(
            instance_id = %failure.instance_id,
            label = %failure.label,
            stage = %failure.stage,
            error = %failure.error,
            "Dispatch failed"
        );
        report.failed.push(failure);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockProvider, ProvisionParams};

    fn spec(pre_cmd: Option<&str>) -> DispatchSpec {
        DispatchSpec {
            name: Some("job".to_string()),
            pre_cmd: pre_cmd.map(str::to_string),
            cmd: "run %(arg)s".to_string(),
            tags: TagSet::parse(["launch=L", "team=infra"]).unwrap(),
            no_rm: false,
            bucket: "bkt".to_string(),
            owner: "me".to_string(),
            date: Utc::now(),
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_dispatch_runs_pre_cmd_then_job_then_tags() {
        let provider = MockProvider::new();
        let ids = provider
            .provision("job", 1, &ProvisionParams::default())
            .await
            .unwrap();
        let report = dispatch(
            Arc::new(provider.clone()),
            &ids,
            &strings(&["a b"]),
            &strings(&["a-b"]),
            &spec(Some("setup %(arg)s")),
        )
        .await;
        assert!(report.is_success());

        let commands = provider.commands(&ids[0]).await;
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0], RemoteCommand::foreground("setup 'a b'"));
        assert!(commands[1].is_detached());
        assert!(commands[1].script().contains("label=a-b,launch=L,team=infra"));

        let tags = provider.tags_of(&ids[0]).await.unwrap();
        assert_eq!(tags.label(), Some("a-b"));
        assert_eq!(tags.launch_id(), Some("L"));
        assert_eq!(tags.get("team"), Some("infra"));
    }

    #[tokio::test]
    async fn test_failed_item_is_not_tagged() {
        let provider = MockProvider::new();
        let ids = provider
            .provision("job", 2, &ProvisionParams::default())
            .await
            .unwrap();
        provider.fail_remote_on(&ids[0]).await;
        let report = dispatch(
            Arc::new(provider.clone()),
            &ids,
            &strings(&["a", "b"]),
            &strings(&["a", "b"]),
            &spec(None),
        )
        .await;

        assert_eq!(report.total(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].label, "a");
        assert_eq!(report.failed[0].stage, DispatchStage::Command);
        assert_eq!(provider.tags_of(&ids[0]).await.unwrap().label(), None);
        assert_eq!(provider.tags_of(&ids[1]).await.unwrap().label(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_instances_run_concurrently() {
        let delay = std::time::Duration::from_millis(50);
        let provider = MockProvider::with_remote_delay(delay);
        let ids = provider
            .provision("job", 5, &ProvisionParams::default())
            .await
            .unwrap();
        let args = strings(&["a", "b", "c", "d", "e"]);

        let started = tokio::time::Instant::now();
        let report = dispatch(Arc::new(provider.clone()), &ids, &args, &args, &spec(None)).await;
        let elapsed = started.elapsed();

        assert!(report.is_success());
        assert_eq!(report.succeeded.len(), 5);
        assert!(elapsed >= delay);
        // Run one after another the five items would take 250ms.
        assert!(elapsed < delay * 2, "dispatch took {elapsed:?}");
    }
}
