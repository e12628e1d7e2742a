// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status, restart and wait tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use flotilla::blob::MemoryBlobStore;
use flotilla::layout;
use flotilla::prompt::ScriptedPrompt;
use flotilla::provider::{InstanceState, MockProvider};
use flotilla::status::LabelStatus;
use flotilla::status::StatusReconciler;
use flotilla::wait::{WaitConfig, WaitLoop};
use flotilla::{Error, RestartOptions};

fn statuses(entries: &[flotilla::status::StatusEntry]) -> Vec<String> {
    entries.iter().map(|e| e.to_string()).collect()
}

// ============================================================================
// Status
// ============================================================================

#[tokio::test]
async fn test_status_running_then_done() {
    let ctx = TestContext::new();
    let report = ctx.launcher.new_launch(request(&["a"])).await.unwrap();
    let id = report.launch_id.to_string();
    let tags = launch_tags(&id);

    let entries = ctx.launcher.status(&tags).await.unwrap();
    assert_eq!(statuses(&entries), vec!["running label=a"]);

    ctx.finish(&id, "a", 0).await;
    let entries = ctx.launcher.status(&tags).await.unwrap();
    assert_eq!(statuses(&entries), vec!["done label=a"]);
}

#[tokio::test]
async fn test_status_all_states() {
    let ctx = TestContext::new();
    let report = ctx
        .launcher
        .new_launch(request(&["a", "b", "c", "d"]))
        .await
        .unwrap();
    let id = report.launch_id.to_string();

    ctx.finish(&id, "a", 0).await;
    ctx.finish(&id, "b", 2).await;
    ctx.provider
        .set_state(&MockProvider::nth_id(4), InstanceState::Terminated)
        .await;

    let entries = ctx.launcher.status(&launch_tags(&id)).await.unwrap();
    assert_eq!(
        statuses(&entries),
        vec![
            "running label=c",
            "missing label=d",
            "failed label=b",
            "done label=a",
        ]
    );
}

#[tokio::test]
async fn test_failed_log_beats_running_instance() {
    let ctx = TestContext::new();
    let report = ctx.launcher.new_launch(request(&["a"])).await.unwrap();
    let id = report.launch_id.to_string();
    ctx.write_log(&id, "a", "exited 1\n").await;

    let entries = ctx.launcher.status(&launch_tags(&id)).await.unwrap();
    assert_eq!(entries[0].status, LabelStatus::Failed);
}

#[tokio::test]
async fn test_status_pending_counts_as_running() {
    let ctx = TestContext::new();
    let report = ctx.launcher.new_launch(request(&["a"])).await.unwrap();
    ctx.provider
        .set_state(&MockProvider::nth_id(1), InstanceState::Pending)
        .await;
    let entries = ctx
        .launcher
        .status(&launch_tags(&report.launch_id.to_string()))
        .await
        .unwrap();
    assert_eq!(entries[0].status, LabelStatus::Running);
}

#[tokio::test]
async fn test_status_without_manifest() {
    let ctx = TestContext::new();
    let result = ctx.launcher.status(&launch_tags("nope")).await;
    assert!(matches!(result, Err(Error::ManifestNotFound(_))));
}

// ============================================================================
// Restart
// ============================================================================

#[tokio::test]
async fn test_restart_only_failed() {
    let ctx = TestContext::new();
    let first = ctx
        .launcher
        .new_launch(request(&["a", "b", "c"]).pre_cmd("prep %(arg)s").no_rm(true))
        .await
        .unwrap();
    let id = first.launch_id.to_string();
    ctx.finish(&id, "a", 0).await;
    ctx.finish(&id, "b", 1).await;

    let options = RestartOptions {
        yes: true,
        only_failed: true,
        ..RestartOptions::default()
    };
    let second = ctx
        .launcher
        .restart(&launch_tags(&id), &options)
        .await
        .unwrap()
        .expect("a relaunch");
    assert_ne!(second.launch_id, first.launch_id);
    assert_eq!(second.dispatch.succeeded.len(), 1);
    assert_eq!(second.dispatch.succeeded[0].label, "b");

    let original = ctx.launcher.manifests().load(&launch_tags(&id)).await.unwrap();
    let relaunched = ctx
        .launcher
        .manifests()
        .load(&launch_tags(&second.launch_id.to_string()))
        .await
        .unwrap();
    assert_eq!(relaunched.args, vec!["b"]);
    assert_eq!(relaunched.labels, vec!["b"]);
    assert_eq!(relaunched.name, original.name);
    assert_eq!(relaunched.cmd, original.cmd);
    assert_eq!(relaunched.pre_cmd, original.pre_cmd);
    assert_eq!(relaunched.tags, original.tags);
    assert_eq!(relaunched.no_rm, original.no_rm);
    assert_eq!(relaunched.provisioning, original.provisioning);
}

#[tokio::test]
async fn test_restart_keeps_manifest_order() {
    let ctx = TestContext::new();
    let first = ctx
        .launcher
        .new_launch(request(&["z", "m", "a"]))
        .await
        .unwrap();
    let id = first.launch_id.to_string();
    ctx.provider.terminate_matching(&launch_tags(&id)).await;

    let options = RestartOptions {
        yes: true,
        ..RestartOptions::default()
    };
    let second = ctx
        .launcher
        .restart(&launch_tags(&id), &options)
        .await
        .unwrap()
        .unwrap();
    let labels: Vec<&str> = second
        .dispatch
        .succeeded
        .iter()
        .map(|i| i.label.as_str())
        .collect();
    assert_eq!(labels, vec!["z", "m", "a"]);

    let relaunched = ctx
        .launcher
        .manifests()
        .load(&launch_tags(&second.launch_id.to_string()))
        .await
        .unwrap();
    assert_eq!(relaunched.args, vec!["z", "m", "a"]);
}

#[tokio::test]
async fn test_restart_nothing_to_do() {
    let ctx = TestContext::new();
    let first = ctx.launcher.new_launch(request(&["a"])).await.unwrap();
    let id = first.launch_id.to_string();
    ctx.finish(&id, "a", 0).await;

    let options = RestartOptions {
        only_failed: true,
        ..RestartOptions::default()
    };
    let result = ctx.launcher.restart(&launch_tags(&id), &options).await.unwrap();
    assert!(result.is_none());
    assert_eq!(ctx.provider.provision_calls(), 1);
}

#[tokio::test]
async fn test_restart_declined() {
    let prompt = Arc::new(ScriptedPrompt::new().with_confirmation(false));
    let ctx = TestContext::interactive(prompt.clone());
    let first = ctx.launcher.new_launch(request(&["a"])).await.unwrap();
    let id = first.launch_id.to_string();
    ctx.finish(&id, "a", 1).await;

    let result = ctx
        .launcher
        .restart(&launch_tags(&id), &RestartOptions::default())
        .await;
    assert!(matches!(result, Err(Error::Aborted)));
    assert_eq!(prompt.asked().len(), 1);
    assert_eq!(ctx.provider.provision_calls(), 1);
}

#[tokio::test]
async fn test_restart_non_interactive_requires_yes() {
    let ctx = TestContext::new();
    let first = ctx.launcher.new_launch(request(&["a"])).await.unwrap();
    let id = first.launch_id.to_string();
    ctx.finish(&id, "a", 1).await;

    let result = ctx
        .launcher
        .restart(&launch_tags(&id), &RestartOptions::default())
        .await;
    assert!(matches!(result, Err(Error::Aborted)));
}

#[tokio::test]
async fn test_restart_with_transform() {
    let prompt = Arc::new(
        ScriptedPrompt::new()
            .with_confirmation(true)
            .with_confirmation(true),
    );
    let ctx = TestContext::interactive(prompt.clone());
    let first = ctx.launcher.new_launch(request(&["a"])).await.unwrap();
    let id = first.launch_id.to_string();
    ctx.finish(&id, "a", 1).await;

    let options = RestartOptions {
        transform: Some("sed 's/run %(arg)s/rerun %(arg)s/'".to_string()),
        ..RestartOptions::default()
    };
    let second = ctx
        .launcher
        .restart(&launch_tags(&id), &options)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(prompt.asked().len(), 2);

    let relaunched = ctx
        .launcher
        .manifests()
        .load(&launch_tags(&second.launch_id.to_string()))
        .await
        .unwrap();
    assert_eq!(relaunched.cmd, "rerun %(arg)s");
}

#[tokio::test]
async fn test_restart_transform_moves_bucket() {
    let ctx = TestContext::new();
    let first = ctx.launcher.new_launch(request(&["a"])).await.unwrap();
    let id = first.launch_id.to_string();
    ctx.finish(&id, "a", 1).await;

    let options = RestartOptions {
        transform: Some("sed 's/test-bucket/moved-bucket/'".to_string()),
        yes: true,
        ..RestartOptions::default()
    };
    let second = ctx
        .launcher
        .restart(&launch_tags(&id), &options)
        .await
        .unwrap()
        .unwrap();

    let saved = ctx
        .store
        .get_string(&layout::manifest_path(
            "moved-bucket",
            OWNER,
            &second.launch_id.to_string(),
        ))
        .await
        .expect("relaunch manifest in the moved bucket");
    assert!(saved.contains("\"bucket\": \"moved-bucket\""));
    let commands = ctx.provider.commands(&MockProvider::nth_id(2)).await;
    assert!(commands[0].script().contains("s3://moved-bucket/"));
}

#[tokio::test]
async fn test_restart_transform_failure() {
    let ctx = TestContext::new();
    let first = ctx.launcher.new_launch(request(&["a"])).await.unwrap();
    let options = RestartOptions {
        transform: Some("exit 4".to_string()),
        yes: true,
        ..RestartOptions::default()
    };
    let result = ctx
        .launcher
        .restart(&launch_tags(&first.launch_id.to_string()), &options)
        .await;
    assert!(matches!(result, Err(Error::Transform(_))));
}

// ============================================================================
// Wait
// ============================================================================

#[tokio::test]
async fn test_wait_all_done() {
    let ctx = TestContext::new();
    let report = ctx.launcher.new_launch(request(&["a", "b"])).await.unwrap();
    let id = report.launch_id.to_string();
    ctx.finish(&id, "a", 0).await;
    ctx.finish(&id, "b", 0).await;

    let entries = ctx.launcher.wait(&launch_tags(&id)).await.unwrap();
    assert!(entries.iter().all(|e| e.status == LabelStatus::Done));
}

#[tokio::test]
async fn test_wait_reports_incomplete_labels() {
    let ctx = TestContext::new();
    let report = ctx.launcher.new_launch(request(&["a", "b"])).await.unwrap();
    let id = report.launch_id.to_string();
    ctx.finish(&id, "a", 0).await;
    ctx.finish(&id, "b", 3).await;

    match ctx.launcher.wait(&launch_tags(&id)).await {
        Err(Error::BatchIncomplete { not_done }) => assert_eq!(not_done, vec!["b"]),
        other => panic!("expected incomplete batch, got {other:?}"),
    }
}

#[tokio::test]
async fn test_wait_polls_until_idle() {
    let ctx = TestContext::with(MockProvider::new(), MemoryBlobStore::new(), |b| {
        b.wait_config(WaitConfig {
            base: Duration::from_millis(1),
            jitter: Duration::ZERO,
        })
    });
    let report = ctx.launcher.new_launch(request(&["a"])).await.unwrap();
    let id = report.launch_id.to_string();

    let finisher = {
        let provider = ctx.provider.clone();
        let tags = launch_tags(&id);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            provider.terminate_matching(&tags).await;
        })
    };
    ctx.write_log(&id, "a", "exited 0\n").await;

    let entries = ctx.launcher.wait(&launch_tags(&id)).await.unwrap();
    finisher.await.unwrap();
    assert_eq!(entries[0].status, LabelStatus::Done);
}

#[tokio::test]
async fn test_until_idle_counts_polls() {
    let ctx = TestContext::new();
    let report = ctx.launcher.new_launch(request(&["a"])).await.unwrap();
    let tags = launch_tags(&report.launch_id.to_string());
    let provider = Arc::new(ctx.provider.clone());
    let wait_loop = WaitLoop::new(
        provider.clone(),
        StatusReconciler::new(
            ctx.launcher.manifests(),
            ctx.launcher.log_aggregator(),
            provider,
            2,
        ),
        WaitConfig {
            base: Duration::from_millis(5),
            jitter: Duration::ZERO,
        },
    );

    let finisher = {
        let provider = ctx.provider.clone();
        let tags = tags.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            provider.terminate_matching(&tags).await;
        })
    };
    let polls = wait_loop.until_idle(&tags).await.unwrap();
    finisher.await.unwrap();
    assert!(polls > 1, "expected several polls, got {polls}");

    assert_eq!(wait_loop.until_idle(&tags).await.unwrap(), 1);
}
