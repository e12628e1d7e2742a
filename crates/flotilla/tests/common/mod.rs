// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for flotilla integration tests.
//!
//! Provides TestContext wiring a launcher to a mock provider and an
//! in-memory blob store, plus helpers simulating finished jobs.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use flotilla::blob::{BlobStore, MemoryBlobStore};
use flotilla::config::{ExecutionMode, Interaction, StoreTarget};
use flotilla::layout::{self, LOG_FILE, TAIL_FILE};
use flotilla::prompt::Prompt;
use flotilla::provider::{MockProvider, ProvisionParams};
use flotilla::tags::{LABEL_KEY, LAUNCH_KEY, NAME_KEY};
use flotilla::wait::WaitConfig;
use flotilla::{Launcher, NewLaunch, TagSet};

pub const BUCKET: &str = "test-bucket";
pub const OWNER: &str = "tester";

/// Launcher over a mock provider and an in-memory store.
pub struct TestContext {
    pub provider: MockProvider,
    pub store: MemoryBlobStore,
    pub launcher: Launcher,
}

impl TestContext {
    /// Create a context with a non-interactive remote launcher.
    pub fn new() -> Self {
        Self::with(MockProvider::new(), MemoryBlobStore::new(), |b| b)
    }

    /// Create a context, customizing the launcher builder.
    pub fn with(
        provider: MockProvider,
        store: MemoryBlobStore,
        customize: impl FnOnce(flotilla::LauncherBuilder) -> flotilla::LauncherBuilder,
    ) -> Self {
        let builder = Launcher::builder()
            .provider(Arc::new(provider.clone()))
            .store(Arc::new(store.clone()))
            .target(StoreTarget {
                bucket: BUCKET.to_string(),
                owner: OWNER.to_string(),
            })
            .wait_config(WaitConfig::immediate());
        let launcher = customize(builder).build().expect("launcher");
        Self {
            provider,
            store,
            launcher,
        }
    }

    /// Create a context whose confirmations go to `prompt`.
    pub fn interactive(prompt: Arc<dyn Prompt>) -> Self {
        Self::with(MockProvider::new(), MemoryBlobStore::new(), |b| {
            b.prompt(prompt).interaction(Interaction::Interactive)
        })
    }

    /// Create a context running items on this machine.
    pub fn local() -> Self {
        Self::with(MockProvider::new(), MemoryBlobStore::new(), |b| {
            b.mode(ExecutionMode::Local)
        })
    }

    /// Simulate the background job of `label` finishing: upload its logs
    /// ending in `exited <code>` and terminate its instance.
    pub async fn finish(&self, launch_id: &str, label: &str, code: i32) {
        self.write_log(launch_id, label, &format!("working\nexited {code}\n"))
            .await;
        let tags = TagSet::new()
            .with(LAUNCH_KEY, launch_id)
            .with(LABEL_KEY, label);
        self.provider.terminate_matching(&tags).await;
    }

    /// Upload `content` as both logs of `label`.
    pub async fn write_log(&self, launch_id: &str, label: &str, content: &str) {
        let date = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let tags = TagSet::new()
            .with(NAME_KEY, "job")
            .with(LAUNCH_KEY, launch_id)
            .with(LABEL_KEY, label);
        let dir = layout::log_dir(BUCKET, OWNER, date, &tags);
        for file in [LOG_FILE, TAIL_FILE] {
            self.store
                .put(
                    &dir.sibling(format!("{}/{file}", dir.key)),
                    content.as_bytes().to_vec(),
                )
                .await
                .unwrap();
        }
    }
}

/// Provisioning parameters as a resolved configuration would produce.
pub fn provisioning() -> ProvisionParams {
    ProvisionParams {
        key: Some("key".to_string()),
        ami: Some("ami-123".to_string()),
        sg: Some("sg-default".to_string()),
        instance_type: Some("t3.micro".to_string()),
        vpc: Some("main".to_string()),
        ..ProvisionParams::default()
    }
}

/// A request launching one item per arg.
pub fn request(args: &[&str]) -> NewLaunch {
    NewLaunch::new("job", "run %(arg)s")
        .args(args.iter().copied())
        .tag("team=infra")
        .provisioning(provisioning())
}

/// `launch=<id>` tag set.
pub fn launch_tags(launch_id: &str) -> TagSet {
    TagSet::new().with(LAUNCH_KEY, launch_id)
}
