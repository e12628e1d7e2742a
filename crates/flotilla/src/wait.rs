// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wait loop.
//!
//! Polls live instances of a launch until none remain, then checks that
//! every label finished with `exited 0`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::info;

use crate::error::{Error, Result};
use crate::provider::{InstanceProvider, InstanceState};
use crate::status::{LabelStatus, StatusEntry, StatusReconciler};
use crate::tags::TagSet;

/// Configuration for the wait loop.
#[derive(Debug, Clone)]
pub struct WaitConfig {
    /// Fixed part of the delay between polls.
    pub base: Duration,
    /// Upper bound of the random part of the delay between polls.
    pub jitter: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            jitter: Duration::from_secs(10),
        }
    }
}

impl WaitConfig {
    /// Poll without sleeping.
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Delay before the next poll.
    pub fn next_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.base;
        }
        self.base + rand::thread_rng().gen_range(Duration::ZERO..self.jitter)
    }
}

/// Waits for a launch to finish.
pub struct WaitLoop {
    provider: Arc<dyn InstanceProvider>,
    reconciler: StatusReconciler,
    config: WaitConfig,
}

impl WaitLoop {
    /// Create a wait loop.
    pub fn new(
        provider: Arc<dyn InstanceProvider>,
        reconciler: StatusReconciler,
        config: WaitConfig,
    ) -> Self {
        Self {
            provider,
            reconciler,
            config,
        }
    }

    /// Block until no instance carrying `tags` is running or pending.
    ///
    /// Returns the number of polls made.
    pub async fn until_idle(&self, tags: &TagSet) -> Result<usize> {
        let mut polls = 0;
        loop {
            polls += 1;
            let live = self.provider.list(tags, &InstanceState::LIVE).await?;
            info!(
                "{} num running: {}",
                Utc::now().format("%Y-%m-%dT%H:%M:%S"),
                live.len()
            );
            if live.is_empty() {
                return Ok(polls);
            }
            tokio::time::sleep(self.config.next_delay()).await;
        }
    }

    /// Wait for the launch, then fail with [`Error::BatchIncomplete`] unless
    /// every label is done.
    pub async fn wait(&self, tags: &TagSet) -> Result<Vec<StatusEntry>> {
        info!(tags = %tags, "Waiting for launch");
        self.until_idle(tags).await?;
        let entries = self.reconciler.status(tags).await?;
        for entry in &entries {
            info!("{entry}");
        }
        let not_done: Vec<String> = entries
            .iter()
            .filter(|e| e.status != LabelStatus::Done)
            .map(|e| e.label.clone())
            .collect();
        if !not_done.is_empty() {
            return Err(Error::BatchIncomplete { not_done });
        }
        Ok(entries)
    }
}
