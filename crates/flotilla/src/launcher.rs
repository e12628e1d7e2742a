// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Launcher: the operation surface.
//!
//! The launcher ties the manifest store, the instance provider, the fan-out,
//! the log aggregator and the status reconciler together. It is built once
//! from resolved configuration and then serves every operator command.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::command::substitute;
use crate::config::{ConfigError, ExecutionMode, Interaction, StoreTarget};
use crate::error::{Error, Result};
use crate::fanout::{
    self, DispatchFailure, DispatchReport, DispatchSpec, DispatchStage, DispatchedItem,
};
use crate::logs::{DEFAULT_MAX_CONCURRENCY, LaunchLogs, LogAggregator, LogFilter, LogRecord};
use crate::manifest::{LaunchBatch, MANIFEST_VERSION, ManifestListing, ManifestStore};
use crate::process;
use crate::prompt::{NoPrompt, Prompt};
use crate::provider::{InstanceProvider, ProviderError, ProvisionParams};
use crate::status::{StatusEntry, StatusReconciler, select_for_restart};
use crate::tags::{LAUNCH_KEY, TagSet, tagify};
use crate::wait::{WaitConfig, WaitLoop};

/// Instance id recorded for items run in local mode.
pub const LOCAL_INSTANCE: &str = "local";

/// A request to launch a new batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewLaunch {
    /// Name of all instances.
    pub name: String,
    /// One instance per arg.
    pub args: Vec<String>,
    /// One label per arg; defaults to the args.
    pub labels: Vec<String>,
    /// Command run in the foreground before `cmd`, or a file containing it.
    pub pre_cmd: Option<String>,
    /// Command run in the background, or a file containing it.
    pub cmd: String,
    /// Caller tags, `key=value`.
    pub tags: Vec<String>,
    /// Halt instead of terminating when done.
    pub no_rm: bool,
    /// Bucket receiving the manifest and logs; the launcher's bucket when unset.
    pub bucket: Option<String>,
    /// Provisioning parameters.
    pub provisioning: ProvisionParams,
}

impl NewLaunch {
    /// Create a request.
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            ..Self::default()
        }
    }

    /// Set the args.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the labels.
    pub fn labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Add a caller tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Set the foreground command.
    pub fn pre_cmd(mut self, pre_cmd: impl Into<String>) -> Self {
        self.pre_cmd = Some(pre_cmd.into());
        self
    }

    /// Halt instead of terminating when done.
    pub fn no_rm(mut self, no_rm: bool) -> Self {
        self.no_rm = no_rm;
        self
    }

    /// Send the manifest and logs to `bucket`.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the provisioning parameters.
    pub fn provisioning(mut self, params: ProvisionParams) -> Self {
        self.provisioning = params;
        self
    }

    /// A request relaunching `batch` with the given items.
    pub fn from_batch(batch: &LaunchBatch, args: Vec<String>, labels: Vec<String>) -> Self {
        Self {
            name: batch.name.clone(),
            args,
            labels,
            pre_cmd: batch.pre_cmd.clone(),
            cmd: batch.cmd.clone(),
            tags: batch.tags.clone(),
            no_rm: batch.no_rm,
            bucket: Some(batch.bucket.clone()).filter(|b| !b.is_empty()),
            provisioning: batch.provisioning.clone(),
        }
    }
}

/// Outcome of a launch.
///
/// A launch with failed items still has a usable launch id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReport {
    /// Launch id.
    pub launch_id: Uuid,
    /// Per-item outcome.
    pub dispatch: DispatchReport,
}

impl LaunchReport {
    /// `launch=<id>`.
    pub fn launch_tag(&self) -> String {
        format!("{LAUNCH_KEY}={}", self.launch_id)
    }

    /// The report, or [`Error::Dispatch`] if any item failed.
    pub fn into_result(self) -> Result<Self> {
        if self.dispatch.is_success() {
            return Ok(self);
        }
        Err(Error::Dispatch {
            launch_id: self.launch_id.to_string(),
            failed: self.dispatch.failed.len(),
            total: self.dispatch.total(),
        })
    }
}

/// Options of [`Launcher::restart`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartOptions {
    /// Shell command transforming the manifest JSON before relaunching.
    pub transform: Option<String>,
    /// Skip confirmation prompts.
    pub yes: bool,
    /// Relaunch only failed and missing labels.
    pub only_failed: bool,
}

/// Builder for creating a [`Launcher`].
pub struct LauncherBuilder {
    provider: Option<Arc<dyn InstanceProvider>>,
    store: Option<Arc<dyn BlobStore>>,
    target: Option<StoreTarget>,
    prompt: Arc<dyn Prompt>,
    mode: ExecutionMode,
    interaction: Interaction,
    wait_config: WaitConfig,
    max_log_concurrency: usize,
}

impl Default for LauncherBuilder {
    fn default() -> Self {
        Self {
            provider: None,
            store: None,
            target: None,
            prompt: Arc::new(NoPrompt),
            mode: ExecutionMode::default(),
            interaction: Interaction::default(),
            wait_config: WaitConfig::default(),
            max_log_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl LauncherBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the instance provider (required).
    pub fn provider(mut self, provider: Arc<dyn InstanceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the blob store (required).
    pub fn store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the bucket and owner (required).
    pub fn target(mut self, target: StoreTarget) -> Self {
        self.target = Some(target);
        self
    }

    /// Set the operator prompt.
    pub fn prompt(mut self, prompt: Arc<dyn Prompt>) -> Self {
        self.prompt = prompt;
        self
    }

    /// Set the execution mode.
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set whether confirmations may be asked.
    pub fn interaction(mut self, interaction: Interaction) -> Self {
        self.interaction = interaction;
        self
    }

    /// Set the wait loop delays.
    pub fn wait_config(mut self, config: WaitConfig) -> Self {
        self.wait_config = config;
        self
    }

    /// Set the number of concurrent log fetches.
    pub fn max_log_concurrency(mut self, max: usize) -> Self {
        self.max_log_concurrency = max;
        self
    }

    /// Build the launcher.
    pub fn build(self) -> Result<Launcher> {
        let provider = self.provider.ok_or(ConfigError::Incomplete("provider"))?;
        let store = self.store.ok_or(ConfigError::Incomplete("store"))?;
        let target = self.target.ok_or(ConfigError::Incomplete("bucket and owner"))?;
        debug!(
            provider = provider.provider_type(),
            store = store.store_type(),
            bucket = %target.bucket,
            mode = ?self.mode,
            "Launcher built"
        );
        Ok(Launcher {
            provider,
            store,
            target,
            prompt: self.prompt,
            mode: self.mode,
            interaction: self.interaction,
            wait_config: self.wait_config,
            max_log_concurrency: self.max_log_concurrency,
        })
    }
}

/// Launches batches and tracks them.
pub struct Launcher {
    provider: Arc<dyn InstanceProvider>,
    store: Arc<dyn BlobStore>,
    target: StoreTarget,
    prompt: Arc<dyn Prompt>,
    mode: ExecutionMode,
    interaction: Interaction,
    wait_config: WaitConfig,
    max_log_concurrency: usize,
}

impl Launcher {
    /// Create a builder.
    pub fn builder() -> LauncherBuilder {
        LauncherBuilder::new()
    }

    /// Bucket and owner.
    pub fn target(&self) -> &StoreTarget {
        &self.target
    }

    /// Execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Manifest store under the launcher's owner.
    pub fn manifests(&self) -> ManifestStore {
        ManifestStore::new(self.store.clone(), &self.target.bucket, &self.target.owner)
    }

    /// Log aggregator under the launcher's owner.
    pub fn log_aggregator(&self) -> LogAggregator {
        LogAggregator::new(self.store.clone(), &self.target.bucket, &self.target.owner)
    }

    fn reconciler(&self) -> StatusReconciler {
        StatusReconciler::new(
            self.manifests(),
            self.log_aggregator(),
            self.provider.clone(),
            self.max_log_concurrency,
        )
    }

    fn confirm(&self, message: &str) -> Result<()> {
        if self.interaction == Interaction::NonInteractive {
            warn!("Confirmation required, pass yes to proceed");
            return Err(Error::Aborted);
        }
        if self.prompt.confirm(message) {
            Ok(())
        } else {
            Err(Error::Aborted)
        }
    }

    async fn read_if_file(value: String, what: &str) -> Result<String> {
        let path = Path::new(&value);
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {
                let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
                info!(path = %absolute.display(), "Reading {what} from file");
                Ok(tokio::fs::read_to_string(path).await?)
            }
            _ => Ok(value),
        }
    }

    /// Turn a request into a validated batch with a fresh launch id.
    ///
    /// Labels default to the args and are tagified; `cmd` and `pre_cmd`
    /// naming an existing file are replaced by its contents.
    pub async fn prepare(&self, request: NewLaunch) -> Result<LaunchBatch> {
        let NewLaunch {
            name,
            args,
            labels,
            pre_cmd,
            cmd,
            tags,
            no_rm,
            bucket,
            provisioning,
        } = request;

        if !labels.is_empty() && labels.len() != args.len() {
            return Err(Error::InvalidBatch(format!(
                "there must be an equal number of args and labels, {} != {}",
                args.len(),
                labels.len()
            )));
        }
        let labels: Vec<String> = if labels.is_empty() {
            args.iter().map(|a| tagify(a)).collect()
        } else {
            labels.iter().map(|l| tagify(l)).collect()
        };
        TagSet::parse(&tags)?;

        for (arg, label) in args.iter().zip(&labels) {
            if arg == label {
                info!(arg = %arg, "Going to launch");
            } else {
                info!(label = %label, arg = %arg, "Going to launch");
            }
        }

        let pre_cmd = match pre_cmd {
            Some(pre_cmd) => Some(Self::read_if_file(pre_cmd, "pre_cmd").await?),
            None => None,
        };
        let cmd = Self::read_if_file(cmd, "cmd").await?;

        let batch = LaunchBatch {
            version: MANIFEST_VERSION,
            launch_id: Uuid::new_v4(),
            name,
            args,
            labels,
            pre_cmd,
            cmd,
            tags,
            no_rm,
            bucket: bucket.unwrap_or_else(|| self.target.bucket.clone()),
            provisioning,
        };
        batch.validate()?;
        Ok(batch)
    }

    /// Launch a new batch.
    ///
    /// Item failures are reported in the returned [`LaunchReport`]; call
    /// [`LaunchReport::into_result`] to turn them into an error.
    pub async fn new_launch(&self, request: NewLaunch) -> Result<LaunchReport> {
        let batch = self.prepare(request).await?;
        self.launch(&batch).await
    }

    /// Launch a prepared batch.
    pub async fn launch(&self, batch: &LaunchBatch) -> Result<LaunchReport> {
        batch.validate()?;
        info!("{}", batch.launch_tag());
        let dispatch = match self.mode {
            ExecutionMode::Local => self.run_local(batch).await,
            ExecutionMode::Remote => self.run_remote(batch).await?,
        };
        if !dispatch.is_success() {
            error!(
                launch_id = %batch.launch_id,
                failed = dispatch.failed.len(),
                total = dispatch.total(),
                "Launch had errors"
            );
            for failure in &dispatch.failed {
                error!("{failure}");
            }
        }
        Ok(LaunchReport {
            launch_id: batch.launch_id,
            dispatch,
        })
    }

    async fn run_remote(&self, batch: &LaunchBatch) -> Result<DispatchReport> {
        ManifestStore::new(self.store.clone(), &batch.bucket, &self.target.owner)
            .save(batch)
            .await?;

        let count = batch.args.len();
        let instances = self
            .provider
            .provision(&batch.name, count, &batch.provisioning)
            .await?;
        if instances.len() < count {
            return Err(ProviderError::Provision(format!(
                "requested {count} instances, got {}",
                instances.len()
            ))
            .into());
        }
        info!(launch_id = %batch.launch_id, count, "Provisioned instances");

        let spec = DispatchSpec {
            name: Some(batch.name.clone()),
            pre_cmd: batch.pre_cmd.clone(),
            cmd: batch.cmd.clone(),
            tags: batch.launch_tags()?,
            no_rm: batch.no_rm,
            bucket: batch.bucket.clone(),
            owner: self.target.owner.clone(),
            date: Utc::now(),
        };
        Ok(fanout::dispatch(
            self.provider.clone(),
            &instances,
            &batch.args,
            &batch.labels,
            &spec,
        )
        .await)
    }

    async fn run_local(&self, batch: &LaunchBatch) -> DispatchReport {
        let mut report = DispatchReport::default();
        for (arg, label) in batch.items() {
            match Self::run_local_item(batch, arg).await {
                Ok(()) => report.succeeded.push(DispatchedItem {
                    instance_id: LOCAL_INSTANCE.to_string(),
                    label: label.to_string(),
                }),
                Err((stage, error)) => report.failed.push(DispatchFailure {
                    instance_id: LOCAL_INSTANCE.to_string(),
                    label: label.to_string(),
                    stage,
                    error,
                }),
            }
        }
        report
    }

    async fn run_local_item(
        batch: &LaunchBatch,
        arg: &str,
    ) -> std::result::Result<(), (DispatchStage, String)> {
        let dir = tempfile::tempdir().map_err(|e| (DispatchStage::Task, e.to_string()))?;
        let steps = batch
            .pre_cmd
            .iter()
            .map(|c| (DispatchStage::PreCommand, c))
            .chain([(DispatchStage::Command, &batch.cmd)]);
        for (stage, template) in steps {
            let script = substitute(template, arg);
            let output = process::run_shell(&script, None, Some(dir.path()))
                .await
                .map_err(|e| (stage, e.to_string()))?;
            for line in output.stdout_str().lines() {
                info!("{line}");
            }
            if !output.success() {
                return Err((stage, output.describe_failure()));
            }
        }
        Ok(())
    }

    /// Launch a new batch from a manifest JSON file.
    pub async fn from_params(&self, path: impl AsRef<Path>) -> Result<LaunchReport> {
        let data = tokio::fs::read(path.as_ref()).await?;
        let batch: LaunchBatch = serde_json::from_slice(&data)?;
        let request = NewLaunch::from_batch(&batch, batch.args.clone(), batch.labels.clone());
        self.new_launch(request).await
    }

    /// Pretty JSON of the manifest selected by `tags`.
    pub async fn params(&self, tags: &TagSet) -> Result<String> {
        let value = self.manifests().load_raw(tags).await?;
        Ok(serde_json::to_string_pretty(&value)?)
    }

    /// Status of every label of the launch selected by `tags`.
    pub async fn status(&self, tags: &TagSet) -> Result<Vec<StatusEntry>> {
        self.reconciler().status(tags).await
    }

    /// Wait until the launch has no live instances, then require every label
    /// to be done. Does nothing in local mode.
    pub async fn wait(&self, tags: &TagSet) -> Result<Vec<StatusEntry>> {
        if self.mode == ExecutionMode::Local {
            return Ok(Vec::new());
        }
        WaitLoop::new(
            self.provider.clone(),
            self.reconciler(),
            self.wait_config.clone(),
        )
        .wait(tags)
        .await
    }

    async fn transform(
        &self,
        value: serde_json::Value,
        command: &str,
        yes: bool,
    ) -> Result<serde_json::Value> {
        let text = serde_json::to_string_pretty(&value)?;
        let output = process::run_shell(command, Some(text.as_bytes()), None).await?;
        if !output.success() {
            return Err(Error::Transform(format!(
                "{command}: {}",
                output.describe_failure()
            )));
        }
        let transformed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Transform(format!("{command}: {e}")))?;

        if let Some(old) = value.as_object() {
            for (key, old_value) in old {
                let new_value = transformed.get(key).unwrap_or(&serde_json::Value::Null);
                if old_value != new_value {
                    info!(key = %key, old = %old_value, new = %new_value, "Manifest changed");
                }
            }
        }
        if !yes {
            self.confirm("would you like to proceed?")?;
        }
        Ok(transformed)
    }

    /// Relaunch the labels of a launch that did not finish.
    ///
    /// Returns `None` when there is nothing to restart. The relaunch gets a
    /// new launch id and reuses every other manifest parameter.
    pub async fn restart(
        &self,
        tags: &TagSet,
        options: &RestartOptions,
    ) -> Result<Option<LaunchReport>> {
        let mut value = self.manifests().load_raw(tags).await?;
        if let Some(command) = &options.transform {
            value = self.transform(value, command, options.yes).await?;
        }
        let batch: LaunchBatch = serde_json::from_value(value)?;

        let entries = self.status(tags).await?;
        let selected = select_for_restart(&entries, options.only_failed);
        for entry in entries.iter().filter(|e| selected.contains(&e.label)) {
            info!(status = %entry.status, label = %entry.label, "Going to restart");
        }
        if selected.is_empty() {
            info!("Nothing to restart");
            return Ok(None);
        }
        if !options.yes {
            self.confirm("would you like to proceed?")?;
        }

        let selected: BTreeSet<&str> = selected.iter().map(String::as_str).collect();
        let (args, labels): (Vec<String>, Vec<String>) = batch
            .items()
            .filter(|(_, label)| selected.contains(label))
            .map(|(arg, label)| (arg.to_string(), label.to_string()))
            .unzip();
        info!(labels = %labels.join(" "), "Restarting");
        let request = NewLaunch::from_batch(&batch, args, labels);
        self.new_launch(request).await.map(Some)
    }

    /// Manifests of the launcher's owner, newest first.
    pub async fn ls_params(&self) -> Result<Vec<ManifestListing>> {
        self.manifests().list().await
    }

    /// Launches that left logs, oldest first.
    pub async fn ls_logs(&self) -> Result<Vec<LaunchLogs>> {
        self.log_aggregator().ls_logs().await
    }

    /// Full content of one log matching `tags`.
    pub async fn log(&self, tags: &TagSet, index: isize, tail_only: bool) -> Result<Vec<u8>> {
        self.log_aggregator().log(tags, index, tail_only).await
    }

    /// Filtered content of every log matching `tags`.
    pub async fn logs(
        &self,
        tags: &TagSet,
        filter: &LogFilter,
        tail_only: bool,
    ) -> Result<Vec<LogRecord>> {
        self.log_aggregator()
            .fetch_tails(tags, filter, self.max_log_concurrency, tail_only)
            .await
    }
}
