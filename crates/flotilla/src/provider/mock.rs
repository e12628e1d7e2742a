// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock provider for testing.
//!
//! A provider implementation that keeps instances in memory and records the
//! commands sent to them without provisioning anything.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::*;
use crate::command::RemoteCommand;
use crate::tags::{NAME_KEY, TagSet};

/// Mock instance state.
#[derive(Debug, Clone)]
struct MockInstance {
    state: InstanceState,
    tags: TagSet,
    commands: Vec<RemoteCommand>,
}

/// Mock provider for testing.
///
/// Instance ids are allocated sequentially (`i-00000001`, `i-00000002`, ...),
/// so tests can address the n-th provisioned instance by id.
#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    instances: Arc<Mutex<BTreeMap<String, MockInstance>>>,
    failing_remote: Arc<Mutex<HashSet<String>>>,
    next_id: Arc<AtomicUsize>,
    provisions: Arc<AtomicUsize>,
    /// If true, provisioning fails.
    pub fail_provision: bool,
    /// Number of instances to withhold from each provisioning request.
    pub shortfall: usize,
    /// Time every remote command takes.
    pub remote_delay: Duration,
}

impl MockProvider {
    /// Create a new mock provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock provider whose provisioning always fails.
    pub fn failing() -> Self {
        Self {
            fail_provision: true,
            ..Self::default()
        }
    }

    /// Create a mock provider returning `shortfall` fewer instances than
    /// requested.
    pub fn with_shortfall(shortfall: usize) -> Self {
        Self {
            shortfall,
            ..Self::default()
        }
    }

    /// Create a mock provider whose remote commands each take `delay`.
    pub fn with_remote_delay(delay: Duration) -> Self {
        Self {
            remote_delay: delay,
            ..Self::default()
        }
    }

    /// Id of the n-th instance provisioned (1-based).
    pub fn nth_id(n: usize) -> String {
        format!("i-{n:08}")
    }

    /// Make every remote command on `instance_id` fail.
    pub async fn fail_remote_on(&self, instance_id: &str) {
        self.failing_remote
            .lock()
            .await
            .insert(instance_id.to_string());
    }

    /// Change the state of an instance.
    pub async fn set_state(&self, instance_id: &str, state: InstanceState) {
        if let Some(instance) = self.instances.lock().await.get_mut(instance_id) {
            instance.state = state;
        }
    }

    /// Mark every instance carrying `tags` as terminated.
    pub async fn terminate_matching(&self, tags: &TagSet) {
        for instance in self.instances.lock().await.values_mut() {
            if tags.matches(&instance.tags) {
                instance.state = InstanceState::Terminated;
            }
        }
    }

    /// Commands sent to an instance, in order.
    pub async fn commands(&self, instance_id: &str) -> Vec<RemoteCommand> {
        self.instances
            .lock()
            .await
            .get(instance_id)
            .map(|i| i.commands.clone())
            .unwrap_or_default()
    }

    /// Current tags of an instance.
    pub async fn tags_of(&self, instance_id: &str) -> Option<TagSet> {
        self.instances
            .lock()
            .await
            .get(instance_id)
            .map(|i| i.tags.clone())
    }

    /// Ids of all instances ever provisioned.
    pub async fn instance_ids(&self) -> Vec<String> {
        self.instances.lock().await.keys().cloned().collect()
    }

    /// Number of provisioning calls made.
    pub fn provision_calls(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceProvider for MockProvider {
    fn provider_type(&self) -> &'static str {
        "mock"
    }

    async fn provision(
        &self,
        name: &str,
        count: usize,
        _params: &ProvisionParams,
    ) -> Result<Vec<String>> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        if self.fail_provision {
            return Err(ProviderError::Provision("Mock failure".to_string()));
        }

        let mut instances = self.instances.lock().await;
        let mut ids = Vec::with_capacity(count);
        for _ in 0..count.saturating_sub(self.shortfall) {
            let id = Self::nth_id(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            instances.insert(
                id.clone(),
                MockInstance {
                    state: InstanceState::Running,
                    tags: TagSet::new().with(NAME_KEY, name),
                    commands: Vec::new(),
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    async fn run_remote(&self, instance_id: &str, command: &RemoteCommand) -> Result<()> {
        if !self.remote_delay.is_zero() {
            tokio::time::sleep(self.remote_delay).await;
        }
        if self.failing_remote.lock().await.contains(instance_id) {
            return Err(ProviderError::RemoteExec {
                instance_id: instance_id.to_string(),
                message: "Mock failure".to_string(),
            });
        }
        let mut instances = self.instances.lock().await;
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| ProviderError::InstanceNotFound(instance_id.to_string()))?;
        instance.commands.push(command.clone());
        Ok(())
    }

    async fn tag(&self, instance_id: &str, tags: &TagSet) -> Result<()> {
        let mut instances = self.instances.lock().await;
        let instance = instances
            .get_mut(instance_id)
            .ok_or_else(|| ProviderError::InstanceNotFound(instance_id.to_string()))?;
        instance
            .tags
            .extend(tags.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        Ok(())
    }

    async fn list(
        &self,
        tags: &TagSet,
        states: &[InstanceState],
    ) -> Result<Vec<InstanceDescriptor>> {
        let instances = self.instances.lock().await;
        Ok(instances
            .iter()
            .filter(|(_, i)| states.contains(&i.state) && tags.matches(&i.tags))
            .map(|(id, i)| InstanceDescriptor {
                id: id.clone(),
                state: i.state,
                tags: i.tags.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_provision_allocates_sequential_ids() {
        let provider = MockProvider::new();
        let ids = provider
            .provision("job", 3, &ProvisionParams::default())
            .await
            .unwrap();
        assert_eq!(ids, vec!["i-00000001", "i-00000002", "i-00000003"]);
        assert_eq!(MockProvider::nth_id(2), "i-00000002");
        assert_eq!(provider.provision_calls(), 1);
        assert_eq!(provider.provider_type(), "mock");
    }

    #[tokio::test]
    async fn test_failing_provision() {
        let provider = MockProvider::failing();
        let result = provider.provision("job", 1, &ProvisionParams::default()).await;
        assert!(matches!(result, Err(ProviderError::Provision(_))));
    }

    #[tokio::test]
    async fn test_tag_and_list() {
        let provider = MockProvider::new();
        let ids = provider
            .provision("job", 2, &ProvisionParams::default())
            .await
            .unwrap();
        let tags = TagSet::parse(["launch=L", "label=a"]).unwrap();
        provider.tag(&ids[0], &tags).await.unwrap();

        let listed = provider
            .list(&TagSet::parse(["launch=L"]).unwrap(), &InstanceState::LIVE)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].tags.label(), Some("a"));
        assert_eq!(listed[0].tags.get("Name"), Some("job"));

        provider.set_state(&ids[0], InstanceState::Terminated).await;
        let listed = provider.list(&tags, &InstanceState::LIVE).await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn test_remote_failure_is_per_instance() {
        let provider = MockProvider::new();
        let ids = provider
            .provision("job", 2, &ProvisionParams::default())
            .await
            .unwrap();
        provider.fail_remote_on(&ids[1]).await;
        let cmd = RemoteCommand::foreground("true");

        assert!(provider.run_remote(&ids[0], &cmd).await.is_ok());
        assert!(matches!(
            provider.run_remote(&ids[1], &cmd).await,
            Err(ProviderError::RemoteExec { .. })
        ));
        assert_eq!(provider.commands(&ids[0]).await, vec![cmd]);
    }
}
