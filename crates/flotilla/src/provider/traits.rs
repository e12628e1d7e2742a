// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instance provider trait definitions.
//!
//! Defines the capability surface the launcher needs from a compute backend.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::RemoteCommand;
use crate::tags::TagSet;

/// Errors from provider operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProviderError {
    /// The requested instances could not be created.
    #[error("Provisioning failed: {0}")]
    Provision(String),

    /// A remote command could not be run.
    #[error("Remote execution failed on {instance_id}: {message}")]
    RemoteExec {
        /// Instance the command was sent to.
        instance_id: String,
        /// Failure description.
        message: String,
    },

    /// Tags could not be applied.
    #[error("Tagging failed on {instance_id}: {message}")]
    Tagging {
        /// Instance being tagged.
        instance_id: String,
        /// Failure description.
        message: String,
    },

    /// Instances could not be listed.
    #[error("Listing instances failed: {0}")]
    Listing(String),

    /// Instance was not found.
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    /// Being created.
    Pending,
    /// Running.
    Running,
    /// Terminating.
    ShuttingDown,
    /// Terminated.
    Terminated,
    /// Stopping.
    Stopping,
    /// Stopped.
    Stopped,
}

impl InstanceState {
    /// States in which an instance counts as live for status and wait.
    pub const LIVE: [InstanceState; 2] = [InstanceState::Running, InstanceState::Pending];

    /// Provider-native name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceState {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "shutting-down" => Ok(Self::ShuttingDown),
            "terminated" => Ok(Self::Terminated),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            other => Err(ProviderError::Listing(format!(
                "unknown instance state: {other}"
            ))),
        }
    }
}

/// A listed instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescriptor {
    /// Instance id.
    pub id: String,
    /// Current state.
    pub state: InstanceState,
    /// Current tags.
    pub tags: TagSet,
}

/// Parameters for provisioning instances.
///
/// Serialized as part of the launch manifest, so field names follow the
/// manifest format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionParams {
    /// Spot price to bid; on-demand when absent.
    #[serde(default)]
    pub spot: Option<String>,
    /// Key pair name.
    #[serde(default)]
    pub key: Option<String>,
    /// Machine image id.
    #[serde(default)]
    pub ami: Option<String>,
    /// Security group name or id.
    #[serde(default)]
    pub sg: Option<String>,
    /// Instance type.
    #[serde(default, rename = "type")]
    pub instance_type: Option<String>,
    /// VPC name or id.
    #[serde(default)]
    pub vpc: Option<String>,
    /// Availability zone.
    #[serde(default)]
    pub zone: Option<String>,
    /// Size of the primary disk in GiB.
    #[serde(default = "default_gigs")]
    pub gigs: u32,
}

/// Default primary disk size in GiB.
pub const DEFAULT_GIGS: u32 = 8;

fn default_gigs() -> u32 {
    DEFAULT_GIGS
}

impl Default for ProvisionParams {
    fn default() -> Self {
        Self {
            spot: None,
            key: None,
            ami: None,
            sg: None,
            instance_type: None,
            vpc: None,
            zone: None,
            gigs: DEFAULT_GIGS,
        }
    }
}

/// Trait for instance providers.
///
/// Providers are pure capability adapters: they know nothing about
/// manifests, labels or logs. The launcher drives them.
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    /// Provider type identifier (e.g., "aws", "mock").
    fn provider_type(&self) -> &'static str;

    /// Create `count` instances named `name` and return their ids once they
    /// accept remote commands.
    async fn provision(
        &self,
        name: &str,
        count: usize,
        params: &ProvisionParams,
    ) -> Result<Vec<String>>;

    /// Run a command on an instance.
    ///
    /// Detached commands return as soon as they have been started.
    async fn run_remote(&self, instance_id: &str, command: &RemoteCommand) -> Result<()>;

    /// Add or replace tags on an instance.
    async fn tag(&self, instance_id: &str, tags: &TagSet) -> Result<()>;

    /// List instances carrying all of `tags` and in one of `states`.
    async fn list(&self, tags: &TagSet, states: &[InstanceState])
    -> Result<Vec<InstanceDescriptor>>;
}
