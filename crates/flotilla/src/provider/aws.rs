// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! EC2 provider backed by the `aws` and `ssh` command line tools.
//!
//! Pure capability logic, no knowledge of manifests or logs. Instances are
//! reached over SSH on their public DNS name (private IP as fallback).

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info, warn};

use super::traits::*;
use crate::command::RemoteCommand;
use crate::process::{CapturedOutput, run_captured};
use crate::tags::{NAME_KEY, TagSet};

/// Configuration for the AWS CLI provider.
#[derive(Debug, Clone)]
pub struct AwsCliConfig {
    /// Path to the aws executable.
    pub aws_bin: String,
    /// Path to the ssh executable.
    pub ssh_bin: String,
    /// Login user on launched instances.
    pub ssh_user: String,
    /// Number of SSH connection attempts before giving up.
    pub ssh_attempts: u32,
    /// Number of tagging attempts.
    pub tag_attempts: u32,
    /// Delay between tagging attempts.
    pub tag_retry_delay: Duration,
}

impl Default for AwsCliConfig {
    fn default() -> Self {
        Self {
            aws_bin: "aws".to_string(),
            ssh_bin: "ssh".to_string(),
            ssh_user: "ubuntu".to_string(),
            ssh_attempts: 60,
            tag_attempts: 5,
            tag_retry_delay: Duration::from_secs(2),
        }
    }
}

impl AwsCliConfig {
    /// Load configuration from environment variables.
    ///
    /// - `FLOTILLA_AWS_BIN`: aws executable (default: `aws`)
    /// - `FLOTILLA_SSH_BIN`: ssh executable (default: `ssh`)
    /// - `FLOTILLA_SSH_USER`: login user (default: `ubuntu`)
    /// - `FLOTILLA_SSH_ATTEMPTS`: connection attempts (default: 60)
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            aws_bin: std::env::var("FLOTILLA_AWS_BIN").unwrap_or(default.aws_bin),
            ssh_bin: std::env::var("FLOTILLA_SSH_BIN").unwrap_or(default.ssh_bin),
            ssh_user: std::env::var("FLOTILLA_SSH_USER").unwrap_or(default.ssh_user),
            ssh_attempts: std::env::var("FLOTILLA_SSH_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.ssh_attempts),
            ..default
        }
    }
}

/// Provider that drives EC2 through the aws CLI.
pub struct AwsCliProvider {
    config: AwsCliConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesOutput {
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Ec2Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Instance {
    instance_id: String,
    #[serde(default)]
    state: Option<Ec2State>,
    #[serde(default)]
    tags: Vec<Ec2Tag>,
    #[serde(default)]
    public_dns_name: Option<String>,
    #[serde(default)]
    private_ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2State {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Ec2Tag {
    key: String,
    value: String,
}

impl Ec2Instance {
    fn address(&self) -> Option<&str> {
        self.public_dns_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.private_ip_address.as_deref())
            .filter(|s| !s.is_empty())
    }

    fn descriptor(self) -> Result<InstanceDescriptor> {
        let state = self
            .state
            .as_ref()
            .map(|s| s.name.parse::<InstanceState>())
            .transpose()?
            .unwrap_or(InstanceState::Pending);
        Ok(InstanceDescriptor {
            tags: self.tags.into_iter().map(|t| (t.key, t.value)).collect(),
            id: self.instance_id,
            state,
        })
    }
}

/// `--filters` JSON selecting instances by tags and states.
///
/// JSON keeps tag values containing commas as a single value.
fn describe_filters(tags: &TagSet, states: &[InstanceState]) -> Vec<serde_json::Value> {
    let mut filters: Vec<serde_json::Value> = tags
        .iter()
        .map(|(k, v)| json!({ "Name": format!("tag:{k}"), "Values": [v] }))
        .collect();
    if !states.is_empty() {
        let names: Vec<&str> = states.iter().map(InstanceState::as_str).collect();
        filters.push(json!({ "Name": "instance-state-name", "Values": names }));
    }
    filters
}

impl AwsCliProvider {
    /// Create a provider with the given configuration.
    pub fn new(config: AwsCliConfig) -> Self {
        Self { config }
    }

    /// Create a provider from environment variables.
    pub fn from_env() -> Self {
        Self::new(AwsCliConfig::from_env())
    }

    async fn aws(&self, args: Vec<String>) -> Result<CapturedOutput> {
        let output = run_captured(&self.config.aws_bin, &args, None, None).await?;
        Ok(output)
    }

    /// Run an aws command with `--output json` and parse its stdout.
    async fn aws_json<T: DeserializeOwned>(
        &self,
        mut args: Vec<String>,
        on_error: impl FnOnce(String) -> ProviderError,
    ) -> Result<T> {
        args.extend(["--output".to_string(), "json".to_string()]);
        let output = self.aws(args).await?;
        if !output.success() {
            return Err(on_error(output.describe_failure()));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    /// Run an aws query with `--output text` and return the single value.
    async fn aws_text(&self, mut args: Vec<String>) -> Result<Option<String>> {
        args.extend(["--output".to_string(), "text".to_string()]);
        let output = self.aws(args).await?;
        if !output.success() {
            return Err(ProviderError::Provision(output.describe_failure()));
        }
        let value = output.stdout_str().trim().to_string();
        Ok((!value.is_empty() && value != "None").then_some(value))
    }

    async fn resolve_vpc(&self, vpc: &str) -> Result<String> {
        if vpc.starts_with("vpc-") {
            return Ok(vpc.to_string());
        }
        self.aws_text(vec![
            "ec2".into(),
            "describe-vpcs".into(),
            "--filters".into(),
            format!("Name=tag:Name,Values={vpc}"),
            "--query".into(),
            "Vpcs[0].VpcId".into(),
        ])
        .await?
        .ok_or_else(|| ProviderError::Provision(format!("no vpc named {vpc}")))
    }

    async fn resolve_subnet(&self, vpc_id: &str, zone: Option<&str>) -> Result<String> {
        let mut args = vec![
            "ec2".into(),
            "describe-subnets".into(),
            "--filters".into(),
            format!("Name=vpc-id,Values={vpc_id}"),
        ];
        if let Some(zone) = zone {
            args.push(format!("Name=availability-zone,Values={zone}"));
        }
        args.extend(["--query".into(), "Subnets[0].SubnetId".into()]);
        self.aws_text(args).await?.ok_or_else(|| {
            ProviderError::Provision(format!(
                "no subnet in {vpc_id}{}",
                zone.map(|z| format!(" ({z})")).unwrap_or_default()
            ))
        })
    }

    async fn resolve_security_group(&self, sg: &str, vpc_id: &str) -> Result<String> {
        if sg.starts_with("sg-") {
            return Ok(sg.to_string());
        }
        self.aws_text(vec![
            "ec2".into(),
            "describe-security-groups".into(),
            "--filters".into(),
            format!("Name=group-name,Values={sg}"),
            format!("Name=vpc-id,Values={vpc_id}"),
            "--query".into(),
            "SecurityGroups[0].GroupId".into(),
        ])
        .await?
        .ok_or_else(|| ProviderError::Provision(format!("no security group named {sg}")))
    }

    async fn describe(&self, instance_ids: &[String]) -> Result<Vec<Ec2Instance>> {
        let mut args = vec![
            "ec2".to_string(),
            "describe-instances".to_string(),
            "--instance-ids".to_string(),
        ];
        args.extend(instance_ids.iter().cloned());
        let output: DescribeInstancesOutput = self
            .aws_json(args, ProviderError::Listing)
            .await?;
        Ok(output
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .collect())
    }

    async fn ssh(&self, instance_id: &str, command: &RemoteCommand) -> Result<CapturedOutput> {
        let instance = self
            .describe(&[instance_id.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::InstanceNotFound(instance_id.to_string()))?;
        let address = instance.address().ok_or_else(|| ProviderError::RemoteExec {
            instance_id: instance_id.to_string(),
            message: "instance has no address".to_string(),
        })?;

        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectionAttempts={}", self.config.ssh_attempts),
        ];
        if command.is_detached() {
            args.push("-T".to_string());
        }
        args.push(format!("{}@{}", self.config.ssh_user, address));
        args.push(command.to_shell_line());

        Ok(run_captured(&self.config.ssh_bin, &args, None, None).await?)
    }
}

#[async_trait]
impl InstanceProvider for AwsCliProvider {
    fn provider_type(&self) -> &'static str {
        "aws"
    }

    async fn provision(
        &self,
        name: &str,
        count: usize,
        params: &ProvisionParams,
    ) -> Result<Vec<String>> {
        let required = |value: &Option<String>, what: &str| {
            value
                .clone()
                .ok_or_else(|| ProviderError::Provision(format!("missing {what}")))
        };
        let ami = required(&params.ami, "ami")?;
        let instance_type = required(&params.instance_type, "instance type")?;
        let key = required(&params.key, "key pair")?;
        let vpc = required(&params.vpc, "vpc")?;
        let sg = required(&params.sg, "security group")?;

        let vpc_id = self.resolve_vpc(&vpc).await?;
        let subnet_id = self.resolve_subnet(&vpc_id, params.zone.as_deref()).await?;
        let sg_id = self.resolve_security_group(&sg, &vpc_id).await?;

        let block_devices = json!([{
            "DeviceName": "/dev/sda1",
            "Ebs": {
                "VolumeSize": params.gigs,
                "VolumeType": "gp3",
                "DeleteOnTermination": true,
            },
        }]);
        let tag_spec = json!([{
            "ResourceType": "instance",
            "Tags": [{ "Key": NAME_KEY, "Value": name }],
        }]);

        let mut args = vec![
            "ec2".to_string(),
            "run-instances".to_string(),
            "--image-id".to_string(),
            ami,
            "--instance-type".to_string(),
            instance_type,
            "--key-name".to_string(),
            key,
            "--count".to_string(),
            format!("{count}:{count}"),
            "--subnet-id".to_string(),
            subnet_id,
            "--security-group-ids".to_string(),
            sg_id,
            "--block-device-mappings".to_string(),
            block_devices.to_string(),
            "--tag-specifications".to_string(),
            tag_spec.to_string(),
        ];
        if let Some(spot) = &params.spot {
            let market = json!({
                "MarketType": "spot",
                "SpotOptions": { "MaxPrice": spot },
            });
            args.extend(["--instance-market-options".to_string(), market.to_string()]);
        }

        info!(name = %name, count, "Provisioning instances");
        let output: RunInstancesOutput = self.aws_json(args, ProviderError::Provision).await?;
        let ids: Vec<String> = output
            .instances
            .into_iter()
            .map(|i| i.instance_id)
            .collect();
        if ids.len() != count {
            return Err(ProviderError::Provision(format!(
                "requested {count} instances, got {}",
                ids.len()
            )));
        }

        let mut wait_args = vec![
            "ec2".to_string(),
            "wait".to_string(),
            "instance-running".to_string(),
            "--instance-ids".to_string(),
        ];
        wait_args.extend(ids.iter().cloned());
        let waited = self.aws(wait_args).await?;
        if !waited.success() {
            return Err(ProviderError::Provision(format!(
                "waiting for instances: {}",
                waited.describe_failure()
            )));
        }

        info!(instance_ids = ?ids, "Instances running");
        Ok(ids)
    }

    async fn run_remote(&self, instance_id: &str, command: &RemoteCommand) -> Result<()> {
        debug!(
            instance_id = %instance_id,
            detached = command.is_detached(),
            "Running remote command"
        );
        let output = self.ssh(instance_id, command).await?;
        for line in output.stdout_str().lines() {
            info!("{}: {}", instance_id, line);
        }
        if !output.success() {
            return Err(ProviderError::RemoteExec {
                instance_id: instance_id.to_string(),
                message: output.describe_failure(),
            });
        }
        Ok(())
    }

    async fn tag(&self, instance_id: &str, tags: &TagSet) -> Result<()> {
        let tag_list: Vec<_> = tags
            .iter()
            .map(|(k, v)| json!({ "Key": k, "Value": v }))
            .collect();
        let args = vec![
            "ec2".to_string(),
            "create-tags".to_string(),
            "--resources".to_string(),
            instance_id.to_string(),
            "--tags".to_string(),
            serde_json::Value::Array(tag_list).to_string(),
        ];

        let mut last_error = String::new();
        for attempt in 1..=self.config.tag_attempts.max(1) {
            let output = self.aws(args.clone()).await?;
            if output.success() {
                return Ok(());
            }
            last_error = output.describe_failure();
            warn!(
                instance_id = %instance_id,
                attempt,
                error = %last_error,
                "Tagging failed, retrying"
            );
            tokio::time::sleep(self.config.tag_retry_delay).await;
        }
        Err(ProviderError::Tagging {
            instance_id: instance_id.to_string(),
            message: last_error,
        })
    }

    async fn list(
        &self,
        tags: &TagSet,
        states: &[InstanceState],
    ) -> Result<Vec<InstanceDescriptor>> {
        let mut args = vec!["ec2".to_string(), "describe-instances".to_string()];
        let filters = describe_filters(tags, states);
        if !filters.is_empty() {
            args.push("--filters".to_string());
            args.push(serde_json::Value::Array(filters).to_string());
        }
        let output: DescribeInstancesOutput = self.aws_json(args, ProviderError::Listing).await?;
        output
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .map(Ec2Instance::descriptor)
            .collect()
    }
}
