// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for flotilla.
//!
//! Every setting resolves in the same order: explicit value, environment
//! variable, persisted preference, interactive prompt. Prompted answers are
//! written back to the preferences file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::prompt::Prompt;
use crate::provider::{DEFAULT_GIGS, ProvisionParams};

/// Where commands run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Provision instances and run commands on them.
    #[default]
    Remote,
    /// Run every item sequentially on this machine.
    Local,
}

/// Whether missing settings may be prompted for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Interaction {
    /// Prompt for missing settings.
    Interactive,
    /// Fail on missing settings.
    #[default]
    NonInteractive,
}

/// A resolvable setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    /// Bucket receiving manifests and logs.
    Bucket,
    /// Owner prefix under the log root.
    Owner,
    /// Key pair name.
    Key,
    /// Machine image id.
    Ami,
    /// Security group name.
    Sg,
    /// Instance type.
    InstanceType,
    /// VPC name.
    Vpc,
    /// Availability zone.
    Zone,
    /// Spot price.
    Spot,
    /// Primary disk size in GiB.
    Gigs,
}

impl Setting {
    /// Environment variable holding the setting.
    pub fn env_var(self) -> &'static str {
        match self {
            Self::Bucket => "FLOTILLA_BUCKET",
            Self::Owner => "FLOTILLA_OWNER",
            Self::Key => "FLOTILLA_KEY",
            Self::Ami => "FLOTILLA_AMI",
            Self::Sg => "FLOTILLA_SG",
            Self::InstanceType => "FLOTILLA_TYPE",
            Self::Vpc => "FLOTILLA_VPC",
            Self::Zone => "FLOTILLA_ZONE",
            Self::Spot => "FLOTILLA_SPOT",
            Self::Gigs => "FLOTILLA_GIGS",
        }
    }

    /// Key in the preferences file.
    pub fn pref_key(self) -> &'static str {
        match self {
            Self::Bucket => "ec2_logs_bucket",
            Self::Owner => "owner",
            Self::Key => "key",
            Self::Ami => "ami",
            Self::Sg => "sg",
            Self::InstanceType => "type",
            Self::Vpc => "vpc",
            Self::Zone => "zone",
            Self::Spot => "spot",
            Self::Gigs => "gigs",
        }
    }

    fn message(self) -> &'static str {
        match self {
            Self::Bucket => "bucket for ec2_logs",
            Self::Owner => "owner",
            Self::Key => "key pair name",
            Self::Ami => "ami id",
            Self::Sg => "security group name",
            Self::InstanceType => "instance type",
            Self::Vpc => "vpc name",
            Self::Zone => "ec2 availability zone",
            Self::Spot => "spot price",
            Self::Gigs => "gb capacity of primary disk",
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required setting has no value and cannot be prompted for.
    #[error("Missing setting {name}: pass it explicitly, set {env_var}, or run interactively")]
    Missing {
        /// Preference key of the setting.
        name: &'static str,
        /// Environment variable that would provide it.
        env_var: &'static str,
    },

    /// A setting has a value that cannot be parsed.
    #[error("Invalid value for {name}: {value}")]
    InvalidValue {
        /// Preference key of the setting.
        name: &'static str,
        /// Offending value.
        value: String,
    },

    /// A launcher was built without a required component.
    #[error("Launcher is missing {0}")]
    Incomplete(&'static str),

    /// Neither `FLOTILLA_CONFIG_DIR` nor `HOME` is set.
    #[error("Cannot locate the preferences directory")]
    NoConfigDir,

    /// Preferences file I/O failed.
    #[error("Preferences IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Preferences file is not valid JSON.
    #[error("Preferences JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Explicitly provided settings. Unset fields fall through to the next
/// resolution layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Bucket receiving manifests and logs.
    pub bucket: Option<String>,
    /// Owner prefix.
    pub owner: Option<String>,
    /// Key pair name.
    pub key: Option<String>,
    /// Machine image id.
    pub ami: Option<String>,
    /// Security group name.
    pub sg: Option<String>,
    /// Instance type.
    pub instance_type: Option<String>,
    /// VPC name.
    pub vpc: Option<String>,
    /// Availability zone.
    pub zone: Option<String>,
    /// Spot price.
    pub spot: Option<String>,
    /// Primary disk size in GiB.
    pub gigs: Option<u32>,
}

/// Bucket and owner every operation works under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreTarget {
    /// Bucket name.
    pub bucket: String,
    /// Owner prefix.
    pub owner: String,
}

impl LaunchConfig {
    /// Load settings from `FLOTILLA_*` environment variables.
    ///
    /// The owner falls back to `$USER`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let var = |s: Setting| std::env::var(s.env_var()).ok().filter(|v| !v.is_empty());
        let gigs = var(Setting::Gigs)
            .map(|v| parse_gigs(&v))
            .transpose()?;
        Ok(Self {
            bucket: var(Setting::Bucket),
            owner: var(Setting::Owner)
                .or_else(|| std::env::var("USER").ok().filter(|v| !v.is_empty())),
            key: var(Setting::Key),
            ami: var(Setting::Ami),
            sg: var(Setting::Sg),
            instance_type: var(Setting::InstanceType),
            vpc: var(Setting::Vpc),
            zone: var(Setting::Zone),
            spot: var(Setting::Spot),
            gigs,
        })
    }

    /// Fill every unset field of `self` from `fallback`.
    pub fn or(self, fallback: LaunchConfig) -> Self {
        Self {
            bucket: self.bucket.or(fallback.bucket),
            owner: self.owner.or(fallback.owner),
            key: self.key.or(fallback.key),
            ami: self.ami.or(fallback.ami),
            sg: self.sg.or(fallback.sg),
            instance_type: self.instance_type.or(fallback.instance_type),
            vpc: self.vpc.or(fallback.vpc),
            zone: self.zone.or(fallback.zone),
            spot: self.spot.or(fallback.spot),
            gigs: self.gigs.or(fallback.gigs),
        }
    }

    /// Resolve the bucket and owner.
    pub fn resolve_target(
        &self,
        resolver: &mut ConfigResolver<'_>,
    ) -> Result<StoreTarget, ConfigError> {
        Ok(StoreTarget {
            bucket: resolver.required(Setting::Bucket, self.bucket.as_deref())?,
            owner: resolver.required(Setting::Owner, self.owner.as_deref())?,
        })
    }

    /// Resolve provisioning parameters for a new launch.
    ///
    /// Key, image, security group, type and VPC are required; zone, spot
    /// price and disk size are not.
    pub fn resolve_provisioning(
        &self,
        resolver: &mut ConfigResolver<'_>,
    ) -> Result<ProvisionParams, ConfigError> {
        let gigs = resolver
            .optional(Setting::Gigs, self.gigs.map(|g| g.to_string()).as_deref())
            .map(|v| parse_gigs(&v))
            .transpose()?
            .unwrap_or(DEFAULT_GIGS);
        Ok(ProvisionParams {
            spot: resolver.optional(Setting::Spot, self.spot.as_deref()),
            key: Some(resolver.required(Setting::Key, self.key.as_deref())?),
            ami: Some(resolver.required(Setting::Ami, self.ami.as_deref())?),
            sg: Some(resolver.required(Setting::Sg, self.sg.as_deref())?),
            instance_type: Some(
                resolver.required(Setting::InstanceType, self.instance_type.as_deref())?,
            ),
            vpc: Some(resolver.required(Setting::Vpc, self.vpc.as_deref())?),
            zone: resolver.optional(Setting::Zone, self.zone.as_deref()),
            gigs,
        })
    }
}

fn parse_gigs(value: &str) -> Result<u32, ConfigError> {
    value
        .trim()
        .parse()
        .ok()
        .filter(|g| *g > 0)
        .ok_or_else(|| ConfigError::InvalidValue {
            name: Setting::Gigs.pref_key(),
            value: value.to_string(),
        })
}

/// Persisted operator preferences.
#[derive(Debug, Clone, Default)]
pub struct Preferences {
    path: Option<PathBuf>,
    values: BTreeMap<String, String>,
}

impl Preferences {
    /// File name within the configuration directory.
    pub const FILE_NAME: &'static str = "preferences.json";

    /// `$FLOTILLA_CONFIG_DIR/preferences.json`, or
    /// `~/.config/flotilla/preferences.json`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        if let Ok(dir) = std::env::var("FLOTILLA_CONFIG_DIR") {
            return Ok(PathBuf::from(dir).join(Self::FILE_NAME));
        }
        let home = std::env::var("HOME").map_err(|_| ConfigError::NoConfigDir)?;
        Ok(PathBuf::from(home)
            .join(".config")
            .join("flotilla")
            .join(Self::FILE_NAME))
    }

    /// In-memory preferences that are never saved.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load preferences from `path`. A missing file yields empty preferences.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let values = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), count = values.len(), "Loaded preferences");
        Ok(Self {
            path: Some(path.to_path_buf()),
            values,
        })
    }

    /// Look up a preference.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Set a preference in memory.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Write preferences back to their file, creating its directory.
    pub fn save(&self) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(&self.values)?)?;
        Ok(())
    }
}

/// Resolves settings that have no explicit or environment value.
pub struct ConfigResolver<'a> {
    prefs: Preferences,
    prompt: &'a dyn Prompt,
    interaction: Interaction,
}

impl<'a> ConfigResolver<'a> {
    /// Create a resolver.
    pub fn new(prefs: Preferences, prompt: &'a dyn Prompt, interaction: Interaction) -> Self {
        Self {
            prefs,
            prompt,
            interaction,
        }
    }

    /// Resolve a setting without prompting.
    pub fn optional(&self, setting: Setting, value: Option<&str>) -> Option<String> {
        value
            .or_else(|| self.prefs.get(setting.pref_key()))
            .map(str::to_string)
    }

    /// Resolve a setting, prompting for it when interactive.
    pub fn required(
        &mut self,
        setting: Setting,
        value: Option<&str>,
    ) -> Result<String, ConfigError> {
        if let Some(value) = self.optional(setting, value) {
            return Ok(value);
        }
        let missing = ConfigError::Missing {
            name: setting.pref_key(),
            env_var: setting.env_var(),
        };
        if self.interaction == Interaction::NonInteractive {
            return Err(missing);
        }
        let answer = self.prompt.ask(setting.message()).ok_or(missing)?;
        self.prefs.set(setting.pref_key(), answer.clone());
        self.prefs.save()?;
        info!(setting = setting.pref_key(), "Saved preference");
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{NoPrompt, ScriptedPrompt};

    fn full() -> LaunchConfig {
        LaunchConfig {
            bucket: Some("bkt".into()),
            owner: Some("me".into()),
            key: Some("k".into()),
            ami: Some("ami-1".into()),
            sg: Some("sg".into()),
            instance_type: Some("t3.micro".into()),
            vpc: Some("v".into()),
            ..LaunchConfig::default()
        }
    }

    #[test]
    fn test_explicit_wins_over_fallback() {
        let explicit = LaunchConfig {
            bucket: Some("explicit".into()),
            ..LaunchConfig::default()
        };
        let merged = explicit.or(full());
        assert_eq!(merged.bucket.as_deref(), Some("explicit"));
        assert_eq!(merged.owner.as_deref(), Some("me"));
    }

    #[test]
    fn test_non_interactive_missing_setting() {
        let mut resolver =
            ConfigResolver::new(Preferences::in_memory(), &NoPrompt, Interaction::NonInteractive);
        let err = LaunchConfig::default().resolve_target(&mut resolver).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Missing { name: "ec2_logs_bucket", env_var: "FLOTILLA_BUCKET" }
        ));
    }

    #[test]
    fn test_provisioning_defaults() {
        let mut resolver =
            ConfigResolver::new(Preferences::in_memory(), &NoPrompt, Interaction::NonInteractive);
        let params = full().resolve_provisioning(&mut resolver).unwrap();
        assert_eq!(params.gigs, DEFAULT_GIGS);
        assert_eq!(params.zone, None);
        assert_eq!(params.instance_type.as_deref(), Some("t3.micro"));
    }

    #[test]
    fn test_invalid_gigs() {
        assert!(matches!(
            parse_gigs("lots"),
            Err(ConfigError::InvalidValue { name: "gigs", .. })
        ));
        assert!(parse_gigs("0").is_err());
        assert_eq!(parse_gigs(" 20 ").unwrap(), 20);
    }

    #[test]
    fn test_prompted_answer_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(Preferences::FILE_NAME);
        let prompt = ScriptedPrompt::new().with_answer("prompted-bucket");
        {
            let mut resolver = ConfigResolver::new(
                Preferences::load(&path).unwrap(),
                &prompt,
                Interaction::Interactive,
            );
            let value = resolver.required(Setting::Bucket, None).unwrap();
            assert_eq!(value, "prompted-bucket");
        }
        assert_eq!(prompt.asked(), vec!["bucket for ec2_logs"]);

        let prefs = Preferences::load(&path).unwrap();
        assert_eq!(prefs.get("ec2_logs_bucket"), Some("prompted-bucket"));

        let mut resolver = ConfigResolver::new(prefs, &NoPrompt, Interaction::NonInteractive);
        assert_eq!(
            resolver.required(Setting::Bucket, None).unwrap(),
            "prompted-bucket"
        );
    }
}
