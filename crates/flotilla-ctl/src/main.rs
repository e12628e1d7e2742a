// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flotilla Control CLI
//!
//! Launches one instance per arg and tracks the launch.
//!
//! Usage:
//!   flotilla-ctl [global options] <command> [options]
//!
//! Commands:
//!   new <name> --cmd <cmd> [--arg <a>]... [--label <l>]... [--tag k=v]...
//!   from-params <path>            Launch from a manifest JSON file
//!   wait <tag>...                 Wait for a launch, fail unless all done
//!   restart <tag>...              Relaunch labels that did not finish
//!   params <tag>...               Print the manifest of a launch
//!   status <tag>...               Print the status of every label
//!   ls-params                     List manifests
//!   ls-logs                       List launches that left logs
//!   log <tag>...                  Print one log
//!   logs <tag>...                 Print filtered logs

use std::io::{IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use flotilla::blob::S3CliStore;
use flotilla::config::{
    ConfigResolver, ExecutionMode, Interaction, LaunchConfig, Preferences, StoreTarget,
};
use flotilla::logs::{DEFAULT_MAX_CONCURRENCY, LogFilter};
use flotilla::prompt::StdinPrompt;
use flotilla::provider::{AwsCliProvider, ProvisionParams};
use flotilla::{Error, Launcher, NewLaunch, RestartOptions, TagSet};
use tracing::{debug, error, info};

#[derive(Debug, Parser)]
#[command(
    name = "flotilla-ctl",
    version,
    about = "Launch one instance per arg and track the launch"
)]
struct Cli {
    /// S3 bucket for manifests and logs.
    #[arg(long, global = true)]
    bucket: Option<String>,

    /// Owner prefix under ec2_logs/ (defaults to $USER).
    #[arg(long, global = true)]
    owner: Option<String>,

    /// Run every arg sequentially on this machine instead of on instances.
    #[arg(long, global = true, env = "FLOTILLA_RUN_LOCAL")]
    local: bool,

    /// Never prompt; missing settings and confirmations fail.
    #[arg(long, global = true)]
    no_input: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Launch a new batch.
    New(NewArgs),
    /// Launch a new batch from a manifest JSON file.
    FromParams {
        /// Path of the manifest JSON file.
        path: PathBuf,
    },
    /// Wait for all args to finish, and exit 0 only if all logged "exited 0".
    Wait(TagArgs),
    /// Restart any arg which is not running and has not logged "exited 0".
    Restart {
        #[command(flatten)]
        tags: TagArgs,
        /// Shell command transforming the manifest JSON before relaunching.
        #[arg(long = "cmd")]
        transform: Option<String>,
        /// Do not ask for confirmation.
        #[arg(long, short)]
        yes: bool,
        /// Only restart failed and missing labels.
        #[arg(long)]
        only_failed: bool,
    },
    /// Print the manifest of a launch.
    Params(TagArgs),
    /// Show all labels and their state, ie running|done|failed|missing.
    Status(TagArgs),
    /// List manifests, newest first.
    LsParams,
    /// List launches that left logs.
    LsLogs {
        /// Print only the first line of every launch.
        #[arg(long)]
        name_only: bool,
    },
    /// Print one log.
    Log {
        #[command(flatten)]
        tags: TagArgs,
        /// Index into the matching logs, negative counts from the end.
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        index: isize,
        /// Read nohup.out.tail instead of nohup.out.
        #[arg(long)]
        tail_only: bool,
    },
    /// Print every matching log, filtered.
    Logs {
        #[command(flatten)]
        tags: TagArgs,
        /// Shell command each log is piped through (default: last line).
        #[arg(long)]
        cmd: Option<String>,
        /// Maximum number of concurrent fetches.
        #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENCY)]
        max_threads: usize,
        /// Read nohup.out.tail instead of nohup.out.
        #[arg(long)]
        tail_only: bool,
    },
}

#[derive(Debug, Args)]
struct TagArgs {
    /// Tags as key=value, at least one of them launch=<id> where needed.
    #[arg(required = true)]
    tags: Vec<String>,
}

impl TagArgs {
    fn parse(&self) -> flotilla::Result<TagSet> {
        TagSet::parse(&self.tags)
    }
}

#[derive(Debug, Args)]
struct NewArgs {
    /// Name of all instances.
    name: String,
    /// One instance per arg, substituted for %(arg)s in cmd and pre_cmd.
    #[arg(long = "arg")]
    args: Vec<String>,
    /// One label per arg, used as the label tag; defaults to the arg.
    #[arg(long = "label")]
    labels: Vec<String>,
    /// Command run before cmd is backgrounded, or a file containing it.
    #[arg(long)]
    pre_cmd: Option<String>,
    /// Command run in the background, or a file containing it.
    #[arg(long)]
    cmd: String,
    /// Tag to set as key=value.
    #[arg(long = "tag")]
    tags: Vec<String>,
    /// Stop instances instead of terminating them when done.
    #[arg(long)]
    no_rm: bool,
    /// Spot price to bid.
    #[arg(long)]
    spot: Option<String>,
    /// Key pair name.
    #[arg(long)]
    key: Option<String>,
    /// AMI id.
    #[arg(long)]
    ami: Option<String>,
    /// Security group name.
    #[arg(long)]
    sg: Option<String>,
    /// Instance type.
    #[arg(long = "type")]
    instance_type: Option<String>,
    /// VPC name.
    #[arg(long)]
    vpc: Option<String>,
    /// EC2 availability zone.
    #[arg(long)]
    zone: Option<String>,
    /// GiB capacity of the primary disk.
    #[arg(long)]
    gigs: Option<u32>,
}

impl NewArgs {
    fn explicit_config(&self) -> LaunchConfig {
        LaunchConfig {
            spot: self.spot.clone(),
            key: self.key.clone(),
            ami: self.ami.clone(),
            sg: self.sg.clone(),
            instance_type: self.instance_type.clone(),
            vpc: self.vpc.clone(),
            zone: self.zone.clone(),
            gigs: self.gigs,
            ..LaunchConfig::default()
        }
    }

    fn into_request(self, provisioning: ProvisionParams) -> NewLaunch {
        let mut request = NewLaunch::new(self.name, self.cmd)
            .args(self.args)
            .labels(self.labels)
            .no_rm(self.no_rm)
            .provisioning(provisioning);
        request.pre_cmd = self.pre_cmd;
        request.tags = self.tags;
        request
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flotilla=info,flotilla_ctl=info".into()),
        )
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .init();
}

struct Session {
    launcher: Launcher,
    provisioning: ProvisionParams,
}

fn build_session(cli: &Cli) -> anyhow::Result<Session> {
    let interaction = if cli.no_input || !std::io::stdin().is_terminal() {
        Interaction::NonInteractive
    } else {
        Interaction::Interactive
    };
    let mode = if cli.local {
        ExecutionMode::Local
    } else {
        ExecutionMode::Remote
    };

    let explicit = match &cli.command {
        Command::New(args) => args.explicit_config(),
        _ => LaunchConfig::default(),
    };
    let config = LaunchConfig {
        bucket: cli.bucket.clone(),
        owner: cli.owner.clone(),
        ..explicit
    }
    .or(LaunchConfig::from_env()?);

    let prompt = Arc::new(StdinPrompt);
    let prefs = Preferences::load(Preferences::default_path()?)?;
    let mut resolver = ConfigResolver::new(prefs, prompt.as_ref(), interaction);
    let target: StoreTarget = config.resolve_target(&mut resolver)?;
    let provisioning = match (&cli.command, mode) {
        (Command::New(_), ExecutionMode::Remote) => config.resolve_provisioning(&mut resolver)?,
        _ => ProvisionParams::default(),
    };
    debug!(bucket = %target.bucket, owner = %target.owner, ?mode, "Resolved configuration");

    let launcher = Launcher::builder()
        .provider(Arc::new(AwsCliProvider::from_env()))
        .store(Arc::new(S3CliStore::from_env()))
        .target(target)
        .prompt(prompt)
        .mode(mode)
        .interaction(interaction)
        .max_log_concurrency(match &cli.command {
            Command::Logs { max_threads, .. } => *max_threads,
            _ => DEFAULT_MAX_CONCURRENCY,
        })
        .build()?;
    Ok(Session {
        launcher,
        provisioning,
    })
}

fn print_launch(report: flotilla::LaunchReport) -> anyhow::Result<ExitCode> {
    println!("{}", report.launch_tag());
    report.into_result()?;
    Ok(ExitCode::SUCCESS)
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let Session {
        launcher,
        provisioning,
    } = build_session(&cli)?;

    match cli.command {
        Command::New(args) => {
            let report = launcher.new_launch(args.into_request(provisioning)).await?;
            print_launch(report)
        }
        Command::FromParams { path } => {
            let report = launcher.from_params(&path).await?;
            print_launch(report)
        }
        Command::Wait(tags) => {
            let entries = launcher.wait(&tags.parse()?).await?;
            for entry in entries {
                println!("{entry}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Restart {
            tags,
            transform,
            yes,
            only_failed,
        } => {
            let options = RestartOptions {
                transform,
                yes,
                only_failed,
            };
            match launcher.restart(&tags.parse()?, &options).await? {
                Some(report) => print_launch(report),
                None => Ok(ExitCode::SUCCESS),
            }
        }
        Command::Params(tags) => {
            println!("{}", launcher.params(&tags.parse()?).await?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Status(tags) => {
            for entry in launcher.status(&tags.parse()?).await? {
                println!("{entry}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::LsParams => {
            for listing in launcher.ls_params().await? {
                println!("{}", listing.to_line());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::LsLogs { name_only } => {
            for launch in launcher.ls_logs().await? {
                let text = launch.to_string();
                if name_only {
                    println!("{}", text.lines().next().unwrap_or_default());
                } else {
                    println!("{text}");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Log {
            tags,
            index,
            tail_only,
        } => {
            let content = launcher.log(&tags.parse()?, index, tail_only).await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&content)?;
            stdout.flush()?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Logs {
            tags,
            cmd,
            tail_only,
            ..
        } => {
            let filter = cmd.map(LogFilter::Shell).unwrap_or_default();
            for record in launcher.logs(&tags.parse()?, &filter, tail_only).await? {
                println!("{record}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    if let Err(e) = dotenvy::dotenv() {
        debug!("No .env file loaded: {}", e);
    }

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            if let Some(Error::Aborted) = e.downcast_ref::<Error>() {
                info!("Aborted");
            } else {
                error!("{e:#}");
            }
            ExitCode::FAILURE
        }
    }
}
