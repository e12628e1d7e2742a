// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed construction of the shell commands sent to instances.
//!
//! Every value that does not come from the operator's own command text
//! (args, labels, tags, bucket, owner, date) reaches the remote shell only
//! through [`shell_words::quote`].

use std::fmt;

use chrono::{DateTime, Utc};

use crate::blob::BlobPath;
use crate::layout::{self, LOG_FILE, TAIL_FILE, TAIL_LINES};
use crate::tags::TagSet;

/// Placeholder replaced by the item's arg in `cmd` and `pre_cmd`.
pub const ARG_PLACEHOLDER: &str = "%(arg)s";

/// Substitute `arg`, shell-quoted, for every [`ARG_PLACEHOLDER`] in `template`.
pub fn substitute(template: &str, arg: &str) -> String {
    template.replace(ARG_PLACEHOLDER, &shell_words::quote(arg))
}

/// How a remote command is attached to the SSH session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteMode {
    /// Run in the session and wait for it to finish.
    Foreground,
    /// Start in the background, detached from the session.
    Detached,
}

/// A command to run on an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    script: String,
    mode: RemoteMode,
}

impl RemoteCommand {
    /// A command run in the foreground.
    pub fn foreground(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            mode: RemoteMode::Foreground,
        }
    }

    /// A command started detached from the session.
    pub fn detached(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            mode: RemoteMode::Detached,
        }
    }

    /// The script body.
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Attachment mode.
    pub fn mode(&self) -> RemoteMode {
        self.mode
    }

    /// Whether the command is detached.
    pub fn is_detached(&self) -> bool {
        self.mode == RemoteMode::Detached
    }

    /// Line handed to the remote login shell.
    ///
    /// Detached commands survive the session closing, write stdout and
    /// stderr to `~/nohup.out` and read nothing from stdin.
    pub fn to_shell_line(&self) -> String {
        match self.mode {
            RemoteMode::Foreground => self.script.clone(),
            RemoteMode::Detached => format!(
                "cd ~ && nohup sh -c {} >{LOG_FILE} 2>&1 </dev/null &",
                shell_words::quote(&self.script)
            ),
        }
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell_line())
    }
}

/// What the instance does once the job finished and logs are uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Terminate the instance.
    Terminate,
    /// Halt (stop) the instance, keeping its disk.
    Halt,
}

impl ExitAction {
    /// `Halt` when `no_rm`, otherwise `Terminate`.
    pub fn from_no_rm(no_rm: bool) -> Self {
        if no_rm { Self::Halt } else { Self::Terminate }
    }

    fn script(self) -> &'static str {
        match self {
            Self::Halt => "sudo halt",
            Self::Terminate => {
                "aws ec2 terminate-instances --instance-ids \"$(curl -s http://169.254.169.254/latest/meta-data/instance-id/ 2>/dev/null)\""
            }
        }
    }
}

/// Builder for the background job run on each instance.
#[derive(Debug, Clone)]
pub struct BackgroundJob {
    command: String,
    log_dir: BlobPath,
    exit_action: ExitAction,
}

impl BackgroundJob {
    /// Create a job for an already substituted `command`.
    pub fn new(command: impl Into<String>, log_dir: BlobPath) -> Self {
        Self {
            command: command.into(),
            log_dir,
            exit_action: ExitAction::Terminate,
        }
    }

    /// Create a job whose logs go to the standard log directory for `tags`.
    pub fn for_item(
        command: impl Into<String>,
        bucket: &str,
        owner: &str,
        date: DateTime<Utc>,
        tags: &TagSet,
    ) -> Self {
        Self::new(command, layout::log_dir(bucket, owner, date, tags))
    }

    /// Set the exit action.
    pub fn with_exit_action(mut self, action: ExitAction) -> Self {
        self.exit_action = action;
        self
    }

    /// Log directory receiving `nohup.out` and `nohup.out.tail`.
    pub fn log_dir(&self) -> &BlobPath {
        &self.log_dir
    }

    /// Render the job script.
    ///
    /// The last line of `nohup.out` is always `exited <code>`, which is what
    /// status reconciliation reads back from the tail log.
    pub fn render(&self) -> String {
        let command = shell_words::quote(&self.command);
        let log_path = format!("{}/{LOG_FILE}", self.log_dir);
        let tail_path = format!("{}/{TAIL_FILE}", self.log_dir);
        let log = shell_words::quote(&log_path);
        let tail = shell_words::quote(&tail_path);
        [
            format!("echo {command}"),
            format!("sh -c {command}"),
            "echo exited $?".to_string(),
            format!("aws s3 cp ~/{LOG_FILE} {log} >/dev/null 2>&1"),
            format!("tail -n {TAIL_LINES} ~/{LOG_FILE} > ~/{TAIL_FILE}"),
            format!("aws s3 cp ~/{TAIL_FILE} {tail} >/dev/null 2>&1"),
            self.exit_action.script().to_string(),
        ]
        .join("\n")
    }

    /// The detached remote command starting this job.
    pub fn into_remote(self) -> RemoteCommand {
        RemoteCommand::detached(self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn job(no_rm: bool) -> BackgroundJob {
        let date = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let tags = TagSet::parse(["launch=L", "label=a"]).unwrap();
        BackgroundJob::for_item("echo 'a'", "bkt", "me", date, &tags)
            .with_exit_action(ExitAction::from_no_rm(no_rm))
    }

    #[test]
    fn test_substitute_quotes_arg() {
        assert_eq!(substitute("echo %(arg)s", "a"), "echo a");
        assert_eq!(
            substitute("run %(arg)s %(arg)s", "x; rm -rf /"),
            "run 'x; rm -rf /' 'x; rm -rf /'"
        );
        assert_eq!(substitute("no placeholder", "a"), "no placeholder");
    }

    #[test]
    fn test_render_orders_steps() {
        let script = job(false).render();
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "echo 'echo '\\''a'\\'''");
        assert_eq!(lines[2], "echo exited $?");
        assert!(
            lines[3].contains("s3://bkt/ec2_logs/me/2024-01-02T03:04:05Z_label=a,launch=L/nohup.out")
        );
        assert!(lines[4].starts_with("tail -n 1000"));
        assert!(lines[5].contains("nohup.out.tail"));
        assert!(lines[6].starts_with("aws ec2 terminate-instances"));
    }

    #[test]
    fn test_render_quotes_log_paths() {
        let job = BackgroundJob::new("true", BlobPath::new("my bkt", "logs/run 1"));
        let script = job.render();
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(
            lines[3],
            "aws s3 cp ~/nohup.out 's3://my bkt/logs/run 1/nohup.out' >/dev/null 2>&1"
        );
        assert_eq!(
            lines[5],
            "aws s3 cp ~/nohup.out.tail 's3://my bkt/logs/run 1/nohup.out.tail' >/dev/null 2>&1"
        );
    }

    #[test]
    fn test_no_rm_halts() {
        let script = job(true).render();
        assert_eq!(script.lines().last(), Some("sudo halt"));
    }

    #[test]
    fn test_detached_line() {
        let remote = job(false).into_remote();
        assert!(remote.is_detached());
        let line = remote.to_shell_line();
        assert!(line.starts_with("cd ~ && nohup sh -c '"));
        assert!(line.ends_with(">nohup.out 2>&1 </dev/null &"));
    }

    #[test]
    fn test_foreground_line_is_script() {
        let remote = RemoteCommand::foreground("uname -a");
        assert!(!remote.is_detached());
        assert_eq!(remote.to_shell_line(), "uname -a");
    }
}
