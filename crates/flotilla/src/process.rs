// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Child process helpers shared by the CLI-backed adapters.

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::trace;

/// Captured output of a finished child process.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    /// Standard output.
    pub stdout: Vec<u8>,
    /// Standard error.
    pub stderr: Vec<u8>,
}

impl CapturedOutput {
    /// Whether the process exited with code 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Standard output as lossy UTF-8.
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error as lossy UTF-8, trimmed.
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Short description of a failed run for error messages.
    pub fn describe_failure(&self) -> String {
        let code = self
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let stderr = self.stderr_str();
        if stderr.is_empty() {
            format!("exit {code}")
        } else {
            format!("exit {code}: {stderr}")
        }
    }
}

/// Run `program args..`, optionally feeding `stdin`, and capture its output.
pub async fn run_captured(
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
    cwd: Option<&Path>,
) -> std::io::Result<CapturedOutput> {
    trace!(program = %program, args = ?args, "spawn");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn()?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let input = input.to_vec();
        // stdin must be fed while stdout is drained below.
        tokio::spawn(async move {
            let _ = pipe.write_all(&input).await;
            let _ = pipe.shutdown().await;
        });
    }

    let output = child.wait_with_output().await?;
    Ok(CapturedOutput {
        code: output.status.code(),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Run a shell snippet with `sh -c`.
pub async fn run_shell(
    script: &str,
    stdin: Option<&[u8]>,
    cwd: Option<&Path>,
) -> std::io::Result<CapturedOutput> {
    run_captured("sh", &["-c".to_string(), script.to_string()], stdin, cwd).await
}
