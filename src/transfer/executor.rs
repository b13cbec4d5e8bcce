//! Runs rsync and turns its exit code and `--stats` output into a structured
//! outcome.
//!
//! # Timeouts
//!
//! Each transfer is bounded. When the bound elapses the child gets SIGTERM,
//! then SIGKILL after the grace period.
//!
//! # Passwords
//!
//! Passwords never appear on the command line. A private askpass helper is
//! written to a temp file and ssh reads the secret from the child's
//! environment through `SSH_ASKPASS`.

use std::future::Future;
use std::io::Write;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use super::command::CommandSpec;
use crate::process::terminate_gracefully;

/// Environment variable the askpass helper reads the password from.
pub const ASKPASS_SECRET_ENV: &str = "RMSYNC_ASKPASS_SECRET";

/// Named rsync exit conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitCondition {
    SyntaxError,
    ProtocolIncompatible,
    FileSelection,
    ActionNotSupported,
    ClientServerStartup,
    DaemonLog,
    SocketIo,
    FileIo,
    ProtocolStream,
    Diagnostics,
    Ipc,
    Interrupted,
    Waitpid,
    OutOfMemory,
    PartialTransfer,
    VanishedSource,
    MaxDelete,
    Timeout,
    DaemonTimeout,
    RemoteShell,
    /// Killed by us after the transfer timeout elapsed.
    TimedOut,
    /// Terminated by a signal we did not send.
    Signaled,
    Unknown(i32),
}

impl ExitCondition {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::SyntaxError,
            2 => Self::ProtocolIncompatible,
            3 => Self::FileSelection,
            4 => Self::ActionNotSupported,
            5 => Self::ClientServerStartup,
            6 => Self::DaemonLog,
            10 => Self::SocketIo,
            11 => Self::FileIo,
            12 => Self::ProtocolStream,
            13 => Self::Diagnostics,
            14 => Self::Ipc,
            20 => Self::Interrupted,
            21 => Self::Waitpid,
            22 => Self::OutOfMemory,
            23 => Self::PartialTransfer,
            24 => Self::VanishedSource,
            25 => Self::MaxDelete,
            30 => Self::Timeout,
            35 => Self::DaemonTimeout,
            255 => Self::RemoteShell,
            other => Self::Unknown(other),
        }
    }

    /// Partial-transfer, timeout and transport-class failures are retried;
    /// syntax, permission and capability failures are not.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::ClientServerStartup
                | Self::SocketIo
                | Self::FileIo
                | Self::ProtocolStream
                | Self::Ipc
                | Self::Interrupted
                | Self::Waitpid
                | Self::PartialTransfer
                | Self::VanishedSource
                | Self::Timeout
                | Self::DaemonTimeout
                | Self::RemoteShell
                | Self::TimedOut
                | Self::Signaled
        )
    }

    pub fn description(self) -> String {
        match self {
            Self::SyntaxError => "syntax or usage error".into(),
            Self::ProtocolIncompatible => "protocol incompatibility".into(),
            Self::FileSelection => "errors selecting input/output files or directories".into(),
            Self::ActionNotSupported => "requested action not supported".into(),
            Self::ClientServerStartup => "error starting client-server protocol".into(),
            Self::DaemonLog => "daemon unable to append to log file".into(),
            Self::SocketIo => "error in socket I/O".into(),
            Self::FileIo => "error in file I/O".into(),
            Self::ProtocolStream => "error in rsync protocol data stream".into(),
            Self::Diagnostics => "errors with program diagnostics".into(),
            Self::Ipc => "error in IPC code".into(),
            Self::Interrupted => "received SIGUSR1 or SIGINT".into(),
            Self::Waitpid => "some error returned by waitpid()".into(),
            Self::OutOfMemory => "error allocating core memory buffers".into(),
            Self::PartialTransfer => "partial transfer due to error".into(),
            Self::VanishedSource => "partial transfer due to vanished source files".into(),
            Self::MaxDelete => "skipped some deletes due to --max-delete limit".into(),
            Self::Timeout => "timeout in data send/receive".into(),
            Self::DaemonTimeout => "timeout waiting for daemon connection".into(),
            Self::RemoteShell => "remote shell (ssh) failed".into(),
            Self::TimedOut => "transfer timed out".into(),
            Self::Signaled => "terminated by signal".into(),
            Self::Unknown(code) => format!("unknown exit code {code}"),
        }
    }
}

/// Raw result of running the transfer tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl TransferOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// `None` on success.
    pub fn condition(&self) -> Option<ExitCondition> {
        if self.timed_out {
            return Some(ExitCondition::TimedOut);
        }
        match self.exit_code {
            Some(0) => None,
            Some(code) => Some(ExitCondition::from_code(code)),
            None => Some(ExitCondition::Signaled),
        }
    }

    pub fn stats(&self) -> TransferStats {
        parse_rsync_stats(&self.stdout)
    }

    /// Operator-facing failure text, or `None` on success.
    pub fn failure_message(&self) -> Option<String> {
        let condition = self.condition()?;
        let stderr = self.stderr.trim();
        let detail = if stderr.contains("Permission denied") {
            format!("permission denied: {}", last_line(stderr))
        } else if stderr.contains("Connection refused") || stderr.contains("Connection timed out") {
            format!("SSH connection failed: {}", last_line(stderr))
        } else if stderr.is_empty() {
            String::new()
        } else {
            last_line(stderr).to_string()
        };

        let code = match self.exit_code {
            Some(code) => format!(" (exit {code})"),
            None => String::new(),
        };
        if detail.is_empty() {
            Some(format!("rsync failed: {}{code}", condition.description()))
        } else {
            Some(format!("rsync failed: {}{code}: {detail}", condition.description()))
        }
    }
}

fn last_line(text: &str) -> &str {
    text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or(text).trim()
}

/// Statistics parsed from rsync --stats output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub files_transferred: u64,
    pub bytes_transferred: u64,
}

/// Parse transfer statistics from rsync --stats output. Missing fields are 0.
pub fn parse_rsync_stats(output: &str) -> TransferStats {
    let mut stats = TransferStats::default();

    for line in output.lines() {
        let line = line.trim();

        // "Number of regular files transferred: N" (3.x) or
        // "Number of files transferred: N" (2.x)
        if (line.starts_with("Number of regular files transferred:")
            || line.starts_with("Number of files transferred:"))
            && let Some(num_str) = line.split(':').nth(1)
        {
            stats.files_transferred = leading_number(num_str);
        }

        // "Total transferred file size: 1,234 bytes"
        if line.starts_with("Total transferred file size:")
            && let Some(size_part) = line.split(':').nth(1)
        {
            stats.bytes_transferred = leading_number(size_part);
        }
    }

    stats
}

fn leading_number(text: &str) -> u64 {
    text.split_whitespace()
        .next()
        .unwrap_or("0")
        .replace(',', "")
        .parse()
        .unwrap_or(0)
}

/// Runs transfer commands. The orchestrator is generic over this so tests can
/// script outcomes.
pub trait TransferRunner: Send + Sync {
    fn execute(
        &self,
        spec: &CommandSpec,
        password: Option<&str>,
        timeout: Duration,
    ) -> impl Future<Output = std::io::Result<TransferOutcome>> + Send;
}

/// Runs the transfer tool as a child process.
#[derive(Debug, Clone)]
pub struct TransferExecutor {
    kill_grace: Duration,
}

impl Default for TransferExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl TransferExecutor {
    pub fn new(kill_grace: Duration) -> Self {
        Self { kill_grace }
    }

    async fn run(
        &self,
        spec: &CommandSpec,
        password: Option<&str>,
        timeout: Duration,
    ) -> std::io::Result<TransferOutcome> {
        let start = Instant::now();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Held until the child exits; dropping removes the helper.
        let _askpass = match password {
            Some(secret) => {
                let helper = write_askpass_helper()?;
                cmd.env("SSH_ASKPASS", &helper)
                    .env("SSH_ASKPASS_REQUIRE", "force")
                    .env(ASKPASS_SECRET_ENV, secret);
                if std::env::var_os("DISPLAY").is_none() {
                    cmd.env("DISPLAY", ":0");
                }
                Some(helper)
            }
            None => None,
        };

        tracing::debug!(command = %spec.display(), "starting transfer");
        let mut child = cmd.spawn()?;

        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    tracing::warn!(error = %e, "failed writing file list to transfer stdin");
                }
            });
        }

        let stdout_task = tokio::spawn(read_lossy(child.stdout.take(), "stdout"));
        let stderr_task = tokio::spawn(read_lossy(child.stderr.take(), "stderr"));

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => (status?.code(), false),
            Err(_) => {
                tracing::warn!(
                    timeout_secs = timeout.as_secs(),
                    "transfer timed out; terminating"
                );
                terminate_gracefully(&mut child, self.kill_grace).await;
                (None, true)
            }
        };

        let stdout = collect(stdout_task, self.kill_grace).await;
        let stderr = collect(stderr_task, self.kill_grace).await;

        let outcome = TransferOutcome {
            exit_code,
            stdout,
            stderr,
            timed_out,
            duration: start.elapsed(),
        };

        if outcome.success() {
            let stats = outcome.stats();
            tracing::info!(
                files = stats.files_transferred,
                bytes = stats.bytes_transferred,
                duration_ms = outcome.duration.as_millis() as u64,
                "transfer completed"
            );
        } else {
            tracing::warn!(
                exit_code = ?outcome.exit_code,
                timed_out,
                error = %outcome.failure_message().unwrap_or_default(),
                "transfer failed"
            );
        }
        Ok(outcome)
    }
}

impl TransferRunner for TransferExecutor {
    fn execute(
        &self,
        spec: &CommandSpec,
        password: Option<&str>,
        timeout: Duration,
    ) -> impl Future<Output = std::io::Result<TransferOutcome>> + Send {
        self.run(spec, password, timeout)
    }
}

/// Read a pipe to EOF. Output is decoded lossily so a non-UTF-8 file name
/// in rsync's listing cannot cost the rest of the stream.
async fn read_lossy<R: AsyncRead + Unpin>(pipe: Option<R>, stream: &'static str) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    if let Err(e) = pipe.read_to_end(&mut buf).await {
        tracing::warn!(stream, error = %e, "failed reading transfer output");
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn collect(task: tokio::task::JoinHandle<String>, grace: Duration) -> String {
    match tokio::time::timeout(grace, task).await {
        Ok(Ok(text)) => text,
        _ => String::new(),
    }
}

/// Write a private helper script that prints the askpass secret.
fn write_askpass_helper() -> std::io::Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("rmsync-askpass-")
        .suffix(".sh")
        .tempfile()?;
    writeln!(file, "#!/bin/sh")?;
    writeln!(file, "printf '%s\\n' \"${ASKPASS_SECRET_ENV}\"")?;
    file.flush()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o700))?;
    }

    // Closing the handle before exec avoids ETXTBSY.
    Ok(file.into_temp_path())
}
