//! rsync invocations for full, incremental, dry-run and pull transfers.
//!
//! Everything here is pure: a profile (plus a file list for incremental
//! jobs) goes in, a [`CommandSpec`] comes out. Values are passed as discrete
//! arguments and never through a shell.
//!
//! Local is authoritative, so full syncs run with `--delete`. Pulls never
//! delete.

use crate::config::Profile;

use super::job::{SyncJob, SyncStrategy};

pub const DEFAULT_TRANSFER_PROGRAM: &str = "rsync";

/// Ends option parsing so neither path can be read as a flag.
const END_OF_OPTIONS: &str = "--";

/// Program, arguments and optional stdin payload for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl CommandSpec {
    /// Whether `flag` appears as a standalone argument.
    pub fn has_arg(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }

    /// Arguments before the `--` that precedes the source/destination pair.
    pub fn flags(&self) -> &[String] {
        let end = self
            .args
            .iter()
            .rposition(|a| a == END_OF_OPTIONS)
            .unwrap_or(self.args.len());
        &self.args[..end]
    }

    /// For logs only; the process is never started through a shell.
    pub fn display(&self) -> String {
        let mut words = vec![self.program.clone()];
        words.extend(self.args.iter().cloned());
        shell_words::join(words)
    }
}

/// Builds rsync invocations for a profile.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: String,
    connect_timeout_secs: u64,
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_TRANSFER_PROGRAM)
    }
}

impl CommandBuilder {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            connect_timeout_secs: 10,
        }
    }

    pub fn with_connect_timeout(mut self, seconds: u64) -> Self {
        self.connect_timeout_secs = seconds;
        self
    }

    /// Mirror the whole local tree, deleting remote entries absent locally.
    pub fn full(&self, profile: &Profile) -> CommandSpec {
        let mut args = vec!["-az".to_string(), "--delete".to_string()];
        args.extend(self.common_args(profile));
        push_endpoints(&mut args, local_source(profile), remote_destination(profile));
        self.spec(args, None)
    }

    /// Transfer only `files` (relative to the local root), read by rsync from
    /// stdin. Paths missing locally are deleted remotely. An empty list falls
    /// back to [`full`](Self::full).
    ///
    /// `--files-from` switches off the recursion `-a` implies, so `-r` is
    /// given explicitly: a directory moved into the tree arrives with its
    /// contents.
    pub fn incremental(&self, profile: &Profile, files: &[String]) -> CommandSpec {
        if files.is_empty() {
            return self.full(profile);
        }

        let mut args = vec!["-az".to_string(), "-r".to_string()];
        args.extend(self.common_args(profile));
        args.push("--files-from=-".to_string());
        args.push("--delete-missing-args".to_string());
        push_endpoints(&mut args, local_source(profile), remote_destination(profile));

        let mut list = files.join("\n");
        list.push('\n');
        self.spec(args, Some(list))
    }

    /// Full-sync arguments plus a non-destructive preview.
    pub fn dry_run(&self, profile: &Profile) -> CommandSpec {
        let mut spec = self.full(profile);
        let insert_at = spec.flags().len();
        spec.args
            .splice(insert_at..insert_at, ["--dry-run".to_string(), "--verbose".to_string()]);
        spec
    }

    /// Manual remote-to-local copy. Never deletes local files.
    pub fn pull(&self, profile: &Profile) -> CommandSpec {
        let mut args = vec!["-az".to_string()];
        args.extend(self.common_args(profile));
        push_endpoints(&mut args, remote_destination(profile), local_source(profile));
        self.spec(args, None)
    }

    /// Command for `job` using the strategy the selector picks for it.
    pub fn for_job(&self, job: &SyncJob) -> CommandSpec {
        match select_strategy(job) {
            SyncStrategy::Incremental => self.incremental(&job.profile, &job.files),
            SyncStrategy::Full => self.full(&job.profile),
        }
    }

    /// `--stats`, `--protect-args`, exclude pairs and the remote shell.
    fn common_args(&self, profile: &Profile) -> Vec<String> {
        let mut args = vec!["--stats".to_string(), "--protect-args".to_string()];
        for pattern in &profile.exclude {
            args.push("--exclude".to_string());
            args.push(pattern.clone());
        }
        args.push("-e".to_string());
        args.push(self.remote_shell(profile));
        args
    }

    /// The `-e` value. rsync splits it itself, so paths are quoted.
    fn remote_shell(&self, profile: &Profile) -> String {
        let mut words = vec![
            "ssh".to_string(),
            "-p".to_string(),
            profile.ssh_port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ];
        if let Some(key) = &profile.identity_file {
            words.push("-i".to_string());
            words.push(key.to_string_lossy().into_owned());
        }
        shell_words::join(words)
    }

    fn spec(&self, args: Vec<String>, stdin: Option<String>) -> CommandSpec {
        CommandSpec {
            program: self.program.clone(),
            args,
            stdin,
        }
    }
}

fn push_endpoints(args: &mut Vec<String>, source: String, destination: String) {
    args.push(END_OF_OPTIONS.to_string());
    args.push(source);
    args.push(destination);
}

/// `localDir/` with exactly one trailing separator so rsync copies contents.
pub fn local_source(profile: &Profile) -> String {
    let local = profile.local_dir.to_string_lossy();
    format!("{}/", local.trim_end_matches('/'))
}

/// `user@host:remoteDir/`.
pub fn remote_destination(profile: &Profile) -> String {
    format!(
        "{}:{}/",
        profile.destination_host(),
        profile.remote_dir.trim_end_matches('/')
    )
}

/// Strategies in preference order. `Full` handles every job, so selection
/// always succeeds.
pub const STRATEGY_PREFERENCE: [SyncStrategy; 2] = [SyncStrategy::Incremental, SyncStrategy::Full];

impl SyncStrategy {
    pub fn can_handle(self, job: &SyncJob) -> bool {
        match self {
            SyncStrategy::Incremental => {
                job.strategy == SyncStrategy::Incremental && !job.files.is_empty()
            }
            SyncStrategy::Full => true,
        }
    }
}

/// Pick incremental for a non-empty incremental request, full otherwise.
pub fn select_strategy(job: &SyncJob) -> SyncStrategy {
    STRATEGY_PREFERENCE
        .into_iter()
        .find(|strategy| strategy.can_handle(job))
        .unwrap_or(SyncStrategy::Full)
}
