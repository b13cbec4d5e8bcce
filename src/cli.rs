//! Command-line surface for `rmsync`.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use directories::ProjectDirs;

use crate::config::{EngineSettings, Profile, Settings};
use crate::credentials::{
    CredentialStore, FileSecretBackend, NoPrompt, PasswordPrompt, TerminalPrompt, confirm_action,
    confirm_with_details,
};
use crate::orchestrator::{EventReceiver, Orchestrator, OrchestratorEvent};
use crate::remote::{Auth, RemoteShell, SshRemote};
use crate::transfer::{CommandBuilder, CommandSpec, TransferExecutor, TransferOutcome, TransferRunner};
use crate::watch::InotifyLauncher;

pub const CREDENTIALS_ENV: &str = "RMSYNC_CREDENTIALS";

#[derive(Parser, Debug)]
#[command(name = "rmsync", version)]
#[command(about = "Mirror a local directory to a remote host over rsync/SSH")]
pub struct Cli {
    /// Config file (defaults to $RMSYNC_CONFIG, then the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `remote_mirror_sync=trace`
    #[arg(long, global = true, env = "RMSYNC_LOG")]
    pub log_level: Option<String>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Password store file
    #[arg(long, global = true, env = CREDENTIALS_ENV)]
    pub credentials_file: Option<PathBuf>,

    /// Never prompt; fail instead when a password is needed
    #[arg(long, global = true)]
    pub no_prompt: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List configured profiles
    Profiles,
    /// Full sync, then mirror every local change until Ctrl-C
    Watch {
        /// Profile alias (defaults to auto_start)
        alias: Option<String>,
    },
    /// One full sync, no watching
    Sync { alias: String },
    /// Preview what a full sync would change
    DryRun { alias: String },
    /// Copy remote files into the local directory (never deletes)
    Pull {
        alias: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Check that the remote host accepts a connection
    Test { alias: String },
    /// Check connection, remote directory and write permission
    Validate { alias: String },
    /// Manage stored passwords
    Credentials {
        #[command(subcommand)]
        action: CredentialAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum CredentialAction {
    /// Prompt for and store the profile's password
    Set { alias: String },
    /// Remove the profile's stored password
    Delete {
        alias: String,
        #[arg(short, long)]
        yes: bool,
    },
    /// Show whether a password is stored
    Status { alias: String },
}

pub async fn run(cli: Cli) -> Result<()> {
    let config_path = Settings::resolve_path(cli.config.as_deref())?;
    let settings = Settings::load(&config_path)
        .with_context(|| format!("loading config {}", config_path.display()))?;
    let store = credential_store(cli.credentials_file.as_deref(), cli.no_prompt)?;

    match cli.command {
        Commands::Profiles => {
            print_profiles(&settings, &config_path);
            Ok(())
        }
        Commands::Watch { alias } => {
            let profile = match alias {
                Some(alias) => settings.profile(&alias)?.clone(),
                None => settings.auto_start_profile().cloned().ok_or_else(|| {
                    anyhow!("no profile given and no auto_start configured in {}", config_path.display())
                })?,
            };
            watch(settings.engine.clone(), profile, store).await
        }
        Commands::Sync { alias } => {
            let profile = settings.profile(&alias)?.clone();
            sync_once(settings.engine.clone(), profile, store).await
        }
        Commands::DryRun { alias } => {
            let profile = settings.profile(&alias)?;
            profile.validate()?;
            let spec = builder(&settings.engine).dry_run(profile);
            let outcome = transfer(&settings.engine, &spec, profile, &store).await?;
            print!("{}", outcome.stdout);
            finish_transfer(&outcome, "dry run")
        }
        Commands::Pull { alias, yes } => {
            let profile = settings.profile(&alias)?;
            profile.validate()?;
            if !yes {
                confirm_pull(profile)?;
            }
            let spec = builder(&settings.engine).pull(profile);
            let outcome = transfer(&settings.engine, &spec, profile, &store).await?;
            finish_transfer(&outcome, "pull")
        }
        Commands::Test { alias } => {
            let profile = settings.profile(&alias)?.clone();
            test_connection(&settings.engine, profile, &store).await
        }
        Commands::Validate { alias } => {
            let profile = settings.profile(&alias)?.clone();
            validate_remote(&settings.engine, profile, &store).await
        }
        Commands::Credentials { action } => credentials(&settings, action, &store, cli.no_prompt),
    }
}

// =============================================================================
// Commands
// =============================================================================

fn print_profiles(settings: &Settings, config_path: &Path) {
    if settings.profiles.is_empty() {
        println!("No profiles configured in {}", config_path.display());
        return;
    }
    for profile in &settings.profiles {
        let auto = if settings.auto_start.as_deref() == Some(profile.alias.as_str()) {
            " (auto-start)".green().to_string()
        } else {
            String::new()
        };
        println!(
            "{}{}  {} -> {}:{}  port {}",
            profile.alias.bold(),
            auto,
            profile.local_dir.display(),
            profile.destination_host().cyan(),
            profile.remote_dir,
            profile.ssh_port
        );
        if !profile.exclude.is_empty() {
            println!("    exclude: {}", profile.exclude.join(", ").dimmed());
        }
    }
}

async fn watch(engine: EngineSettings, profile: Profile, store: CredentialStore) -> Result<()> {
    let (orchestrator, events) = orchestrator(engine, store);
    let printer = tokio::spawn(print_events(events));
    let (handle, task) = orchestrator.spawn();

    handle
        .start(profile.clone())
        .await
        .with_context(|| format!("starting profile '{}'", profile.alias))?;
    eprintln!(
        "{} {} -> {}  (Ctrl-C to stop)",
        "Watching".green().bold(),
        profile.local_dir.display(),
        profile.destination_host()
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    eprintln!("{}", "Stopping...".yellow());
    handle.shutdown().await?;
    let _ = task.await;
    let _ = printer.await;
    Ok(())
}

async fn sync_once(engine: EngineSettings, profile: Profile, store: CredentialStore) -> Result<()> {
    let (mut orchestrator, events) = orchestrator(engine, store);
    drop(events);
    let result = orchestrator
        .sync_once(profile.clone())
        .await
        .with_context(|| format!("syncing profile '{}'", profile.alias))?;
    println!(
        "{} {} file(s), {} in {:.1}s",
        "Synced".green().bold(),
        result.files_transferred,
        format_bytes(result.bytes_transferred),
        result.duration.as_secs_f64()
    );
    Ok(())
}

async fn test_connection(engine: &EngineSettings, profile: Profile, store: &CredentialStore) -> Result<()> {
    let auth = stored_auth(&profile, store);
    let remote = SshRemote::new(engine.connect_timeout());
    let target = format!("{}:{}", profile.destination_host(), profile.ssh_port);
    let test = tokio::task::spawn_blocking(move || remote.test_connection(&profile, &auth)).await?;

    if test.success {
        println!(
            "{} {} ({} ms)",
            "✓ Connected to".green(),
            target,
            test.latency_ms.unwrap_or_default()
        );
        Ok(())
    } else {
        let error = test.error.map(|e| e.to_string()).unwrap_or_default();
        bail!("connection to {target} failed: {error}")
    }
}

async fn validate_remote(engine: &EngineSettings, profile: Profile, store: &CredentialStore) -> Result<()> {
    profile.validate()?;
    let auth = stored_auth(&profile, store);
    let remote = SshRemote::new(engine.connect_timeout());
    let validation =
        tokio::task::spawn_blocking(move || remote.validate_setup(&profile, &auth)).await?;

    let mark = |ok: bool| if ok { "✓".green() } else { "✗".red() };
    println!("{} connected", mark(validation.connected));
    println!("{} remote directory exists", mark(validation.remote_directory_exists));
    println!("{} remote directory writable", mark(validation.has_write_permission));
    for error in &validation.errors {
        eprintln!("  {}", error.red());
    }

    if validation.is_ok() {
        Ok(())
    } else {
        bail!("remote setup is not usable")
    }
}

fn credentials(
    settings: &Settings,
    action: CredentialAction,
    store: &CredentialStore,
    no_prompt: bool,
) -> Result<()> {
    match action {
        CredentialAction::Set { alias } => {
            let profile = settings.profile(&alias)?;
            if no_prompt {
                bail!("--no-prompt given; cannot ask for a password");
            }
            let password = TerminalPrompt
                .ask_password(&profile.remote_host, &profile.remote_user)?
                .ok_or_else(|| anyhow!("no password entered"))?;
            store.set(&profile.remote_host, &profile.remote_user, &password)?;
            println!("{} password for {}", "Stored".green(), profile.destination_host());
        }
        CredentialAction::Delete { alias, yes } => {
            let profile = settings.profile(&alias)?;
            if !yes
                && !confirm_action(
                    &format!("Delete the stored password for {}?", profile.destination_host()),
                    false,
                )?
            {
                println!("Kept.");
                return Ok(());
            }
            if store.delete(&profile.remote_host, &profile.remote_user)? {
                println!("{} password for {}", "Deleted".yellow(), profile.destination_host());
            } else {
                println!("No stored password for {}", profile.destination_host());
            }
        }
        CredentialAction::Status { alias } => {
            let profile = settings.profile(&alias)?;
            if store.has(&profile.remote_host, &profile.remote_user)? {
                println!("{}: password stored", profile.destination_host());
            } else {
                println!("{}: no stored password (key authentication)", profile.destination_host());
            }
        }
    }
    Ok(())
}

fn confirm_pull(profile: &Profile) -> Result<()> {
    if !std::io::stdin().is_terminal() {
        bail!("pull overwrites local files; pass --yes to confirm non-interactively");
    }
    let from = format!("{}:{}", profile.destination_host(), profile.remote_dir);
    let into = profile.local_dir.display().to_string();
    let details = [
        format!("from: {from}"),
        format!("into: {into}"),
        "newer local files may be overwritten; nothing is deleted".to_string(),
    ];
    let details: Vec<&str> = details.iter().map(String::as_str).collect();
    if !confirm_with_details("Pull remote files into the local directory", &details, false)? {
        bail!("pull cancelled");
    }
    Ok(())
}

// =============================================================================
// Helpers
// =============================================================================

type LiveOrchestrator = Orchestrator<SshRemote, TransferExecutor, InotifyLauncher>;

fn orchestrator(engine: EngineSettings, store: CredentialStore) -> (LiveOrchestrator, EventReceiver) {
    let remote = SshRemote::new(engine.connect_timeout());
    let executor = TransferExecutor::new(engine.kill_grace());
    let launcher = InotifyLauncher::new(engine.watch_program.clone(), engine.kill_grace());
    Orchestrator::new(engine, remote, executor, launcher, store)
}

fn builder(engine: &EngineSettings) -> CommandBuilder {
    CommandBuilder::new(engine.transfer_program.clone()).with_connect_timeout(engine.connect_timeout_secs)
}

async fn transfer(
    engine: &EngineSettings,
    spec: &CommandSpec,
    profile: &Profile,
    store: &CredentialStore,
) -> Result<TransferOutcome> {
    let auth = stored_auth(profile, store);
    tracing::debug!(command = %spec.display(), "running transfer");
    TransferExecutor::new(engine.kill_grace())
        .execute(spec, auth.password(), engine.transfer_timeout())
        .await
        .with_context(|| format!("running {}", spec.program))
}

fn finish_transfer(outcome: &TransferOutcome, what: &str) -> Result<()> {
    match outcome.failure_message() {
        None => {
            let stats = outcome.stats();
            eprintln!(
                "{} {what}: {} file(s), {}",
                "Done".green().bold(),
                stats.files_transferred,
                format_bytes(stats.bytes_transferred)
            );
            Ok(())
        }
        Some(message) => bail!("{what} failed: {message}"),
    }
}

fn stored_auth(profile: &Profile, store: &CredentialStore) -> Auth {
    let password = match store.get(&profile.remote_host, &profile.remote_user) {
        Ok(password) => password,
        Err(e) => {
            tracing::warn!(error = %e, "could not read stored password");
            None
        }
    };
    Auth::for_profile(profile, password)
}

fn credential_store(path: Option<&Path>, no_prompt: bool) -> Result<CredentialStore> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => ProjectDirs::from("", "", "rmsync")
            .map(|dirs| dirs.data_dir().join("credentials.json"))
            .ok_or_else(|| anyhow!("cannot determine a data directory for stored passwords"))?,
    };
    let backend = FileSecretBackend::new(path);
    Ok(if no_prompt {
        CredentialStore::new(backend, NoPrompt)
    } else {
        CredentialStore::new(backend, TerminalPrompt)
    })
}

async fn print_events(mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        if let Some(line) = describe_event(&event) {
            eprintln!("{line}");
        }
    }
}

/// One status line per event worth showing; `None` for the rest.
pub fn describe_event(event: &OrchestratorEvent) -> Option<String> {
    match event {
        OrchestratorEvent::StateChanged { old, new, .. } => {
            Some(format!("{} {old} -> {new}", "state".dimmed()))
        }
        OrchestratorEvent::SyncStarted(job) => Some(format!(
            "{} {} sync #{} ({} path(s))",
            "sync".cyan(),
            job.strategy,
            job.id,
            job.files.len()
        )),
        OrchestratorEvent::SyncCompleted { job, result } => Some(format!(
            "{} #{}: {} file(s), {} in {}",
            "synced".green(),
            job.id,
            result.files_transferred,
            format_bytes(result.bytes_transferred),
            format_duration(result.duration)
        )),
        OrchestratorEvent::SyncFailed { job, error } => {
            Some(format!("{} #{}: {}", "failed".red(), job.id, error.message))
        }
        OrchestratorEvent::FilesChanged(_) => None,
        OrchestratorEvent::Error {
            message,
            recoverable,
            retry,
        } => Some(match (recoverable, retry) {
            (true, Some(retry)) => format!(
                "{} {message} (retry {}/{})",
                "error".yellow(),
                retry.current,
                retry.max
            ),
            _ => format!("{} {message}", "error".red().bold()),
        }),
    }
}

/// Format bytes as human-readable string
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

fn format_duration(duration: Duration) -> String {
    if duration < Duration::from_secs(1) {
        format!("{} ms", duration.as_millis())
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}
