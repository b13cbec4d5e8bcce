//! The control loop.
//!
//! One task owns the [`StateMachine`], the active profile and the running
//! aggregator. It reacts to three inputs: control commands from an
//! [`OrchestratorHandle`], change batches and faults from the aggregator,
//! and the recovery timer. At most one transfer runs at a time; batches that
//! arrive meanwhile queue in the aggregator and are merged before the next
//! job.
//!
//! ```text
//! start: idle -> initializing -> connecting -(full sync)-> watching
//! batch: watching -> syncing -> watching | error
//! error: error -(delay)-> recovering -(probe ok)-> watching
//!                                    -(probe fails)-> error
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};

use super::events::{EventReceiver, EventSink, OrchestratorEvent, RetryStatus};
use super::state::{OrchestratorState, StateMachine};
use crate::config::{EngineSettings, Profile};
use crate::credentials::CredentialStore;
use crate::error::{ErrorKind, SyncFailure};
use crate::remote::{Auth, ConnectionTest, RemoteError, RemoteShell};
use crate::transfer::{CommandBuilder, SyncJob, SyncResult, TransferRunner, select_strategy};
use crate::watch::{ChangeAggregator, ChangeEvent, ExcludeMatcher, WatchLauncher, WatchSignal};

/// Errors from talking to a running orchestrator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("orchestrator is not running")]
    Closed,

    #[error("cannot sync now while {0}")]
    NotWatching(OrchestratorState),

    #[error(transparent)]
    Failed(#[from] SyncFailure),
}

/// Point-in-time view of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub state: OrchestratorState,
    pub profile: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<SyncFailure>,
}

enum Command {
    Start {
        profile: Box<Profile>,
        reply: oneshot::Sender<Result<(), SyncFailure>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    SyncNow {
        reply: oneshot::Sender<Result<SyncResult, ControlError>>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct Orchestrator<R, T, W> {
    settings: EngineSettings,
    remote: Arc<R>,
    runner: T,
    launcher: W,
    credentials: Arc<CredentialStore>,
    builder: CommandBuilder,
    machine: StateMachine,
    events: EventSink,
    aggregator: Option<ChangeAggregator>,
    excludes: ExcludeMatcher,
    auth: Option<Auth>,
    /// Changes not yet mirrored, one per path: failed jobs and batches seen
    /// outside `watching`.
    carry_over: BTreeMap<String, ChangeEvent>,
    recovery_at: Option<Instant>,
}

impl<R, T, W> Orchestrator<R, T, W>
where
    R: RemoteShell,
    T: TransferRunner + 'static,
    W: WatchLauncher + 'static,
{
    pub fn new(
        settings: EngineSettings,
        remote: R,
        runner: T,
        launcher: W,
        credentials: CredentialStore,
    ) -> (Self, EventReceiver) {
        let (events, rx) = EventSink::channel();
        let builder = CommandBuilder::new(settings.transfer_program.clone())
            .with_connect_timeout(settings.connect_timeout_secs);
        let orchestrator = Self {
            settings,
            remote: Arc::new(remote),
            runner,
            launcher,
            credentials: Arc::new(credentials),
            builder,
            machine: StateMachine::new(),
            events,
            aggregator: None,
            excludes: ExcludeMatcher::empty(),
            auth: None,
            carry_over: BTreeMap::new(),
            recovery_at: None,
        };
        (orchestrator, rx)
    }

    pub fn state(&self) -> OrchestratorState {
        self.machine.state()
    }

    pub fn retry_count(&self) -> u32 {
        self.machine.retry_count()
    }

    pub fn profile(&self) -> Option<&Profile> {
        self.machine.profile()
    }

    pub fn last_error(&self) -> Option<&SyncFailure> {
        self.machine.last_error()
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.machine.state(),
            profile: self.machine.profile().map(|p| p.alias.clone()),
            retry_count: self.machine.retry_count(),
            last_error: self.machine.last_error().cloned(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Validate, connect, run the initial full sync, then start watching.
    /// Any failure leaves the machine in `error` and is returned.
    pub async fn start(&mut self, profile: Profile) -> Result<(), SyncFailure> {
        self.prepare(profile.clone()).await?;

        if !self.transition(OrchestratorState::Watching) {
            return Err(self.fail_start(SyncFailure::configuration(format!(
                "cannot enter watching from {}",
                self.machine.state()
            ))));
        }
        if let Err(failure) = self.launch_watch(&profile) {
            return Err(self.fail_start(failure));
        }
        tracing::info!(alias = %profile.alias, local = %profile.local_dir.display(), "watching");
        Ok(())
    }

    /// Validate, connect and run one full sync without watching. Returns to
    /// `idle` afterwards, success or not.
    pub async fn sync_once(&mut self, profile: Profile) -> Result<SyncResult, SyncFailure> {
        let result = self.prepare(profile).await;
        self.stop().await;
        result
    }

    /// Stop watching, cancel recovery and return to `idle` from any state.
    /// A transfer that is already running is never interrupted; this runs
    /// between jobs.
    pub async fn stop(&mut self) {
        self.recovery_at = None;
        if let Some(aggregator) = self.aggregator.take() {
            let leftovers = aggregator.stop().await;
            if !leftovers.is_empty() {
                tracing::info!(count = leftovers.len(), "stopped with unsynced changes");
            }
        }
        self.carry_over.clear();
        self.auth = None;

        let alias = self.machine.profile().map(|p| p.alias.clone());
        let old = self.machine.reset();
        if old != OrchestratorState::Idle {
            tracing::info!(alias = alias.as_deref().unwrap_or(""), from = %old, "stopped");
            self.events.emit(OrchestratorEvent::StateChanged {
                old,
                new: OrchestratorState::Idle,
                profile: None,
            });
        }
    }

    /// Full sync on demand while watching.
    pub async fn sync_now(&mut self) -> Result<SyncResult, ControlError> {
        let state = self.machine.state();
        let profile = match (state, self.machine.profile()) {
            (OrchestratorState::Watching, Some(profile)) => profile.clone(),
            _ => return Err(ControlError::NotWatching(state)),
        };
        if !self.transition(OrchestratorState::Syncing) {
            return Err(ControlError::NotWatching(state));
        }

        match self.run_job(SyncJob::full(profile)).await {
            Ok(result) => {
                self.transition(OrchestratorState::Watching);
                Ok(result)
            }
            Err(failure) => {
                self.enter_error(failure.clone()).await;
                Err(ControlError::Failed(failure))
            }
        }
    }

    /// Steps shared by `start` and `sync_once`, ending in `connecting` after
    /// a successful full sync.
    async fn prepare(&mut self, profile: Profile) -> Result<SyncResult, SyncFailure> {
        if self.machine.state().is_active() {
            tracing::info!("already active; stopping first");
            self.stop().await;
        }

        self.machine.set_profile(profile.clone());
        if !self.transition(OrchestratorState::Initializing) {
            return Err(SyncFailure::configuration(format!(
                "cannot start from {}",
                self.machine.state()
            )));
        }
        tracing::info!(alias = %profile.alias, host = %profile.remote_host, "starting");

        if let Err(failure) = self.initialize(&profile) {
            return Err(self.fail_start(failure));
        }

        self.transition(OrchestratorState::Connecting);
        let auth = match self.connect(&profile).await {
            Ok(auth) => auth,
            Err(failure) => return Err(self.fail_start(failure)),
        };
        self.auth = Some(auth);

        match self.run_job(SyncJob::full(profile)).await {
            Ok(result) => Ok(result),
            Err(failure) => Err(self.fail_start(failure)),
        }
    }

    fn initialize(&mut self, profile: &Profile) -> Result<(), SyncFailure> {
        profile
            .validate()
            .map_err(|e| SyncFailure::configuration(e.to_string()))?;
        self.excludes = ExcludeMatcher::new(&profile.exclude)
            .map_err(|e| SyncFailure::configuration(format!("invalid exclude pattern: {e}")))?;
        self.check_prerequisites()
    }

    fn check_prerequisites(&self) -> Result<(), SyncFailure> {
        for program in [&self.settings.watch_program, &self.settings.transfer_program] {
            if let Err(e) = which::which(program) {
                return Err(SyncFailure::prerequisite(format!(
                    "required program '{program}' not found: {e}"
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Connecting
    // =========================================================================

    /// Connectivity check with retries for connection-class failures and a
    /// single password prompt for authentication failures.
    async fn connect(&self, profile: &Profile) -> Result<Auth, SyncFailure> {
        let mut auth = self.initial_auth(profile).await;
        let attempts = self.settings.connect_attempts.max(1);
        let mut prompted = false;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let test = self.probe(profile, &auth).await;
            if test.success {
                tracing::info!(
                    host = %profile.remote_host,
                    latency_ms = test.latency_ms.unwrap_or_default(),
                    "connected"
                );
                return Ok(auth);
            }

            let error = test
                .error
                .unwrap_or_else(|| RemoteError::Connect("connection test failed".into()));

            if error.is_authentication() {
                if prompted {
                    return Err(SyncFailure::authentication(error.to_string()));
                }
                prompted = true;
                match self.prompt_password(profile).await {
                    Some(password) => {
                        tracing::info!(host = %profile.remote_host, "retrying with entered password");
                        auth = Auth::Password(password);
                        continue;
                    }
                    None => {
                        return Err(SyncFailure::authentication(format!(
                            "{error}; no password available"
                        )));
                    }
                }
            }

            if attempt >= attempts {
                return Err(SyncFailure::connection(format!(
                    "{error} (after {attempt} attempt{})",
                    if attempt == 1 { "" } else { "s" }
                )));
            }
            tracing::warn!(
                host = %profile.remote_host,
                attempt,
                max = attempts,
                error = %error,
                "connection attempt failed; retrying"
            );
            sleep(self.settings.connect_retry_delay()).await;
        }
    }

    /// Stored password if there is one, else key-based auth.
    async fn initial_auth(&self, profile: &Profile) -> Auth {
        let store = Arc::clone(&self.credentials);
        let (host, user) = (profile.remote_host.clone(), profile.remote_user.clone());
        match tokio::task::spawn_blocking(move || store.get(&host, &user)).await {
            Ok(Ok(Some(password))) => Auth::Password(password),
            Ok(Ok(None)) => Auth::for_profile(profile, None),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "could not read stored password");
                Auth::for_profile(profile, None)
            }
            Err(e) => {
                tracing::warn!(error = %e, "credential lookup task failed");
                Auth::for_profile(profile, None)
            }
        }
    }

    async fn prompt_password(&self, profile: &Profile) -> Option<String> {
        let store = Arc::clone(&self.credentials);
        let (host, user) = (profile.remote_host.clone(), profile.remote_user.clone());
        match tokio::task::spawn_blocking(move || store.prompt_and_optionally_store(&host, &user))
            .await
        {
            Ok(Ok(password)) => password,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "password prompt failed");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "password prompt task failed");
                None
            }
        }
    }

    async fn probe(&self, profile: &Profile, auth: &Auth) -> ConnectionTest {
        let remote = Arc::clone(&self.remote);
        let (profile, auth) = (profile.clone(), auth.clone());
        match tokio::task::spawn_blocking(move || remote.test_connection(&profile, &auth)).await {
            Ok(test) => test,
            Err(e) => ConnectionTest::failed(RemoteError::Connect(format!(
                "connection test task failed: {e}"
            ))),
        }
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    async fn run_job(&mut self, mut job: SyncJob) -> Result<SyncResult, SyncFailure> {
        job.start()
            .map_err(|e| SyncFailure::new(ErrorKind::Transfer, e.to_string()).with_recoverable(false))?;
        self.events.emit(OrchestratorEvent::SyncStarted(job.clone()));

        let spec = self.builder.for_job(&job);
        tracing::info!(
            job_id = job.id,
            strategy = %select_strategy(&job),
            files = job.files.len(),
            "sync started"
        );
        tracing::debug!(command = %spec.display(), "transfer command");

        let started = StdInstant::now();
        let password = self.auth.as_ref().and_then(Auth::password);
        let outcome = self
            .runner
            .execute(&spec, password, self.settings.transfer_timeout())
            .await;

        let failure = match outcome {
            Ok(outcome) if outcome.success() => {
                let stats = outcome.stats();
                if let Err(e) = job.complete(stats.files_transferred, stats.bytes_transferred) {
                    return Err(SyncFailure::new(ErrorKind::Transfer, e.to_string()).with_recoverable(false));
                }
                let result = SyncResult {
                    success: true,
                    job_id: job.id,
                    files_transferred: stats.files_transferred,
                    bytes_transferred: stats.bytes_transferred,
                    duration: started.elapsed(),
                    errors: Vec::new(),
                };
                tracing::info!(
                    job_id = job.id,
                    files = result.files_transferred,
                    bytes = result.bytes_transferred,
                    duration_ms = result.duration.as_millis() as u64,
                    "sync completed"
                );
                self.events.emit(OrchestratorEvent::SyncCompleted {
                    job,
                    result: result.clone(),
                });
                return Ok(result);
            }
            Ok(outcome) => {
                let recoverable = outcome.condition().is_some_and(|c| c.is_recoverable());
                let message = outcome
                    .failure_message()
                    .unwrap_or_else(|| "transfer failed".to_string());
                SyncFailure::new(ErrorKind::Transfer, message).with_recoverable(recoverable)
            }
            Err(e) => SyncFailure::new(
                ErrorKind::Transfer,
                format!("failed to run {}: {e}", spec.program),
            )
            .with_recoverable(false),
        };

        tracing::warn!(job_id = job.id, error = %failure.message, recoverable = failure.recoverable, "sync failed");
        if let Err(e) = job.fail(failure.message.clone()) {
            tracing::error!(error = %e, "job lifecycle violation");
        }
        self.events.emit(OrchestratorEvent::SyncFailed {
            job,
            error: failure.clone(),
        });
        Err(failure)
    }

    /// Merge `events` with carried-over and queued changes and mirror them
    /// in one incremental job.
    async fn sync_changes(&mut self, events: Vec<ChangeEvent>) {
        let mut merged = std::mem::take(&mut self.carry_over);
        hold(&mut merged, events);

        let mut fault = None;
        if let Some(aggregator) = self.aggregator.as_mut() {
            while let Some(signal) = aggregator.try_recv() {
                match signal {
                    WatchSignal::Batch(more) => hold(&mut merged, more),
                    WatchSignal::Fault(message) => fault = Some(message),
                }
            }
        }

        if !merged.is_empty() {
            self.sync_batch(merged).await;
        }
        if let Some(message) = fault {
            self.on_watch_fault(message).await;
        }
    }

    async fn sync_batch(&mut self, changes: BTreeMap<String, ChangeEvent>) {
        let paths: Vec<String> = changes.keys().cloned().collect();
        self.events.emit(OrchestratorEvent::FilesChanged(paths.clone()));

        let Some(profile) = self.machine.profile().cloned() else {
            return;
        };
        if !self.transition(OrchestratorState::Syncing) {
            self.carry_over = changes;
            return;
        }

        match self.run_job(SyncJob::incremental(profile, paths)).await {
            Ok(_) => {
                self.transition(OrchestratorState::Watching);
            }
            Err(failure) => {
                self.carry_over = changes;
                self.enter_error(failure).await;
            }
        }
    }

    // =========================================================================
    // Watching, errors and recovery
    // =========================================================================

    fn launch_watch(&mut self, profile: &Profile) -> Result<(), SyncFailure> {
        let aggregator = self
            .launcher
            .launch(&profile.local_dir, self.excludes.clone(), self.settings.quiet_window())
            .map_err(|e| SyncFailure::watch_process(e.to_string()))?;
        self.aggregator = Some(aggregator);
        Ok(())
    }

    /// Stop a dead or closed aggregator, keeping whatever it still held.
    async fn retire_aggregator(&mut self) {
        if let Some(aggregator) = self.aggregator.take() {
            let leftovers = aggregator.stop().await;
            hold(&mut self.carry_over, leftovers);
        }
    }

    async fn handle_signal(&mut self, signal: Option<WatchSignal>) {
        match signal {
            Some(WatchSignal::Batch(events)) => {
                if self.machine.state() == OrchestratorState::Watching {
                    self.sync_changes(events).await;
                } else {
                    tracing::debug!(count = events.len(), state = %self.machine.state(), "holding changes");
                    hold(&mut self.carry_over, events);
                }
            }
            Some(WatchSignal::Fault(message)) => self.on_watch_fault(message).await,
            None => self.on_watch_fault("watch process output closed".to_string()).await,
        }
    }

    async fn on_watch_fault(&mut self, message: String) {
        self.retire_aggregator().await;
        if self.machine.state() == OrchestratorState::Watching {
            self.enter_error(SyncFailure::watch_process(message)).await;
        } else {
            tracing::debug!(error = %message, state = %self.machine.state(), "watch fault outside watching");
        }
    }

    /// Move to `error` and schedule recovery if the failure allows it and
    /// the retry budget is not spent. Otherwise watching ends until the next
    /// `start`, whose full sync covers anything changed meanwhile.
    async fn enter_error(&mut self, failure: SyncFailure) {
        self.machine.set_error(failure.clone());
        self.transition(OrchestratorState::Error);

        let max = self.settings.max_retries;
        let used = self.machine.retry_count();
        if failure.recoverable && used < max {
            let delay = self.settings.recovery_delay();
            self.recovery_at = Some(Instant::now() + delay);
            tracing::warn!(
                error = %failure,
                attempt = used + 1,
                max,
                delay_ms = delay.as_millis() as u64,
                "scheduling recovery"
            );
            self.events.emit(OrchestratorEvent::Error {
                message: failure.to_string(),
                recoverable: true,
                retry: Some(RetryStatus {
                    current: used + 1,
                    max,
                }),
            });
        } else {
            self.recovery_at = None;
            tracing::error!(error = %failure, retries = used, "giving up; stop and start to retry");
            self.retire_aggregator().await;
            if !self.carry_over.is_empty() {
                tracing::info!(count = self.carry_over.len(), "dropping held changes; next start runs a full sync");
                self.carry_over.clear();
            }
            self.events.emit(OrchestratorEvent::Error {
                message: failure.to_string(),
                recoverable: false,
                retry: failure
                    .recoverable
                    .then_some(RetryStatus { current: used, max }),
            });
        }
    }

    /// Re-check connectivity, relaunch the watcher if it died, and resume.
    async fn recover(&mut self) {
        self.recovery_at = None;
        if self.machine.state() != OrchestratorState::Error {
            return;
        }
        let Some(profile) = self.machine.profile().cloned() else {
            return;
        };
        if !self.transition(OrchestratorState::Recovering) {
            return;
        }
        tracing::info!(
            alias = %profile.alias,
            attempt = self.machine.retry_count(),
            max = self.settings.max_retries,
            "recovering"
        );

        let auth = self
            .auth
            .clone()
            .unwrap_or_else(|| Auth::for_profile(&profile, None));
        let test = self.probe(&profile, &auth).await;
        if !test.success {
            let failure = match test.error {
                Some(e) if e.is_authentication() => SyncFailure::authentication(e.to_string()),
                Some(e) => SyncFailure::connection(e.to_string()),
                None => SyncFailure::connection("connection check failed"),
            };
            self.enter_error(failure).await;
            return;
        }

        if self.aggregator.as_ref().is_none_or(|a| !a.is_alive()) {
            self.retire_aggregator().await;
            if let Err(failure) = self.launch_watch(&profile) {
                self.enter_error(failure).await;
                return;
            }
        }

        if !self.transition(OrchestratorState::Watching) {
            return;
        }
        tracing::info!(alias = %profile.alias, "recovered");

        if !self.carry_over.is_empty() {
            self.sync_changes(Vec::new()).await;
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn transition(&mut self, next: OrchestratorState) -> bool {
        match self.machine.transition(next) {
            Ok(old) => {
                self.events.emit(OrchestratorEvent::StateChanged {
                    old,
                    new: next,
                    profile: self.machine.profile().map(|p| p.alias.clone()),
                });
                true
            }
            Err(_) => false,
        }
    }

    fn fail_start(&mut self, failure: SyncFailure) -> SyncFailure {
        tracing::error!(kind = %failure.kind, error = %failure.message, "start failed");
        self.machine.set_error(failure.clone());
        self.transition(OrchestratorState::Error);
        self.events.emit(OrchestratorEvent::Error {
            message: failure.to_string(),
            recoverable: false,
            retry: None,
        });
        failure
    }

    // =========================================================================
    // Control loop
    // =========================================================================

    /// Run the control loop on its own task.
    pub fn spawn(self) -> (OrchestratorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(self.run(rx));
        (OrchestratorHandle { tx }, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.stop().await;
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                signal = next_signal(&mut self.aggregator) => {
                    self.handle_signal(signal).await;
                }
                () = recovery_timer(self.recovery_at) => {
                    self.recover().await;
                }
            }
        }
        tracing::debug!("orchestrator loop finished");
    }

    async fn handle_command(&mut self, command: Command) -> std::ops::ControlFlow<()> {
        match command {
            Command::Start { profile, reply } => {
                let result = self.start(*profile).await;
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            Command::SyncNow { reply } => {
                let result = self.sync_now().await;
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown { reply } => {
                self.stop().await;
                let _ = reply.send(());
                return std::ops::ControlFlow::Break(());
            }
        }
        std::ops::ControlFlow::Continue(())
    }
}

/// Merge `events` into `held`, last event per path wins.
fn hold(held: &mut BTreeMap<String, ChangeEvent>, events: impl IntoIterator<Item = ChangeEvent>) {
    for event in events {
        held.insert(event.path.clone(), event);
    }
}

async fn next_signal(aggregator: &mut Option<ChangeAggregator>) -> Option<WatchSignal> {
    match aggregator {
        Some(aggregator) => aggregator.recv().await,
        None => std::future::pending().await,
    }
}

async fn recovery_timer(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Cloneable control handle for a spawned orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Start { .. } => "Start",
            Command::Stop { .. } => "Stop",
            Command::SyncNow { .. } => "SyncNow",
            Command::Status { .. } => "Status",
            Command::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl OrchestratorHandle {
    pub async fn start(&self, profile: Profile) -> Result<(), ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start {
            profile: Box::new(profile),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ControlError::Closed)?.map_err(ControlError::Failed)
    }

    pub async fn stop(&self) -> Result<(), ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stop { reply }).await?;
        rx.await.map_err(|_| ControlError::Closed)
    }

    pub async fn sync_now(&self) -> Result<SyncResult, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::SyncNow { reply }).await?;
        rx.await.map_err(|_| ControlError::Closed)?
    }

    pub async fn status(&self) -> Result<StatusSnapshot, ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        rx.await.map_err(|_| ControlError::Closed)
    }

    /// Stop and end the control loop.
    pub async fn shutdown(&self) -> Result<(), ControlError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| ControlError::Closed)
    }

    async fn send(&self, command: Command) -> Result<(), ControlError> {
        self.tx.send(command).await.map_err(|_| ControlError::Closed)
    }
}
