//! Orchestrator end-to-end runs against scripted collaborators: a fake
//! remote host, a fake transfer tool and a line-fed watcher.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use remote_mirror_sync::config::{EngineSettings, Profile};
use remote_mirror_sync::credentials::{
    CredentialStore, InteractiveError, MemorySecretBackend, PasswordPrompt,
};
use remote_mirror_sync::error::ErrorKind;
use remote_mirror_sync::orchestrator::{
    ControlError, EventReceiver, Orchestrator, OrchestratorEvent, OrchestratorHandle,
    OrchestratorState,
};
use remote_mirror_sync::remote::{Auth, CommandOutput, ConnectionTest, RemoteError, RemoteShell};
use remote_mirror_sync::transfer::{CommandSpec, SyncStrategy, TransferOutcome, TransferRunner};
use remote_mirror_sync::watch::{ChangeAggregator, ExcludeMatcher, WatchError, WatchLauncher};
use tempfile::TempDir;
use tokio::sync::mpsc;

use OrchestratorState::*;

// =============================================================================
// Fakes
// =============================================================================

#[derive(Clone)]
struct FakeRemote {
    script: Arc<Mutex<VecDeque<ConnectionTest>>>,
    fallback: ConnectionTest,
    probes: Arc<AtomicUsize>,
}

impl FakeRemote {
    fn reachable() -> Self {
        Self::with_fallback(ConnectionTest::ok(3))
    }

    fn with_fallback(fallback: ConnectionTest) -> Self {
        Self {
            script: Arc::default(),
            fallback,
            probes: Arc::default(),
        }
    }

    fn then(self, test: ConnectionTest) -> Self {
        self.script.lock().unwrap().push_back(test);
        self
    }

    fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl RemoteShell for FakeRemote {
    fn test_connection(&self, _: &Profile, _: &Auth) -> ConnectionTest {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    fn execute(&self, _: &Profile, _: &Auth, _: &str) -> CommandOutput {
        CommandOutput::from_exit(0, String::new(), String::new())
    }
}

#[derive(Debug, Clone)]
struct Call {
    spec: CommandSpec,
    password: Option<String>,
}

#[derive(Clone, Default)]
struct FakeRunner {
    script: Arc<Mutex<VecDeque<TransferOutcome>>>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl FakeRunner {
    fn then_exit(self, code: i32) -> Self {
        let outcome = if code == 0 {
            success()
        } else {
            TransferOutcome {
                exit_code: Some(code),
                stderr: format!("rsync error: code {code}"),
                ..Default::default()
            }
        };
        self.script.lock().unwrap().push_back(outcome);
        self
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

fn success() -> TransferOutcome {
    TransferOutcome {
        exit_code: Some(0),
        stdout: "Number of regular files transferred: 3\nTotal transferred file size: 1,024 bytes\n"
            .into(),
        ..Default::default()
    }
}

impl TransferRunner for FakeRunner {
    fn execute(
        &self,
        spec: &CommandSpec,
        password: Option<&str>,
        _timeout: Duration,
    ) -> impl Future<Output = std::io::Result<TransferOutcome>> + Send {
        self.calls.lock().unwrap().push(Call {
            spec: spec.clone(),
            password: password.map(String::from),
        });
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(success);
        async move { Ok(outcome) }
    }
}

#[derive(Clone, Default)]
struct FakeLauncher {
    feeds: Arc<Mutex<Vec<mpsc::UnboundedSender<String>>>>,
    launches: Arc<AtomicUsize>,
}

impl FakeLauncher {
    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Feed for the most recent launch.
    fn feed(&self) -> mpsc::UnboundedSender<String> {
        self.feeds.lock().unwrap().last().cloned().unwrap()
    }

    fn close_feeds(&self) {
        self.feeds.lock().unwrap().clear();
    }
}

impl WatchLauncher for FakeLauncher {
    fn launch(
        &self,
        target: &Path,
        excludes: ExcludeMatcher,
        quiet_window: Duration,
    ) -> Result<ChangeAggregator, WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().push(tx);
        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(ChangeAggregator::from_lines(target, excludes, quiet_window, rx))
    }
}

struct ScriptedPrompt(Option<&'static str>);

impl PasswordPrompt for ScriptedPrompt {
    fn ask_password(&self, _: &str, _: &str) -> Result<Option<String>, InteractiveError> {
        Ok(self.0.map(String::from))
    }

    fn confirm_store(&self, _: &str, _: &str) -> Result<bool, InteractiveError> {
        Ok(true)
    }
}

// =============================================================================
// Harness
// =============================================================================

fn settings() -> EngineSettings {
    EngineSettings {
        quiet_window_ms: 20,
        max_retries: 3,
        recovery_delay_ms: 20,
        transfer_timeout_secs: 5,
        connect_timeout_secs: 1,
        connect_attempts: 3,
        connect_retry_delay_ms: 10,
        kill_grace_ms: 100,
        // Any program on PATH satisfies the prerequisite check.
        watch_program: "sh".into(),
        transfer_program: "sh".into(),
    }
}

fn profile(dir: &TempDir) -> Profile {
    Profile::new("app", "deploy", "prod.example.com", "/var/www/app", dir.path())
        .with_exclude([".git"])
}

struct Rig {
    remote: FakeRemote,
    runner: FakeRunner,
    launcher: FakeLauncher,
    handle: OrchestratorHandle,
    events: EventReceiver,
}

fn spawn(settings: EngineSettings, remote: FakeRemote, runner: FakeRunner) -> Rig {
    let launcher = FakeLauncher::default();
    let (orchestrator, events) = Orchestrator::new(
        settings,
        remote.clone(),
        runner.clone(),
        launcher.clone(),
        CredentialStore::in_memory(),
    );
    let (handle, _task) = orchestrator.spawn();
    Rig {
        remote,
        runner,
        launcher,
        handle,
        events,
    }
}

fn drain(events: &mut EventReceiver) -> Vec<OrchestratorEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

/// Collect events until one satisfies `done`.
async fn wait_for(
    events: &mut EventReceiver,
    done: impl Fn(&OrchestratorEvent) -> bool,
) -> Vec<OrchestratorEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

/// Events up to the next completed sync and the return to `watching`.
async fn wait_for_sync_then_watching(events: &mut EventReceiver) -> Vec<OrchestratorEvent> {
    let mut seen = wait_for(events, |e| {
        matches!(e, OrchestratorEvent::SyncCompleted { .. })
    })
    .await;
    seen.extend(wait_for(events, is_entering(Watching)).await);
    seen
}

fn transitions(events: &[OrchestratorEvent]) -> Vec<(OrchestratorState, OrchestratorState)> {
    events
        .iter()
        .filter_map(|e| match e {
            OrchestratorEvent::StateChanged { old, new, .. } => Some((*old, *new)),
            _ => None,
        })
        .collect()
}

fn is_entering(state: OrchestratorState) -> impl Fn(&OrchestratorEvent) -> bool {
    move |e| matches!(e, OrchestratorEvent::StateChanged { new, .. } if *new == state)
}

fn change_line(dir: &TempDir, event: &str, relative: &str) -> String {
    format!("{event} {}/{relative}", dir.path().display())
}

// =============================================================================
// Startup
// =============================================================================

#[tokio::test]
async fn start_reaches_watching_after_one_full_sync() {
    let dir = TempDir::new().unwrap();
    let mut rig = spawn(settings(), FakeRemote::reachable(), FakeRunner::default());

    rig.handle.start(profile(&dir)).await.unwrap();
    let events = drain(&mut rig.events);

    assert_eq!(
        transitions(&events),
        vec![
            (Idle, Initializing),
            (Initializing, Connecting),
            (Connecting, Watching)
        ]
    );

    let completed: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, OrchestratorEvent::SyncCompleted { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(completed.len(), 1);
    let watching_at = events.iter().position(is_entering(Watching)).unwrap();
    assert!(completed[0] < watching_at);

    let calls = rig.runner.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].spec.has_arg("--delete"));
    assert!(calls[0].password.is_none());
    assert_eq!(rig.launcher.launches(), 1);

    let status = rig.handle.status().await.unwrap();
    assert_eq!(status.state, Watching);
    assert_eq!(status.profile.as_deref(), Some("app"));
    assert_eq!(status.retry_count, 0);
}

#[tokio::test]
async fn invalid_profile_fails_before_anything_runs() {
    let dir = TempDir::new().unwrap();
    let mut rig = spawn(settings(), FakeRemote::reachable(), FakeRunner::default());

    let mut bad = profile(&dir);
    bad.local_dir = dir.path().join("missing");
    let err = rig.handle.start(bad).await.unwrap_err();

    let ControlError::Failed(failure) = err else {
        panic!("unexpected error {err:?}");
    };
    assert_eq!(failure.kind, ErrorKind::Configuration);
    assert_eq!(
        transitions(&drain(&mut rig.events)),
        vec![(Idle, Initializing), (Initializing, Error)]
    );
    assert_eq!(rig.remote.probes(), 0);
    assert!(rig.runner.calls().is_empty());
}

#[tokio::test]
async fn missing_program_is_a_prerequisite_failure() {
    let dir = TempDir::new().unwrap();
    let mut config = settings();
    config.watch_program = "rmsync-no-such-watcher".into();
    let rig = spawn(config, FakeRemote::reachable(), FakeRunner::default());

    let err = rig.handle.start(profile(&dir)).await.unwrap_err();
    assert!(matches!(err, ControlError::Failed(ref f) if f.kind == ErrorKind::PrerequisiteMissing));
    assert_eq!(rig.handle.status().await.unwrap().state, Error);
}

#[tokio::test]
async fn connection_failures_are_retried_while_connecting() {
    let dir = TempDir::new().unwrap();
    let down = ConnectionTest::failed(RemoteError::Connect("refused".into()));
    let remote = FakeRemote::reachable().then(down.clone()).then(down);
    let rig = spawn(settings(), remote, FakeRunner::default());

    rig.handle.start(profile(&dir)).await.unwrap();
    assert_eq!(rig.remote.probes(), 3);
}

#[tokio::test]
async fn connection_gives_up_after_attempt_budget() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::with_fallback(ConnectionTest::failed(RemoteError::Timeout(1)));
    let rig = spawn(settings(), remote, FakeRunner::default());

    let err = rig.handle.start(profile(&dir)).await.unwrap_err();
    assert!(matches!(err, ControlError::Failed(ref f) if f.kind == ErrorKind::Connection));
    assert_eq!(rig.remote.probes(), 3);
    assert!(rig.runner.calls().is_empty());
}

#[tokio::test]
async fn authentication_failure_prompts_once_and_uses_password() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::reachable().then(ConnectionTest::failed(RemoteError::Authentication(
        "publickey denied".into(),
    )));
    let runner = FakeRunner::default();
    let store = CredentialStore::new(MemorySecretBackend::default(), ScriptedPrompt(Some("s3cret")));
    let (mut orchestrator, _events) = Orchestrator::new(
        settings(),
        remote.clone(),
        runner.clone(),
        FakeLauncher::default(),
        store,
    );

    orchestrator.start(profile(&dir)).await.unwrap();
    assert_eq!(orchestrator.state(), Watching);
    assert_eq!(remote.probes(), 2);
    assert_eq!(runner.calls()[0].password.as_deref(), Some("s3cret"));
    orchestrator.stop().await;
}

#[tokio::test]
async fn cancelled_prompt_is_terminal_authentication_error() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::with_fallback(ConnectionTest::failed(RemoteError::Authentication(
        "denied".into(),
    )));
    let store = CredentialStore::new(MemorySecretBackend::default(), ScriptedPrompt(None));
    let (mut orchestrator, _events) = Orchestrator::new(
        settings(),
        remote.clone(),
        FakeRunner::default(),
        FakeLauncher::default(),
        store,
    );

    let failure = orchestrator.start(profile(&dir)).await.unwrap_err();
    assert_eq!(failure.kind, ErrorKind::Authentication);
    assert!(!failure.recoverable);
    assert_eq!(orchestrator.state(), Error);
    assert_eq!(remote.probes(), 1);
}

#[tokio::test]
async fn failed_initial_sync_aborts_start() {
    let dir = TempDir::new().unwrap();
    let runner = FakeRunner::default().then_exit(23);
    let (mut orchestrator, mut events) = Orchestrator::new(
        settings(),
        FakeRemote::reachable(),
        runner,
        FakeLauncher::default(),
        CredentialStore::in_memory(),
    );

    let failure = orchestrator.start(profile(&dir)).await.unwrap_err();
    assert_eq!(failure.kind, ErrorKind::Transfer);
    assert_eq!(orchestrator.state(), Error);
    let seen = drain(&mut events);
    assert!(seen.iter().any(|e| matches!(e, OrchestratorEvent::SyncFailed { .. })));
    assert!(!seen.iter().any(is_entering(Watching)));
}

// =============================================================================
// Watching
// =============================================================================

#[tokio::test]
async fn batch_of_three_paths_runs_one_incremental_job() {
    let dir = TempDir::new().unwrap();
    let mut rig = spawn(settings(), FakeRemote::reachable(), FakeRunner::default());
    rig.handle.start(profile(&dir)).await.unwrap();
    drain(&mut rig.events);

    let feed = rig.launcher.feed();
    feed.send(change_line(&dir, "CLOSE_WRITE,CLOSE", "a.txt")).unwrap();
    feed.send(change_line(&dir, "CREATE", "sub/c.txt")).unwrap();
    feed.send(change_line(&dir, "DELETE", "b.txt")).unwrap();
    feed.send(change_line(&dir, "CLOSE_WRITE,CLOSE", ".git/index")).unwrap();

    let events = wait_for_sync_then_watching(&mut rig.events).await;

    let started: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            OrchestratorEvent::SyncStarted(job) => Some(job),
            _ => None,
        })
        .collect();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].strategy, SyncStrategy::Incremental);
    assert_eq!(started[0].files, vec!["a.txt", "b.txt", "sub/c.txt"]);

    let call = rig.runner.calls().pop().unwrap();
    assert!(call.spec.has_arg("--files-from=-"));
    assert_eq!(call.spec.stdin.as_deref(), Some("a.txt\nb.txt\nsub/c.txt\n"));

    let status = rig.handle.status().await.unwrap();
    assert_eq!(status.state, Watching);
    assert_eq!(status.retry_count, 0);
    assert_eq!(
        transitions(&events),
        vec![(Watching, Syncing), (Syncing, Watching)]
    );
}

#[tokio::test]
async fn moved_in_directory_is_mirrored_recursively() {
    let dir = TempDir::new().unwrap();
    let mut rig = spawn(settings(), FakeRemote::reachable(), FakeRunner::default());
    rig.handle.start(profile(&dir)).await.unwrap();
    drain(&mut rig.events);

    rig.launcher
        .feed()
        .send(change_line(&dir, "MOVED_TO,ISDIR", "newdir"))
        .unwrap();
    wait_for_sync_then_watching(&mut rig.events).await;

    let call = rig.runner.calls().pop().unwrap();
    assert!(call.spec.has_arg("-r"));
    assert!(call.spec.has_arg("--files-from=-"));
    assert_eq!(call.spec.stdin.as_deref(), Some("newdir\n"));
}

#[tokio::test]
async fn recoverable_failure_recovers_and_resyncs_carried_paths() {
    let dir = TempDir::new().unwrap();
    let runner = FakeRunner::default().then_exit(0).then_exit(23);
    let mut rig = spawn(settings(), FakeRemote::reachable(), runner);
    rig.handle.start(profile(&dir)).await.unwrap();
    drain(&mut rig.events);

    rig.launcher
        .feed()
        .send(change_line(&dir, "CLOSE_WRITE,CLOSE", "a.txt"))
        .unwrap();

    let events = wait_for_sync_then_watching(&mut rig.events).await;

    let error = events
        .iter()
        .find_map(|e| match e {
            OrchestratorEvent::Error {
                recoverable, retry, ..
            } => Some((*recoverable, *retry)),
            _ => None,
        })
        .unwrap();
    assert!(error.0);
    let retry = error.1.unwrap();
    assert_eq!((retry.current, retry.max), (1, 3));

    assert_eq!(
        transitions(&events),
        vec![
            (Watching, Syncing),
            (Syncing, Error),
            (Error, Recovering),
            (Recovering, Watching),
            (Watching, Syncing),
            (Syncing, Watching),
        ]
    );

    let calls = rig.runner.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2].spec.stdin.as_deref(), Some("a.txt\n"));
    assert_eq!(rig.handle.status().await.unwrap().retry_count, 0);
}

#[tokio::test]
async fn persistent_fault_exhausts_retry_budget() {
    let dir = TempDir::new().unwrap();
    let remote = FakeRemote::with_fallback(ConnectionTest::failed(RemoteError::Connect(
        "no route".into(),
    )))
    .then(ConnectionTest::ok(1));
    let runner = FakeRunner::default().then_exit(0).then_exit(30);
    let mut config = settings();
    config.max_retries = 2;
    let mut rig = spawn(config, remote, runner);
    rig.handle.start(profile(&dir)).await.unwrap();
    drain(&mut rig.events);

    rig.launcher
        .feed()
        .send(change_line(&dir, "CREATE", "new.txt"))
        .unwrap();

    let events = wait_for(&mut rig.events, |e| {
        matches!(e, OrchestratorEvent::Error { recoverable: false, .. })
    })
    .await;

    assert_eq!(
        transitions(&events),
        vec![
            (Watching, Syncing),
            (Syncing, Error),
            (Error, Recovering),
            (Recovering, Error),
            (Error, Recovering),
            (Recovering, Error),
        ]
    );
    let status = rig.handle.status().await.unwrap();
    assert_eq!(status.state, Error);
    assert_eq!(status.retry_count, 2);
    assert_eq!(
        status.last_error.map(|f| f.kind),
        Some(ErrorKind::Connection)
    );

    // Stays put until stopped.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(drain(&mut rig.events).is_empty());
    rig.handle.stop().await.unwrap();
    assert_eq!(rig.handle.status().await.unwrap().state, Idle);
}

#[tokio::test]
async fn terminal_transfer_failure_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let runner = FakeRunner::default().then_exit(0).then_exit(1);
    let mut rig = spawn(settings(), FakeRemote::reachable(), runner);
    rig.handle.start(profile(&dir)).await.unwrap();
    drain(&mut rig.events);
    let probes_before = rig.remote.probes();

    rig.launcher
        .feed()
        .send(change_line(&dir, "CLOSE_WRITE,CLOSE", "a.txt"))
        .unwrap();

    let events = wait_for(&mut rig.events, |e| matches!(e, OrchestratorEvent::Error { .. })).await;
    assert!(matches!(
        events.last(),
        Some(OrchestratorEvent::Error {
            recoverable: false,
            retry: None,
            ..
        })
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.handle.status().await.unwrap().state, Error);
    assert_eq!(rig.remote.probes(), probes_before);
}

#[tokio::test]
async fn terminal_failure_retires_the_watcher() {
    let dir = TempDir::new().unwrap();
    let runner = FakeRunner::default().then_exit(0).then_exit(1);
    let mut rig = spawn(settings(), FakeRemote::reachable(), runner);
    rig.handle.start(profile(&dir)).await.unwrap();
    drain(&mut rig.events);

    let feed = rig.launcher.feed();
    feed.send(change_line(&dir, "CLOSE_WRITE,CLOSE", "a.txt")).unwrap();
    wait_for(&mut rig.events, |e| {
        matches!(e, OrchestratorEvent::Error { recoverable: false, .. })
    })
    .await;

    // Nothing is listening any more, so edits cannot pile up while parked.
    for _ in 0..50 {
        assert!(feed.send(change_line(&dir, "CLOSE_WRITE,CLOSE", "a.txt")).is_err());
    }
    assert_eq!(rig.handle.status().await.unwrap().state, Error);

    rig.handle.stop().await.unwrap();
    rig.handle.start(profile(&dir)).await.unwrap();
    assert_eq!(rig.launcher.launches(), 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let calls = rig.runner.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[2].spec.has_arg("--delete"));
    assert!(calls[2].spec.stdin.is_none());
    assert_eq!(rig.handle.status().await.unwrap().state, Watching);
}

#[tokio::test]
async fn watcher_exit_is_recovered_by_relaunching() {
    let dir = TempDir::new().unwrap();
    let mut rig = spawn(settings(), FakeRemote::reachable(), FakeRunner::default());
    rig.handle.start(profile(&dir)).await.unwrap();
    drain(&mut rig.events);

    rig.launcher.close_feeds();

    let events = wait_for(&mut rig.events, is_entering(Watching)).await;
    assert!(events.iter().any(|e| matches!(
        e,
        OrchestratorEvent::Error { message, recoverable: true, .. } if message.contains("watch-process")
    )));
    assert_eq!(rig.launcher.launches(), 2);
}

// =============================================================================
// Control
// =============================================================================

#[tokio::test]
async fn stop_returns_to_idle_and_cancels_recovery() {
    let dir = TempDir::new().unwrap();
    let runner = FakeRunner::default().then_exit(0).then_exit(23);
    let mut config = settings();
    config.recovery_delay_ms = 200;
    let mut rig = spawn(config, FakeRemote::reachable(), runner);
    rig.handle.start(profile(&dir)).await.unwrap();

    rig.launcher
        .feed()
        .send(change_line(&dir, "CLOSE_WRITE,CLOSE", "a.txt"))
        .unwrap();
    wait_for(&mut rig.events, is_entering(Error)).await;
    let probes = rig.remote.probes();

    rig.handle.stop().await.unwrap();
    let status = rig.handle.status().await.unwrap();
    assert_eq!(status.state, Idle);
    assert!(status.profile.is_none());
    assert!(status.last_error.is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rig.remote.probes(), probes);
    assert!(!drain(&mut rig.events).iter().any(is_entering(Recovering)));
}

#[tokio::test]
async fn sync_now_runs_full_sync_only_while_watching() {
    let dir = TempDir::new().unwrap();
    let rig = spawn(settings(), FakeRemote::reachable(), FakeRunner::default());

    let err = rig.handle.sync_now().await.unwrap_err();
    assert_eq!(err, ControlError::NotWatching(Idle));

    rig.handle.start(profile(&dir)).await.unwrap();
    let result = rig.handle.sync_now().await.unwrap();
    assert!(result.success);
    assert_eq!(result.files_transferred, 3);
    assert_eq!(result.bytes_transferred, 1024);

    let calls = rig.runner.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[1].spec.has_arg("--delete"));
    assert_eq!(rig.handle.status().await.unwrap().state, Watching);
}

#[tokio::test]
async fn restarting_stops_the_previous_session() {
    let dir = TempDir::new().unwrap();
    let mut rig = spawn(settings(), FakeRemote::reachable(), FakeRunner::default());
    rig.handle.start(profile(&dir)).await.unwrap();
    drain(&mut rig.events);

    rig.handle.start(profile(&dir)).await.unwrap();
    let events = drain(&mut rig.events);
    assert_eq!(transitions(&events)[0], (Watching, Idle));
    assert_eq!(rig.launcher.launches(), 2);
}

#[tokio::test]
async fn sync_once_returns_to_idle() {
    let dir = TempDir::new().unwrap();
    let launcher = FakeLauncher::default();
    let (mut orchestrator, _events) = Orchestrator::new(
        settings(),
        FakeRemote::reachable(),
        FakeRunner::default(),
        launcher.clone(),
        CredentialStore::in_memory(),
    );

    let result = orchestrator.sync_once(profile(&dir)).await.unwrap();
    assert!(result.success);
    assert_eq!(orchestrator.state(), Idle);
    assert_eq!(launcher.launches(), 0);
}

#[tokio::test]
async fn shutdown_closes_the_handle() {
    let rig = spawn(settings(), FakeRemote::reachable(), FakeRunner::default());
    rig.handle.shutdown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(rig.handle.status().await.unwrap_err(), ControlError::Closed);
}
