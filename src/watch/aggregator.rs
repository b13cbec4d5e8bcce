//! Debounced change aggregation on top of an external watch process.
//!
//! The watch process (inotifywait in monitor mode) prints one
//! `"<EVENTS> <path>"` line per change. Lines are parsed, filtered through the
//! profile's [`ExcludeMatcher`], and collected into a path-keyed map so that
//! several events on the same path within one quiet window collapse into the
//! last one. Every accepted event restarts the window; when it elapses the
//! map is flushed as a single [`WatchSignal::Batch`].
//!
//! ```text
//! inotifywait stdout ──> reader task ──> debounce task ──> WatchSignal::Batch
//! inotifywait exit   ──> supervisor task ─────────────────> WatchSignal::Fault
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use super::exclude::ExcludeMatcher;
use crate::process::terminate_gracefully;

/// Events requested from the watch tool.
pub const WATCH_EVENTS: &[&str] = &["close_write", "create", "delete", "move"];

/// Errors from launching the watch process.
#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to start watch process '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Watch process has no stdout pipe")]
    NoStdout,
}

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
    Move,
}

impl ChangeKind {
    /// Map an inotify event list such as `CLOSE_WRITE,CLOSE` or
    /// `CREATE,ISDIR` to a change kind.
    pub fn from_inotify(events: &str) -> Option<Self> {
        let flags: Vec<&str> = events.split(',').map(str::trim).collect();
        let has = |name: &str| flags.iter().any(|f| f.eq_ignore_ascii_case(name));

        if has("CREATE") {
            Some(Self::Create)
        } else if has("DELETE") || has("DELETE_SELF") {
            Some(Self::Delete)
        } else if has("MOVED_FROM") || has("MOVED_TO") || has("MOVE") || has("MOVE_SELF") {
            Some(Self::Move)
        } else if has("CLOSE_WRITE") || has("MODIFY") {
            Some(Self::Modify)
        } else {
            None
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Modify => write!(f, "modify"),
            Self::Delete => write!(f, "delete"),
            Self::Move => write!(f, "move"),
        }
    }
}

/// One coalesced change, with `path` relative to the watched root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub path: String,
    pub timestamp: DateTime<Utc>,
    pub old_path: Option<String>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            timestamp: Utc::now(),
            old_path: None,
        }
    }
}

/// Output of a running aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchSignal {
    /// One quiet window's worth of changes, one event per path.
    Batch(Vec<ChangeEvent>),
    /// The watch process died on its own.
    Fault(String),
}

/// Program and arguments for the watch process.
pub fn watch_command(program: &str, target: &Path) -> (String, Vec<String>) {
    let mut args = vec!["-m".to_string(), "-r".to_string()];
    for event in WATCH_EVENTS {
        args.push("-e".to_string());
        args.push((*event).to_string());
    }
    args.push("--format".to_string());
    args.push("%e %w%f".to_string());
    args.push(target.to_string_lossy().into_owned());
    (program.to_string(), args)
}

/// Parse a watch line into a kind and a root-relative path.
///
/// Returns `None` for lines that are not `"<EVENTS> <path>"`, for unknown
/// event kinds, and for paths outside `root`.
pub fn parse_line(line: &str, root: &Path) -> Option<(ChangeKind, String)> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (events, path) = line.split_once(' ')?;
    if events.is_empty() || path.trim().is_empty() {
        return None;
    }
    let kind = ChangeKind::from_inotify(events)?;
    let relative = relativize(path, root)?;
    Some((kind, relative))
}

fn relativize(path: &str, root: &Path) -> Option<String> {
    let root = root.to_string_lossy();
    let root = root.trim_end_matches('/');

    let relative = if root.is_empty() {
        path.trim_start_matches('/')
    } else if let Some(rest) = path.strip_prefix(root) {
        if !rest.is_empty() && !rest.starts_with('/') {
            // sibling such as /data/app2 when watching /data/app
            return None;
        }
        rest.trim_start_matches('/')
    } else if path.starts_with('/') {
        return None;
    } else {
        path
    };

    let relative = relative.trim_end_matches('/');
    (!relative.is_empty()).then(|| relative.to_string())
}

/// Forward watch output line by line until the pipe closes or nobody
/// listens. Read errors end the stream; undecodable lines do not.
pub async fn forward_lines<R: AsyncRead + Unpin>(reader: R, lines: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "failed reading watch output");
                break;
            }
        }
        let Some(line) = decode_watch_line(&buf) else {
            continue;
        };
        if lines.send(line).is_err() {
            break;
        }
    }
}

/// Decode one raw watch line.
///
/// Paths are bytes on Linux. A name that is not UTF-8 cannot be handed to
/// rsync as a `String`, so the event is widened to the nearest directory
/// whose path is valid UTF-8; the recursive incremental transfer then
/// picks the file up. `None` when not even the event token decodes.
pub fn decode_watch_line(raw: &[u8]) -> Option<String> {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    match std::str::from_utf8(raw) {
        Ok(line) => Some(line.to_string()),
        Err(e) => {
            let valid = &raw[..e.valid_up_to()];
            let slash = valid.iter().rposition(|&b| b == b'/');
            let widened = slash
                .map(|at| &valid[..at])
                .and_then(|prefix| std::str::from_utf8(prefix).ok())
                .filter(|prefix| prefix.contains(' '));
            match widened {
                Some(prefix) => {
                    tracing::warn!(
                        line = %String::from_utf8_lossy(raw),
                        "non-UTF-8 path; syncing its directory instead"
                    );
                    Some(prefix.to_string())
                }
                None => {
                    tracing::warn!(line = %String::from_utf8_lossy(raw), "dropping undecodable watch line");
                    None
                }
            }
        }
    }
}

/// Which half of a rename a watch line reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveSide {
    From,
    To,
}

impl MoveSide {
    pub fn from_inotify(events: &str) -> Option<Self> {
        events.split(',').map(str::trim).find_map(|flag| {
            if flag.eq_ignore_ascii_case("MOVED_FROM") {
                Some(Self::From)
            } else if flag.eq_ignore_ascii_case("MOVED_TO") {
                Some(Self::To)
            } else {
                None
            }
        })
    }
}

/// A running change aggregator.
///
/// Created by [`ChangeAggregator::start`] around a real watch process or by
/// [`ChangeAggregator::from_lines`] around any line source.
pub struct ChangeAggregator {
    root: PathBuf,
    signals: mpsc::UnboundedReceiver<WatchSignal>,
    stop_tx: Option<oneshot::Sender<()>>,
    debouncer: Option<JoinHandle<Vec<ChangeEvent>>>,
    process: Option<WatchProcess>,
}

struct WatchProcess {
    terminate_tx: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<()>,
}

impl ChangeAggregator {
    /// Spawn `program` recursively watching `target` and aggregate its output.
    pub fn start(
        program: &str,
        target: &Path,
        excludes: ExcludeMatcher,
        quiet_window: Duration,
        kill_grace: Duration,
    ) -> Result<Self, WatchError> {
        let (program, args) = watch_command(program, target);
        tracing::debug!(program = %program, args = ?args, "starting watch process");

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WatchError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(WatchError::NoStdout)?;
        let stderr = child.stderr.take();

        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        tokio::spawn(forward_lines(stdout, lines_tx));

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                while matches!(reader.read_until(b'\n', &mut buf).await, Ok(n) if n > 0) {
                    let line = String::from_utf8_lossy(&buf);
                    tracing::warn!(line = %line.trim(), "watch process");
                    buf.clear();
                }
            });
        }

        let (mut aggregator, faults) = Self::build(target, excludes, quiet_window, lines_rx);

        let (terminate_tx, terminate_rx) = oneshot::channel();
        let supervisor = tokio::spawn(supervise(child, terminate_rx, kill_grace, faults));
        aggregator.process = Some(WatchProcess {
            terminate_tx: Some(terminate_tx),
            supervisor,
        });

        tracing::info!(target = %target.display(), "watching for changes");
        Ok(aggregator)
    }

    /// Aggregate lines from an arbitrary source. The aggregator stops
    /// producing batches once the source closes.
    pub fn from_lines(
        target: &Path,
        excludes: ExcludeMatcher,
        quiet_window: Duration,
        lines: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self::build(target, excludes, quiet_window, lines).0
    }

    fn build(
        target: &Path,
        excludes: ExcludeMatcher,
        quiet_window: Duration,
        lines: mpsc::UnboundedReceiver<String>,
    ) -> (Self, mpsc::UnboundedSender<WatchSignal>) {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let root = target.to_path_buf();

        let debouncer = tokio::spawn(debounce(
            root.clone(),
            excludes,
            quiet_window,
            lines,
            signals_tx.clone(),
            stop_rx,
        ));

        let aggregator = Self {
            root,
            signals: signals_rx,
            stop_tx: Some(stop_tx),
            debouncer: Some(debouncer),
            process: None,
        };
        (aggregator, signals_tx)
    }

    /// Wait for the next batch or fault. `None` once everything upstream
    /// has shut down.
    pub async fn recv(&mut self) -> Option<WatchSignal> {
        self.signals.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<WatchSignal> {
        self.signals.try_recv().ok()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether the underlying watch process is still running.
    pub fn is_alive(&self) -> bool {
        match &self.process {
            Some(process) => !process.supervisor.is_finished(),
            None => self.debouncer.as_ref().is_some_and(|d| !d.is_finished()),
        }
    }

    /// Cancel the pending window, terminate the watch process, and return
    /// every change that was collected but never consumed.
    pub async fn stop(mut self) -> Vec<ChangeEvent> {
        let mut remaining = Vec::new();

        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(debouncer) = self.debouncer.take() {
            match debouncer.await {
                Ok(events) => remaining.extend(events),
                Err(e) => tracing::warn!(error = %e, "debounce task failed"),
            }
        }

        if let Some(mut process) = self.process.take() {
            if let Some(terminate_tx) = process.terminate_tx.take() {
                let _ = terminate_tx.send(());
            }
            if let Err(e) = process.supervisor.await {
                tracing::warn!(error = %e, "watch supervisor task failed");
            }
        }

        while let Ok(signal) = self.signals.try_recv() {
            if let WatchSignal::Batch(events) = signal {
                remaining.extend(events);
            }
        }
        remaining.sort_by(|a, b| a.path.cmp(&b.path));
        remaining
    }
}

async fn debounce(
    root: PathBuf,
    excludes: ExcludeMatcher,
    quiet_window: Duration,
    mut lines: mpsc::UnboundedReceiver<String>,
    signals: mpsc::UnboundedSender<WatchSignal>,
    mut stop_rx: oneshot::Receiver<()>,
) -> Vec<ChangeEvent> {
    let mut pending: BTreeMap<String, ChangeEvent> = BTreeMap::new();
    let mut deadline = Instant::now() + quiet_window;
    // inotify reports a rename as MOVED_FROM immediately followed by
    // MOVED_TO; the source path is kept to pair them.
    let mut moved_from: Option<String> = None;

    loop {
        tokio::select! {
            biased;

            _ = &mut stop_rx => {
                return pending.into_values().collect();
            }

            line = lines.recv() => {
                let Some(line) = line else {
                    flush(&mut pending, &signals);
                    return Vec::new();
                };
                let Some((kind, path)) = parse_line(&line, &root) else {
                    tracing::trace!(line = %line, "dropping unparseable watch line");
                    moved_from = None;
                    continue;
                };
                let side = line.split_once(' ').and_then(|(events, _)| MoveSide::from_inotify(events));
                let source = match side {
                    Some(MoveSide::From) => {
                        moved_from = Some(path.clone());
                        None
                    }
                    Some(MoveSide::To) => moved_from.take(),
                    None => {
                        moved_from = None;
                        None
                    }
                };
                if excludes.is_excluded(&path) {
                    continue;
                }
                let mut event = ChangeEvent::new(kind, path.clone());
                event.old_path = source;
                pending.insert(path, event);
                deadline = Instant::now() + quiet_window;
            }

            () = sleep_until(deadline), if !pending.is_empty() => {
                flush(&mut pending, &signals);
            }
        }
    }
}

fn flush(pending: &mut BTreeMap<String, ChangeEvent>, signals: &mpsc::UnboundedSender<WatchSignal>) {
    if pending.is_empty() {
        return;
    }
    let batch: Vec<ChangeEvent> = std::mem::take(pending).into_values().collect();
    tracing::debug!(count = batch.len(), "flushing change batch");
    let _ = signals.send(WatchSignal::Batch(batch));
}

async fn supervise(
    mut child: Child,
    mut terminate_rx: oneshot::Receiver<()>,
    kill_grace: Duration,
    signals: mpsc::UnboundedSender<WatchSignal>,
) {
    tokio::select! {
        status = child.wait() => {
            let message = match status {
                Ok(status) if status.success() => {
                    tracing::warn!("watch process exited");
                    return;
                }
                Ok(status) => format!("watch process exited unexpectedly ({status})"),
                Err(e) => format!("failed waiting for watch process: {e}"),
            };
            tracing::warn!(error = %message, "watch process fault");
            let _ = signals.send(WatchSignal::Fault(message));
        }
        _ = &mut terminate_rx => {
            terminate_gracefully(&mut child, kill_grace).await;
        }
    }
}
