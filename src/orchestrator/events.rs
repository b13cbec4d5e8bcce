//! Everything the orchestrator tells the outside world travels over one
//! channel as an [`OrchestratorEvent`].

use tokio::sync::mpsc;

use super::state::OrchestratorState;
use crate::error::SyncFailure;
use crate::transfer::{SyncJob, SyncResult};

/// Current attempt and budget for a recoverable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStatus {
    pub current: u32,
    pub max: u32,
}

#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    StateChanged {
        old: OrchestratorState,
        new: OrchestratorState,
        /// Alias of the active profile, if any.
        profile: Option<String>,
    },
    SyncStarted(SyncJob),
    SyncCompleted {
        job: SyncJob,
        result: SyncResult,
    },
    SyncFailed {
        job: SyncJob,
        error: SyncFailure,
    },
    FilesChanged(Vec<String>),
    Error {
        message: String,
        recoverable: bool,
        retry: Option<RetryStatus>,
    },
}

impl OrchestratorEvent {
    /// Short name for logs and test assertions.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state-changed",
            Self::SyncStarted(_) => "sync-started",
            Self::SyncCompleted { .. } => "sync-completed",
            Self::SyncFailed { .. } => "sync-failed",
            Self::FilesChanged(_) => "files-changed",
            Self::Error { .. } => "error",
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<OrchestratorEvent>;

/// Sending half. Events are dropped silently once nobody listens.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: OrchestratorEvent) {
        tracing::trace!(event = event.name(), "emit");
        let _ = self.tx.send(event);
    }
}
