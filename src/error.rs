//! Failure taxonomy shared by the orchestrator and its observers.
//!
//! Validators and executors hand back structured outcomes; the orchestrator
//! folds those into a [`SyncFailure`] whose [`ErrorKind`] decides whether the
//! failure is retried or surfaced as terminal.

use std::fmt;

use thiserror::Error;

/// Coarse classification of everything that can stop a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or invalid profile fields, bad port, unreadable local dir.
    Configuration,
    /// The watch tool or the mirroring tool is not installed.
    PrerequisiteMissing,
    /// Remote host unreachable or timed out.
    Connection,
    /// Credential rejected by the remote host.
    Authentication,
    /// Mirroring tool exited non-zero.
    Transfer,
    /// Watch process exited unexpectedly.
    WatchProcess,
}

impl ErrorKind {
    /// Default recoverability for the kind. Transfer failures refine this
    /// through the exit-code table, see [`crate::transfer::ExitCondition`].
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::Connection | ErrorKind::Transfer | ErrorKind::WatchProcess
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::PrerequisiteMissing => "prerequisite-missing",
            ErrorKind::Connection => "connection",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Transfer => "transfer",
            ErrorKind::WatchProcess => "watch-process",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure as seen by the orchestrator: what kind, whether it may be
/// retried, and a message fit for the operator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct SyncFailure {
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
}

impl SyncFailure {
    /// Failure with the kind's default recoverability.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            recoverable: kind.is_recoverable(),
        }
    }

    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn prerequisite(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PrerequisiteMissing, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    pub fn watch_process(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WatchProcess, message)
    }
}
