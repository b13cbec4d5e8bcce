//! Orchestrator lifecycle states and the transition table.

use std::fmt;

use thiserror::Error;

use crate::config::Profile;
use crate::error::SyncFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OrchestratorState {
    #[default]
    Idle,
    Initializing,
    Connecting,
    Watching,
    Syncing,
    Error,
    Recovering,
}

impl OrchestratorState {
    /// The only legal edges. Everything else is rejected.
    pub fn can_transition_to(self, next: OrchestratorState) -> bool {
        use OrchestratorState::*;
        matches!(
            (self, next),
            (Idle, Initializing)
                | (Initializing, Connecting | Error | Idle)
                | (Connecting, Watching | Error | Idle)
                | (Watching, Syncing | Error | Idle)
                | (Syncing, Watching | Error)
                | (Error, Recovering | Idle)
                | (Recovering, Watching | Error | Idle)
        )
    }

    /// Anything but idle.
    pub fn is_active(self) -> bool {
        self != OrchestratorState::Idle
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Connecting => "connecting",
            Self::Watching => "watching",
            Self::Syncing => "syncing",
            Self::Error => "error",
            Self::Recovering => "recovering",
        }
    }
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("illegal state transition {from} -> {to}")]
pub struct TransitionError {
    pub from: OrchestratorState,
    pub to: OrchestratorState,
}

/// Current state plus the context that travels with it.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    state: OrchestratorState,
    profile: Option<Profile>,
    last_error: Option<SyncFailure>,
    retry_count: u32,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    pub fn last_error(&self) -> Option<&SyncFailure> {
        self.last_error.as_ref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn set_profile(&mut self, profile: Profile) {
        self.profile = Some(profile);
    }

    pub fn set_error(&mut self, failure: SyncFailure) {
        self.last_error = Some(failure);
    }

    /// Move to `next` if the table allows it and return the previous state.
    /// A rejected request is logged and leaves everything unchanged.
    pub fn transition(&mut self, next: OrchestratorState) -> Result<OrchestratorState, TransitionError> {
        if !self.state.can_transition_to(next) {
            tracing::warn!(from = %self.state, to = %next, "rejected state transition");
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        let old = std::mem::replace(&mut self.state, next);
        self.on_enter(next);
        tracing::debug!(from = %old, to = %next, retry = self.retry_count, "state transition");
        Ok(old)
    }

    /// Force `idle` from any state. Returns the previous state.
    pub fn reset(&mut self) -> OrchestratorState {
        let old = std::mem::replace(&mut self.state, OrchestratorState::Idle);
        self.on_enter(OrchestratorState::Idle);
        old
    }

    fn on_enter(&mut self, state: OrchestratorState) {
        match state {
            OrchestratorState::Watching => self.retry_count = 0,
            OrchestratorState::Recovering => self.retry_count += 1,
            OrchestratorState::Idle => {
                self.profile = None;
                self.last_error = None;
                self.retry_count = 0;
            }
            _ => {}
        }
    }
}
