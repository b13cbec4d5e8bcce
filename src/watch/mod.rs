//! Local change detection: the exclusion matcher and the debounced
//! aggregator that turns watch-process output into change batches.

pub mod aggregator;
pub mod exclude;

use std::path::Path;
use std::time::Duration;

pub use aggregator::{
    ChangeAggregator, ChangeEvent, ChangeKind, WatchError, WatchSignal, parse_line, watch_command,
};
pub use exclude::ExcludeMatcher;

/// Starts aggregators for the orchestrator.
///
/// The production launcher spawns the watch tool; tests substitute a
/// launcher backed by [`ChangeAggregator::from_lines`].
pub trait WatchLauncher: Send + Sync {
    fn launch(
        &self,
        target: &Path,
        excludes: ExcludeMatcher,
        quiet_window: Duration,
    ) -> Result<ChangeAggregator, WatchError>;
}

/// Launches `inotifywait` (or a compatible program) in monitor mode.
#[derive(Debug, Clone)]
pub struct InotifyLauncher {
    program: String,
    kill_grace: Duration,
}

impl InotifyLauncher {
    pub fn new(program: impl Into<String>, kill_grace: Duration) -> Self {
        Self {
            program: program.into(),
            kill_grace,
        }
    }
}

impl WatchLauncher for InotifyLauncher {
    fn launch(
        &self,
        target: &Path,
        excludes: ExcludeMatcher,
        quiet_window: Duration,
    ) -> Result<ChangeAggregator, WatchError> {
        ChangeAggregator::start(&self.program, target, excludes, quiet_window, self.kill_grace)
    }
}
