//! Watch a local directory and keep a remote copy in step over rsync/SSH.
//!
//! The [`orchestrator`] drives everything: it validates a [`config::Profile`],
//! probes the host through [`remote`], runs an initial full [`transfer`], then
//! mirrors each debounced batch from [`watch`] incrementally, retrying and
//! recovering according to the [`error`] taxonomy.

pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod remote;
pub mod transfer;
pub mod watch;

pub use config::{EngineSettings, Profile, Settings};
pub use error::{ErrorKind, SyncFailure};
pub use orchestrator::{Orchestrator, OrchestratorEvent, OrchestratorHandle, OrchestratorState};
