//! Transfer layer: jobs, strategy selection, rsync command construction and
//! execution.
//!
//! ```rust,ignore
//! use remote_mirror_sync::transfer::{CommandBuilder, SyncJob, TransferExecutor, TransferRunner};
//!
//! let job = SyncJob::incremental(profile, vec!["src/main.rs".into()]);
//! let spec = CommandBuilder::default().for_job(&job);
//! let outcome = TransferExecutor::default().execute(&spec, None, timeout).await?;
//! println!("{} files", outcome.stats().files_transferred);
//! ```

pub mod command;
pub mod executor;
pub mod job;

pub use command::{
    CommandBuilder, CommandSpec, DEFAULT_TRANSFER_PROGRAM, STRATEGY_PREFERENCE, local_source,
    remote_destination, select_strategy,
};
pub use executor::{
    ExitCondition, TransferExecutor, TransferOutcome, TransferRunner, TransferStats,
    parse_rsync_stats,
};
pub use job::{JobError, JobStatus, SyncJob, SyncResult, SyncStrategy};
