//! Sync jobs and their results.
//!
//! A job moves strictly `Pending -> Running -> {Completed | Failed}`. Any
//! other lifecycle call is a caller bug and returns [`JobError`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::Profile;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Full tree mirror or a transfer limited to a list of changed paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStrategy {
    Full,
    Incremental,
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Illegal lifecycle call on a job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot {action} job {job_id} while it is {status}")]
pub struct JobError {
    pub job_id: u64,
    pub status: JobStatus,
    pub action: &'static str,
}

/// One transfer request and its lifecycle.
#[derive(Debug, Clone)]
pub struct SyncJob {
    pub id: u64,
    pub profile: Profile,
    pub files: Vec<String>,
    pub strategy: SyncStrategy,
    pub created_at: DateTime<Utc>,
    status: JobStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
    files_transferred: u64,
    bytes_transferred: u64,
}

impl SyncJob {
    pub fn new(profile: Profile, files: Vec<String>, strategy: SyncStrategy) -> Self {
        Self {
            id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
            profile,
            files,
            strategy,
            created_at: Utc::now(),
            status: JobStatus::Pending,
            started_at: None,
            completed_at: None,
            error: None,
            files_transferred: 0,
            bytes_transferred: 0,
        }
    }

    pub fn full(profile: Profile) -> Self {
        Self::new(profile, Vec::new(), SyncStrategy::Full)
    }

    pub fn incremental(profile: Profile, files: Vec<String>) -> Self {
        Self::new(profile, files, SyncStrategy::Incremental)
    }

    pub fn start(&mut self) -> Result<(), JobError> {
        self.expect_status(JobStatus::Pending, "start")?;
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self, files_transferred: u64, bytes_transferred: u64) -> Result<(), JobError> {
        self.expect_status(JobStatus::Running, "complete")?;
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.files_transferred = files_transferred;
        self.bytes_transferred = bytes_transferred;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), JobError> {
        self.expect_status(JobStatus::Running, "fail")?;
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
        Ok(())
    }

    fn expect_status(&self, expected: JobStatus, action: &'static str) -> Result<(), JobError> {
        if self.status == expected {
            Ok(())
        } else {
            tracing::error!(job_id = self.id, status = %self.status, action, "illegal job lifecycle call");
            Err(JobError {
                job_id: self.id,
                status: self.status,
                action,
            })
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn files_transferred(&self) -> u64 {
        self.files_transferred
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }
}

/// Snapshot handed to observers once a job finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub success: bool,
    pub job_id: u64,
    pub files_transferred: u64,
    pub bytes_transferred: u64,
    pub duration: Duration,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> Profile {
        Profile::new("app", "deploy", "host", "/remote", "/local")
    }

    #[test]
    fn test_happy_lifecycle() {
        let mut job = SyncJob::full(profile());
        assert_eq!(job.status(), JobStatus::Pending);

        job.start().unwrap();
        assert_eq!(job.status(), JobStatus::Running);
        assert!(job.started_at().is_some());

        job.complete(3, 1024).unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.files_transferred(), 3);
        assert_eq!(job.bytes_transferred(), 1024);
        assert!(job.completed_at().is_some());
    }

    #[test]
    fn test_failure_lifecycle() {
        let mut job = SyncJob::incremental(profile(), vec!["a".into()]);
        job.start().unwrap();
        job.fail("rsync exited with 23").unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error(), Some("rsync exited with 23"));
    }

    #[test]
    fn test_illegal_calls_rejected() {
        let mut job = SyncJob::full(profile());
        assert!(job.complete(0, 0).is_err());
        assert!(job.fail("nope").is_err());

        job.start().unwrap();
        let err = job.start().unwrap_err();
        assert_eq!(err.status, JobStatus::Running);
        assert_eq!(err.action, "start");

        job.complete(0, 0).unwrap();
        assert!(job.complete(0, 0).is_err());
        assert!(job.fail("late").is_err());
        assert_eq!(job.status(), JobStatus::Completed);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = SyncJob::full(profile());
        let b = SyncJob::full(profile());
        assert_ne!(a.id, b.id);
    }
}
