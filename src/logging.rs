//! Process-wide tracing setup.
//!
//! [`LoggingContext::init`] is called once from `main`. The returned value
//! owns the background writer for the optional log file; dropping it at
//! shutdown flushes whatever is still buffered.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const DEFAULT_LEVEL: &str = "info";

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("invalid log filter '{filter}': {source}")]
    Filter {
        filter: String,
        #[source]
        source: ParseError,
    },

    #[error("log file path has no file name: {0}")]
    BadLogPath(PathBuf),

    #[error("failed to create log directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global subscriber is already installed")]
    AlreadyInitialized,
}

/// Owns logging resources for the lifetime of the process.
#[derive(Debug)]
pub struct LoggingContext {
    log_file: Option<PathBuf>,
    _guard: Option<WorkerGuard>,
}

impl LoggingContext {
    /// Install the global subscriber: compact stderr output plus, when
    /// `log_file` is set, a plain-text copy written off-thread.
    pub fn init(level: Option<&str>, log_file: Option<&Path>) -> Result<Self, LoggingError> {
        let filter = build_filter(level)?;
        let stderr_layer = tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr);

        let (file_layer, guard) = match log_file {
            Some(path) => {
                let file_name = path
                    .file_name()
                    .ok_or_else(|| LoggingError::BadLogPath(path.to_path_buf()))?;
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                std::fs::create_dir_all(dir).map_err(|source| LoggingError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;

                let appender = tracing_appender::rolling::never(dir, file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .with(file_layer)
            .try_init()
            .map_err(|_| LoggingError::AlreadyInitialized)?;

        Ok(Self {
            log_file: log_file.map(Path::to_path_buf),
            _guard: guard,
        })
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }
}

/// Explicit level wins, then `RUST_LOG`, then [`DEFAULT_LEVEL`].
pub fn build_filter(level: Option<&str>) -> Result<EnvFilter, LoggingError> {
    match level {
        Some(level) => EnvFilter::try_new(level).map_err(|source| LoggingError::Filter {
            filter: level.to_string(),
            source,
        }),
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))),
    }
}
