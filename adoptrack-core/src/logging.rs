//! Logging for adoptrack
//!
//! `before`/`after` are invoked by editor hooks whose stdout and stderr are
//! part of the hook protocol, so every log line goes to a rotating file:
//! `logging.directory`, or `$XDG_STATE_HOME/adoptrack/` when unset. Files are
//! named `adoptrack.<date>.log`.
//!
//! The level comes from `logging.level`; `ADOPTRACK_LOG` overrides it with a
//! full filter directive such as `adoptrack_core::db=debug`.

use crate::config::{Config, LoggingConfig};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding a filter directive that replaces the level.
pub const LOG_ENV: &str = "ADOPTRACK_LOG";

/// Keeps the background log writer alive; pending lines are flushed on drop.
pub struct LoggingGuard {
    directory: PathBuf,
    _guard: WorkerGuard,
}

impl LoggingGuard {
    /// Directory the log files are written to
    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

/// Install the file subscriber as the global default.
pub fn init(config: &LoggingConfig) -> Result<LoggingGuard> {
    let (subscriber, guard) = file_subscriber(config)?;
    subscriber
        .try_init()
        .map_err(|e| Error::Config(format!("failed to install subscriber: {}", e)))?;

    tracing::info!(
        log_dir = %guard.directory.display(),
        level = %config.level,
        max_files = config.max_files,
        "Logging initialized"
    );
    Ok(guard)
}

/// Build the file subscriber without installing it.
pub fn file_subscriber(
    config: &LoggingConfig,
) -> Result<(impl Subscriber + Send + Sync + 'static, LoggingGuard)> {
    let directory = config.directory.clone().unwrap_or_else(Config::state_dir);
    std::fs::create_dir_all(&directory)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("adoptrack")
        .filename_suffix("log")
        .max_log_files(config.max_files.max(1))
        .build(&directory)
        .map_err(|e| Error::Config(format!("failed to create log appender: {}", e)))?;
    let (writer, worker) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_env(LOG_ENV).or_else(|_| EnvFilter::try_new(&config.level));
    let filter = filter.map_err(|e| {
        Error::Config(format!("invalid log level {:?}: {}", config.level, e))
    })?;

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true),
    );
    Ok((
        subscriber,
        LoggingGuard {
            directory,
            _guard: worker,
        },
    ))
}
