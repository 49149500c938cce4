//! # Setup Logging
//!
//! Configures the global `tracing` subscriber:
//! - the level comes from `RUST_LOG` when set, otherwise from the configured
//!   level,
//! - console output is human-readable with ANSI colors,
//! - file output is JSON, one file per day under the log directory, written
//!   through a non-blocking appender.
//!
//! The returned [`WorkerGuard`] flushes buffered lines when dropped, so the
//! caller keeps it alive for the life of the process.

use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Failures while installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The log directory could not be created.
    #[error("failed to create log directory: {0}")]
    LogDir(#[from] io::Error),

    /// Neither `RUST_LOG` nor the configured level is a valid filter.
    #[error("invalid log filter {filter:?}: {reason}")]
    Filter {
        /// The rejected directive.
        filter: String,
        /// Parser message.
        reason: String,
    },

    /// A global subscriber is already installed.
    #[error("failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Builds the filter: `RUST_LOG` wins, `log_level` is the fallback.
pub fn build_filter(log_level: &str) -> Result<EnvFilter, LoggingError> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| LoggingError::Filter {
            filter: log_level.to_string(),
            reason: e.to_string(),
        })
}

/// Installs the global subscriber. Log files are named `<file_prefix>.<date>`.
pub fn setup_logging(
    log_dir: &Path,
    log_level: &str,
    file_prefix: &str,
) -> Result<WorkerGuard, LoggingError> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, file_prefix);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    tracing_subscriber::registry()
        .with(build_filter(log_level)?)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    info!(level = log_level, dir = %log_dir.display(), "Logging initialized");
    Ok(guard)
}
