//! Tracing setup for Piecework
//!
//! Console output at the level the user picks, plus a full trace of the
//! last run on disk for post-mortem debugging of peer sessions.

use std::fs::{File, create_dir_all};
use std::path::{Path, PathBuf};

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use crate::PieceworkError;

/// File the last run's trace is written to, inside the logs directory.
pub const LAST_RUN_LOG: &str = "piecework-last-run.log";

/// Installs the global subscriber: console at `console_level`, file at trace.
///
/// `RUST_LOG` overrides the console level when set. Returns the path of the
/// trace file, which is truncated on every run.
///
/// # Errors
///
/// - `PieceworkError::Configuration` - Logs directory or file cannot be created, or a subscriber is already installed
pub fn init_tracing(console_level: Level, logs_dir: &Path) -> Result<PathBuf, PieceworkError> {
    create_dir_all(logs_dir).map_err(|e| PieceworkError::Configuration {
        reason: format!("cannot create logs directory {}: {e}", logs_dir.display()),
    })?;

    let log_file_path = logs_dir.join(LAST_RUN_LOG);
    let log_file = File::create(&log_file_path).map_err(|e| PieceworkError::Configuration {
        reason: format!("cannot create {}: {e}", log_file_path.display()),
    })?;

    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level.to_string()));
    let console_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_filter(console_filter);

    let file_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(log_file)
        .with_filter(EnvFilter::new("trace"));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| PieceworkError::Configuration {
            reason: format!("tracing already initialized: {e}"),
        })?;

    tracing::info!(
        console = %console_level,
        trace_file = %log_file_path.display(),
        "Tracing initialized"
    );

    Ok(log_file_path)
}

/// CLI log levels for user control
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliLogLevel {
    /// Only error messages
    Error,
    /// Warning and error messages
    Warn,
    /// Progress and peer lifecycle
    Info,
    /// Per-peer protocol decisions
    Debug,
    /// Every wire message
    Trace,
}

impl CliLogLevel {
    /// Converts CLI log level to tracing Level enum.
    ///
    /// # Examples
    /// ```
    /// use piecework_core::tracing_setup::CliLogLevel;
    ///
    /// let level = CliLogLevel::Info.as_tracing_level();
    /// assert_eq!(level, tracing::Level::INFO);
    /// ```
    pub fn as_tracing_level(self) -> Level {
        match self {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CliLogLevel::Error => "error",
            CliLogLevel::Warn => "warn",
            CliLogLevel::Info => "info",
            CliLogLevel::Debug => "debug",
            CliLogLevel::Trace => "trace",
        };
        f.write_str(name)
    }
}
