//! Shared logging setup for SQLGate binaries.
//!
//! Two layers: a daily log file under `$SQLGATE_HOME/logs` and stderr.
//! Nothing is ever written to stdout, which belongs to the JSON-RPC stream.
//!
//! File writes go through a background worker; keep the [`LoggingGuard`]
//! alive for the life of the process or buffered lines are lost on exit.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "sqlgate=info,sqlgate_mcp=info,sqlgate_db=info,sqlgate_security=info";
const MAX_LOG_FILES: usize = 7;

/// Logging configuration for a SQLGate process.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Mirror the file filter on stderr instead of only warnings.
    pub verbose: bool,
    /// Overrides `$SQLGATE_HOME/logs`.
    pub log_dir: Option<PathBuf>,
}

/// Flushes the background file writer when dropped.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: WorkerGuard,
}

/// Initialize tracing with a daily rolling log file and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<LoggingGuard> {
    let log_dir = match config.log_dir {
        Some(dir) => dir,
        None => logs_dir(),
    };
    let appender = file_appender(&log_dir, config.app_name)?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if config.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(LoggingGuard { _file: guard })
}

/// `<dir>/<app>.<date>.log`, rolled daily, keeping the last week.
fn file_appender(dir: &Path, app_name: &str) -> Result<RollingFileAppender> {
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create logs directory: {}", dir.display()))?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(sanitize_name(app_name))
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(dir)
        .with_context(|| format!("Failed to open log file in {}", dir.display()))
}

/// SQLGate home directory: `$SQLGATE_HOME`, else `~/.sqlgate`.
pub fn sqlgate_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("SQLGATE_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sqlgate")
}

/// Default logs directory: `$SQLGATE_HOME/logs`.
pub fn logs_dir() -> PathBuf {
    sqlgate_home().join("logs")
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' { ch } else { '_' })
        .collect()
}
