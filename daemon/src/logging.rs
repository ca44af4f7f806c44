use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

pub const LOG_FILE_NAME: &str = "devmon.log";

const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Keeps the file writer flushing; hold it until the process exits.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Level after applying `-v` flags: each one raises verbosity by one step.
pub fn effective_level(configured: &str, verbosity: u8) -> &'static str {
    let base = LEVELS
        .iter()
        .position(|l| l.eq_ignore_ascii_case(configured.trim()))
        .unwrap_or(2);
    LEVELS[(base + usize::from(verbosity)).min(LEVELS.len() - 1)]
}

/// Installs the global subscriber: stderr always, plus a daily-rolling
/// `devmon.log` in `log_dir` when file logging is enabled.  `RUST_LOG`
/// overrides the configured level.
pub fn init(config: &LoggingConfig, verbosity: u8, log_dir: Option<&Path>) -> Result<LoggingGuard> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(effective_level(&config.level, verbosity))
            .context("Invalid log level")?,
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    let mut guard = None;
    let mut file_layer = None;
    if let (true, Some(dir)) = (config.file, log_dir) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);
        file_layer = Some(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(writer),
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(LoggingGuard { _file: guard })
}
