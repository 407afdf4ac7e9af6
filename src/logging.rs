//! Logging setup for mindfleet using tracing.
//!
//! The daemon writes a daily rolling `daemon.log` under `<home>/logs`, next to the
//! per-mind output in `<home>/minds/<key>/mind.log`, and mirrors it to stderr.
//! Client commands only log warnings to stderr so their own output stays readable.

use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter override, takes precedence over `RUST_LOG`.
pub const LOG_ENV: &str = "MINDFLEET_LOG";
pub const LOG_DIR: &str = "logs";
pub const DAEMON_LOG_PREFIX: &str = "daemon.log";

/// Who is logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    Daemon,
    Client,
}

impl LogMode {
    fn default_directive(self) -> &'static str {
        match self {
            LogMode::Daemon => "info,mindfleet=debug,tower_http=info",
            LogMode::Client => "warn",
        }
    }
}

pub fn log_dir(home: &Path) -> PathBuf {
    home.join(LOG_DIR)
}

fn env_filter(mode: LogMode) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(mode.default_directive()))
}

fn console_layer<S>(mode: LogMode) -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(mode == LogMode::Daemon)
}

/// Install the global subscriber.
///
/// In daemon mode the returned guard flushes the file writer on drop; keep it
/// alive for the lifetime of the process.
pub fn init(home: &Path, mode: LogMode) -> Result<Option<WorkerGuard>> {
    if mode == LogMode::Client {
        tracing_subscriber::registry()
            .with(env_filter(mode))
            .with(console_layer(mode))
            .try_init()?;
        return Ok(None);
    }

    let dir = log_dir(home);
    std::fs::create_dir_all(&dir)?;
    let (non_blocking, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, DAEMON_LOG_PREFIX));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter(mode))
        .with(file_layer)
        .with(console_layer(mode))
        .try_init()?;

    tracing::debug!("Daemon log directory: {}", dir.display());
    Ok(Some(guard))
}

/// Console-only logging captured by the test harness. Safe to call from every test.
#[cfg(test)]
pub fn init_test() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new("mindfleet=debug"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_test_writer())
        .try_init();
}
