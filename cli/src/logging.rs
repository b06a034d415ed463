use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{runtime_dir, LogLevel};

static INSTALLED: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    File,
    Stderr,
}

impl LogMode {
    pub fn from_config(log_to_file: bool) -> Self {
        if log_to_file {
            LogMode::File
        } else {
            LogMode::Stderr
        }
    }
}

/// Flushes the log file when dropped.
#[must_use]
pub struct LogGuard(Option<WorkerGuard>);

pub fn log_dir() -> PathBuf {
    runtime_dir()
}

/// Installs the global subscriber once. `role` names the log file so a
/// server and a watcher running side by side write to separate files.
pub fn init(
    level: LogLevel,
    mode: LogMode,
    role: &str,
    cli_override: Option<LogLevel>,
) -> LogGuard {
    let Some(level) = cli_override.unwrap_or(level).as_tracing_level() else {
        return LogGuard(None);
    };
    if INSTALLED.set(()).is_err() {
        return LogGuard(None);
    }

    if mode == LogMode::Stderr {
        install_stderr(level);
        return LogGuard(None);
    }

    let dir = log_dir();
    match file_writer(&dir, role) {
        Ok((writer, guard)) => {
            tracing_subscriber::registry()
                .with(env_filter(level))
                .with(
                    fmt::layer()
                        .with_writer(writer)
                        .with_timer(UtcTime::rfc_3339())
                        .with_ansi(false)
                        .with_file(true)
                        .with_line_number(true),
                )
                .init();
            LogGuard(Some(guard))
        }
        Err(e) => {
            eprintln!(
                "Warning: cannot write logs to {}: {}, using stderr",
                dir.display(),
                e
            );
            install_stderr(level);
            LogGuard(None)
        }
    }
}

// stdout is reserved for `export` lines and cycle JSON.
fn install_stderr(level: Level) {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            fmt::layer()
                .with_writer(io::stderr)
                .with_timer(UtcTime::rfc_3339()),
        )
        .init();
}

/// `RUST_LOG` wins. Otherwise the `ibp` crates log at `level` and
/// dependencies only warn.
fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(level)))
}

fn default_directives(level: Level) -> String {
    format!("warn,ibp={}", level.as_str().to_ascii_lowercase())
}

fn file_writer(dir: &Path, role: &str) -> io::Result<(NonBlocking, WorkerGuard)> {
    fs::create_dir_all(dir)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(format!("ibp-{}", role))
        .filename_suffix("log")
        .max_log_files(7)
        .build(dir)
        .map_err(io::Error::other)?;

    Ok(tracing_appender::non_blocking(appender))
}
