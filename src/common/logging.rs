//! Logging setup.

use std::env;
use std::fs;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const DEBUG_ENV: &str = "COMPANION_RELAY_DEBUG";
const LOG_FILE_NAME: &str = "relay.log";

/// Get the directory holding the relay log file
pub fn log_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|c| c.join("companion-relay"))
}

/// Get the path to the relay log file
pub fn log_file_path() -> Option<PathBuf> {
    log_dir().map(|d| d.join(LOG_FILE_NAME))
}

fn debug_forced() -> bool {
    env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn build_filter(debug: bool) -> EnvFilter {
    if debug || debug_forced() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Initialize logging to stderr, and optionally to the relay log file.
///
/// The returned guard must be held for the life of the process when file
/// logging is on, otherwise buffered lines are lost at exit.
pub fn init_logging(debug: bool, to_file: bool) -> Option<WorkerGuard> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(build_filter(debug));

    let file_parts = if to_file { file_writer() } else { None };

    match file_parts {
        Some((writer, guard)) => {
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(build_filter(debug));
            let _ = tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry().with(stderr_layer).try_init();
            None
        }
    }
}

fn file_writer() -> Option<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let dir = log_dir()?;
    if let Err(err) = fs::create_dir_all(&dir) {
        eprintln!("Failed to create log directory {:?}: {}", dir, err);
        return None;
    }
    let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
    Some(tracing_appender::non_blocking(appender))
}
