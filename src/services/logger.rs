//! Structured logging setup.
//!
//! Sets up:
//! - File output: rolling log files in `{base}/logs/holow-mcp.log` with
//!   daily rotation, keeping the latest 5 files.
//! - Console output on stderr: stdout is reserved for JSON-RPC frames,
//!   so nothing else may ever write there.
//! - Environment filter: defaults to `info`, configurable via `RUST_LOG`.

use std::fs;
use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system.
///
/// # Panics
///
/// Panics if the tracing subscriber cannot be set (e.g., called twice).
/// Use `try_init()` for fallible initialization.
pub fn init(base: &Path) {
    try_init(base).expect("logger already initialized");
}

/// Fallible variant of [`init`].
pub fn try_init(base: &Path) -> Result<(), String> {
    let log_dir = base.join("logs");
    let _ = fs::create_dir_all(&log_dir);

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("holow-mcp")
        .filename_suffix("log")
        .max_log_files(5)
        .build(&log_dir)
        .map_err(|e| format!("failed to create log file appender: {e}"))?;

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .compact();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| format!("logger already initialized: {e}"))?;

    tracing::info!(log_dir = %log_dir.display(), "logger initialized");
    Ok(())
}
