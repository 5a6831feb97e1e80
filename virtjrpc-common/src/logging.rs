//! Logging initialization using tracing.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Initialize the tracing subscriber with the specified log level.
///
/// When `log_to_files` is set, events are additionally appended to
/// `/var/log/<app>-main.log` (everything) and `/var/log/<app>-errors.log`
/// (WARN and above), both created with mode 0600. A failed log file open is
/// a hard error so the daemon refuses to start half-blind.
pub fn init_logging(level: &str, log_to_files: bool, app: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    let stdout = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    if !log_to_files {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout)
            .init();
        return Ok(());
    }

    let main_log = open_log_file(&format!("/var/log/{}-main.log", app))?;
    let errors_log = open_log_file(&format!("/var/log/{}-errors.log", app))?;

    let main_layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(Arc::new(main_log));

    let errors_layer = fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(Arc::new(errors_log))
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(main_layer)
        .with(errors_layer)
        .init();

    Ok(())
}

fn open_log_file(path: &str) -> Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path))
}
