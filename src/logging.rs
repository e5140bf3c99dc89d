//! Tracing subscriber setup.
//!
//! RUST_LOG takes precedence over the configured level.

use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "offline-sync.log";

fn filter(config: &LoggingConfig) -> EnvFilter {
  if std::env::var("RUST_LOG").is_ok() {
    EnvFilter::from_default_env()
  } else {
    EnvFilter::new(config.level.as_str())
  }
}

/// Install the global subscriber.
///
/// Logs go to a daily-rolling file under `log_dir` unless `config.stderr` is
/// set. The returned guard flushes the file writer and must outlive logging.
pub fn init(config: &LoggingConfig, log_dir: &Path) -> Result<Option<WorkerGuard>> {
  let filter = filter(config);

  if config.stderr {
    tracing_subscriber::registry()
      .with(filter)
      .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
      .try_init()
      .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;
    return Ok(None);
  }

  std::fs::create_dir_all(log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(Some(guard))
}
