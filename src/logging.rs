//! Log sink setup

use crate::config::{BridgeConfig, LogFormat, LogLevel};
use crate::error::{Error, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// File written when `log_to_file` is enabled
pub const LOG_FILE: &str = "bridge.log";

/// Build the level filter; `directives` (usually `RUST_LOG`) wins over `level`
pub fn level_filter(level: LogLevel, directives: Option<&str>) -> Result<EnvFilter> {
    match directives {
        Some(directives) if !directives.trim().is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(level.to_string()),
    }
    .map_err(|e| Error::config(format!("invalid log filter: {}", e)))
}

/// Install the global subscriber
///
/// The returned guard flushes the log file on drop and must be held until
/// the process exits.
pub fn init_logging(config: &BridgeConfig) -> Result<Option<WorkerGuard>> {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = level_filter(config.log_level, directives.as_deref())?;

    let console = match config.log_format {
        LogFormat::Json => fmt::layer().json().with_target(true).boxed(),
        LogFormat::Plain => fmt::layer().with_target(false).boxed(),
    };

    let (file_layer, guard) = if config.log_to_file {
        let appender = tracing_appender::rolling::never(".", LOG_FILE);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::config(format!("failed to install log subscriber: {}", e)))?;

    Ok(guard)
}
