//! Logger initialization with file and console output

use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

use crate::utils::error::{GatewayError, Result};

/// Initialize the global logger.
///
/// With `console` set, logs go to stderr with ANSI colors; otherwise they are
/// appended to a daily-rotated file named after the service inside `log_dir`.
/// The `RUST_LOG` environment variable overrides `level` when present.
pub fn init_logger(
    log_dir: impl AsRef<Path>,
    service_name: &str,
    level: &str,
    console: bool,
) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}={level}")));

    if console {
        fmt().with_env_filter(env_filter).init();
        tracing::info!("Logger initialized for service: {} (console mode)", service_name);
    } else {
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| GatewayError::Internal(format!("Failed to create log dir: {e}")))?;

        let file_appender = RollingFileAppender::new(
            Rotation::DAILY,
            log_dir,
            format!("{service_name}.log"),
        );

        fmt()
            .with_env_filter(env_filter)
            .with_writer(file_appender)
            .with_ansi(false)
            .init();

        tracing::info!("Logger initialized for service: {} (file mode)", service_name);
    }

    Ok(())
}
