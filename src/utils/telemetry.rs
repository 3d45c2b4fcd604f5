//! Logging bootstrap.
//!
//! stdout fmt layer plus an optional daily-rolling file, filtered by `RUST_LOG`
//! or the configured default directive.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::error::{OpsError, OpsResult};
use crate::orchestrator::profile::LoggingConfig;

/// Keep the returned guard alive for the life of the process or buffered file
/// output is lost.
pub fn init_logging(config: &LoggingConfig) -> OpsResult<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_directive))
        .map_err(|e| OpsError::Config(format!("invalid log directive: {}", e)))?;

    let stdout = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_line_number(config.with_line_numbers);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "autonomic.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer);
            Registry::default()
                .with(filter)
                .with(stdout)
                .with(file)
                .try_init()
                .map_err(|e| OpsError::Config(e.to_string()))?;
            Ok(Some(guard))
        }
        None => {
            Registry::default()
                .with(filter)
                .with(stdout)
                .try_init()
                .map_err(|e| OpsError::Config(e.to_string()))?;
            Ok(None)
        }
    }
}
