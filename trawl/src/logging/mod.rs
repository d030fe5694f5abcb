//! Logging initialization.
//!
//! Console output through `tracing_subscriber::fmt` with an env-driven
//! filter, plus an optional daily-rotated file layer when a log directory
//! is configured.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "trawl=info,sqlx=warn";

/// Log file name prefix for the rotated file output.
const LOG_FILE_PREFIX: &str = "trawl.log";

/// Initialize the global tracing subscriber.
///
/// Returns the appender guard when file logging is enabled; the caller
/// must keep it alive for the process lifetime or buffered lines are
/// dropped on exit.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}
