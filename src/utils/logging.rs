use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Initialize tracing/logging for the application.
///
/// `RUST_LOG` wins when it is set; otherwise `default_level` applies to every
/// target.
pub fn init(default_level: &str) {
    // try_init so tests and libraries can call this multiple times without panicking
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(false)
        .try_init();
}

/// Builds the filter used by [`init`].
pub fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level(default_level).to_string()))
}

fn level(name: &str) -> LevelFilter {
    match name.to_lowercase().as_str() {
        "error" => LevelFilter::ERROR,
        "warn" | "warning" => LevelFilter::WARN,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Logging capability handed to a connection.
///
/// The library never talks to a global logger on its own; whatever is passed
/// here receives every lifecycle line the delivery core produces.
pub trait Logger: Send + Sync {
    fn info(&self, message: &str);
    fn debug(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards to `tracing` events under the `retrysub` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn info(&self, message: &str) {
        tracing::info!(target: "retrysub", "{message}");
    }

    fn debug(&self, message: &str) {
        tracing::debug!(target: "retrysub", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "retrysub", "{message}");
    }
}

/// Discards everything. Used when no logger is supplied.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn info(&self, _message: &str) {}
    fn debug(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// Resolves an optional logger, synthesizing a no-op one when absent.
pub fn resolve(logger: Option<Arc<dyn Logger>>) -> Arc<dyn Logger> {
    logger.unwrap_or_else(|| Arc::new(NoopLogger))
}
