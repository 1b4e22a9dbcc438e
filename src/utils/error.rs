//! The `error` module defines the error types used across `retrysub`.
//!
//! Only [`ConnectionError`] ever reaches the caller of `Connection::open`.
//! Handler failures and timeouts are absorbed by the delivery coordinator, and
//! publish failures during a republish are logged only.

use std::time::Duration;

/// Failures raised by a transport adapter.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport is closed")]
    Closed,

    #[error("unknown exchange: {0}")]
    UnknownExchange(String),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// The broker could not be reached, or the exchanges could not be declared.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("could not connect to {url}: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: TransportError,
    },

    #[error("connecting to {url} timed out after {timeout_ms}ms")]
    TimedOut { url: String, timeout_ms: u64 },

    #[error("failed to declare exchange {name}: {source}")]
    Topology {
        name: String,
        #[source]
        source: TransportError,
    },
}

/// A publish (or republish) was rejected by the transport.
#[derive(Debug, thiserror::Error)]
#[error("failed to publish to {routing_key}: {source}")]
pub struct PublishError {
    pub routing_key: String,
    #[source]
    pub source: TransportError,
}

/// The handler signaled failure, or panicked while running.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::Failed(message.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::Failed(message)
    }
}

/// The handler did not signal completion before its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("handler timed out after {}ms", .timeout.as_millis())]
pub struct TimeoutError {
    pub timeout: Duration,
}
