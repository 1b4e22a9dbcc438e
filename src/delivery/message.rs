//! Message definitions for the delivery core
//!
//! `Message` is what a handler sees: the decoded JSON body, the header map and
//! the routing key it was published under.
//!
//! Notes on headers:
//! - headers are an opaque string-keyed map that survives the transport
//! - three of them steer delivery: `x-retry-count` (attempts left),
//!   `x-retry-delay-ms` and `x-timeout-ms`
//! - by the time a handler runs, all three hold valid integers

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type Headers = serde_json::Map<String, Value>;

pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
pub const RETRY_DELAY_HEADER: &str = "x-retry-delay-ms";
pub const TIMEOUT_HEADER: &str = "x-timeout-ms";

/// Content type tag attached to every published payload.
pub const CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub body: Value,
    pub headers: Headers,
    pub routing_key: String,
    /// Payload exactly as it arrived, reused when the message is republished.
    #[serde(skip)]
    received: Option<String>,
}

impl Message {
    pub fn new(routing_key: impl Into<String>, body: Value) -> Self {
        Self {
            body,
            headers: Headers::new(),
            routing_key: routing_key.into(),
            received: None,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Rebuilds a message from its wire form. A payload that is not JSON is
    /// exposed as a string body; the original bytes are kept either way.
    pub fn from_payload(payload: &str, headers: Headers, routing_key: impl Into<String>) -> Self {
        let body = serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()));
        Self {
            body,
            headers,
            routing_key: routing_key.into(),
            received: Some(payload.to_string()),
        }
    }

    /// Wire form of the message. A received message yields its payload
    /// unchanged; otherwise the body is serialized as JSON.
    pub fn payload(&self) -> Result<String, serde_json::Error> {
        match &self.received {
            Some(payload) => Ok(payload.clone()),
            None => serde_json::to_string(&self.body),
        }
    }

    pub fn retry_count(&self) -> Option<u64> {
        self.headers.get(RETRY_COUNT_HEADER).and_then(Value::as_u64)
    }
}
