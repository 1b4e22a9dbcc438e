use std::time::Duration;

use serde_json::Value;

use crate::config::DeliverySettings;
use crate::delivery::message::{Headers, RETRY_COUNT_HEADER, RETRY_DELAY_HEADER, TIMEOUT_HEADER};

/// Values substituted for control headers that are missing or invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderDefaults {
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
}

impl Default for HeaderDefaults {
    fn default() -> Self {
        Self {
            retry_count: 10,
            retry_delay_ms: 60_000,
            timeout_ms: 60_000,
        }
    }
}

impl From<&DeliverySettings> for HeaderDefaults {
    fn from(settings: &DeliverySettings) -> Self {
        Self {
            retry_count: settings.retry_count,
            retry_delay_ms: settings.retry_delay_ms,
            timeout_ms: settings.timeout_ms,
        }
    }
}

/// Typed view over the three control headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFields {
    pub retry_count: u64,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

impl ControlFields {
    /// Reads the control headers, using `defaults` wherever a value is unusable.
    pub fn read(headers: &Headers, defaults: &HeaderDefaults) -> Self {
        Self {
            retry_count: field(headers, RETRY_COUNT_HEADER, 0)
                .unwrap_or(u64::from(defaults.retry_count)),
            retry_delay: Duration::from_millis(
                field(headers, RETRY_DELAY_HEADER, 0).unwrap_or(defaults.retry_delay_ms),
            ),
            timeout: Duration::from_millis(
                field(headers, TIMEOUT_HEADER, 1).unwrap_or(defaults.timeout_ms),
            ),
        }
    }
}

/// Returns `headers` with every control field holding a valid integer.
///
/// Valid values are kept, numeric strings are normalized to numbers, and
/// anything else (absent, non-integer, out of range) is replaced by the
/// default. Applying it twice yields the same map.
pub fn ensure_defaults(mut headers: Headers, defaults: &HeaderDefaults) -> Headers {
    let fields = ControlFields::read(&headers, defaults);
    headers.insert(RETRY_COUNT_HEADER.to_string(), Value::from(fields.retry_count));
    headers.insert(
        RETRY_DELAY_HEADER.to_string(),
        Value::from(fields.retry_delay.as_millis() as u64),
    );
    headers.insert(
        TIMEOUT_HEADER.to_string(),
        Value::from(fields.timeout.as_millis() as u64),
    );
    headers
}

fn field(headers: &Headers, name: &str, min: u64) -> Option<u64> {
    headers.get(name).and_then(parse_int).filter(|value| *value >= min)
}

/// Integers and integer strings are accepted; negative numbers are not.
fn parse_int(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
