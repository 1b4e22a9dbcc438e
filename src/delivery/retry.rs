//! Retry policy
//!
//! Decides what happens to a message whose attempt failed or timed out:
//! - attempts left (`x-retry-count > 0`): republish to the main exchange after
//!   `x-retry-delay-ms`, with the count decremented by one
//! - no attempts left: republish immediately to the dead-letter exchange with
//!   the headers untouched
//!
//! The routing key is always preserved so the message keeps its logical
//! address in either exchange.

use std::time::Duration;

use serde_json::Value;

use crate::delivery::headers::{ControlFields, HeaderDefaults};
use crate::delivery::message::{Headers, Message, RETRY_COUNT_HEADER};
use crate::transport::{ExchangeHandle, Transport};
use crate::utils::error::PublishError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    DeadLetter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    pub action: RetryAction,
    pub delay: Duration,
    pub headers: Headers,
}

/// The exchange pair a connection publishes into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchanges {
    pub origin: ExchangeHandle,
    pub dead_letter: ExchangeHandle,
}

impl Exchanges {
    pub fn destination(&self, action: RetryAction) -> &ExchangeHandle {
        match action {
            RetryAction::Retry => &self.origin,
            RetryAction::DeadLetter => &self.dead_letter,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    defaults: HeaderDefaults,
}

impl RetryPolicy {
    pub fn new(defaults: HeaderDefaults) -> Self {
        Self { defaults }
    }

    pub fn decide(&self, headers: &Headers) -> RetryDecision {
        let fields = ControlFields::read(headers, &self.defaults);

        if fields.retry_count > 0 {
            let mut updated = headers.clone();
            updated.insert(
                RETRY_COUNT_HEADER.to_string(),
                Value::from(fields.retry_count - 1),
            );
            RetryDecision {
                action: RetryAction::Retry,
                delay: fields.retry_delay,
                headers: updated,
            }
        } else {
            RetryDecision {
                action: RetryAction::DeadLetter,
                delay: Duration::ZERO,
                headers: headers.clone(),
            }
        }
    }

    /// Waits out the decision's delay, then republishes `message` with the
    /// decision's headers. Does not wait for a broker confirmation.
    pub async fn execute(
        &self,
        transport: &dyn Transport,
        exchanges: &Exchanges,
        message: &Message,
        decision: &RetryDecision,
    ) -> Result<(), PublishError> {
        if !decision.delay.is_zero() {
            tokio::time::sleep(decision.delay).await;
        }

        let publish_error = |source| PublishError {
            routing_key: message.routing_key.clone(),
            source,
        };
        let payload = message.payload().map_err(|err| publish_error(err.into()))?;

        transport
            .publish(
                exchanges.destination(decision.action),
                &message.routing_key,
                payload,
                &decision.headers,
            )
            .await
            .map_err(publish_error)
    }
}
