//! Delivery coordinator
//!
//! Drives one delivery attempt from arrival to acknowledgment:
//! - defaults the control headers before the handler sees them
//! - runs the handler on its own task while a deadline timer runs on another
//! - takes the first of success, failure, panic or timeout as the outcome;
//!   later signals are discarded
//! - on failure or timeout asks the [`RetryPolicy`] where the message goes
//!   next and republishes it
//! - acknowledges the original delivery exactly once, whatever happened
//!
//! A timed-out handler is not cancelled. It keeps running on its task and its
//! eventual signal is ignored.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::delivery::handler::{Completion, Handler, Outcome, Resolution};
use crate::delivery::headers::{HeaderDefaults, ensure_defaults};
use crate::delivery::message::Message;
use crate::delivery::retry::{Exchanges, RetryAction, RetryPolicy};
use crate::transport::{AckHandle, Transport};
use crate::utils::error::{HandlerError, TimeoutError};
use crate::utils::logging::Logger;

/// Lifecycle of a single delivery attempt.
///
/// `Pending -> Dispatched -> {Succeeded | Failed | TimedOut}`, then
/// `Failed | TimedOut -> {Retrying | DeadLettered}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Dispatched,
    Succeeded,
    Failed,
    TimedOut,
    Retrying,
    DeadLettered,
}

impl AttemptState {
    /// Terminal states end in exactly one acknowledgment.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptState::Succeeded | AttemptState::Retrying | AttemptState::DeadLettered
        )
    }
}

pub struct DeliveryCoordinator {
    transport: Arc<dyn Transport>,
    exchanges: Exchanges,
    policy: RetryPolicy,
    defaults: HeaderDefaults,
    logger: Arc<dyn Logger>,
}

impl DeliveryCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        exchanges: Exchanges,
        defaults: HeaderDefaults,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            transport,
            exchanges,
            policy: RetryPolicy::new(defaults),
            defaults,
            logger,
        }
    }

    pub fn exchanges(&self) -> &Exchanges {
        &self.exchanges
    }

    /// Runs one attempt and returns the terminal state it ended in.
    ///
    /// `timeout` is the subscription's deadline. `None` or a zero duration
    /// falls back to the configured `timeout_ms`.
    pub async fn handle(
        &self,
        mut message: Message,
        ack: Box<dyn AckHandle>,
        handler: Arc<dyn Handler>,
        timeout: Option<Duration>,
    ) -> AttemptState {
        message.headers = ensure_defaults(std::mem::take(&mut message.headers), &self.defaults);
        let timeout = timeout
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(Duration::from_millis(self.defaults.timeout_ms));
        let routing_key = message.routing_key.clone();

        let mut state = AttemptState::Pending;
        let (resolution, outcome_rx) = Resolution::new();

        let timer = tokio::spawn({
            let resolution = resolution.clone();
            async move {
                tokio::time::sleep(timeout).await;
                resolution.resolve(Outcome::TimedOut(TimeoutError { timeout }));
            }
        });

        let done = Completion::new(resolution.clone(), routing_key.clone(), self.logger.clone());
        let invocation = tokio::spawn({
            let message = message.clone();
            async move { handler.handle(message, done).await }
        });
        state = self.transition(&routing_key, state, AttemptState::Dispatched);

        // A panicking handler resolves the attempt as failed instead of
        // tearing anything down.
        tokio::spawn({
            let resolution = resolution.clone();
            async move {
                if let Err(err) = invocation.await {
                    if err.is_panic() {
                        let reason = panic_reason(err.into_panic());
                        resolution.resolve(Outcome::Failed(HandlerError::Panicked(reason)));
                    }
                }
            }
        });

        let outcome = outcome_rx.await.unwrap_or_else(|_| {
            Outcome::Failed(HandlerError::new("attempt resolution was dropped"))
        });
        timer.abort();

        match outcome {
            Outcome::Succeeded => {
                state = self.transition(&routing_key, state, AttemptState::Succeeded);
                self.logger
                    .debug(&format!("retrysub: ack message after success for {routing_key}"));
                self.acknowledge(ack.as_ref(), &routing_key).await;
                return state;
            }
            Outcome::Failed(err) => {
                self.logger.error(&format!(
                    "retrysub: error returned from client handler for {routing_key}: {err}"
                ));
                state = self.transition(&routing_key, state, AttemptState::Failed);
            }
            Outcome::TimedOut(err) => {
                self.logger
                    .debug(&format!("retrysub: time out reached for {routing_key}: {err}"));
                state = self.transition(&routing_key, state, AttemptState::TimedOut);
            }
        }

        let decision = self.policy.decide(&message.headers);
        let next = match decision.action {
            RetryAction::Retry => {
                self.logger.debug(&format!(
                    "retrysub: retries left for {routing_key}: {}",
                    message.retry_count().unwrap_or_default()
                ));
                AttemptState::Retrying
            }
            RetryAction::DeadLetter => {
                self.logger.debug(&format!(
                    "retrysub: routing {routing_key} to dead exchange {}",
                    self.exchanges.dead_letter.name()
                ));
                AttemptState::DeadLettered
            }
        };

        // Publish failures are not retried; the delivery is settled regardless.
        if let Err(err) = self
            .policy
            .execute(self.transport.as_ref(), &self.exchanges, &message, &decision)
            .await
        {
            self.logger.error(&format!("retrysub: {err}"));
        }

        state = self.transition(&routing_key, state, next);
        self.logger
            .debug(&format!("retrysub: ack message after retry for {routing_key}"));
        self.acknowledge(ack.as_ref(), &routing_key).await;
        state
    }

    fn transition(&self, routing_key: &str, from: AttemptState, to: AttemptState) -> AttemptState {
        self.logger
            .debug(&format!("retrysub: {routing_key} attempt {from:?} -> {to:?}"));
        to
    }

    async fn acknowledge(&self, ack: &dyn AckHandle, routing_key: &str) {
        if let Err(err) = ack.acknowledge(false).await {
            self.logger.error(&format!(
                "retrysub: failed to acknowledge delivery for {routing_key}: {err}"
            ));
        }
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
