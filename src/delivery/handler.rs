//! Handler contract
//!
//! A handler receives a [`Message`] together with a [`Completion`] and must
//! signal the outcome through it. `Completion` is consumed when used, so one
//! handler invocation can signal at most once; racing that signal against the
//! attempt's deadline is the coordinator's job.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::delivery::message::Message;
use crate::utils::error::{HandlerError, TimeoutError};
use crate::utils::logging::Logger;

#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, message: Message, done: Completion);
}

/// How an attempt was resolved. Only the first resolution counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed(HandlerError),
    TimedOut(TimeoutError),
}

/// Single-assignment slot shared by the handler's completion, the deadline
/// timer and the panic watcher of one attempt.
pub(crate) struct Resolution {
    resolved: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl Resolution {
    pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let resolution = Arc::new(Self {
            resolved: AtomicBool::new(false),
            sender: Mutex::new(Some(tx)),
        });
        (resolution, rx)
    }

    /// Returns `false` when another party already resolved the attempt.
    pub(crate) fn resolve(&self, outcome: Outcome) -> bool {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return false;
        }
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = sender {
            let _ = tx.send(outcome);
        }
        true
    }
}

/// Completion signal handed to a handler.
pub struct Completion {
    resolution: Arc<Resolution>,
    routing_key: String,
    logger: Arc<dyn Logger>,
}

impl Completion {
    pub(crate) fn new(
        resolution: Arc<Resolution>,
        routing_key: String,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            resolution,
            routing_key,
            logger,
        }
    }

    pub fn ok(self) -> bool {
        self.finish(Ok(()))
    }

    pub fn fail(self, error: impl Into<HandlerError>) -> bool {
        self.finish(Err(error.into()))
    }

    /// Signals the outcome. Returns `false` if the attempt had already been
    /// resolved (usually by its deadline), in which case the signal is dropped.
    pub fn finish(self, result: Result<(), HandlerError>) -> bool {
        let outcome = match result {
            Ok(()) => Outcome::Succeeded,
            Err(err) => Outcome::Failed(err),
        };
        let accepted = self.resolution.resolve(outcome);
        if !accepted {
            self.logger.debug(&format!(
                "retrysub: discarding late completion for {}",
                self.routing_key
            ));
        }
        accepted
    }
}

/// Adapts an async closure into a [`Handler`].
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Message, Completion) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Message, Completion) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: Message, done: Completion) {
        (self.f)(message, done).await
    }
}
