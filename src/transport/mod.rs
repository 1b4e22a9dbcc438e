//! The `transport` module is the seam between the delivery core and the
//! broker client underneath it.
//!
//! [`Transport`] is the publish/subscribe/ack contract the core relies on.
//! Two adapters implement it:
//! - [`amqp::AmqpTransport`] talks to an AMQP 0-9-1 broker through `lapin`
//! - [`memory::MemoryTransport`] is an in-process direct exchange used by the
//!   tests and the demo binary

pub mod amqp;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::delivery::message::{Headers, Message};
use crate::utils::error::TransportError;

/// A declared exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExchangeHandle {
    name: String,
}

impl ExchangeHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A queue bound to an exchange under one routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub name: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Settles one transport delivery.
#[async_trait]
pub trait AckHandle: Send + Sync {
    /// `requeue = false` removes the delivery from its queue; `true` hands it
    /// back to the broker for redelivery.
    async fn acknowledge(&self, requeue: bool) -> Result<(), TransportError>;
}

/// One raw message handed over by a transport.
pub struct Delivery {
    pub body: String,
    pub headers: Headers,
    pub routing_key: String,
    pub ack: Box<dyn AckHandle>,
}

impl Delivery {
    /// Splits the delivery into the decoded message and its ack handle.
    pub fn into_parts(self) -> (Message, Box<dyn AckHandle>) {
        let message = Message::from_payload(&self.body, self.headers, self.routing_key);
        (message, self.ack)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("body", &self.body)
            .field("headers", &self.headers)
            .field("routing_key", &self.routing_key)
            .finish_non_exhaustive()
    }
}

pub type DeliveryReceiver = UnboundedReceiver<Delivery>;

/// Publish/subscribe/ack primitives supplied by the broker client.
///
/// Implementations must tolerate interleaved calls from many tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn declare_exchange(
        &self,
        name: &str,
        durable: bool,
    ) -> Result<ExchangeHandle, TransportError>;

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), TransportError>;

    async fn bind(
        &self,
        exchange: &ExchangeHandle,
        queue: &str,
        routing_key: &str,
    ) -> Result<QueueHandle, TransportError>;

    /// Fire-and-forget: returns once the transport accepted the message, never
    /// waits for a broker confirmation.
    async fn publish(
        &self,
        exchange: &ExchangeHandle,
        routing_key: &str,
        payload: String,
        headers: &Headers,
    ) -> Result<(), TransportError>;

    /// Starts consuming `queue` with manual acknowledgment.
    async fn subscribe(&self, queue: &QueueHandle) -> Result<DeliveryReceiver, TransportError>;

    /// Stops every consumer started on `queue`. Deliveries already handed
    /// over stay outstanding until acknowledged or requeued.
    async fn unsubscribe(&self, queue: &QueueHandle) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
