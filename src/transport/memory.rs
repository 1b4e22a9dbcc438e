//! In-memory transport
//!
//! A direct exchange living in process memory. It mirrors the broker
//! behavior the delivery core depends on:
//! - exchanges route by exact routing key to every bound queue
//! - queues without a consumer buffer their messages until one subscribes
//! - several consumers on one queue take turns (round robin)
//! - deliveries stay outstanding until acknowledged; requeue redelivers
//!
//! Every publish and acknowledgment is recorded so callers can inspect what
//! happened.
//!
//! State lives behind one `std::sync::Mutex` that is never held across an
//! await point.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::delivery::message::Headers;
use crate::transport::{
    AckHandle, Delivery, DeliveryReceiver, ExchangeHandle, QueueHandle, Transport,
};
use crate::utils::error::TransportError;

/// A message as it passed through an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub exchange: String,
    pub routing_key: String,
    pub body: String,
    pub headers: Headers,
}

/// Counters over everything the transport has settled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub published: usize,
    pub acknowledged: usize,
    pub requeued: usize,
    /// Acknowledgments issued for a delivery that was already settled.
    pub duplicate_acks: usize,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    backlog: VecDeque<Envelope>,
    consumers: Vec<UnboundedSender<Delivery>>,
    next_consumer: usize,
}

#[derive(Debug, Default)]
struct ExchangeState {
    exchanges: HashSet<String>,
    queues: HashMap<String, MemoryQueue>,
    bindings: HashMap<(String, String), BTreeSet<String>>,
    published: Vec<Envelope>,
    stats: MemoryStats,
    closed: bool,
}

type SharedState = Arc<Mutex<ExchangeState>>;

#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: SharedState,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, in order.
    pub fn published(&self) -> Vec<Envelope> {
        self.lock().published.clone()
    }

    pub fn published_to(&self, exchange: &str) -> Vec<Envelope> {
        self.lock()
            .published
            .iter()
            .filter(|envelope| envelope.exchange == exchange)
            .cloned()
            .collect()
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn backlog(&self, queue: &str) -> Vec<Envelope> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.backlog.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, ExchangeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_state(&self) -> Result<MutexGuard<'_, ExchangeState>, TransportError> {
        let state = self.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        Ok(state)
    }
}

/// Hands `envelope` to the next live consumer of `queue_name`, or buffers it.
fn deliver(state: &mut ExchangeState, shared: &SharedState, queue_name: &str, envelope: Envelope) {
    let Some(queue) = state.queues.get_mut(queue_name) else {
        return;
    };

    while !queue.consumers.is_empty() {
        let index = queue.next_consumer % queue.consumers.len();
        let delivery = Delivery {
            body: envelope.body.clone(),
            headers: envelope.headers.clone(),
            routing_key: envelope.routing_key.clone(),
            ack: Box::new(MemoryAck {
                state: shared.clone(),
                queue: queue_name.to_string(),
                envelope: envelope.clone(),
                settled: AtomicBool::new(false),
            }),
        };
        match queue.consumers[index].send(delivery) {
            Ok(()) => {
                queue.next_consumer = index + 1;
                return;
            }
            Err(_) => {
                // Receiver is gone; forget the consumer and try the next one.
                queue.consumers.remove(index);
            }
        }
    }
    queue.backlog.push_back(envelope);
}

struct MemoryAck {
    state: SharedState,
    queue: String,
    envelope: Envelope,
    settled: AtomicBool,
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn acknowledge(&self, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if self.settled.swap(true, Ordering::AcqRel) {
            state.stats.duplicate_acks += 1;
            return Err(TransportError::InvalidArgument("delivery already acknowledged"));
        }
        if requeue {
            state.stats.requeued += 1;
            deliver(&mut state, &self.state, &self.queue, self.envelope.clone());
        } else {
            state.stats.acknowledged += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_exchange(
        &self,
        name: &str,
        _durable: bool,
    ) -> Result<ExchangeHandle, TransportError> {
        let mut state = self.open_state()?;
        state.exchanges.insert(name.to_string());
        Ok(ExchangeHandle::new(name))
    }

    async fn declare_queue(&self, name: &str, _durable: bool) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind(
        &self,
        exchange: &ExchangeHandle,
        queue: &str,
        routing_key: &str,
    ) -> Result<QueueHandle, TransportError> {
        let mut state = self.open_state()?;
        if !state.exchanges.contains(exchange.name()) {
            return Err(TransportError::UnknownExchange(exchange.name().to_string()));
        }
        if !state.queues.contains_key(queue) {
            return Err(TransportError::UnknownQueue(queue.to_string()));
        }
        state
            .bindings
            .entry((exchange.name().to_string(), routing_key.to_string()))
            .or_default()
            .insert(queue.to_string());

        Ok(QueueHandle {
            name: queue.to_string(),
            exchange: exchange.name().to_string(),
            routing_key: routing_key.to_string(),
        })
    }

    async fn publish(
        &self,
        exchange: &ExchangeHandle,
        routing_key: &str,
        payload: String,
        headers: &Headers,
    ) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        if !state.exchanges.contains(exchange.name()) {
            return Err(TransportError::UnknownExchange(exchange.name().to_string()));
        }

        let envelope = Envelope {
            exchange: exchange.name().to_string(),
            routing_key: routing_key.to_string(),
            body: payload,
            headers: headers.clone(),
        };
        state.published.push(envelope.clone());
        state.stats.published += 1;

        let targets: Vec<String> = state
            .bindings
            .get(&(envelope.exchange.clone(), envelope.routing_key.clone()))
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default();

        // Unroutable messages are dropped, as a broker would.
        for queue in targets {
            deliver(&mut state, &self.state, &queue, envelope.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &QueueHandle) -> Result<DeliveryReceiver, TransportError> {
        let mut state = self.open_state()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let entry = state
            .queues
            .get_mut(&queue.name)
            .ok_or_else(|| TransportError::UnknownQueue(queue.name.clone()))?;
        entry.consumers.push(tx);
        let waiting: Vec<Envelope> = entry.backlog.drain(..).collect();

        for envelope in waiting {
            deliver(&mut state, &self.state, &queue.name, envelope);
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, queue: &QueueHandle) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        let entry = state
            .queues
            .get_mut(&queue.name)
            .ok_or_else(|| TransportError::UnknownQueue(queue.name.clone()))?;
        entry.consumers.clear();
        entry.next_consumer = 0;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.closed = true;
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
        Ok(())
    }
}
