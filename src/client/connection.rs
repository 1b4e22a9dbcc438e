//! Connection
//!
//! `Connection` is the public face of the crate. It owns the transport, the
//! declared exchange pair (`<name>` and `<name>.dead`) and the delivery
//! coordinator shared by every subscription.
//!
//! Each subscription gets a consumer task that hands every delivery to the
//! coordinator on a task of its own, so a slow handler never holds up the
//! next message.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use crate::config::{DeliverySettings, Settings};
use crate::delivery::coordinator::DeliveryCoordinator;
use crate::delivery::handler::Handler;
use crate::delivery::headers::HeaderDefaults;
use crate::delivery::message::Headers;
use crate::delivery::retry::Exchanges;
use crate::transport::amqp::AmqpTransport;
use crate::transport::{ExchangeHandle, QueueHandle, Transport};
use crate::utils::error::{ConnectionError, PublishError, TransportError};
use crate::utils::logging::{self, Logger};

/// Everything needed to open a [`Connection`].
#[derive(Clone, Default)]
pub struct ConnectionOptions {
    pub settings: Settings,
    pub logger: Option<Arc<dyn Logger>>,
}

impl ConnectionOptions {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            logger: None,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }
}

impl From<Settings> for ConnectionOptions {
    fn from(settings: Settings) -> Self {
        Self::new(settings)
    }
}

/// A handler registration request.
#[derive(Clone)]
pub struct Subscription {
    /// Routing key the consumer queue is bound with.
    pub routing_key: String,
    /// Name of the consumer queue.
    pub consumer: String,
    pub handler: Arc<dyn Handler>,
    /// Deadline for each attempt. `None` or zero uses the configured
    /// `delivery.timeout_ms`.
    pub timeout: Option<Duration>,
}

impl Subscription {
    pub fn new(
        routing_key: impl Into<String>,
        consumer: impl Into<String>,
        handler: impl Handler,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            consumer: consumer.into(),
            handler: Arc::new(handler),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A live subscription.
#[derive(Debug)]
pub struct Registration {
    queue: QueueHandle,
    dead_letter_queue: Option<QueueHandle>,
    stop: Arc<Notify>,
}

impl Registration {
    pub fn queue(&self) -> &QueueHandle {
        &self.queue
    }

    pub fn dead_letter_queue(&self) -> Option<&QueueHandle> {
        self.dead_letter_queue.as_ref()
    }

    /// Stops taking new deliveries. The consumer is cancelled on the
    /// transport and deliveries it had not started handling are requeued.
    /// Attempts already running finish normally.
    pub fn cancel(&self) {
        self.stop.notify_one();
    }
}

pub struct Connection {
    transport: Arc<dyn Transport>,
    coordinator: Arc<DeliveryCoordinator>,
    delivery: DeliverySettings,
    logger: Arc<dyn Logger>,
    consumers: Mutex<Vec<AbortHandle>>,
}

impl Connection {
    /// Connects to the AMQP broker named in the settings and declares the
    /// exchange pair.
    pub async fn open(options: ConnectionOptions) -> Result<Self, ConnectionError> {
        let logger = logging::resolve(options.logger.clone());
        let url = &options.settings.connection.url;
        logger.info(&format!("retrysub: connecting to {url}"));

        let transport = match AmqpTransport::connect(&options.settings.connection).await {
            Ok(transport) => transport,
            Err(err) => {
                logger.error(&format!("retrysub: {url} error: {err}"));
                return Err(err);
            }
        };
        logger.info(&format!("retrysub: connected to {url}"));

        Self::open_with(Arc::new(transport), options).await
    }

    /// Declares the exchange pair on an already connected transport.
    pub async fn open_with(
        transport: Arc<dyn Transport>,
        options: ConnectionOptions,
    ) -> Result<Self, ConnectionError> {
        let logger = logging::resolve(options.logger);
        let name = options.settings.connection.name;

        let origin = declare_exchange(transport.as_ref(), &name, logger.as_ref()).await?;
        let dead_letter =
            declare_exchange(transport.as_ref(), &format!("{name}.dead"), logger.as_ref()).await?;

        let coordinator = DeliveryCoordinator::new(
            transport.clone(),
            Exchanges {
                origin,
                dead_letter,
            },
            HeaderDefaults::from(&options.settings.delivery),
            logger.clone(),
        );

        Ok(Self {
            transport,
            coordinator: Arc::new(coordinator),
            delivery: options.settings.delivery,
            logger,
            consumers: Mutex::new(Vec::new()),
        })
    }

    pub fn exchanges(&self) -> &Exchanges {
        self.coordinator.exchanges()
    }

    /// Binds the consumer queue and starts handling its deliveries.
    pub async fn subscribe(&self, subscription: Subscription) -> Result<Registration, TransportError> {
        let Subscription {
            routing_key,
            consumer,
            handler,
            timeout,
        } = subscription;
        if routing_key.is_empty() {
            return Err(TransportError::InvalidArgument("routing key is required"));
        }
        if consumer.is_empty() {
            return Err(TransportError::InvalidArgument("consumer is required"));
        }

        let exchanges = self.coordinator.exchanges();
        let queue = self
            .bind_queue(&exchanges.origin, &consumer, &routing_key)
            .await?;

        let dead_letter_queue = if self.delivery.dead_letter_queues {
            let name = format!("dead.{consumer}");
            Some(
                self.bind_queue(&exchanges.dead_letter, &name, &routing_key)
                    .await?,
            )
        } else {
            None
        };

        let mut deliveries = self.transport.subscribe(&queue).await?;
        let transport = self.transport.clone();
        let coordinator = self.coordinator.clone();
        let logger = self.logger.clone();
        let stop = Arc::new(Notify::new());

        let task = tokio::spawn({
            let stop = stop.clone();
            let queue = queue.clone();
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = stop.notified() => break,
                        next = deliveries.recv() => {
                            let Some(delivery) = next else {
                                logger.debug("retrysub: delivery stream closed");
                                return;
                            };
                            logger.debug(&format!(
                                "retrysub: received message for {}",
                                delivery.routing_key
                            ));
                            let coordinator = coordinator.clone();
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                let (message, ack) = delivery.into_parts();
                                coordinator.handle(message, ack, handler, timeout).await;
                            });
                        }
                    }
                }

                logger.debug(&format!("retrysub: cancelling consumer on {}", queue.name));
                if let Err(err) = transport.unsubscribe(&queue).await {
                    logger.error(&format!(
                        "retrysub: failed to cancel consumer on {}: {err}",
                        queue.name
                    ));
                }
                deliveries.close();
                while let Some(delivery) = deliveries.recv().await {
                    if let Err(err) = delivery.ack.acknowledge(true).await {
                        logger.error(&format!(
                            "retrysub: failed to requeue message for {}: {err}",
                            delivery.routing_key
                        ));
                    }
                }
            }
        });

        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task.abort_handle());

        Ok(Registration {
            queue,
            dead_letter_queue,
            stop,
        })
    }

    /// Publishes `body` as JSON to the main exchange. Returns once the
    /// transport accepted it; there is no delivery confirmation.
    pub async fn publish<B: Serialize + ?Sized>(
        &self,
        routing_key: &str,
        body: &B,
        headers: Option<Headers>,
    ) -> Result<(), PublishError> {
        let publish_error = |source| PublishError {
            routing_key: routing_key.to_string(),
            source,
        };
        if routing_key.is_empty() {
            return Err(publish_error(TransportError::InvalidArgument(
                "routing key is required",
            )));
        }
        self.logger
            .debug(&format!("retrysub: publish({routing_key})"));

        let payload = serde_json::to_string(body).map_err(|err| publish_error(err.into()))?;
        let result = self
            .transport
            .publish(
                &self.coordinator.exchanges().origin,
                routing_key,
                payload,
                &headers.unwrap_or_default(),
            )
            .await
            .map_err(publish_error);

        match &result {
            Ok(()) => self.logger.debug(&format!(
                "retrysub: finished publishing message for {routing_key}"
            )),
            Err(err) => self.logger.error(&format!("retrysub: {err}")),
        }
        result
    }

    /// Stops every consumer task and closes the transport.
    pub async fn close(&self) -> Result<(), TransportError> {
        let consumers: Vec<AbortHandle> = self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for consumer in consumers {
            consumer.abort();
        }
        self.logger.info("retrysub: closing connection");
        self.transport.close().await
    }

    async fn bind_queue(
        &self,
        exchange: &ExchangeHandle,
        queue: &str,
        routing_key: &str,
    ) -> Result<QueueHandle, TransportError> {
        self.transport.declare_queue(queue, true).await?;
        let handle = self.transport.bind(exchange, queue, routing_key).await?;
        self.logger.debug(&format!(
            "retrysub: bound {queue} to {} with {routing_key}",
            exchange.name()
        ));
        Ok(handle)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("exchanges", self.exchanges())
            .field("delivery", &self.delivery)
            .finish_non_exhaustive()
    }
}

async fn declare_exchange(
    transport: &dyn Transport,
    name: &str,
    logger: &dyn Logger,
) -> Result<ExchangeHandle, ConnectionError> {
    logger.debug(&format!("retrysub: creating exchange {name}"));
    transport
        .declare_exchange(name, true)
        .await
        .map_err(|source| ConnectionError::Topology {
            name: name.to_string(),
            source,
        })
}
