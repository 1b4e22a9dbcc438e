//! AMQP transport
//!
//! Adapter over `lapin` for AMQP 0-9-1 brokers such as RabbitMQ.
//! Responsibilities:
//! - open the connection within `connection_timeout_ms` and a single channel
//! - declare durable direct exchanges and durable queues
//! - publish JSON payloads as persistent messages with the header map carried
//!   in the AMQP header table
//! - consume with manual acknowledgment and forward deliveries over a channel;
//!   deliveries that can no longer be forwarded are requeued
//!
//! Publishing never awaits the publisher confirm returned by the broker.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ConnectionSettings;
use crate::delivery::message::{CONTENT_TYPE, Headers};
use crate::transport::{
    AckHandle, Delivery, DeliveryReceiver, ExchangeHandle, QueueHandle, Transport,
};
use crate::utils::error::{ConnectionError, TransportError};

/// AMQP reply code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;

pub struct AmqpTransport {
    connection: Connection,
    channel: Channel,
    /// Consumer tags by queue name.
    consumers: Mutex<HashMap<String, Vec<String>>>,
}

impl AmqpTransport {
    pub async fn connect(settings: &ConnectionSettings) -> Result<Self, ConnectionError> {
        let connect_error = |err: lapin::Error| ConnectionError::Unreachable {
            url: settings.url.clone(),
            source: err.into(),
        };

        let connect = Connection::connect(&settings.url, ConnectionProperties::default());
        let connection = tokio::time::timeout(
            Duration::from_millis(settings.connection_timeout_ms),
            connect,
        )
        .await
        .map_err(|_| ConnectionError::TimedOut {
            url: settings.url.clone(),
            timeout_ms: settings.connection_timeout_ms,
        })?
        .map_err(connect_error)?;

        let channel = connection.create_channel().await.map_err(connect_error)?;
        if settings.prefetch_count > 0 {
            channel
                .basic_qos(settings.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(connect_error)?;
        }

        Ok(Self {
            connection,
            channel,
            consumers: Mutex::new(HashMap::new()),
        })
    }
}

impl fmt::Debug for AmqpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpTransport")
            .field("channel_id", &self.channel.id())
            .finish_non_exhaustive()
    }
}

struct AmqpAck {
    acker: Acker,
}

#[async_trait]
impl AckHandle for AmqpAck {
    async fn acknowledge(&self, requeue: bool) -> Result<(), TransportError> {
        if requeue {
            self.acker
                .reject(BasicRejectOptions { requeue: true })
                .await?;
        } else {
            self.acker.ack(BasicAckOptions::default()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_exchange(
        &self,
        name: &str,
        durable: bool,
    ) -> Result<ExchangeHandle, TransportError> {
        let options = ExchangeDeclareOptions {
            durable,
            auto_delete: false,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(name, ExchangeKind::Direct, options, FieldTable::default())
            .await?;
        tracing::debug!(exchange = name, "exchange declared");
        Ok(ExchangeHandle::new(name))
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), TransportError> {
        let options = QueueDeclareOptions {
            durable,
            auto_delete: false,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(name, options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn bind(
        &self,
        exchange: &ExchangeHandle,
        queue: &str,
        routing_key: &str,
    ) -> Result<QueueHandle, TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange.name(),
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        tracing::debug!(queue, routing_key, exchange = exchange.name(), "queue bound");

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
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT)
            .with_headers(to_field_table(headers));

        // The confirm future is dropped: publishing is fire-and-forget.
        let _confirm = self
            .channel
            .basic_publish(
                exchange.name(),
                routing_key,
                BasicPublishOptions::default(),
                payload.as_bytes(),
                properties,
            )
            .await?;
        Ok(())
    }

    async fn subscribe(&self, queue: &QueueHandle) -> Result<DeliveryReceiver, TransportError> {
        let consumer_tag = format!("{}-{}", queue.name, Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                &queue.name,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(queue.name.clone())
            .or_default()
            .push(consumer_tag.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(item) = consumer.next().await {
                let delivery = match item {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        tracing::error!(consumer = %consumer_tag, "consumer failed: {err}");
                        break;
                    }
                };
                let headers = delivery
                    .properties
                    .headers()
                    .as_ref()
                    .map(from_field_table)
                    .unwrap_or_default();

                let forwarded = Delivery {
                    body: String::from_utf8_lossy(&delivery.data).into_owned(),
                    headers,
                    routing_key: delivery.routing_key.as_str().to_string(),
                    ack: Box::new(AmqpAck {
                        acker: delivery.acker,
                    }),
                };
                // Nobody reads this consumer any more: hand the delivery back
                // until the broker processes the cancellation.
                if let Err(mpsc::error::SendError(rejected)) = tx.send(forwarded) {
                    if let Err(err) = rejected.ack.acknowledge(true).await {
                        tracing::error!(consumer = %consumer_tag, "requeue failed: {err}");
                    }
                }
            }
            tracing::debug!(consumer = %consumer_tag, "consumer stream closed");
        });

        Ok(rx)
    }

    async fn unsubscribe(&self, queue: &QueueHandle) -> Result<(), TransportError> {
        let tags = self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&queue.name)
            .unwrap_or_default();
        for tag in tags {
            self.channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await?;
            tracing::debug!(consumer = %tag, "consumer cancelled");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.channel.close(REPLY_SUCCESS, "closing").await?;
        self.connection.close(REPLY_SUCCESS, "closing").await?;
        Ok(())
    }
}

pub(crate) fn to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(ShortString::from(key.clone()), to_amqp_value(value));
    }
    table
}

pub(crate) fn from_field_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), from_amqp_value(value)))
        .collect()
}

fn to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(flag) => AMQPValue::Boolean(*flag),
        Value::Number(number) => match (number.as_i64(), number.as_f64()) {
            (Some(int), _) => AMQPValue::LongLongInt(int),
            (None, Some(float)) => AMQPValue::Double(float),
            (None, None) => AMQPValue::LongString(LongString::from(number.to_string())),
        },
        Value::String(text) => AMQPValue::LongString(LongString::from(text.clone())),
        nested => AMQPValue::LongString(LongString::from(nested.to_string())),
    }
}

fn from_amqp_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(flag) => Value::Bool(*flag),
        AMQPValue::ShortShortInt(v) => Value::from(*v),
        AMQPValue::ShortShortUInt(v) => Value::from(*v),
        AMQPValue::ShortInt(v) => Value::from(*v),
        AMQPValue::ShortUInt(v) => Value::from(*v),
        AMQPValue::LongInt(v) => Value::from(*v),
        AMQPValue::LongUInt(v) => Value::from(*v),
        AMQPValue::LongLongInt(v) => Value::from(*v),
        AMQPValue::Timestamp(v) => Value::from(*v),
        AMQPValue::Float(v) => Value::from(f64::from(*v)),
        AMQPValue::Double(v) => Value::from(*v),
        AMQPValue::ShortString(text) => Value::String(text.as_str().to_string()),
        AMQPValue::LongString(text) => {
            Value::String(String::from_utf8_lossy(text.as_bytes()).into_owned())
        }
        _ => Value::Null,
    }
}
