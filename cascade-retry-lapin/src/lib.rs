//! AMQP 0-9-1 adapter for `cascade-retry` (companion crate).
//!
//! [`LapinBroker`] implements [`cascade_retry::Broker`] over a `lapin::Channel`:
//! - headers travel as an AMQP field table, values written as long strings;
//! - the retry TTL is the native `expiration` property;
//! - deliveries are consumed in manual-acknowledgement mode, with the subscription's
//!   concurrency as the consumer prefetch;
//! - [`LapinBroker::declare_topology`] declares the wait queues with their dead-letter
//!   arguments and the wait-ended queue.
//!
//! Enable publisher confirms on the channel (`confirm_select`) to have `publish` wait for the
//! broker and report nacks.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cascade_retry::RetryCascade;
//! use cascade_retry_lapin::LapinBroker;
//! use lapin::{options::ConfirmSelectOptions, Connection, ConnectionProperties};
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = Connection::connect("amqp://127.0.0.1:5672/%2f", ConnectionProperties::default()).await?;
//! let channel = conn.create_channel().await?;
//! channel.confirm_select(ConfirmSelectOptions::default()).await?;
//!
//! let broker = Arc::new(LapinBroker::new(channel));
//! let cascade = RetryCascade::builder(broker.clone()).build()?;
//! broker.declare_topology(cascade.topology()).await?;
//! # Ok(()) }
//! ```

use async_trait::async_trait;
use cascade_retry::broker::{Broker, BrokerError, DeliveryStream};
use cascade_retry::message::{Delivery, DeliveryTag, Destination, Headers, OutboundMessage};
use cascade_retry::RetryTopology;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// [`Broker`] backed by one AMQP channel.
#[derive(Clone, Debug)]
pub struct LapinBroker {
    channel: Channel,
    consumers: Arc<AtomicU64>,
}

impl LapinBroker {
    pub fn new(channel: Channel) -> Self {
        Self { channel, consumers: Arc::new(AtomicU64::new(0)) }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Declare a durable queue with optional arguments.
    pub async fn declare_queue(&self, name: &str, arguments: FieldTable) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions { durable: true, ..QueueDeclareOptions::default() };
        self.channel
            .queue_declare(name, options, arguments)
            .await
            .map_err(BrokerError::transport)?;
        Ok(())
    }

    /// Declare the wait-ended queue and every wait queue, the latter dead-lettering into the
    /// former through the default exchange.
    pub async fn declare_topology(&self, topology: &RetryTopology) -> Result<(), BrokerError> {
        self.declare_queue(topology.wait_ended_queue(), FieldTable::default()).await?;
        let mut arguments = FieldTable::default();
        for (name, value) in topology.wait_queue_arguments() {
            arguments.insert(ShortString::from(name), AMQPValue::LongString(LongString::from(value)));
        }
        for queue in topology.wait_queues().iter() {
            self.declare_queue(queue, arguments.clone()).await?;
            tracing::debug!(queue, dead_letter_to = topology.wait_ended_queue(), "declared wait queue");
        }
        Ok(())
    }
}

/// Header map as an AMQP field table. Every value is written as a long string.
pub fn headers_to_field_table(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (name, value) in headers.iter() {
        table.insert(ShortString::from(name), AMQPValue::LongString(LongString::from(value)));
    }
    table
}

/// Header map from an AMQP field table.
///
/// Strings and integers are kept (integers in decimal, so a count written by another client
/// as a number still reads back); other value types are skipped.
pub fn field_table_to_headers(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(name, value)| {
            let value = amqp_value_to_string(value);
            if value.is_none() {
                tracing::trace!(header = name.as_str(), "skipping non-scalar header");
            }
            value.map(|value| (name.as_str().to_string(), value))
        })
        .collect()
}

fn amqp_value_to_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        AMQPValue::ShortShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortShortUInt(v) => Some(v.to_string()),
        AMQPValue::ShortInt(v) => Some(v.to_string()),
        AMQPValue::ShortUInt(v) => Some(v.to_string()),
        AMQPValue::LongInt(v) => Some(v.to_string()),
        AMQPValue::LongUInt(v) => Some(v.to_string()),
        AMQPValue::LongLongInt(v) => Some(v.to_string()),
        AMQPValue::Boolean(v) => Some(v.to_string()),
        _ => None,
    }
}

/// Properties for an outbound message: headers plus the optional expiration.
pub fn outbound_properties(message: &OutboundMessage) -> BasicProperties {
    let properties =
        BasicProperties::default().with_headers(headers_to_field_table(&message.headers));
    match &message.expiration {
        Some(expiration) => properties.with_expiration(ShortString::from(expiration.clone())),
        None => properties,
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(field_table_to_headers)
        .unwrap_or_default();
    let expiration = delivery.properties.expiration().as_ref().map(|e| e.as_str().to_string());
    Delivery {
        tag: DeliveryTag::new(delivery.delivery_tag),
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        payload: delivery.data,
        headers,
        expiration,
        redelivered: delivery.redelivered,
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn publish(
        &self,
        destination: &Destination,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        let properties = outbound_properties(&message);
        let confirm = self
            .channel
            .basic_publish(
                &destination.exchange,
                &destination.routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map_err(BrokerError::transport)?;
        let confirmation = confirm.await.map_err(BrokerError::transport)?;
        if confirmation.is_nack() {
            return Err(BrokerError::PublishRefused {
                destination: destination.clone(),
                reason: "broker nacked the publish".to_string(),
            });
        }
        Ok(())
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        self.channel
            .basic_ack(tag.value(), BasicAckOptions::default())
            .await
            .map_err(BrokerError::transport)
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        self.channel
            .basic_reject(tag.value(), BasicRejectOptions { requeue })
            .await
            .map_err(BrokerError::transport)
    }

    /// `basic.qos` is per consumer (`global = false`) and applies to consumers started after it,
    /// so each call sets it right before `basic.consume`.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, BrokerError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
            .map_err(BrokerError::transport)?;
        let seq = self.consumers.fetch_add(1, Ordering::Relaxed);
        let consumer_tag = format!("cascade-retry-{queue}-{seq}");
        let consumer = self
            .channel
            .basic_consume(queue, &consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(BrokerError::transport)?;
        tracing::info!(queue, consumer_tag, prefetch, "consuming");
        Ok(consumer
            .map(|next| next.map(into_delivery).map_err(BrokerError::transport))
            .boxed())
    }
}
