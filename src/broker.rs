//! Broker capability consumed by the cascade.
//!
//! The cascade never stores, routes or expires messages itself. It needs four operations from
//! whatever client talks to the broker: publish, acknowledge, reject, and push-based delivery
//! from a named queue. Durable storage, TTL expiry and dead-lettering stay with the broker.
//!
//! Implementations must be safe to share across concurrently running workers.

use crate::message::{Delivery, DeliveryTag, Destination, OutboundMessage};
use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

/// Boxed error from an underlying client library.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Stream of deliveries pushed by the broker for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Failures reported by a [`Broker`].
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("no queue named `{0}`")]
    UnknownQueue(String),
    #[error("no route for {0}")]
    Unroutable(Destination),
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(DeliveryTag),
    #[error("queue `{0}` already has a consumer")]
    AlreadyConsumed(String),
    #[error("broker refused publish to {destination}: {reason}")]
    PublishRefused { destination: Destination, reason: String },
    #[error("broker connection closed")]
    Closed,
    #[error("broker transport error: {0}")]
    Transport(#[source] BoxError),
}

impl BrokerError {
    /// Wrap a client-library error.
    pub fn transport(error: impl Into<BoxError>) -> Self {
        BrokerError::Transport(error.into())
    }
}

/// Publish / acknowledge / reject / consume against an external broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publish `message` to `destination`. Returns once the broker has accepted it.
    async fn publish(
        &self,
        destination: &Destination,
        message: OutboundMessage,
    ) -> Result<(), BrokerError>;

    /// Acknowledge a delivery; the broker forgets the message.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    /// Reject a delivery. With `requeue == false` the broker drops it, or dead-letters it if
    /// the queue is configured to.
    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    /// Start consuming `queue` in manual-acknowledgement mode.
    ///
    /// `prefetch` caps the deliveries the broker hands this consumer before some are settled;
    /// `0` means no limit. Dropping the stream cancels the consumer, and the broker redelivers
    /// whatever it still held.
    async fn consume(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, BrokerError>;
}
