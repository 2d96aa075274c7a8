//! Wait-expiry router.
//!
//! Consumes the wait-ended queue. Every message arriving there has sat out its backoff in a
//! wait queue and was dead-lettered on expiry; the router sends it back to the exchange and
//! routing key recorded on its first failure. Payload and headers are forwarded unchanged, so
//! the next failure continues the cascade from the carried `x-retried-count`. Any expiration
//! is dropped.
//!
//! The delivery is acknowledged only after the publish succeeded. On any error it stays
//! unacknowledged.

use crate::broker::Broker;
use crate::error::RouteError;
use crate::message::{Delivery, Destination, OutboundMessage, ORIGINAL_EXCHANGE, ORIGINAL_ROUTING_KEY};
use crate::telemetry::{emit_best_effort, CascadeEvent, NullSink, TelemetrySink};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_service::Service;

/// Returns wait-expired messages to their original destination.
pub struct WaitExpiryRouter<B, T = NullSink> {
    broker: Arc<B>,
    sink: T,
}

impl<B: Broker> WaitExpiryRouter<B, NullSink> {
    pub fn new(broker: Arc<B>) -> Self {
        Self { broker, sink: NullSink }
    }
}

impl<B, T> WaitExpiryRouter<B, T> {
    /// Replace the telemetry sink.
    pub fn with_sink<U: TelemetrySink>(self, sink: U) -> WaitExpiryRouter<B, U> {
        WaitExpiryRouter { broker: self.broker, sink }
    }
}

impl<B, T: Clone> Clone for WaitExpiryRouter<B, T> {
    fn clone(&self) -> Self {
        Self { broker: self.broker.clone(), sink: self.sink.clone() }
    }
}

/// Destination recorded on the delivery, or the name of the first missing header.
fn original_route(delivery: &Delivery) -> Result<Destination, &'static str> {
    let headers = &delivery.headers;
    match headers.original_route() {
        Some(destination) => Ok(destination),
        None if headers.contains_key(ORIGINAL_EXCHANGE) => Err(ORIGINAL_ROUTING_KEY),
        None => Err(ORIGINAL_EXCHANGE),
    }
}

impl<B, T> Service<Delivery> for WaitExpiryRouter<B, T>
where
    B: Broker,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    type Response = Destination;
    type Error = RouteError;
    type Future = BoxFuture<'static, Result<Destination, RouteError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, delivery: Delivery) -> Self::Future {
        let broker = self.broker.clone();
        let sink = self.sink.clone();

        Box::pin(async move {
            let tag = delivery.tag;
            let destination = match original_route(&delivery) {
                Ok(destination) => destination,
                Err(header) => {
                    tracing::error!(delivery_tag = %tag, header, "wait-ended message has no original route");
                    emit_best_effort(sink, CascadeEvent::MissingRoute { tag }).await;
                    return Err(RouteError::MissingOriginalRoute { tag, header });
                }
            };

            let retried_count = delivery.headers.retried_count().unwrap_or_default();
            if let Err(source) =
                broker.publish(&destination, OutboundMessage::from_delivery(&delivery)).await
            {
                tracing::warn!(
                    delivery_tag = %tag,
                    exchange = %destination.exchange,
                    routing_key = %destination.routing_key,
                    error = %source,
                    "route back failed"
                );
                emit_best_effort(
                    sink,
                    CascadeEvent::PublishFailed { tag, destination: destination.clone() },
                )
                .await;
                return Err(RouteError::Publish { destination, source });
            }

            broker.ack(tag).await.map_err(|source| RouteError::Settle { tag, source })?;
            tracing::info!(
                delivery_tag = %tag,
                exchange = %destination.exchange,
                routing_key = %destination.routing_key,
                retried_count,
                "routed back after wait"
            );
            emit_best_effort(
                sink,
                CascadeEvent::Routed { tag, destination: destination.clone(), retried_count },
            )
            .await;
            Ok(destination)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBroker, QueueOptions};
    use crate::message::{DeliveryTag, Headers, RETRIED_COUNT};
    use crate::telemetry::MemorySink;
    use tower::ServiceExt;

    fn routed_headers() -> Headers {
        [(RETRIED_COUNT, "2"), (ORIGINAL_EXCHANGE, ""), (ORIGINAL_ROUTING_KEY, "ingress")]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn routes_back_unchanged_and_acks() {
        let broker = Arc::new(MemoryBroker::new());
        broker.declare_queue("ingress", QueueOptions::default());
        broker.declare_queue("wait-ended", QueueOptions::default());
        broker
            .publish(
                &Destination::queue("wait-ended"),
                OutboundMessage::new("payload").with_headers(routed_headers()),
            )
            .await
            .unwrap();
        let delivery = broker.receive("wait-ended").unwrap();
        let sink = MemorySink::new();

        let router = WaitExpiryRouter::new(broker.clone()).with_sink(sink.clone());
        let destination = router.oneshot(delivery.clone()).await.unwrap();

        assert_eq!(destination, Destination::queue("ingress"));
        let back = broker.receive("ingress").unwrap();
        assert_eq!(back.payload, b"payload");
        assert_eq!(back.headers, routed_headers());
        assert_eq!(back.expiration, None);
        assert_eq!(broker.acked(), vec![delivery.tag]);
        assert_eq!(sink.events_of("routed").len(), 1);
    }

    #[tokio::test]
    async fn missing_route_is_not_acked() {
        let broker = Arc::new(MemoryBroker::new());
        let headers: Headers = [(ORIGINAL_EXCHANGE, "events")].into_iter().collect();
        let delivery = Delivery::new(DeliveryTag::new(11), Destination::queue("wait-ended"), "x")
            .with_headers(headers);

        let err = WaitExpiryRouter::new(broker.clone()).oneshot(delivery).await.unwrap_err();
        assert!(matches!(
            err,
            RouteError::MissingOriginalRoute { header: ORIGINAL_ROUTING_KEY, .. }
        ));
        assert!(broker.acked().is_empty());
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_leaves_delivery_unacked() {
        let broker = Arc::new(MemoryBroker::new());
        broker.declare_queue("ingress", QueueOptions::default());
        broker.declare_queue("wait-ended", QueueOptions::default());
        broker
            .publish(
                &Destination::queue("wait-ended"),
                OutboundMessage::new("x").with_headers(routed_headers()),
            )
            .await
            .unwrap();
        let delivery = broker.receive("wait-ended").unwrap();
        broker.fail_next_publishes(1);

        let err = WaitExpiryRouter::new(broker.clone()).oneshot(delivery).await.unwrap_err();
        assert!(matches!(err, RouteError::Publish { .. }));
        assert!(broker.acked().is_empty());
        assert_eq!(broker.unacked(), 1);
    }
}
