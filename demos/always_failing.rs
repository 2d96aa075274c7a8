//! A handler that never succeeds: the message visits every wait queue, then is rejected for good.
use cascade_retry::message::RETRIED_COUNT;
use cascade_retry::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug)]
struct Unavailable;

impl std::fmt::Display for Unavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "downstream unavailable")
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).init();

    let broker = Arc::new(MemoryBroker::new());
    let gave_up = Arc::new(Notify::new());
    let notify = gave_up.clone();
    let cascade = RetryCascade::builder(broker.clone())
        // Same shape as the defaults, scaled down to keep the demo short.
        .backoff(
            BackoffSchedule::builder()
                .initial_interval(Duration::from_millis(100))
                .factor(3.0)
                .max_wait(Duration::from_millis(1000)),
        )
        .observer(move || {
            tracing::warn!("message rejected after the last retry");
            notify.notify_one();
        })
        .telemetry(LogSink)
        .build()?;
    broker.declare_topology(cascade.topology());
    broker.declare_queue("orders", QueueOptions::default());

    let handler = tower::service_fn(|delivery: Delivery| async move {
        tracing::info!(
            retried = delivery.headers.get(RETRIED_COUNT).unwrap_or("0"),
            payload = %delivery.payload_str(),
            "handling"
        );
        Err::<(), _>(Unavailable)
    });
    let ingress = cascade.subscribe("orders", handler, SubscribeOptions::default()).await?;
    let router = cascade.subscribe_router(SubscribeOptions::default()).await?;

    broker.publish(&Destination::queue("orders"), OutboundMessage::new("order-42")).await?;
    gave_up.notified().await;

    ingress.stop().await;
    router.stop().await;
    Ok(())
}
