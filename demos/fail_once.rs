//! A handler that fails the first time only: one trip through the first wait queue, then an ack.
use cascade_retry::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_target(false).init();

    let config = CascadeConfig::from_json_str(
        r#"{ "initial_interval_ms": 250, "max_wait_ms": 2000, "concurrency": 2 }"#,
    )?;
    let broker = Arc::new(MemoryBroker::new());
    let events = StreamingSink::new(16);
    let mut rx = events.subscribe();
    let cascade = RetryCascade::builder(broker.clone()).config(&config).telemetry(events).build()?;
    broker.declare_topology(cascade.topology());
    broker.declare_queue("orders", QueueOptions::default());

    let failed = Arc::new(AtomicBool::new(false));
    let handler = tower::service_fn(move |_delivery: Delivery| {
        let first = !failed.swap(true, Ordering::SeqCst);
        async move {
            if first {
                Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "first try times out"))
            } else {
                Ok(())
            }
        }
    });
    let options = config.subscribe_options();
    let ingress = cascade.subscribe("orders", handler, options).await?;
    let router = cascade.subscribe_router(options).await?;

    broker.publish(&Destination::queue("orders"), OutboundMessage::new("order-7")).await?;
    while let Ok(event) = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await? {
        println!("{event}");
        if event.kind() == "acked" {
            break;
        }
    }

    ingress.stop().await;
    router.stop().await;
    Ok(())
}
