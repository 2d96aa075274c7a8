//! End-to-end cascade over the in-memory broker with paused time: the interceptor on the
//! ingress queue, TTL expiry in the wait queues, and the router on the wait-ended queue.
mod common;

use cascade_retry::message::{
    Destination, Headers, OutboundMessage, ORIGINAL_EXCHANGE, ORIGINAL_ROUTING_KEY, RETRIED_COUNT,
};
use cascade_retry::telemetry::MemorySink;
use cascade_retry::{
    Broker, Disposition, Jitter, MemoryBroker, QueueOptions, RetryCascade, RouteError,
};
use common::*;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const WAIT_ENDED: &str = "retry-wait-ended-queue";

/// Let the wait-queue TTL run out and route the expired message back.
async fn wait_and_route<T>(
    broker: &MemoryBroker,
    cascade: &RetryCascade<MemoryBroker, T>,
    delay: Duration,
) -> Destination
where
    T: cascade_retry::telemetry::TelemetrySink,
    T::Future: Send + 'static,
{
    tokio::time::sleep(delay + Duration::from_millis(1)).await;
    let expired = broker.receive(WAIT_ENDED).expect("message dead-lettered after its TTL");
    assert_eq!(expired.expiration, None);
    cascade.router().oneshot(expired).await.expect("routed back")
}

#[tokio::test(start_paused = true)]
async fn always_failing_handler_is_rejected_after_third_retry() {
    init_tracing();
    let setup = reference_setup();
    let handler = FlakyHandler::default();
    let svc = setup.cascade.wrap(handler.service(u32::MAX));
    publish(&setup.broker, INGRESS, "doomed").await;

    let expected = [(0, "retry-queue-1", 1000), (1, "retry-queue-2", 3000), (2, "retry-queue-3", 9000)];
    for (attempt, queue, delay_ms) in expected {
        let delivery = setup.broker.receive(INGRESS).expect("delivery");
        let outcome = svc.clone().oneshot(delivery).await.expect("rescheduled");
        assert_eq!(
            outcome,
            Disposition::Rescheduled {
                attempt,
                queue: queue.to_string(),
                delay: Duration::from_millis(delay_ms),
            }
        );
        assert_eq!(setup.broker.published_to(queue).len(), 1);
        let back = wait_and_route(&setup.broker, &setup.cascade, Duration::from_millis(delay_ms)).await;
        assert_eq!(back, Destination::queue(INGRESS));
    }

    let published_before = setup.broker.published().len();
    let last = setup.broker.receive(INGRESS).expect("fourth delivery");
    assert_eq!(last.headers.get(RETRIED_COUNT), Some("3"));
    let err = svc.clone().oneshot(last.clone()).await.unwrap_err();

    assert!(err.is_exhausted());
    assert_eq!(err.attempts(), Some(3));
    assert_eq!(err.handler_error(), Some(&TestError(4)));
    assert_eq!(setup.observed(), 1);
    assert_eq!(setup.broker.rejected().last(), Some(&(last.tag, false)));
    assert_eq!(setup.broker.published().len(), published_before);
    assert_eq!(handler.calls(), 4);
    assert_eq!(
        handler.seen(),
        vec![None, Some("1".to_string()), Some("2".to_string()), Some("3".to_string())]
    );

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(setup.broker.receive(INGRESS).is_none());
    assert!(setup.broker.receive(WAIT_ENDED).is_none());
    assert_eq!(setup.observed(), 1);
}

#[tokio::test(start_paused = true)]
async fn fail_once_then_succeed_is_acked_after_one_reschedule() {
    let setup = reference_setup();
    let handler = FlakyHandler::default();
    let svc = setup.cascade.wrap(handler.service(1));
    publish(&setup.broker, INGRESS, "hello").await;

    let first = setup.broker.receive(INGRESS).unwrap();
    let outcome = svc.clone().oneshot(first.clone()).await.unwrap();
    assert!(matches!(outcome, Disposition::Rescheduled { attempt: 0, .. }));

    let parked = setup.broker.published_to("retry-queue-1");
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].headers.get(RETRIED_COUNT), Some("1"));
    assert_eq!(parked[0].headers.get(ORIGINAL_EXCHANGE), Some(""));
    assert_eq!(parked[0].headers.get(ORIGINAL_ROUTING_KEY), Some(INGRESS));
    assert_eq!(parked[0].expiration.as_deref(), Some("1000"));
    assert_eq!(parked[0].payload, b"hello");

    // Still waiting just before the TTL runs out.
    tokio::time::sleep(Duration::from_millis(999)).await;
    assert!(setup.broker.receive(WAIT_ENDED).is_none());
    wait_and_route(&setup.broker, &setup.cascade, Duration::from_millis(1)).await;

    let second = setup.broker.receive(INGRESS).unwrap();
    assert_eq!(second.headers.get(RETRIED_COUNT), Some("1"));
    assert_eq!(svc.clone().oneshot(second.clone()).await.unwrap(), Disposition::Acked);

    assert_eq!(setup.broker.acked(), vec![second.tag]);
    assert_eq!(setup.broker.rejected(), vec![(first.tag, false)]);
    assert!(setup.broker.published_to("retry-queue-2").is_empty());
    assert!(setup.broker.published_to("retry-queue-3").is_empty());
    assert_eq!(setup.observed(), 0);
    assert_eq!(setup.broker.unacked(), 0);
}

#[tokio::test(start_paused = true)]
async fn k_failures_then_success_sees_count_k() {
    for k in 0..3u32 {
        let setup = reference_setup();
        let handler = FlakyHandler::default();
        let svc = setup.cascade.wrap(handler.service(k));
        publish(&setup.broker, INGRESS, "m").await;

        for attempt in 0..k {
            let delivery = setup.broker.receive(INGRESS).unwrap();
            let outcome = svc.clone().oneshot(delivery).await.unwrap();
            let Disposition::Rescheduled { delay, .. } = outcome else {
                panic!("expected a reschedule on attempt {attempt}");
            };
            wait_and_route(&setup.broker, &setup.cascade, delay).await;
        }

        let delivery = setup.broker.receive(INGRESS).unwrap();
        let expected = if k == 0 { None } else { Some(k.to_string()) };
        assert_eq!(delivery.headers.get(RETRIED_COUNT).map(str::to_string), expected);
        assert_eq!(svc.clone().oneshot(delivery).await.unwrap(), Disposition::Acked);
        assert_eq!(setup.broker.acked().len(), 1);
        assert_eq!(setup.broker.rejected().len(), k as usize);
        assert_eq!(setup.observed(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn original_route_survives_every_round_trip() {
    let setup = reference_setup();
    setup.broker.bind("events", "order.created", INGRESS).unwrap();
    let handler = FlakyHandler::default();
    let svc = setup.cascade.wrap(handler.service(2));
    let first_route = Destination::new("events", "order.created");
    setup.broker.publish(&first_route, OutboundMessage::new("order-17")).await.unwrap();

    for _ in 0..2 {
        let delivery = setup.broker.receive(INGRESS).unwrap();
        let Disposition::Rescheduled { delay, .. } = svc.clone().oneshot(delivery).await.unwrap()
        else {
            panic!("expected a reschedule");
        };
        let back = wait_and_route(&setup.broker, &setup.cascade, delay).await;
        assert_eq!(back, first_route);
    }
    let parked = setup.broker.published_to("retry-queue-2");
    assert_eq!(parked[0].headers.original_route(), Some(first_route.clone()));

    let delivery = setup.broker.receive(INGRESS).unwrap();
    assert_eq!(delivery.received_from(), first_route);
    assert_eq!(svc.clone().oneshot(delivery).await.unwrap(), Disposition::Acked);
}

#[tokio::test(start_paused = true)]
async fn publish_failure_leaves_delivery_unsettled() {
    let setup = reference_setup();
    let handler = FlakyHandler::default();
    let svc = setup.cascade.wrap(handler.service(u32::MAX));
    publish(&setup.broker, INGRESS, "x").await;
    let delivery = setup.broker.receive(INGRESS).unwrap();

    setup.broker.fail_next_publishes(1);
    let err = svc.clone().oneshot(delivery.clone()).await.unwrap_err();
    assert!(err.is_publish());
    assert!(setup.broker.rejected().is_empty());
    assert!(setup.broker.acked().is_empty());
    assert_eq!(setup.broker.unacked(), 1);
    assert_eq!(setup.observed(), 0);

    // The broker redelivers an unsettled message; the cascade picks up where it was.
    setup.broker.reject(delivery.tag, true).await.unwrap();
    let redelivered = setup.broker.receive(INGRESS).unwrap();
    assert!(redelivered.redelivered);
    let outcome = svc.clone().oneshot(redelivered).await.unwrap();
    assert!(matches!(outcome, Disposition::Rescheduled { attempt: 0, .. }));
}

#[tokio::test(start_paused = true)]
async fn malformed_count_is_rejected_permanently() {
    let setup = reference_setup();
    let handler = FlakyHandler::default();
    let svc = setup.cascade.wrap(handler.service(u32::MAX));
    let headers: Headers = [(RETRIED_COUNT, "three")].into_iter().collect();
    publish_with_headers(&setup.broker, INGRESS, headers).await;
    let delivery = setup.broker.receive(INGRESS).unwrap();

    let err = svc.clone().oneshot(delivery.clone()).await.unwrap_err();
    assert!(err.is_malformed_header());
    assert_eq!(setup.observed(), 1);
    assert_eq!(setup.broker.rejected(), vec![(delivery.tag, false)]);
    assert_eq!(setup.broker.published().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn successful_handler_never_touches_wait_queues() {
    let setup = reference_setup();
    let svc = setup.cascade.wrap(always_ok());
    publish(&setup.broker, INGRESS, "fine").await;
    let delivery = setup.broker.receive(INGRESS).unwrap();
    assert_eq!(svc.oneshot(delivery).await.unwrap(), Disposition::Acked);
    assert_eq!(setup.broker.published().len(), 1);
    assert!(setup.broker.rejected().is_empty());
}

#[tokio::test(start_paused = true)]
async fn telemetry_describes_the_round_trip() {
    let broker = Arc::new(MemoryBroker::new());
    let sink = MemorySink::new();
    let cascade = RetryCascade::builder(broker.clone()).telemetry(sink.clone()).build().unwrap();
    broker.declare_topology(cascade.topology());
    broker.declare_queue(INGRESS, QueueOptions::default());

    let handler = FlakyHandler::default();
    let svc = cascade.wrap(handler.service(1));
    publish(&broker, INGRESS, "m").await;

    let delivery = broker.receive(INGRESS).unwrap();
    svc.clone().oneshot(delivery).await.unwrap();
    wait_and_route(&broker, &cascade, Duration::from_millis(1000)).await;
    let delivery = broker.receive(INGRESS).unwrap();
    svc.clone().oneshot(delivery).await.unwrap();

    let kinds: Vec<_> = sink.events().iter().map(|e| e.kind()).collect();
    assert_eq!(kinds, ["rescheduled", "routed", "acked"]);
}

#[tokio::test(start_paused = true)]
async fn jitter_keeps_delay_within_schedule() {
    let broker = Arc::new(MemoryBroker::new());
    let cascade = RetryCascade::builder(broker.clone()).jitter(Jitter::full()).build().unwrap();
    broker.declare_topology(cascade.topology());
    broker.declare_queue(INGRESS, QueueOptions::default());
    let handler = FlakyHandler::default();
    let svc = cascade.wrap(handler.service(u32::MAX));
    publish(&broker, INGRESS, "m").await;

    let delivery = broker.receive(INGRESS).unwrap();
    let Disposition::Rescheduled { delay, .. } = svc.oneshot(delivery).await.unwrap() else {
        panic!("expected a reschedule");
    };
    assert!(delay <= Duration::from_millis(1000));
    let parked = broker.published_to("retry-queue-1");
    assert_eq!(parked[0].expiration_millis(), Some(delay.as_millis() as u64));
}

fn last_attempt_headers() -> Headers {
    [(RETRIED_COUNT, "3"), (ORIGINAL_EXCHANGE, ""), (ORIGINAL_ROUTING_KEY, INGRESS)]
        .into_iter()
        .collect()
}

#[tokio::test(start_paused = true)]
async fn failed_terminal_reject_skips_the_observer() {
    let setup = reference_setup();
    let handler = FlakyHandler::default();
    let svc = setup.cascade.wrap(handler.service(u32::MAX));
    publish_with_headers(&setup.broker, INGRESS, last_attempt_headers()).await;
    let delivery = setup.broker.receive(INGRESS).unwrap();

    setup.broker.fail_next_rejects(1);
    let err = svc.clone().oneshot(delivery.clone()).await.unwrap_err();
    assert!(err.is_settle());
    assert!(!err.is_exhausted());
    assert_eq!(setup.observed(), 0);
    assert!(setup.broker.rejected().is_empty());
    assert_eq!(setup.broker.unacked(), 1);

    // Redelivered, the same decision is taken again and this time it sticks.
    setup.broker.reject(delivery.tag, true).await.unwrap();
    let again = setup.broker.receive(INGRESS).unwrap();
    assert!(svc.clone().oneshot(again).await.unwrap_err().is_exhausted());
    assert_eq!(setup.observed(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_reschedule_reject_keeps_the_published_copy() {
    let setup = reference_setup();
    let handler = FlakyHandler::default();
    let svc = setup.cascade.wrap(handler.service(u32::MAX));
    publish(&setup.broker, INGRESS, "x").await;
    let delivery = setup.broker.receive(INGRESS).unwrap();

    setup.broker.fail_next_rejects(1);
    let err = svc.clone().oneshot(delivery.clone()).await.unwrap_err();
    assert!(err.is_settle());
    assert_eq!(setup.broker.published_to("retry-queue-1").len(), 1);
    assert!(setup.broker.rejected().is_empty());
    assert_eq!(setup.broker.unacked(), 1);
    assert_eq!(setup.observed(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_router_ack_is_reported() {
    let setup = reference_setup();
    setup
        .broker
        .publish(
            &Destination::queue(WAIT_ENDED),
            OutboundMessage::new("back").with_headers(last_attempt_headers()),
        )
        .await
        .unwrap();
    let expired = setup.broker.receive(WAIT_ENDED).unwrap();

    setup.broker.fail_next_acks(1);
    let err = setup.cascade.router().oneshot(expired.clone()).await.unwrap_err();
    assert!(matches!(err, RouteError::Settle { tag, .. } if tag == expired.tag));
    assert_eq!(setup.broker.published_to(INGRESS).len(), 1);
    assert!(setup.broker.acked().is_empty());
    assert_eq!(setup.broker.unacked(), 1);
}

#[tokio::test(start_paused = true)]
async fn panicking_observer_still_rejects() {
    let broker = Arc::new(MemoryBroker::new());
    let cascade = RetryCascade::builder(broker.clone())
        .observer(|| panic!("observer bug"))
        .build()
        .unwrap();
    broker.declare_topology(cascade.topology());
    broker.declare_queue(INGRESS, QueueOptions::default());
    let handler = FlakyHandler::default();
    let svc = cascade.wrap(handler.service(u32::MAX));
    publish_with_headers(&broker, INGRESS, last_attempt_headers()).await;
    let delivery = broker.receive(INGRESS).unwrap();

    let err = svc.oneshot(delivery.clone()).await.unwrap_err();
    assert!(err.is_exhausted());
    assert_eq!(broker.rejected(), vec![(delivery.tag, false)]);
    assert_eq!(broker.unacked(), 0);
}
