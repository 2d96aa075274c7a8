#![allow(dead_code)]

use cascade_retry::message::{Delivery, Destination, Headers, OutboundMessage, RETRIED_COUNT};
use cascade_retry::{Broker, MemoryBroker, QueueOptions, RetryCascade};
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tower::util::BoxCloneService;

pub const INGRESS: &str = "orders";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError(pub u32);

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler failure #{}", self.0)
    }
}

impl std::error::Error for TestError {}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub struct Setup {
    pub broker: Arc<MemoryBroker>,
    pub cascade: RetryCascade<MemoryBroker>,
    pub observed: Arc<AtomicUsize>,
}

impl Setup {
    pub fn observed(&self) -> usize {
        self.observed.load(Ordering::SeqCst)
    }
}

/// Reference cascade (1000 ms, 3.0, 10 000 ms, three queues) over a broker with its topology
/// and one ingress queue declared, plus an observer call counter.
pub fn reference_setup() -> Setup {
    let broker = Arc::new(MemoryBroker::new());
    let observed = Arc::new(AtomicUsize::new(0));
    let counter = observed.clone();
    let cascade = RetryCascade::builder(broker.clone())
        .observer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .expect("reference cascade");
    broker.declare_topology(cascade.topology());
    broker.declare_queue(INGRESS, QueueOptions::default());
    Setup { broker, cascade, observed }
}

pub async fn publish(broker: &MemoryBroker, queue: &str, payload: &str) {
    broker
        .publish(&Destination::queue(queue), OutboundMessage::new(payload))
        .await
        .expect("publish");
}

pub async fn publish_with_headers(broker: &MemoryBroker, queue: &str, headers: Headers) {
    broker
        .publish(&Destination::queue(queue), OutboundMessage::new("payload").with_headers(headers))
        .await
        .expect("publish");
}

/// Handler that fails its first `failures` calls and records the retry count it saw.
#[derive(Clone, Default)]
pub struct FlakyHandler {
    pub calls: Arc<AtomicU32>,
    pub seen_counts: Arc<Mutex<Vec<Option<String>>>>,
}

impl FlakyHandler {
    pub fn service(&self, failures: u32) -> BoxCloneService<Delivery, (), TestError> {
        let calls = self.calls.clone();
        let seen = self.seen_counts.clone();
        BoxCloneService::new(tower::service_fn(move |delivery: Delivery| {
            let calls = calls.clone();
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(delivery.headers.get(RETRIED_COUNT).map(str::to_string));
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(TestError(n + 1))
                } else {
                    Ok(())
                }
            }
        }))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Option<String>> {
        self.seen_counts.lock().unwrap().clone()
    }
}

pub fn always_ok() -> BoxCloneService<Delivery, (), Infallible> {
    BoxCloneService::new(tower::service_fn(|_d: Delivery| async { Ok::<_, Infallible>(()) }))
}
