//! In-process broker for tests, demos and local development.
//!
//! Models the subset of broker behaviour the cascade relies on:
//! - named queues, reachable through the default exchange or explicit bindings;
//! - one consumer per queue, manual acknowledgement with per-delivery tags;
//! - per-message TTL on queues that declare a dead-letter target: such messages are held for
//!   their expiration and then dead-lettered (expiration removed, as real brokers do);
//! - `reject(requeue = true)` redelivers, `reject(requeue = false)` dead-letters when the queue
//!   is configured for it and discards otherwise;
//! - a consumer whose stream is dropped gives its unacked deliveries back to the queue, marked
//!   redelivered, and the queue can be consumed again;
//! - fault injection for publishes, acks and rejects.
//!
//! Timers run on the tokio runtime, so tests can use paused time to fast-forward backoffs.
//! Messages held for expiry are not visible to consumers of that queue.
//!
//! The inspection logs (`published`, `acked`, `rejected`, `discarded`) keep the most recent
//! [`DEFAULT_LOG_CAPACITY`] entries each; see [`MemoryBroker::with_log_capacity`]. Nothing is
//! persisted, so this broker is not meant for production traffic.

use crate::broker::{Broker, BrokerError, DeliveryStream};
use crate::message::{Delivery, DeliveryTag, Destination, OutboundMessage};
use crate::topology::RetryTopology;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// Entries kept per inspection log unless configured otherwise.
pub const DEFAULT_LOG_CAPACITY: usize = 10_000;

/// Per-queue settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Where expired or rejected messages go.
    pub dead_letter: Option<Destination>,
}

impl QueueOptions {
    pub fn dead_letter_to(target: Destination) -> Self {
        Self { dead_letter: Some(target) }
    }
}

/// A publish accepted by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub destination: Destination,
    /// Queue the destination resolved to.
    pub queue: String,
    pub message: OutboundMessage,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    ready: VecDeque<Delivery>,
    consumer: Option<u64>,
    wake: Arc<Notify>,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self { options, ready: VecDeque::new(), consumer: None, wake: Arc::new(Notify::new()) }
    }

    fn push_back(&mut self, delivery: Delivery) {
        self.ready.push_back(delivery);
        self.wake.notify_one();
    }

    fn push_front(&mut self, delivery: Delivery) {
        self.ready.push_front(delivery);
        self.wake.notify_one();
    }
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    delivery: Delivery,
    consumer: Option<u64>,
}

#[derive(Debug, Default)]
struct Faults {
    publishes: usize,
    acks: usize,
    rejects: usize,
}

// Counts down one injected failure; `true` when this call should fail.
fn take_fault(remaining: &mut usize) -> bool {
    if *remaining == 0 {
        return false;
    }
    *remaining -= 1;
    true
}

#[derive(Debug)]
struct State {
    queues: HashMap<String, QueueState>,
    bindings: HashMap<Destination, String>,
    unacked: HashMap<DeliveryTag, Unacked>,
    published: VecDeque<Published>,
    acked: VecDeque<DeliveryTag>,
    rejected: VecDeque<(DeliveryTag, bool)>,
    discarded: VecDeque<Delivery>,
    log_capacity: usize,
    dead_lettered: usize,
    faults: Faults,
}

impl Default for State {
    fn default() -> Self {
        Self {
            queues: HashMap::new(),
            bindings: HashMap::new(),
            unacked: HashMap::new(),
            published: VecDeque::new(),
            acked: VecDeque::new(),
            rejected: VecDeque::new(),
            discarded: VecDeque::new(),
            log_capacity: DEFAULT_LOG_CAPACITY,
            dead_lettered: 0,
            faults: Faults::default(),
        }
    }
}

fn record<T>(log: &mut VecDeque<T>, capacity: usize, entry: T) {
    if log.len() >= capacity {
        log.pop_front();
    }
    log.push_back(entry);
}

impl State {
    fn resolve(&self, destination: &Destination) -> Result<String, BrokerError> {
        if destination.is_default_exchange() {
            if self.queues.contains_key(&destination.routing_key) {
                return Ok(destination.routing_key.clone());
            }
            return Err(BrokerError::UnknownQueue(destination.routing_key.clone()));
        }
        self.bindings
            .get(destination)
            .cloned()
            .ok_or_else(|| BrokerError::Unroutable(destination.clone()))
    }

    /// Hand the next ready delivery of `queue` out under a fresh tag.
    fn take_ready(&mut self, queue: &str, consumer: Option<u64>, tag: DeliveryTag) -> Option<Delivery> {
        let mut delivery = self.queues.get_mut(queue)?.ready.pop_front()?;
        delivery.tag = tag;
        let entry = Unacked { queue: queue.to_string(), delivery: delivery.clone(), consumer };
        self.unacked.insert(tag, entry);
        Some(delivery)
    }
}

/// Cloneable handle to a shared in-memory broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    next_tag: Arc<AtomicU64>,
    next_consumer: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `capacity` entries in each inspection log, dropping the oldest.
    pub fn with_log_capacity(capacity: usize) -> Self {
        let broker = Self::default();
        broker.lock().log_capacity = capacity.max(1);
        broker
    }

    // A panic while holding the lock leaves plain bookkeeping behind; keep going with it.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Declare a queue. Re-declaring keeps pending messages and replaces the options.
    pub fn declare_queue(&self, name: impl Into<String>, options: QueueOptions) {
        let name = name.into();
        let mut state = self.lock();
        match state.queues.get_mut(&name) {
            Some(existing) => existing.options = options,
            None => {
                state.queues.insert(name, QueueState::new(options));
            }
        }
    }

    /// Route `exchange` + `routing_key` to `queue`.
    pub fn bind(
        &self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        queue: impl Into<String>,
    ) -> Result<(), BrokerError> {
        let queue = queue.into();
        let mut state = self.lock();
        if !state.queues.contains_key(&queue) {
            return Err(BrokerError::UnknownQueue(queue));
        }
        state.bindings.insert(Destination::new(exchange, routing_key), queue);
        Ok(())
    }

    /// Declare the wait queues (dead-lettering into the wait-ended queue) and the wait-ended
    /// queue itself.
    pub fn declare_topology(&self, topology: &RetryTopology) {
        self.declare_queue(topology.wait_ended_queue(), QueueOptions::default());
        for queue in topology.wait_queues().iter() {
            self.declare_queue(queue, QueueOptions::dead_letter_to(topology.dead_letter_target()));
        }
    }

    /// Make the next `count` publishes fail with [`BrokerError::PublishRefused`].
    pub fn fail_next_publishes(&self, count: usize) {
        self.lock().faults.publishes = count;
    }

    /// Make the next `count` acks fail. The delivery stays unacked.
    pub fn fail_next_acks(&self, count: usize) {
        self.lock().faults.acks = count;
    }

    /// Make the next `count` rejects fail. The delivery stays unacked.
    pub fn fail_next_rejects(&self, count: usize) {
        self.lock().faults.rejects = count;
    }

    /// Take the next ready delivery from `queue` without a consumer stream.
    ///
    /// Returns `None` when the queue is empty, unknown, or has a consumer.
    pub fn receive(&self, queue: &str) -> Option<Delivery> {
        let tag = self.next_tag();
        let mut state = self.lock();
        if state.queues.get(queue)?.consumer.is_some() {
            return None;
        }
        state.take_ready(queue, None, tag)
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn ready(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Publishes accepted so far, oldest first. Dead-lettering and redelivery are not publishes.
    pub fn published(&self) -> Vec<Published> {
        self.lock().published.iter().cloned().collect()
    }

    /// Publishes that resolved to `queue`.
    pub fn published_to(&self, queue: &str) -> Vec<OutboundMessage> {
        self.lock()
            .published
            .iter()
            .filter(|p| p.queue == queue)
            .map(|p| p.message.clone())
            .collect()
    }

    pub fn acked(&self) -> Vec<DeliveryTag> {
        self.lock().acked.iter().copied().collect()
    }

    pub fn rejected(&self) -> Vec<(DeliveryTag, bool)> {
        self.lock().rejected.iter().copied().collect()
    }

    /// Deliveries rejected without requeue from queues with no dead-letter target.
    pub fn discarded(&self) -> Vec<Delivery> {
        self.lock().discarded.iter().cloned().collect()
    }

    pub fn dead_lettered(&self) -> usize {
        self.lock().dead_lettered
    }

    /// Deliveries handed out but neither acked nor rejected.
    pub fn unacked(&self) -> usize {
        self.lock().unacked.len()
    }

    fn next_tag(&self) -> DeliveryTag {
        DeliveryTag::new(self.next_tag.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Place a message on a resolved queue: hold it for expiry if the queue dead-letters,
    /// otherwise make it ready for delivery.
    fn enqueue(
        &self,
        queue: String,
        via: Destination,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        let target =
            state.queues.get_mut(&queue).ok_or_else(|| BrokerError::UnknownQueue(queue.clone()))?;
        if let (Some(ttl), Some(dead_letter)) =
            (message.expiration_millis(), target.options.dead_letter.clone())
        {
            drop(state);
            let broker = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ttl)).await;
                tracing::trace!(queue = %queue, ttl_ms = ttl, "message expired");
                broker.dead_letter(dead_letter, message);
            });
            return Ok(());
        }
        target.push_back(Delivery {
            tag: DeliveryTag::new(0),
            exchange: via.exchange,
            routing_key: via.routing_key,
            payload: message.payload,
            headers: message.headers,
            expiration: message.expiration,
            redelivered: false,
        });
        Ok(())
    }

    fn dead_letter(&self, target: Destination, mut message: OutboundMessage) {
        message.expiration = None;
        let resolved = {
            let mut state = self.lock();
            state.dead_lettered += 1;
            state.resolve(&target)
        };
        if let Err(error) = resolved.and_then(|queue| self.enqueue(queue, target, message)) {
            tracing::warn!(%error, "dead-letter target missing; message dropped");
        }
    }

    /// Next delivery for the registered consumer `id`, if one is ready.
    fn next_for(&self, queue: &str, id: u64) -> Option<Delivery> {
        let tag = self.next_tag();
        self.lock().take_ready(queue, Some(id), tag)
    }

    /// Consumer `id` went away: requeue what it held and free the queue.
    fn release(&self, queue: &str, id: u64) {
        let mut state = self.lock();
        let mut held: Vec<DeliveryTag> = state
            .unacked
            .iter()
            .filter(|(_, entry)| entry.consumer == Some(id))
            .map(|(tag, _)| *tag)
            .collect();
        held.sort();
        let requeued = held.len();
        let mut returned = Vec::with_capacity(requeued);
        for tag in held {
            if let Some(entry) = state.unacked.remove(&tag) {
                returned.push(entry.delivery);
            }
        }
        if let Some(entry) = state.queues.get_mut(queue) {
            if entry.consumer == Some(id) {
                entry.consumer = None;
            }
            for delivery in returned.into_iter().rev() {
                entry.push_front(Delivery { redelivered: true, ..delivery });
            }
        }
        tracing::debug!(queue, requeued, "consumer cancelled");
    }
}

/// Registration of a consumer stream; dropping it cancels the consumer.
struct ConsumerLease {
    broker: MemoryBroker,
    queue: String,
    id: u64,
}

impl Drop for ConsumerLease {
    fn drop(&mut self) {
        self.broker.release(&self.queue, self.id);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(
        &self,
        destination: &Destination,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        let queue = {
            let mut state = self.lock();
            if take_fault(&mut state.faults.publishes) {
                return Err(BrokerError::PublishRefused {
                    destination: destination.clone(),
                    reason: "injected failure".to_string(),
                });
            }
            let queue = state.resolve(destination)?;
            let capacity = state.log_capacity;
            let published = Published {
                destination: destination.clone(),
                queue: queue.clone(),
                message: message.clone(),
            };
            record(&mut state.published, capacity, published);
            queue
        };
        self.enqueue(queue, destination.clone(), message)
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if take_fault(&mut state.faults.acks) {
            return Err(BrokerError::transport("injected ack failure"));
        }
        state.unacked.remove(&tag).ok_or(BrokerError::UnknownDeliveryTag(tag))?;
        let capacity = state.log_capacity;
        record(&mut state.acked, capacity, tag);
        Ok(())
    }

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let (delivery, dead_letter) = {
            let mut state = self.lock();
            if take_fault(&mut state.faults.rejects) {
                return Err(BrokerError::transport("injected reject failure"));
            }
            let Unacked { queue, delivery, .. } =
                state.unacked.remove(&tag).ok_or(BrokerError::UnknownDeliveryTag(tag))?;
            let capacity = state.log_capacity;
            record(&mut state.rejected, capacity, (tag, requeue));
            if requeue {
                if let Some(target) = state.queues.get_mut(&queue) {
                    target.push_front(Delivery { redelivered: true, ..delivery });
                }
                return Ok(());
            }
            let dead_letter = state.queues.get(&queue).and_then(|q| q.options.dead_letter.clone());
            (delivery, dead_letter)
        };

        match dead_letter {
            Some(target) => self.dead_letter(target, OutboundMessage::from_delivery(&delivery)),
            None => {
                let mut state = self.lock();
                let capacity = state.log_capacity;
                record(&mut state.discarded, capacity, delivery);
            }
        }
        Ok(())
    }

    /// The prefetch limit is not modelled; deliveries are handed out as fast as they are pulled.
    async fn consume(&self, queue: &str, _prefetch: u16) -> Result<DeliveryStream, BrokerError> {
        let id = self.next_consumer.fetch_add(1, Ordering::Relaxed) + 1;
        let wake = {
            let mut state = self.lock();
            let entry =
                state.queues.get_mut(queue).ok_or_else(|| BrokerError::UnknownQueue(queue.into()))?;
            if entry.consumer.is_some() {
                return Err(BrokerError::AlreadyConsumed(queue.into()));
            }
            entry.consumer = Some(id);
            entry.wake.clone()
        };
        let lease = ConsumerLease { broker: self.clone(), queue: queue.to_string(), id };
        let stream = futures::stream::unfold((lease, wake), |(lease, wake)| async move {
            loop {
                if let Some(delivery) = lease.broker.next_for(&lease.queue, lease.id) {
                    return Some((Ok(delivery), (lease, wake)));
                }
                wake.notified().await;
            }
        });
        Ok(stream.boxed())
    }
}
