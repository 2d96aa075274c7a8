//! Logical queue topology of a retry cascade.
//!
//! ```text
//! ingress ──fail──▶ wait[0] ─┐
//!    ▲              wait[1] ─┼─TTL expiry, dead-letter─▶ wait-ended ──router──▶ original route
//!    │              wait[n] ─┘                                                      │
//!    └──────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Ingress queues belong to the consumer groups and are not part of this description; any
//! number of them can share one set of wait queues because the way back is read from headers.
//! Provisioning is done by the broker adapter (or by hand); this type only says what to create.

use crate::message::Destination;
use crate::queues::RetryQueueSet;
use std::collections::BTreeMap;

/// Queue argument naming the exchange expired messages are dead-lettered to.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
/// Queue argument naming the routing key used when dead-lettering.
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";
/// Wait-ended queue name used by the reference deployment.
pub const DEFAULT_WAIT_ENDED_QUEUE: &str = "retry-wait-ended-queue";

/// Wait queues plus the shared wait-ended queue they dead-letter into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTopology {
    wait_queues: RetryQueueSet,
    wait_ended_queue: String,
}

impl RetryTopology {
    pub fn new(wait_queues: RetryQueueSet, wait_ended_queue: impl Into<String>) -> Self {
        Self { wait_queues, wait_ended_queue: wait_ended_queue.into() }
    }

    pub fn wait_queues(&self) -> &RetryQueueSet {
        &self.wait_queues
    }

    pub fn wait_ended_queue(&self) -> &str {
        &self.wait_ended_queue
    }

    /// Where every wait queue sends expired messages: the wait-ended queue, through the
    /// default exchange.
    pub fn dead_letter_target(&self) -> Destination {
        Destination::queue(self.wait_ended_queue.clone())
    }

    /// Arguments every wait queue must be declared with.
    pub fn wait_queue_arguments(&self) -> BTreeMap<&'static str, String> {
        let target = self.dead_letter_target();
        BTreeMap::from([
            (DEAD_LETTER_EXCHANGE_ARG, target.exchange),
            (DEAD_LETTER_ROUTING_KEY_ARG, target.routing_key),
        ])
    }
}
