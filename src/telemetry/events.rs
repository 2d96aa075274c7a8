use crate::message::{DeliveryTag, Destination};
use std::fmt;
use std::time::Duration;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Events emitted while messages move through the cascade.
///
/// Emission is best-effort: a failing sink never changes how a delivery is settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CascadeEvent {
    /// The handler succeeded and the delivery was acknowledged.
    Acked {
        tag: DeliveryTag,
        /// Retries the message had been through before this success.
        retried_count: u32,
    },
    /// The handler failed and a copy was parked in a wait queue.
    Rescheduled {
        tag: DeliveryTag,
        /// Zero-based attempt index that selected the queue and delay.
        attempt: u32,
        queue: String,
        delay: Duration,
    },
    /// The handler failed and will be called again in place after `delay`; the delivery stays
    /// unacked meanwhile.
    Retrying { tag: DeliveryTag, attempt: u32, delay: Duration },
    /// Retries are used up (or the count header was unreadable); the delivery was rejected
    /// for good.
    Exhausted { tag: DeliveryTag, attempts: u32 },
    /// A message whose wait expired was sent back to where it first came from.
    Routed { tag: DeliveryTag, destination: Destination, retried_count: u32 },
    /// Publishing a rescheduled or routed copy failed; the delivery was left unsettled.
    PublishFailed { tag: DeliveryTag, destination: Destination },
    /// A message reached the wait-ended queue without its original-route headers.
    MissingRoute { tag: DeliveryTag },
}

impl CascadeEvent {
    /// Delivery the event is about.
    pub fn tag(&self) -> DeliveryTag {
        match self {
            CascadeEvent::Acked { tag, .. }
            | CascadeEvent::Rescheduled { tag, .. }
            | CascadeEvent::Retrying { tag, .. }
            | CascadeEvent::Exhausted { tag, .. }
            | CascadeEvent::Routed { tag, .. }
            | CascadeEvent::PublishFailed { tag, .. }
            | CascadeEvent::MissingRoute { tag } => *tag,
        }
    }

    /// Stable snake_case name, used as the `kind` field in JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            CascadeEvent::Acked { .. } => "acked",
            CascadeEvent::Rescheduled { .. } => "rescheduled",
            CascadeEvent::Retrying { .. } => "retrying",
            CascadeEvent::Exhausted { .. } => "exhausted",
            CascadeEvent::Routed { .. } => "routed",
            CascadeEvent::PublishFailed { .. } => "publish_failed",
            CascadeEvent::MissingRoute { .. } => "missing_route",
        }
    }
}

impl fmt::Display for CascadeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CascadeEvent::Acked { tag, retried_count } => {
                write!(f, "Acked(tag={}, retried={})", tag, retried_count)
            }
            CascadeEvent::Rescheduled { tag, attempt, queue, delay } => {
                write!(f, "Rescheduled(tag={}, #{} -> {}, delay={:?})", tag, attempt, queue, delay)
            }
            CascadeEvent::Retrying { tag, attempt, delay } => {
                write!(f, "Retrying(tag={}, #{}, delay={:?})", tag, attempt, delay)
            }
            CascadeEvent::Exhausted { tag, attempts } => {
                write!(f, "Exhausted(tag={}, attempts={})", tag, attempts)
            }
            CascadeEvent::Routed { tag, destination, retried_count } => {
                write!(f, "Routed(tag={}, to={}, retried={})", tag, destination, retried_count)
            }
            CascadeEvent::PublishFailed { tag, destination } => {
                write!(f, "PublishFailed(tag={}, to={})", tag, destination)
            }
            CascadeEvent::MissingRoute { tag } => write!(f, "MissingRoute(tag={})", tag),
        }
    }
}

#[cfg_attr(not(feature = "telemetry-json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a [`CascadeEvent`] into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &CascadeEvent) -> serde_json::Value {
    let tag = event.tag().value();
    match event {
        CascadeEvent::Acked { retried_count, .. } => json!({
            "kind": event.kind(),
            "tag": tag,
            "retried_count": *retried_count,
        }),
        CascadeEvent::Rescheduled { attempt, queue, delay, .. } => json!({
            "kind": event.kind(),
            "tag": tag,
            "attempt": *attempt,
            "queue": queue,
            "delay_ms": clamp_u64(delay.as_millis()),
        }),
        CascadeEvent::Retrying { attempt, delay, .. } => json!({
            "kind": event.kind(),
            "tag": tag,
            "attempt": *attempt,
            "delay_ms": clamp_u64(delay.as_millis()),
        }),
        CascadeEvent::Exhausted { attempts, .. } => json!({
            "kind": event.kind(),
            "tag": tag,
            "attempts": *attempts,
        }),
        CascadeEvent::Routed { destination, retried_count, .. } => json!({
            "kind": event.kind(),
            "tag": tag,
            "exchange": destination.exchange,
            "routing_key": destination.routing_key,
            "retried_count": *retried_count,
        }),
        CascadeEvent::PublishFailed { destination, .. } => json!({
            "kind": event.kind(),
            "tag": tag,
            "exchange": destination.exchange,
            "routing_key": destination.routing_key,
        }),
        CascadeEvent::MissingRoute { .. } => json!({ "kind": event.kind(), "tag": tag }),
    }
}

#[cfg(all(test, feature = "telemetry-json"))]
mod json_tests {
    use super::*;

    #[test]
    fn rescheduled_json() {
        let v = event_to_json(&CascadeEvent::Rescheduled {
            tag: DeliveryTag::new(9),
            attempt: 1,
            queue: "retry-queue-2".into(),
            delay: Duration::from_millis(3000),
        });
        assert_eq!(v["kind"], "rescheduled");
        assert_eq!(v["tag"], 9);
        assert_eq!(v["attempt"], 1);
        assert_eq!(v["queue"], "retry-queue-2");
        assert_eq!(v["delay_ms"], 3000);
    }

    #[test]
    fn routed_json_carries_destination() {
        let v = event_to_json(&CascadeEvent::Routed {
            tag: DeliveryTag::new(2),
            destination: Destination::new("events", "order.created"),
            retried_count: 2,
        });
        assert_eq!(v["kind"], "routed");
        assert_eq!(v["exchange"], "events");
        assert_eq!(v["routing_key"], "order.created");
        assert_eq!(v["retried_count"], 2);
    }

    #[test]
    fn json_omits_payloads() {
        let v = event_to_json(&CascadeEvent::Exhausted { tag: DeliveryTag::new(1), attempts: 3 });
        let s = serde_json::to_string(&v).unwrap();
        assert!(!s.contains("payload"), "telemetry JSON should not carry payloads; got {s}");
    }
}
