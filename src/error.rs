//! Error types for the interceptor and the router.
use crate::broker::BrokerError;
use crate::message::{DeliveryTag, Destination, HeaderError};
use crate::queues::QueueSetError;
use std::fmt;
use thiserror::Error;

/// Failure of one intercepted delivery.
///
/// `E` is the wrapped handler's error. Only [`CascadeError::Exhausted`] carries it: a handler
/// failure with retries left is not an error, it is a reschedule.
#[derive(Debug)]
pub enum CascadeError<E> {
    /// The handler failed with no retries left; the delivery was rejected without requeue.
    Exhausted { attempts: u32, source: E },
    /// The retry-count header could not be read; the delivery was rejected without requeue.
    MalformedHeader(HeaderError),
    /// The rescheduled copy could not be published; the delivery was left unsettled.
    Publish { destination: Destination, source: BrokerError },
    /// Acknowledging or rejecting the delivery failed.
    Settle { tag: DeliveryTag, source: BrokerError },
    /// No wait queue for the attempt; the schedule and the queue set disagree.
    Queue(QueueSetError),
}

impl<E: fmt::Display> fmt::Display for CascadeError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { attempts, source } => {
                write!(f, "retries exhausted after {} attempts; last error: {}", attempts, source)
            }
            Self::MalformedHeader(e) => write!(f, "delivery rejected: {}", e),
            Self::Publish { destination, source } => {
                write!(f, "failed to reschedule to {}: {}", destination, source)
            }
            Self::Settle { tag, source } => {
                write!(f, "failed to settle delivery {}: {}", tag, source)
            }
            Self::Queue(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CascadeError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Exhausted { source, .. } => Some(source),
            Self::MalformedHeader(e) => Some(e),
            Self::Publish { source, .. } | Self::Settle { source, .. } => Some(source),
            Self::Queue(e) => Some(e),
        }
    }
}

impl<E> CascadeError<E> {
    /// Check if the delivery was permanently rejected, either exhausted or malformed.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::MalformedHeader(_))
    }
    /// Check if this error is due to retry exhaustion
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
    pub fn is_malformed_header(&self) -> bool {
        matches!(self, Self::MalformedHeader(_))
    }
    /// Check if the rescheduled copy failed to publish
    pub fn is_publish(&self) -> bool {
        matches!(self, Self::Publish { .. })
    }
    pub fn is_settle(&self) -> bool {
        matches!(self, Self::Settle { .. })
    }
    /// Attempts consumed when the delivery was exhausted.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Exhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
    /// Borrow the handler error if present.
    pub fn handler_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { source, .. } => Some(source),
            _ => None,
        }
    }
    /// Get the handler error if present.
    pub fn into_handler_error(self) -> Option<E> {
        match self {
            Self::Exhausted { source, .. } => Some(source),
            _ => None,
        }
    }
    /// Broker error behind a publish or settle failure.
    pub fn broker_error(&self) -> Option<&BrokerError> {
        match self {
            Self::Publish { source, .. } | Self::Settle { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Failure of the wait-expiry router for one delivery. The delivery is never acked.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("delivery {tag} has no `{header}` header; cannot route back")]
    MissingOriginalRoute { tag: DeliveryTag, header: &'static str },
    #[error("failed to route back to {destination}: {source}")]
    Publish {
        destination: Destination,
        #[source]
        source: BrokerError,
    },
    #[error("failed to ack delivery {tag}: {source}")]
    Settle {
        tag: DeliveryTag,
        #[source]
        source: BrokerError,
    },
}

impl RouteError {
    pub fn is_missing_route(&self) -> bool {
        matches!(self, Self::MissingOriginalRoute { .. })
    }
}
