//! Convenient re-exports for common cascade types.
pub use crate::{
    backoff::{BackoffSchedule, Growth},
    broker::{Broker, BrokerError},
    cascade::{CascadeBuildError, RetryCascade},
    config::CascadeConfig,
    error::{CascadeError, RouteError},
    inline::InlineRetryLayer,
    interceptor::{Disposition, RetryInterceptorLayer},
    jitter::Jitter,
    memory::{MemoryBroker, QueueOptions},
    message::{Delivery, DeliveryTag, Destination, Headers, OutboundMessage},
    queues::RetryQueueSet,
    router::WaitExpiryRouter,
    subscription::{SubscribeOptions, SubscriptionHandle},
    telemetry::{CascadeEvent, LogSink, MemorySink, StreamingSink, TelemetrySink},
    topology::RetryTopology,
};
