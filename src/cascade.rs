//! Assembling a cascade: one schedule, one set of wait queues, one broker.
//!
//! A [`RetryCascade`] is the unit an application configures once at startup. It hands out the
//! two services that make up the cascade:
//! - [`RetryCascade::wrap`] / [`RetryCascade::layer`]: the interceptor, for ingress queues;
//! - [`RetryCascade::router`]: the router, for the shared wait-ended queue.
//!
//! Example
//! ```rust
//! use std::convert::Infallible;
//! use std::sync::Arc;
//! use cascade_retry::{MemoryBroker, RetryCascade, SubscribeOptions};
//! use cascade_retry::message::Delivery;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let broker = Arc::new(MemoryBroker::new());
//! let cascade = RetryCascade::builder(broker.clone()).build().unwrap();
//! broker.declare_topology(cascade.topology());
//! broker.declare_queue("orders", Default::default());
//!
//! let handler = tower::service_fn(|_delivery: Delivery| async { Ok::<_, Infallible>(()) });
//! let _ingress = cascade.subscribe("orders", handler, SubscribeOptions::default()).await.unwrap();
//! let _router = cascade.subscribe_router(SubscribeOptions::default()).await.unwrap();
//! # });
//! ```

use crate::backoff::{BackoffError, BackoffSchedule, BackoffScheduleBuilder};
use crate::broker::{Broker, BrokerError};
use crate::config::CascadeConfig;
use crate::interceptor::{Observer, RetryInterceptor, RetryInterceptorLayer};
use crate::jitter::Jitter;
use crate::message::Delivery;
use crate::queues::{QueueSetError, RetryQueueSet};
use crate::router::WaitExpiryRouter;
use crate::subscription::{subscribe, SubscribeOptions, SubscriptionHandle};
use crate::telemetry::{NullSink, TelemetrySink};
use crate::topology::{RetryTopology, DEFAULT_WAIT_ENDED_QUEUE};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tower_layer::Layer;
use tower_service::Service;

/// Errors returned while building a [`RetryCascade`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CascadeBuildError {
    #[error("invalid backoff: {0}")]
    Backoff(#[from] BackoffError),
    #[error("invalid retry queues: {0}")]
    Queues(#[from] QueueSetError),
    #[error("max_attempts ({max_attempts}) must equal the number of retry queues ({queues})")]
    AttemptsQueuesMismatch { max_attempts: u32, queues: usize },
    #[error("wait-ended queue name must not be empty")]
    BlankWaitEndedQueue,
    #[error("wait-ended queue `{0}` is also a retry queue")]
    WaitEndedIsRetryQueue(String),
}

/// Check that the pieces fit together and describe the resulting topology.
pub(crate) fn validate_parts(
    schedule: &BackoffSchedule,
    queues: RetryQueueSet,
    wait_ended_queue: &str,
) -> Result<RetryTopology, CascadeBuildError> {
    if usize::try_from(schedule.max_attempts()).ok() != Some(queues.len()) {
        return Err(CascadeBuildError::AttemptsQueuesMismatch {
            max_attempts: schedule.max_attempts(),
            queues: queues.len(),
        });
    }
    if wait_ended_queue.is_empty() {
        return Err(CascadeBuildError::BlankWaitEndedQueue);
    }
    if queues.iter().any(|q| q == wait_ended_queue) {
        return Err(CascadeBuildError::WaitEndedIsRetryQueue(wait_ended_queue.to_string()));
    }
    Ok(RetryTopology::new(queues, wait_ended_queue))
}

/// A configured retry cascade bound to a broker.
pub struct RetryCascade<B, T = NullSink> {
    broker: Arc<B>,
    layer: RetryInterceptorLayer<B, T>,
    topology: RetryTopology,
    sink: T,
}

impl<B: Broker> RetryCascade<B, NullSink> {
    pub fn builder(broker: Arc<B>) -> RetryCascadeBuilder<B, NullSink> {
        RetryCascadeBuilder::new(broker)
    }
}

impl<B, T> RetryCascade<B, T>
where
    B: Broker,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    /// The interceptor as a tower layer, for use in a `ServiceBuilder` stack.
    pub fn layer(&self) -> RetryInterceptorLayer<B, T> {
        self.layer.clone()
    }

    /// Wrap `handler` with the interceptor.
    pub fn wrap<S>(&self, handler: S) -> RetryInterceptor<S, B, T> {
        self.layer.layer(handler)
    }

    /// Service for the wait-ended queue.
    pub fn router(&self) -> WaitExpiryRouter<B, T> {
        WaitExpiryRouter::new(self.broker.clone()).with_sink(self.sink.clone())
    }

    pub fn topology(&self) -> &RetryTopology {
        &self.topology
    }

    pub fn schedule(&self) -> &BackoffSchedule {
        self.layer.schedule()
    }

    pub fn broker(&self) -> &Arc<B> {
        &self.broker
    }

    /// Consume an ingress queue through the interceptor.
    pub async fn subscribe<S>(
        &self,
        queue: &str,
        handler: S,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, BrokerError>
    where
        S: Service<Delivery> + Clone + Send + 'static,
        S::Response: Send + 'static,
        S::Error: fmt::Display + Send + 'static,
        S::Future: Send + 'static,
    {
        subscribe(self.broker.clone(), queue, self.wrap(handler), options).await
    }

    /// Consume the wait-ended queue through the router.
    pub async fn subscribe_router(
        &self,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, BrokerError> {
        subscribe(self.broker.clone(), self.topology.wait_ended_queue(), self.router(), options)
            .await
    }
}

/// Builder for [`RetryCascade`]. Defaults describe the reference deployment: three wait queues
/// `retry-queue-1..3`, delays of 1 s, 3 s and 9 s capped at 10 s, and
/// `retry-wait-ended-queue`.
pub struct RetryCascadeBuilder<B, T = NullSink> {
    broker: Arc<B>,
    backoff: BackoffScheduleBuilder,
    schedule: Option<BackoffSchedule>,
    queue_names: Vec<String>,
    wait_ended_queue: String,
    jitter: Jitter,
    observer: Option<Observer>,
    sink: T,
}

impl<B: Broker> RetryCascadeBuilder<B, NullSink> {
    pub fn new(broker: Arc<B>) -> Self {
        let defaults = CascadeConfig::default();
        Self {
            broker,
            backoff: defaults.backoff_builder(),
            schedule: None,
            queue_names: defaults.queue_names,
            wait_ended_queue: DEFAULT_WAIT_ENDED_QUEUE.to_string(),
            jitter: Jitter::None,
            observer: None,
            sink: NullSink,
        }
    }
}

impl<B, T> RetryCascadeBuilder<B, T> {
    /// Take schedule parameters and queue names from a config.
    pub fn config(mut self, config: &CascadeConfig) -> Self {
        self.backoff = config.backoff_builder();
        self.schedule = None;
        self.queue_names = config.queue_names.clone();
        self.wait_ended_queue = config.wait_ended_queue.clone();
        self
    }

    /// Schedule parameters, validated at `build`.
    pub fn backoff(mut self, backoff: BackoffScheduleBuilder) -> Self {
        self.backoff = backoff;
        self.schedule = None;
        self
    }

    /// An already-built schedule.
    pub fn schedule(mut self, schedule: BackoffSchedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Wait queue names, one per attempt, in order.
    pub fn queues<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queue_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn wait_ended_queue(mut self, name: impl Into<String>) -> Self {
        self.wait_ended_queue = name.into();
        self
    }

    /// Randomize each delay within the schedule's value.
    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Called once per permanently rejected delivery. Panics are caught and logged.
    pub fn observer<F>(mut self, observer: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn telemetry<U: TelemetrySink>(self, sink: U) -> RetryCascadeBuilder<B, U> {
        RetryCascadeBuilder {
            broker: self.broker,
            backoff: self.backoff,
            schedule: self.schedule,
            queue_names: self.queue_names,
            wait_ended_queue: self.wait_ended_queue,
            jitter: self.jitter,
            observer: self.observer,
            sink,
        }
    }

    pub fn build(self) -> Result<RetryCascade<B, T>, CascadeBuildError>
    where
        B: Broker,
        T: TelemetrySink,
    {
        let schedule = match self.schedule {
            Some(schedule) => schedule,
            None => self.backoff.build()?,
        };
        let queues = RetryQueueSet::new(self.queue_names)?;
        let topology = validate_parts(&schedule, queues.clone(), &self.wait_ended_queue)?;
        let layer = RetryInterceptorLayer::new(self.broker.clone(), schedule, queues)
            .with_parts(self.jitter, self.observer)
            .with_sink(self.sink.clone());
        Ok(RetryCascade { broker: self.broker, layer, topology, sink: self.sink })
    }
}
