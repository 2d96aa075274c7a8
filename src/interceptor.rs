//! Retry interceptor: tower middleware around a message handler.
//!
//! Semantics per delivery:
//! - The handler runs exactly once.
//! - Success: the delivery is acknowledged.
//! - Failure with retries left: a copy with `x-retried-count + 1`, the original route (on first
//!   failure only) and a TTL of `delay(attempt)` is published to the attempt's wait queue, then
//!   the delivery is rejected without requeue.
//! - Failure with no retries left, or an unreadable retry count: the delivery is rejected
//!   without requeue and the observer fires once.
//!
//! Invariants:
//! - The reschedule publish completes before the reject is issued; a failed publish leaves the
//!   delivery unsettled so the broker redelivers it.
//! - The interceptor holds no per-message state; everything it needs is in the headers.

use crate::backoff::BackoffSchedule;
use crate::broker::{Broker, BrokerError};
use crate::error::CascadeError;
use crate::jitter::Jitter;
use crate::message::{
    Delivery, DeliveryTag, Destination, OutboundMessage, ORIGINAL_EXCHANGE, ORIGINAL_ROUTING_KEY,
    RETRIED_COUNT,
};
use crate::queues::RetryQueueSet;
use crate::telemetry::{emit_best_effort, CascadeEvent, NullSink, TelemetrySink};
use futures::future::BoxFuture;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

/// Callback invoked once for every permanently rejected delivery.
pub type Observer = Arc<dyn Fn() + Send + Sync>;

/// How a delivery was settled when the interceptor returns `Ok`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The handler succeeded; the delivery was acknowledged.
    Acked,
    /// The handler failed; a copy waits in `queue` for `delay`.
    Rescheduled { attempt: u32, queue: String, delay: Duration },
}

/// Build the copy of `delivery` that waits out `attempt`'s backoff.
///
/// The retry count becomes `attempt + 1`. The original-route headers are written from the
/// received exchange and routing key only when the delivery does not carry them yet, so the
/// route survives any number of round trips.
pub fn retry_message(delivery: &Delivery, attempt: u32, delay: Duration) -> OutboundMessage {
    let mut headers = delivery.headers.clone();
    headers.insert(RETRIED_COUNT, attempt.saturating_add(1).to_string());
    if headers.original_route().is_none() {
        headers.insert(ORIGINAL_EXCHANGE, delivery.exchange.clone());
        headers.insert(ORIGINAL_ROUTING_KEY, delivery.routing_key.clone());
    }
    OutboundMessage::new(delivery.payload.clone())
        .with_headers(headers)
        .with_expiration(delay.as_millis().to_string())
}

struct Settings<B> {
    broker: Arc<B>,
    schedule: BackoffSchedule,
    queues: RetryQueueSet,
    jitter: Jitter,
    observer: Option<Observer>,
}

/// Run the observer, if any. A panic is logged and swallowed.
pub(crate) fn notify_observer(observer: Option<&Observer>, tag: DeliveryTag) {
    if let Some(observer) = observer {
        let observer: &(dyn Fn() + Send + Sync) = &**observer;
        if catch_unwind(AssertUnwindSafe(observer)).is_err() {
            tracing::error!(delivery_tag = %tag, "retry observer panicked");
        }
    }
}

/// Tower layer that wraps a handler with the retry cascade.
pub struct RetryInterceptorLayer<B, T = NullSink> {
    settings: Arc<Settings<B>>,
    sink: T,
}

impl<B: Broker> RetryInterceptorLayer<B, NullSink> {
    /// Layer over `broker`. The caller guarantees `schedule.max_attempts() == queues.len()`;
    /// [`crate::RetryCascade`] checks this when it is built.
    pub(crate) fn new(broker: Arc<B>, schedule: BackoffSchedule, queues: RetryQueueSet) -> Self {
        let settings = Settings { broker, schedule, queues, jitter: Jitter::None, observer: None };
        Self { settings: Arc::new(settings), sink: NullSink }
    }
}

impl<B, T> RetryInterceptorLayer<B, T> {
    pub(crate) fn with_parts(self, jitter: Jitter, observer: Option<Observer>) -> Self {
        let current = &self.settings;
        let settings = Settings {
            broker: current.broker.clone(),
            schedule: current.schedule.clone(),
            queues: current.queues.clone(),
            jitter,
            observer,
        };
        Self { settings: Arc::new(settings), sink: self.sink }
    }

    /// Replace the telemetry sink.
    pub fn with_sink<U>(self, sink: U) -> RetryInterceptorLayer<B, U>
    where
        U: TelemetrySink,
    {
        RetryInterceptorLayer { settings: self.settings, sink }
    }

    pub fn schedule(&self) -> &BackoffSchedule {
        &self.settings.schedule
    }

    pub fn queues(&self) -> &RetryQueueSet {
        &self.settings.queues
    }
}

impl<B, T: Clone> Clone for RetryInterceptorLayer<B, T> {
    fn clone(&self) -> Self {
        Self { settings: self.settings.clone(), sink: self.sink.clone() }
    }
}

impl<S, B, T: Clone> Layer<S> for RetryInterceptorLayer<B, T> {
    type Service = RetryInterceptor<S, B, T>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryInterceptor { inner, settings: self.settings.clone(), sink: self.sink.clone() }
    }
}

/// Service produced by [`RetryInterceptorLayer`].
pub struct RetryInterceptor<S, B, T = NullSink> {
    inner: S,
    settings: Arc<Settings<B>>,
    sink: T,
}

impl<S: Clone, B, T: Clone> Clone for RetryInterceptor<S, B, T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), settings: self.settings.clone(), sink: self.sink.clone() }
    }
}

impl<S, B, T> Service<Delivery> for RetryInterceptor<S, B, T>
where
    S: Service<Delivery> + Clone + Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    S::Future: Send + 'static,
    B: Broker,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    type Response = Disposition;
    type Error = CascadeError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    // The handler's readiness is driven inside `call`; a readiness error counts as a handler
    // failure and is retried like one.
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, delivery: Delivery) -> Self::Future {
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let settings = self.settings.clone();
        let sink = self.sink.clone();

        Box::pin(async move {
            let tag = delivery.tag;
            match inner.oneshot(delivery.clone()).await {
                Ok(_) => {
                    settings
                        .broker
                        .ack(tag)
                        .await
                        .map_err(|source| CascadeError::Settle { tag, source })?;
                    let retried_count = delivery.headers.retried_count().unwrap_or_default();
                    tracing::debug!(delivery_tag = %tag, retried_count, "delivery acked");
                    emit_best_effort(sink, CascadeEvent::Acked { tag, retried_count }).await;
                    Ok(Disposition::Acked)
                }
                Err(error) => on_failure(&settings, sink, &delivery, error).await,
            }
        })
    }
}

async fn on_failure<B, T, E>(
    settings: &Settings<B>,
    sink: T,
    delivery: &Delivery,
    error: E,
) -> Result<Disposition, CascadeError<E>>
where
    B: Broker,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    let tag = delivery.tag;
    let attempt = match delivery.headers.retried_count() {
        Ok(attempt) => attempt,
        Err(header) => {
            tracing::warn!(delivery_tag = %tag, error = %header, "unreadable retry count");
            reject_permanently(settings, sink, tag, 0)
                .await
                .map_err(|source| CascadeError::Settle { tag, source })?;
            return Err(CascadeError::MalformedHeader(header));
        }
    };

    if settings.schedule.is_exhausted(attempt) {
        tracing::warn!(delivery_tag = %tag, attempt, "retries exhausted");
        reject_permanently(settings, sink, tag, attempt)
            .await
            .map_err(|source| CascadeError::Settle { tag, source })?;
        return Err(CascadeError::Exhausted { attempts: attempt, source: error });
    }

    let queue = settings.queues.queue_for(attempt).map_err(CascadeError::Queue)?;
    let delay = settings.jitter.apply(settings.schedule.delay(attempt));
    let destination = Destination::queue(queue);

    if let Err(source) =
        settings.broker.publish(&destination, retry_message(delivery, attempt, delay)).await
    {
        tracing::warn!(delivery_tag = %tag, queue, error = %source, "reschedule publish failed");
        emit_best_effort(sink, CascadeEvent::PublishFailed { tag, destination: destination.clone() })
            .await;
        return Err(CascadeError::Publish { destination, source });
    }

    settings.broker.reject(tag, false).await.map_err(|source| CascadeError::Settle { tag, source })?;

    tracing::info!(
        delivery_tag = %tag,
        attempt,
        queue,
        delay_ms = delay.as_millis() as u64,
        "delivery rescheduled"
    );
    let queue = queue.to_string();
    emit_best_effort(
        sink,
        CascadeEvent::Rescheduled { tag, attempt, queue: queue.clone(), delay },
    )
    .await;
    Ok(Disposition::Rescheduled { attempt, queue, delay })
}

async fn reject_permanently<B, T>(
    settings: &Settings<B>,
    sink: T,
    tag: DeliveryTag,
    attempts: u32,
) -> Result<(), BrokerError>
where
    B: Broker,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    settings.broker.reject(tag, false).await?;
    notify_observer(settings.observer.as_ref(), tag);
    emit_best_effort(sink, CascadeEvent::Exhausted { tag, attempts }).await;
    Ok(())
}
