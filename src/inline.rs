//! In-place retries for consumers that do not use the wait-queue cascade.
//!
//! The handler is called again on the same delivery after a backoff sleep, holding the
//! delivery unacked in between. With `max_attempts = n` the handler runs at most `n + 1` times.
//! When it still fails the delivery is rejected without requeue and the observer fires, so a
//! queue with a dead-letter exchange collects it.
//!
//! Unlike [`crate::RetryInterceptor`], the retry state lives in the running task: a consumer
//! restart loses it and the broker redelivers the message from its first attempt.

use crate::backoff::BackoffSchedule;
use crate::broker::Broker;
use crate::error::CascadeError;
use crate::interceptor::{notify_observer, Disposition, Observer};
use crate::jitter::Jitter;
use crate::message::Delivery;
use crate::telemetry::{emit_best_effort, CascadeEvent, NullSink, TelemetrySink};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::ServiceExt;
use tower_layer::Layer;
use tower_service::Service;

struct Settings<B> {
    broker: Arc<B>,
    schedule: BackoffSchedule,
    jitter: Jitter,
    observer: Option<Observer>,
}

/// Tower layer that retries a handler in place, then rejects without requeue.
pub struct InlineRetryLayer<B, T = NullSink> {
    settings: Arc<Settings<B>>,
    sink: T,
}

impl<B: Broker> InlineRetryLayer<B, NullSink> {
    /// Layer settling deliveries on `broker`. `schedule.max_attempts()` is the number of
    /// retries after the first call.
    pub fn new(broker: Arc<B>, schedule: BackoffSchedule) -> Self {
        let settings = Settings { broker, schedule, jitter: Jitter::None, observer: None };
        Self { settings: Arc::new(settings), sink: NullSink }
    }
}

impl<B, T> InlineRetryLayer<B, T> {
    fn rebuild(self, jitter: Jitter, observer: Option<Observer>) -> Self {
        let settings = Settings {
            broker: self.settings.broker.clone(),
            schedule: self.settings.schedule.clone(),
            jitter,
            observer,
        };
        Self { settings: Arc::new(settings), sink: self.sink }
    }

    pub fn with_jitter(self, jitter: Jitter) -> Self {
        let observer = self.settings.observer.clone();
        self.rebuild(jitter, observer)
    }

    /// Callback run once per delivery rejected after its last retry.
    pub fn with_observer<F>(self, observer: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let jitter = self.settings.jitter;
        self.rebuild(jitter, Some(Arc::new(observer)))
    }

    /// Replace the telemetry sink.
    pub fn with_sink<U>(self, sink: U) -> InlineRetryLayer<B, U>
    where
        U: TelemetrySink,
    {
        InlineRetryLayer { settings: self.settings, sink }
    }

    pub fn schedule(&self) -> &BackoffSchedule {
        &self.settings.schedule
    }
}

impl<B, T: Clone> Clone for InlineRetryLayer<B, T> {
    fn clone(&self) -> Self {
        Self { settings: self.settings.clone(), sink: self.sink.clone() }
    }
}

impl<S, B, T: Clone> Layer<S> for InlineRetryLayer<B, T> {
    type Service = InlineRetry<S, B, T>;

    fn layer(&self, inner: S) -> Self::Service {
        InlineRetry { inner, settings: self.settings.clone(), sink: self.sink.clone() }
    }
}

/// Service produced by [`InlineRetryLayer`].
pub struct InlineRetry<S, B, T = NullSink> {
    inner: S,
    settings: Arc<Settings<B>>,
    sink: T,
}

impl<S: Clone, B, T: Clone> Clone for InlineRetry<S, B, T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), settings: self.settings.clone(), sink: self.sink.clone() }
    }
}

impl<S, B, T> Service<Delivery> for InlineRetry<S, B, T>
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
            let mut retried = 0;
            loop {
                match inner.clone().oneshot(delivery.clone()).await {
                    Ok(_) => {
                        settings
                            .broker
                            .ack(tag)
                            .await
                            .map_err(|source| CascadeError::Settle { tag, source })?;
                        tracing::debug!(delivery_tag = %tag, retried, "delivery acked");
                        emit_best_effort(
                            sink,
                            CascadeEvent::Acked { tag, retried_count: retried },
                        )
                        .await;
                        return Ok(Disposition::Acked);
                    }
                    Err(error) if settings.schedule.is_exhausted(retried) => {
                        tracing::warn!(
                            delivery_tag = %tag,
                            attempts = retried,
                            "retries exhausted"
                        );
                        settings
                            .broker
                            .reject(tag, false)
                            .await
                            .map_err(|source| CascadeError::Settle { tag, source })?;
                        notify_observer(settings.observer.as_ref(), tag);
                        emit_best_effort(
                            sink,
                            CascadeEvent::Exhausted { tag, attempts: retried },
                        )
                        .await;
                        return Err(CascadeError::Exhausted { attempts: retried, source: error });
                    }
                    Err(_) => {
                        let delay = settings.jitter.apply(settings.schedule.delay(retried));
                        tracing::debug!(
                            delivery_tag = %tag,
                            attempt = retried,
                            delay_ms = delay.as_millis() as u64,
                            "retrying in place"
                        );
                        emit_best_effort(
                            sink.clone(),
                            CascadeEvent::Retrying { tag, attempt: retried, delay },
                        )
                        .await;
                        tokio::time::sleep(delay).await;
                        retried += 1;
                    }
                }
            }
        })
    }
}
