//! Consume a queue and feed each delivery to a service.
//!
//! `subscribe` registers any `Service<Delivery>`: a handler wrapped by the interceptor for an
//! ingress queue, or the router for the wait-ended queue. Deliveries are processed by a bounded
//! pool of tasks; ordering is not preserved. Errors are logged and the loop keeps going.
//!
//! Stopping (or dropping the handle) aborts in-flight work. Those deliveries stay unacked and
//! the broker redelivers them.

use crate::broker::{Broker, BrokerError, DeliveryStream};
use crate::message::Delivery;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tower::{Service, ServiceExt};

const CONSUME_RETRY_START: Duration = Duration::from_millis(100);
const CONSUME_RETRY_MAX: Duration = Duration::from_secs(5);

/// Options for [`subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Deliveries processed at once, also used as the consumer's prefetch. Values below 1 are
    /// treated as 1.
    pub concurrency: usize,
}

impl SubscribeOptions {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self { concurrency }
    }
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// Running subscription. Dropping it stops consumption.
#[derive(Debug)]
pub struct SubscriptionHandle {
    queue: String,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// True once the consume loop has exited (stopped, or the broker closed the stream).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stop consuming and wait for the loop to exit.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                tracing::error!(queue = %self.queue, %error, "subscription task failed");
            }
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Start consuming `queue` from `broker`, calling `service` once per delivery.
///
/// The service is responsible for settling each delivery; the loop only logs the outcome.
pub async fn subscribe<B, S>(
    broker: Arc<B>,
    queue: &str,
    service: S,
    options: SubscribeOptions,
) -> Result<SubscriptionHandle, BrokerError>
where
    B: Broker,
    S: Service<Delivery> + Clone + Send + 'static,
    S::Response: fmt::Debug + Send + 'static,
    S::Error: fmt::Display + Send + 'static,
    S::Future: Send + 'static,
{
    let concurrency = options.concurrency.max(1);
    let prefetch = u16::try_from(concurrency).unwrap_or(u16::MAX);
    let stream = broker.consume(queue, prefetch).await?;
    let (shutdown, shutdown_rx) = watch::channel(false);
    let worker = Worker {
        queue: queue.to_string(),
        semaphore: Arc::new(Semaphore::new(concurrency)),
        service,
    };
    let task = tokio::spawn(worker.run(stream, shutdown_rx));
    tracing::info!(queue, concurrency, prefetch, "subscribed");
    Ok(SubscriptionHandle { queue: queue.to_string(), shutdown, task: Some(task) })
}

struct Worker<S> {
    queue: String,
    semaphore: Arc<Semaphore>,
    service: S,
}

impl<S> Worker<S>
where
    S: Service<Delivery> + Clone + Send + 'static,
    S::Response: fmt::Debug + Send + 'static,
    S::Error: fmt::Display + Send + 'static,
    S::Future: Send + 'static,
{
    async fn run(self, mut stream: DeliveryStream, mut shutdown: watch::Receiver<bool>) {
        let mut workers = JoinSet::new();
        let mut stopped = false;
        let mut retry_in = CONSUME_RETRY_START;

        loop {
            let permit = tokio::select! {
                _ = shutdown.changed() => { stopped = true; break; }
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            while let Some(joined) = workers.try_join_next() {
                self.log_join(joined);
            }

            let next = tokio::select! {
                _ = shutdown.changed() => { stopped = true; break; }
                next = stream.next() => next,
            };
            let delivery = match next {
                Some(Ok(delivery)) => {
                    retry_in = CONSUME_RETRY_START;
                    delivery
                }
                Some(Err(BrokerError::Closed)) => {
                    tracing::warn!(queue = %self.queue, "broker closed the consumer");
                    break;
                }
                Some(Err(error)) => {
                    tracing::warn!(
                        queue = %self.queue,
                        %error,
                        retry_in_ms = retry_in.as_millis() as u64,
                        "consume error"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => { stopped = true; break; }
                        _ = tokio::time::sleep(retry_in) => {}
                    }
                    retry_in = (retry_in * 2).min(CONSUME_RETRY_MAX);
                    continue;
                }
                None => {
                    tracing::info!(queue = %self.queue, "delivery stream ended");
                    break;
                }
            };

            let service = self.service.clone();
            let queue = self.queue.clone();
            workers.spawn(async move {
                let _permit = permit;
                let tag = delivery.tag;
                match service.oneshot(delivery).await {
                    Ok(outcome) => tracing::debug!(%queue, delivery_tag = %tag, ?outcome, "processed"),
                    Err(error) => tracing::warn!(%queue, delivery_tag = %tag, %error, "delivery failed"),
                }
            });
        }

        if stopped {
            workers.abort_all();
        }
        while let Some(joined) = workers.join_next().await {
            self.log_join(joined);
        }
        tracing::info!(queue = %self.queue, "subscription stopped");
    }

    fn log_join(&self, joined: Result<(), tokio::task::JoinError>) {
        if let Err(error) = joined {
            if error.is_panic() {
                tracing::error!(queue = %self.queue, %error, "delivery task panicked");
            }
        }
    }
}
