#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # cascade-retry
//!
//! Stateless, broker-driven retries for message consumers.
//!
//! A failed delivery is not retried in-process. It is republished to a per-attempt wait queue
//! with a TTL; when the TTL expires the broker dead-letters it into a shared wait-ended queue,
//! and a router sends it back to the exchange and routing key it originally came from. All
//! retry state travels in message headers, so consumers can restart at any time.
//!
//! ## Features
//!
//! - **Backoff schedule** mapping attempt indexes to wait times, capped by `max_wait`
//! - **Retry interceptor** as tower middleware around any `Service<Delivery>`
//! - **Wait-expiry router** for the shared wait-ended queue
//! - **In-place retry layer** for queues that retry without wait queues, ending in a
//!   reject to the dead-letter exchange
//! - **Observer hook** and structured telemetry events with pluggable sinks
//! - **In-memory broker** with TTL expiry and dead-lettering for tests and local runs
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use cascade_retry::prelude::*;
//!
//! #[derive(Debug)]
//! struct Unavailable;
//! impl std::fmt::Display for Unavailable {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "unavailable") }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let broker = Arc::new(MemoryBroker::new());
//!     let cascade = RetryCascade::builder(broker.clone())
//!         .observer(|| eprintln!("gave up on a message"))
//!         .build()
//!         .unwrap();
//!     broker.declare_topology(cascade.topology());
//!     broker.declare_queue("orders", QueueOptions::default());
//!
//!     let handler = tower::service_fn(|_delivery: Delivery| async { Err::<(), _>(Unavailable) });
//!     let _orders = cascade.subscribe("orders", handler, SubscribeOptions::default()).await.unwrap();
//!     let _router = cascade.subscribe_router(SubscribeOptions::default()).await.unwrap();
//! }
//! ```

pub mod backoff;
pub mod broker;
pub mod cascade;
pub mod config;
pub mod error;
pub mod inline;
pub mod interceptor;
pub mod jitter;
pub mod memory;
pub mod message;
pub mod prelude;
pub mod queues;
pub mod router;
pub mod subscription;
pub mod telemetry;
pub mod topology;

// Re-exports
pub use backoff::{BackoffError, BackoffSchedule, BackoffScheduleBuilder, Growth};
pub use broker::{Broker, BrokerError, DeliveryStream};
pub use cascade::{CascadeBuildError, RetryCascade, RetryCascadeBuilder};
pub use config::{CascadeConfig, ConfigError};
pub use error::{CascadeError, RouteError};
pub use inline::{InlineRetry, InlineRetryLayer};
pub use interceptor::{retry_message, Disposition, Observer, RetryInterceptor, RetryInterceptorLayer};
pub use jitter::Jitter;
pub use memory::{MemoryBroker, QueueOptions};
pub use queues::{QueueSetError, RetryQueueSet};
pub use router::WaitExpiryRouter;
pub use subscription::{subscribe, SubscribeOptions, SubscriptionHandle};
pub use topology::RetryTopology;
