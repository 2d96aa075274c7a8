//! Telemetry for the retry cascade.
//!
//! The interceptor and the router describe every settlement as a [`CascadeEvent`] and hand
//! it to a [`TelemetrySink`], which is just a `tower::Service<CascadeEvent>`. Sinks can log,
//! buffer, broadcast, or forward events elsewhere (see the `cascade-retry-jsonl` crate).
//!
//! # Events
//!
//! - **Interceptor**: `Acked`, `Rescheduled`, `Exhausted`, `PublishFailed`
//! - **Router**: `Routed`, `MissingRoute`, `PublishFailed`
//!
//! The zero-argument observer set on the cascade still fires for permanent rejections;
//! [`StreamingSink`] is the channel-based alternative when subscribers need details.

pub mod events;
pub mod sinks;

#[cfg(feature = "telemetry-json")]
pub use events::event_to_json;
pub use events::CascadeEvent;
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, StreamingSink, TelemetrySink};
