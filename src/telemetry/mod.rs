//! Telemetry for cache and throttle decisions.
//!
//! Every fetch reports what happened to it as [`FetchEvent`]s: cache hit, miss or join, throttle
//! delays and server backoff, and the final outcome. Events flow into a [`TelemetrySink`], which
//! is a `tower::Service<FetchEvent>` so sinks compose with ordinary tower combinators.
//!
//! Emission is best-effort and never waits. A sink that errors or is not ready loses the event;
//! the fetch is never affected. Wrap a slow sink in [`NonBlockingSink`] to queue events for it
//! instead.
//!
//! ```rust
//! use fetchgate::telemetry::{CacheEvent, FetchEvent, RequestOutcome};
//! use fetchgate::CacheKey;
//! use std::time::Duration;
//!
//! let key = CacheKey::new("athlete.stats?id=7");
//! let miss = FetchEvent::Cache(CacheEvent::Miss { key: key.clone() });
//! let done = FetchEvent::Request(RequestOutcome::Success {
//!     key,
//!     duration: Duration::from_millis(120),
//! });
//! assert!(miss.to_string().starts_with("Cache::Miss"));
//! assert!(done.to_string().contains("120ms"));
//! ```

pub mod events;
pub mod sinks;

#[cfg(feature = "telemetry-json")]
pub use events::event_to_json;
pub use events::{CacheEvent, FetchEvent, RequestOutcome, ThrottleEvent};
pub use sinks::{
    emit_best_effort, emit_nonblocking, ComposedSinkError, LogSink, MemorySink, MulticastSink,
    NonBlockingSink, NullSink, TelemetrySink,
};
