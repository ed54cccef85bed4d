//! Convenient re-exports for common fetchgate types.
pub use crate::{
    cache::{CacheKey, CacheStore, Reservation},
    error::{ConfigError, FetchError},
    orchestrator::{BackoffHint, FetchOptions, FetchSource, Fetched, RequestOrchestrator},
    policy::MethodPolicy,
    telemetry::{FetchEvent, LogSink, MemorySink, NullSink, TelemetrySink},
    throttle::{ThrottleConfig, ThrottleGate, ThrottleLayer},
    timeout::TimeoutPolicy,
};
