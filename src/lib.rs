#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # fetchgate
//!
//! Client-side request orchestration for rate-limited remote APIs.
//!
//! ## Features
//!
//! - **Single-flight cache**: concurrent requests for the same endpoint share one fetch
//! - **Per-method freshness** via a runtime-adjustable life span table
//! - **Throttle gate** combining a concurrency cap with a sliding-window rate limit
//! - **Server backoff** hints that pause every call for a cooldown
//! - **Caller deadlines** that never cancel a fetch other callers are waiting on
//! - **Typed telemetry** through `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use fetchgate::{CacheKey, MethodPolicy, RequestOrchestrator};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let policy = MethodPolicy::new(Duration::from_secs(60))
//!         .with_default("athlete.stats", Duration::from_secs(300));
//!
//!     let orchestrator = RequestOrchestrator::<String, std::io::Error>::builder()
//!         .max_concurrent_requests(4)
//!         .max_requests_in_timeframe(100)
//!         .sliding_timeframe(Duration::from_secs(15 * 60))
//!         .policy(policy)
//!         .build()
//!         .expect("valid limits");
//!
//!     let key = CacheKey::from_parts("athlete.stats", [("id", "7")]);
//!     let stats = orchestrator
//!         .fetch(key, || async {
//!             // Call the remote API here.
//!             Ok::<_, std::io::Error>("{\"rides\":12}".to_string())
//!         })
//!         .await
//!         .unwrap();
//!     assert_eq!(stats.value, "{\"rides\":12}");
//! }
//! ```

pub mod adaptive;
pub mod cache;
pub mod clock;
pub mod error;
pub mod orchestrator;
pub mod policy;
pub mod prelude;
pub mod sleeper;
pub mod telemetry;
pub mod throttle;
pub mod timeout;

// Re-exports
pub use adaptive::DynamicConfig;
pub use cache::{CacheKey, CacheStore, CachedValue, EntryInfo, EntryState, Reservation, WaitHandle};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{ConfigError, FetchError};
pub use orchestrator::{
    BackoffHint, FetchOptions, FetchSource, Fetched, OrchestratorBuilder, RequestOrchestrator,
};
pub use policy::{MethodPolicy, DEFAULT_LIFE_SPAN};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use throttle::{
    GateClosed, GateStats, ThrottleConfig, ThrottleGate, ThrottleLayer, ThrottlePermit,
    ThrottleService,
};
pub use timeout::TimeoutPolicy;
