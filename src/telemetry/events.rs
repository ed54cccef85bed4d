use crate::cache::CacheKey;
use std::fmt;
use std::time::Duration;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Events emitted while serving a fetch.
///
/// Separate from log output: events are typed values handed to a
/// [`TelemetrySink`](super::TelemetrySink) for aggregation or forwarding.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    /// Cache lookups
    Cache(CacheEvent),
    /// Throttle admission
    Throttle(ThrottleEvent),
    /// Outcome of a caller's request
    Request(RequestOutcome),
}

/// Result of looking a key up in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A fresh value was served without touching the remote API.
    Hit {
        key: CacheKey,
        /// Age of the cached value.
        age: Duration,
    },
    /// No usable entry existed; this caller runs the fetch.
    Miss { key: CacheKey },
    /// Another caller's fetch for the key was already in flight; this caller waits on it.
    Joined { key: CacheKey },
}

/// Events emitted by the throttle gate on behalf of a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleEvent {
    /// Admission had to wait for a slot, the window, or a cooldown.
    Delayed {
        key: CacheKey,
        /// Time spent waiting for admission.
        waited: Duration,
    },
    /// A response asked the client to back off.
    BackoffApplied {
        key: CacheKey,
        cooldown: Duration,
    },
}

/// How a caller's request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The fetch function returned a value.
    Success { key: CacheKey, duration: Duration },
    /// The fetch function failed, was abandoned, or was never admitted.
    Failure { key: CacheKey, duration: Duration },
    /// The caller's deadline passed before an outcome was available.
    TimedOut { key: CacheKey, timeout: Duration },
}

impl FetchEvent {
    /// Key the event is about.
    pub fn key(&self) -> &CacheKey {
        match self {
            FetchEvent::Cache(CacheEvent::Hit { key, .. })
            | FetchEvent::Cache(CacheEvent::Miss { key })
            | FetchEvent::Cache(CacheEvent::Joined { key })
            | FetchEvent::Throttle(ThrottleEvent::Delayed { key, .. })
            | FetchEvent::Throttle(ThrottleEvent::BackoffApplied { key, .. })
            | FetchEvent::Request(RequestOutcome::Success { key, .. })
            | FetchEvent::Request(RequestOutcome::Failure { key, .. })
            | FetchEvent::Request(RequestOutcome::TimedOut { key, .. }) => key,
        }
    }
}

impl fmt::Display for FetchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchEvent::Cache(event) => write!(f, "Cache::{}", event),
            FetchEvent::Throttle(event) => write!(f, "Throttle::{}", event),
            FetchEvent::Request(event) => write!(f, "Request::{}", event),
        }
    }
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheEvent::Hit { key, age } => write!(f, "Hit({}, age={:?})", key, age),
            CacheEvent::Miss { key } => write!(f, "Miss({})", key),
            CacheEvent::Joined { key } => write!(f, "Joined({})", key),
        }
    }
}

impl fmt::Display for ThrottleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleEvent::Delayed { key, waited } => {
                write!(f, "Delayed({}, waited={:?})", key, waited)
            }
            ThrottleEvent::BackoffApplied { key, cooldown } => {
                write!(f, "BackoffApplied({}, cooldown={:?})", key, cooldown)
            }
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOutcome::Success { key, duration } => {
                write!(f, "Success({}, duration={:?})", key, duration)
            }
            RequestOutcome::Failure { key, duration } => {
                write!(f, "Failure({}, duration={:?})", key, duration)
            }
            RequestOutcome::TimedOut { key, timeout } => {
                write!(f, "TimedOut({}, timeout={:?})", key, timeout)
            }
        }
    }
}

#[cfg(feature = "telemetry-json")]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a FetchEvent into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &FetchEvent) -> serde_json::Value {
    match event {
        FetchEvent::Cache(c) => match c {
            CacheEvent::Hit { key, age } => json!({
                "kind": "cache_hit",
                "key": key.as_str(),
                "age_ms": clamp_u64(age.as_millis()),
            }),
            CacheEvent::Miss { key } => json!({ "kind": "cache_miss", "key": key.as_str() }),
            CacheEvent::Joined { key } => json!({ "kind": "cache_joined", "key": key.as_str() }),
        },
        FetchEvent::Throttle(t) => match t {
            ThrottleEvent::Delayed { key, waited } => json!({
                "kind": "throttle_delayed",
                "key": key.as_str(),
                "waited_ms": clamp_u64(waited.as_millis()),
            }),
            ThrottleEvent::BackoffApplied { key, cooldown } => json!({
                "kind": "backoff_applied",
                "key": key.as_str(),
                "cooldown_ms": clamp_u64(cooldown.as_millis()),
            }),
        },
        FetchEvent::Request(r) => match r {
            RequestOutcome::Success { key, duration } => json!({
                "kind": "request_success",
                "key": key.as_str(),
                "duration_ms": clamp_u64(duration.as_millis()),
            }),
            RequestOutcome::Failure { key, duration } => json!({
                "kind": "request_failure",
                "key": key.as_str(),
                "duration_ms": clamp_u64(duration.as_millis()),
            }),
            RequestOutcome::TimedOut { key, timeout } => json!({
                "kind": "request_timed_out",
                "key": key.as_str(),
                "timeout_ms": clamp_u64(timeout.as_millis()),
            }),
        },
    }
}

#[cfg(all(test, feature = "telemetry-json"))]
mod json_tests {
    use super::*;

    #[test]
    fn cache_hit_json() {
        let v = event_to_json(&FetchEvent::Cache(CacheEvent::Hit {
            key: CacheKey::new("athlete?id=1"),
            age: Duration::from_millis(1500),
        }));
        assert_eq!(v["kind"], "cache_hit");
        assert_eq!(v["key"], "athlete?id=1");
        assert_eq!(v["age_ms"], 1500);
    }

    #[test]
    fn backoff_json() {
        let v = event_to_json(&FetchEvent::Throttle(ThrottleEvent::BackoffApplied {
            key: CacheKey::new("segments"),
            cooldown: Duration::from_secs(15),
        }));
        assert_eq!(v["kind"], "backoff_applied");
        assert_eq!(v["cooldown_ms"], 15_000);
    }

    #[test]
    fn timed_out_json() {
        let v = event_to_json(&FetchEvent::Request(RequestOutcome::TimedOut {
            key: CacheKey::new("segments"),
            timeout: Duration::from_millis(250),
        }));
        assert_eq!(v["kind"], "request_timed_out");
        assert_eq!(v["timeout_ms"], 250);
    }
}
