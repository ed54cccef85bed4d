//! Abstraction for sleeping/waiting
//!
//! The throttle gate waits through a `Sleeper`, which lets tests drive sliding-window delays
//! without real time passing.

use crate::clock::ManualClock;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Abstraction for sleeping/waiting
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test sleeper that records every requested delay and returns immediately.
///
/// When linked to a [`ManualClock`] it also advances that clock by the requested duration, so
/// code that sleeps until a deadline observes the deadline as reached.
#[derive(Debug, Clone, Default)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
    clock: Option<ManualClock>,
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeper that advances `clock` on every sleep.
    pub fn advancing(clock: ManualClock) -> Self {
        Self { calls: Arc::default(), clock: Some(clock) }
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Sum of all recorded sleeps.
    pub fn total(&self) -> Duration {
        self.calls().iter().sum()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
        if let Some(clock) = &self.clock {
            clock.advance(duration);
        }
        // Yield so a caller looping on the sleeper still lets other tasks run.
        Box::pin(tokio::task::yield_now())
    }
}
