//! Caller deadlines

use crate::error::{ConfigError, FetchError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Bounds how long a caller is willing to wait for an outcome.
///
/// Expiry only drops the future the caller was awaiting. When that future is a waiter handle on
/// a shared entry, the fetch itself keeps running for everyone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Create a timeout policy. The duration must be non-zero.
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        if duration.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(Self { duration })
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Await `future`, giving up with [`FetchError::Timeout`] once the deadline passes.
    ///
    /// The deadline is measured on tokio time. An injected [`Clock`](crate::clock::Clock) does
    /// not move it; pause the tokio runtime to control it in tests.
    pub async fn run<T, E, Fut>(&self, future: Fut) -> Result<T, FetchError<E>>
    where
        Fut: Future<Output = Result<T, FetchError<E>>>,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.duration, future).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout { elapsed: start.elapsed(), timeout: self.duration }),
        }
    }
}
