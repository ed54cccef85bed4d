//! Throttle gate: concurrency cap plus sliding-window rate limit.
//!
//! Admission needs both a free concurrency slot and room in the trailing window:
//! - **Concurrency**: at most `max_concurrent_requests` calls hold a [`ThrottlePermit`] at once.
//!   Slots are handed out in FIFO order and returned when the permit drops.
//! - **Rate**: at most `max_requests_in_timeframe` calls are *started* within any trailing
//!   `sliding_timeframe`. Releasing a permit does not remove its window sample.
//! - **Server backoff**: [`ThrottleGate::apply_backoff`] closes the gate for everyone until the
//!   cooldown has passed, regardless of the window.
//!
//! Nothing is rejected. A caller that does not fit waits until the oldest sample leaves the
//! window (or the cooldown ends) and tries again. The check and the recording of a sample happen
//! under one lock, so the ceiling is never exceeded even transiently.
//!
//! ```rust
//! use fetchgate::{ThrottleConfig, ThrottleGate};
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let config = ThrottleConfig::new(10, 30, Duration::from_secs(60)).unwrap();
//! let gate = ThrottleGate::new(config);
//! let permit = gate.admit().await.unwrap();
//! // ... perform the call ...
//! drop(permit);
//! assert_eq!(gate.stats().completed, 1);
//! # });
//! ```

pub mod layer;
pub mod window;

pub use layer::{ThrottleLayer, ThrottleService};
pub use window::SlidingWindow;

use crate::clock::{Clock, MonotonicClock};
use crate::error::ConfigError;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Validated throttle limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "ThrottleSettings", into = "ThrottleSettings")
)]
pub struct ThrottleConfig {
    max_concurrent_requests: usize,
    max_requests_in_timeframe: usize,
    sliding_timeframe: Duration,
}

impl ThrottleConfig {
    /// Create a config; every ceiling must be positive and the window non-empty.
    pub fn new(
        max_concurrent_requests: usize,
        max_requests_in_timeframe: usize,
        sliding_timeframe: Duration,
    ) -> Result<Self, ConfigError> {
        if max_concurrent_requests == 0 {
            return Err(ConfigError::CapacityMisconfigured {
                field: "max_concurrent_requests",
                value: max_concurrent_requests,
            });
        }
        if max_concurrent_requests > Semaphore::MAX_PERMITS {
            return Err(ConfigError::CapacityMisconfigured {
                field: "max_concurrent_requests",
                value: max_concurrent_requests,
            });
        }
        if max_requests_in_timeframe == 0 {
            return Err(ConfigError::CapacityMisconfigured {
                field: "max_requests_in_timeframe",
                value: max_requests_in_timeframe,
            });
        }
        if sliding_timeframe.as_millis() == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        Ok(Self { max_concurrent_requests, max_requests_in_timeframe, sliding_timeframe })
    }

    pub fn max_concurrent_requests(&self) -> usize {
        self.max_concurrent_requests
    }

    pub fn max_requests_in_timeframe(&self) -> usize {
        self.max_requests_in_timeframe
    }

    pub fn sliding_timeframe(&self) -> Duration {
        self.sliding_timeframe
    }
}

impl Default for ThrottleConfig {
    /// 10 calls in flight, 30 calls per rolling minute.
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            max_requests_in_timeframe: 30,
            sliding_timeframe: Duration::from_secs(60),
        }
    }
}

/// On-disk shape of [`ThrottleConfig`]; validated on load.
#[cfg(feature = "serde")]
#[derive(serde::Serialize, serde::Deserialize)]
struct ThrottleSettings {
    max_concurrent_requests: usize,
    max_requests_in_timeframe: usize,
    sliding_timeframe_ms: u64,
}

#[cfg(feature = "serde")]
impl TryFrom<ThrottleSettings> for ThrottleConfig {
    type Error = ConfigError;

    fn try_from(raw: ThrottleSettings) -> Result<Self, Self::Error> {
        Self::new(
            raw.max_concurrent_requests,
            raw.max_requests_in_timeframe,
            Duration::from_millis(raw.sliding_timeframe_ms),
        )
    }
}

#[cfg(feature = "serde")]
impl From<ThrottleConfig> for ThrottleSettings {
    fn from(config: ThrottleConfig) -> Self {
        Self {
            max_concurrent_requests: config.max_concurrent_requests,
            max_requests_in_timeframe: config.max_requests_in_timeframe,
            sliding_timeframe_ms: u64::try_from(config.sliding_timeframe.as_millis())
                .unwrap_or(u64::MAX),
        }
    }
}

/// Returned by [`ThrottleGate::admit`] once the gate has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("throttle gate is closed")]
pub struct GateClosed;

/// Point-in-time view of the gate's counters. Diagnostics only; the fields are read
/// independently and may be momentarily inconsistent with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStats {
    /// Calls admitted so far.
    pub issued: u64,
    /// Admitted calls whose permit has been released.
    pub completed: u64,
    /// Calls currently holding a permit.
    pub in_flight: u64,
    /// Calls counted in the current sliding window.
    pub window_len: usize,
    /// Time left on a server-directed cooldown, if one is active.
    pub backoff_remaining: Option<Duration>,
}

#[derive(Debug)]
struct GateState {
    window: SlidingWindow,
    backoff_until: u64,
}

#[derive(Debug)]
struct GateInner {
    config: ThrottleConfig,
    slots: Arc<Semaphore>,
    state: Mutex<GateState>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    issued: AtomicU64,
    completed: AtomicU64,
}

impl GateInner {
    fn lock_state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Why an admission had to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hold {
    Window,
    Backoff,
}

/// Admission control shared by every caller. Clones share the same limits and counters.
#[derive(Debug, Clone)]
pub struct ThrottleGate {
    inner: Arc<GateInner>,
}

impl ThrottleGate {
    pub fn new(config: ThrottleConfig) -> Self {
        Self::with_time(config, Arc::new(MonotonicClock::default()), Arc::new(TokioSleeper))
    }

    /// Create a gate with explicit time sources (useful for deterministic tests).
    pub fn with_time(config: ThrottleConfig, clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            inner: Arc::new(GateInner {
                slots: Arc::new(Semaphore::new(config.max_concurrent_requests)),
                state: Mutex::new(GateState {
                    window: SlidingWindow::new(
                        config.max_requests_in_timeframe,
                        config.sliding_timeframe,
                    ),
                    backoff_until: 0,
                }),
                config,
                clock,
                sleeper,
                issued: AtomicU64::new(0),
                completed: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.inner.config
    }

    /// Wait until a call may start.
    ///
    /// Takes a concurrency slot first, then waits for room in the sliding window and for any
    /// server cooldown to pass. The returned permit holds the slot until dropped.
    ///
    /// # Errors
    /// Returns [`GateClosed`] if the gate is closed before the call is admitted.
    pub async fn admit(&self) -> Result<ThrottlePermit, GateClosed> {
        let clock = &self.inner.clock;
        let started = clock.now_millis();

        let (slot, mut delayed) = match Arc::clone(&self.inner.slots).try_acquire_owned() {
            Ok(slot) => (slot, false),
            Err(TryAcquireError::Closed) => return Err(GateClosed),
            Err(TryAcquireError::NoPermits) => {
                tracing::debug!(
                    max = self.inner.config.max_concurrent_requests,
                    "throttle: all slots busy, waiting"
                );
                let slot = Arc::clone(&self.inner.slots)
                    .acquire_owned()
                    .await
                    .map_err(|_| GateClosed)?;
                (slot, true)
            }
        };

        loop {
            if self.inner.slots.is_closed() {
                return Err(GateClosed);
            }
            let now = clock.now_millis();
            let hold = {
                let mut state = self.inner.lock_state();
                if state.backoff_until > now {
                    Some((Duration::from_millis(state.backoff_until - now), Hold::Backoff))
                } else {
                    state.window.try_record(now).err().map(|wait| (wait, Hold::Window))
                }
            };
            let Some((wait, hold)) = hold else { break };
            delayed = true;
            match hold {
                Hold::Window => tracing::debug!(
                    wait_ms = wait.as_millis() as u64,
                    limit = self.inner.config.max_requests_in_timeframe,
                    "throttle: sliding window full, delaying call"
                ),
                Hold::Backoff => tracing::debug!(
                    wait_ms = wait.as_millis() as u64,
                    "throttle: server backoff active, delaying call"
                ),
            }
            self.inner.sleeper.sleep(wait).await;
        }

        self.inner.issued.fetch_add(1, Ordering::SeqCst);
        let waited = Duration::from_millis(clock.now_millis().saturating_sub(started));
        Ok(ThrottlePermit { _slot: slot, gate: Arc::clone(&self.inner), waited, delayed })
    }

    /// Refuse admission to everyone for at least `cooldown`, on top of the sliding window.
    ///
    /// Overlapping cooldowns do not shorten each other; the later deadline wins.
    pub fn apply_backoff(&self, cooldown: Duration) {
        let now = self.inner.clock.now_millis();
        let until = now.saturating_add(u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX));
        let mut state = self.inner.lock_state();
        if until > state.backoff_until {
            state.backoff_until = until;
            tracing::warn!(cooldown_ms = cooldown.as_millis() as u64, "throttle: server requested backoff");
        }
    }

    /// Stop admitting calls. Waiting callers get [`GateClosed`]; permits already handed out stay
    /// valid until dropped.
    pub fn close(&self) {
        self.inner.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.slots.is_closed()
    }

    pub fn stats(&self) -> GateStats {
        let now = self.inner.clock.now_millis();
        let (window_len, backoff_until) = {
            let mut state = self.inner.lock_state();
            (state.window.len_at(now), state.backoff_until)
        };
        let issued = self.inner.issued.load(Ordering::SeqCst);
        let completed = self.inner.completed.load(Ordering::SeqCst);
        GateStats {
            issued,
            completed,
            in_flight: issued.saturating_sub(completed),
            window_len,
            backoff_remaining: (backoff_until > now)
                .then(|| Duration::from_millis(backoff_until - now)),
        }
    }
}

/// Proof of admission. Dropping it returns the concurrency slot; the window sample stays.
#[derive(Debug)]
#[must_use = "the call is only admitted while the permit is held"]
pub struct ThrottlePermit {
    _slot: OwnedSemaphorePermit,
    gate: Arc<GateInner>,
    waited: Duration,
    delayed: bool,
}

impl ThrottlePermit {
    /// How long admission took.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Whether admission had to wait for a slot, the window, or a cooldown.
    pub fn was_delayed(&self) -> bool {
        self.delayed
    }
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        self.gate.completed.fetch_add(1, Ordering::SeqCst);
    }
}
