use std::collections::VecDeque;
use std::time::Duration;

/// Sliding-window call counter.
///
/// Keeps the admission timestamp (clock millis) of every call started inside the trailing
/// window, oldest first. A sample taken at `s` counts while `now - s < window`.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    window_millis: u64,
    limit: usize,
    samples: VecDeque<u64>,
}

impl SlidingWindow {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            window_millis: u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1),
            limit,
            samples: VecDeque::with_capacity(limit),
        }
    }

    /// Record a call at `now` if the window has room, otherwise return how long until the
    /// oldest sample leaves the window.
    pub fn try_record(&mut self, now: u64) -> Result<(), Duration> {
        // Samples stay time-ordered even if a caller's reading lags behind a newer one.
        let now = self.samples.back().map_or(now, |&last| now.max(last));
        self.evict(now);
        if self.samples.len() < self.limit {
            self.samples.push_back(now);
            return Ok(());
        }
        let oldest = self.samples.front().copied().unwrap_or(now);
        let expires_at = oldest.saturating_add(self.window_millis);
        Err(Duration::from_millis(expires_at.saturating_sub(now).max(1)))
    }

    /// Calls counted in the window as of `now`.
    pub fn len_at(&mut self, now: u64) -> usize {
        self.evict(now);
        self.samples.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn evict(&mut self, now: u64) {
        while let Some(&oldest) = self.samples.front() {
            if now.saturating_sub(oldest) >= self.window_millis {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}
