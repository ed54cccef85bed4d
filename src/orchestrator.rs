//! Request orchestrator: the single entry point callers use.
//!
//! A call to [`RequestOrchestrator::fetch`] goes through three stages:
//! 1. The cache is consulted. A fresh value returns immediately and never touches the throttle.
//! 2. If a fetch for the key is already in flight, the caller joins it and shares its outcome.
//! 3. Otherwise the caller's fetch function runs in its own task: it is admitted through the
//!    throttle gate, executed, and its outcome published to every waiter.
//!
//! Callers only ever wait on the shared outcome. A caller whose deadline passes gets
//! [`FetchError::Timeout`] and stops waiting, but the fetch keeps running for everyone else and
//! its value is still cached.
//!
//! ```rust
//! use fetchgate::{CacheKey, FetchSource, RequestOrchestrator};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let orchestrator = RequestOrchestrator::<String, std::io::Error>::builder().build().unwrap();
//! let key = CacheKey::new("athlete.stats?id=7");
//!
//! let first = orchestrator
//!     .fetch(key.clone(), || async { Ok::<_, std::io::Error>("stats".to_string()) })
//!     .await
//!     .unwrap();
//! assert_eq!(first.source, FetchSource::Fetched);
//!
//! let second = orchestrator
//!     .fetch(key, || async { Ok::<_, std::io::Error>("ignored".to_string()) })
//!     .await
//!     .unwrap();
//! assert_eq!(second.source, FetchSource::CacheHit);
//! assert_eq!(second.value, "stats");
//! # });
//! ```

use crate::cache::{CacheKey, CacheStore, PendingFetch, Reservation, WaitHandle};
use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, FetchError};
use crate::policy::MethodPolicy;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{
    emit_nonblocking, CacheEvent, FetchEvent, NullSink, RequestOutcome, TelemetrySink,
    ThrottleEvent,
};
use crate::throttle::{ThrottleConfig, ThrottleGate};
use crate::timeout::TimeoutPolicy;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Explicit server cooldown carried by a successful response.
///
/// When a response reports one, the throttle gate refuses every call until it has passed.
pub trait BackoffHint {
    /// Cooldown requested by the server, if any.
    fn backoff_hint(&self) -> Option<Duration> {
        None
    }
}

impl BackoffHint for () {}
impl BackoffHint for String {}
impl<T> BackoffHint for Vec<T> {}
impl<T: BackoffHint + ?Sized> BackoffHint for Arc<T> {
    fn backoff_hint(&self) -> Option<Duration> {
        (**self).backoff_hint()
    }
}

/// Where a returned value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    /// Served from a fresh cache entry.
    CacheHit,
    /// This caller's fetch function produced it.
    Fetched,
    /// Shared from another caller's in-flight fetch.
    Joined,
}

/// A value together with its provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched<T> {
    pub value: T,
    pub source: FetchSource,
    /// Age of the cached value; zero unless `source` is [`FetchSource::CacheHit`].
    pub age: Duration,
}

impl<T> Fetched<T> {
    pub fn into_inner(self) -> T {
        self.value
    }

    pub fn is_cache_hit(&self) -> bool {
        self.source == FetchSource::CacheHit
    }
}

/// Per-call knobs for [`RequestOrchestrator::fetch_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Caller deadline; overrides the orchestrator's default.
    pub timeout: Option<TimeoutPolicy>,
    /// Life span for an entry created by this call; overrides the method policy.
    pub life_span: Option<Duration>,
}

impl FetchOptions {
    pub fn timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn life_span(mut self, life_span: Duration) -> Self {
        self.life_span = Some(life_span);
        self
    }
}

/// Cache-first, throttled, single-flight access to a remote API.
///
/// Clones share the cache, the throttle gate and the telemetry sink.
pub struct RequestOrchestrator<T, E, S = NullSink> {
    cache: CacheStore<T, E>,
    gate: ThrottleGate,
    sink: S,
    clock: Arc<dyn Clock>,
    default_timeout: Option<TimeoutPolicy>,
    fetch_timeout: Option<TimeoutPolicy>,
}

impl<T, E, S: Clone> Clone for RequestOrchestrator<T, E, S> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            gate: self.gate.clone(),
            sink: self.sink.clone(),
            clock: Arc::clone(&self.clock),
            default_timeout: self.default_timeout,
            fetch_timeout: self.fetch_timeout,
        }
    }
}

impl<T, E, S> std::fmt::Debug for RequestOrchestrator<T, E, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOrchestrator")
            .field("cache", &self.cache)
            .field("gate", &self.gate)
            .field("default_timeout", &self.default_timeout)
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}

impl<T, E> RequestOrchestrator<T, E, NullSink>
where
    T: Clone + Send + Sync + BackoffHint + 'static,
    E: Send + Sync + 'static,
{
    /// Orchestrator with the given limits and life spans, real time and no telemetry.
    pub fn new(throttle: ThrottleConfig, policy: MethodPolicy) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::default());
        Self {
            cache: CacheStore::with_clock(policy, Arc::clone(&clock)),
            gate: ThrottleGate::with_time(throttle, Arc::clone(&clock), Arc::new(TokioSleeper)),
            sink: NullSink,
            clock,
            default_timeout: None,
            fetch_timeout: None,
        }
    }

    pub fn builder() -> OrchestratorBuilder<T, E, NullSink> {
        OrchestratorBuilder::new()
    }
}

impl<T, E, S> RequestOrchestrator<T, E, S>
where
    T: Clone + Send + Sync + BackoffHint + 'static,
    E: Send + Sync + 'static,
    S: TelemetrySink,
    S::Future: Send + 'static,
{
    /// Return the value for `key`, from cache if fresh, otherwise by running `fetch_fn` once for
    /// every concurrent caller of the same key.
    ///
    /// `fetch_fn` is only invoked when this caller creates the pending entry. Errors it returns
    /// reach every waiter as [`FetchError::FetchFailed`] and are never cached.
    pub async fn fetch<F, Fut>(
        &self,
        key: impl Into<CacheKey>,
        fetch_fn: F,
    ) -> Result<Fetched<T>, FetchError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.fetch_with(key, FetchOptions::default(), fetch_fn).await
    }

    /// [`fetch`](Self::fetch) bounded by a caller deadline.
    pub async fn fetch_with_timeout<F, Fut>(
        &self,
        key: impl Into<CacheKey>,
        timeout: TimeoutPolicy,
        fetch_fn: F,
    ) -> Result<Fetched<T>, FetchError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.fetch_with(key, FetchOptions::default().timeout(timeout), fetch_fn).await
    }

    /// [`fetch`](Self::fetch) with per-call options.
    pub async fn fetch_with<F, Fut>(
        &self,
        key: impl Into<CacheKey>,
        options: FetchOptions,
        fetch_fn: F,
    ) -> Result<Fetched<T>, FetchError<E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = key.into();
        let started = self.clock.now_millis();
        let deadline = options.timeout.or(self.default_timeout);

        match self.cache.reserve_with(&key, options.life_span) {
            Reservation::Fresh(cached) => {
                self.emit(FetchEvent::Cache(CacheEvent::Hit { key, age: cached.age }));
                Ok(Fetched { value: cached.value, source: FetchSource::CacheHit, age: cached.age })
            }
            Reservation::Joined(handle) => {
                tracing::trace!(key = %key, "joining in-flight fetch");
                self.emit(FetchEvent::Cache(CacheEvent::Joined { key }));
                self.await_outcome(handle, deadline, FetchSource::Joined, started).await
            }
            Reservation::Created(pending) => {
                self.emit(FetchEvent::Cache(CacheEvent::Miss { key }));
                let handle = pending.subscribe();
                self.spawn_fetch(pending, fetch_fn);
                self.await_outcome(handle, deadline, FetchSource::Fetched, started).await
            }
        }
    }

    async fn await_outcome(
        &self,
        handle: WaitHandle<T, E>,
        deadline: Option<TimeoutPolicy>,
        source: FetchSource,
        started: u64,
    ) -> Result<Fetched<T>, FetchError<E>> {
        let key = handle.key().clone();
        // The shared outcome may itself be a `Timeout` from the fetch deadline, so the caller's
        // own expiry is tracked apart from it.
        let (result, caller_expired) = match deadline {
            Some(policy) => match policy.run(async { Ok::<_, FetchError<E>>(handle.await) }).await {
                Ok(outcome) => (outcome, false),
                Err(expired) => (Err(expired), true),
            },
            None => (handle.await, false),
        };
        let duration = Duration::from_millis(self.clock.now_millis().saturating_sub(started));

        match result {
            Ok(value) => {
                self.emit(FetchEvent::Request(RequestOutcome::Success { key, duration }));
                Ok(Fetched { value, source, age: Duration::ZERO })
            }
            Err(FetchError::Timeout { elapsed, timeout }) if caller_expired => {
                tracing::debug!(
                    key = %key,
                    timeout_ms = timeout.as_millis() as u64,
                    "caller deadline passed; fetch continues for other waiters"
                );
                self.emit(FetchEvent::Request(RequestOutcome::TimedOut { key, timeout }));
                Err(FetchError::Timeout { elapsed, timeout })
            }
            Err(e) => {
                self.emit(FetchEvent::Request(RequestOutcome::Failure { key, duration }));
                Err(e)
            }
        }
    }

    /// Run the fetch detached from the caller so that no caller's cancellation can strand the
    /// other waiters. If the task dies without resolving, dropping `pending` abandons the entry.
    fn spawn_fetch<F, Fut>(&self, pending: PendingFetch<T, E>, fetch_fn: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let cache = self.cache.clone();
        let gate = self.gate.clone();
        let sink = self.sink.clone();
        let fetch_timeout = self.fetch_timeout;

        tokio::spawn(async move {
            let key = pending.key().clone();
            let permit = match gate.admit().await {
                Ok(permit) => permit,
                Err(_closed) => {
                    tracing::debug!(key = %key, "throttle closed before fetch was admitted");
                    cache.resolve(pending, Err(FetchError::Closed));
                    return;
                }
            };
            if permit.was_delayed() {
                let event = ThrottleEvent::Delayed { key: key.clone(), waited: permit.waited() };
                emit_nonblocking(&sink, FetchEvent::Throttle(event));
            }

            let call = async { fetch_fn().await.map_err(FetchError::failed) };
            let outcome = match fetch_timeout {
                Some(policy) => policy.run(call).await,
                None => call.await,
            };
            drop(permit);

            match &outcome {
                Ok(value) => {
                    if let Some(cooldown) = value.backoff_hint() {
                        gate.apply_backoff(cooldown);
                        let event = ThrottleEvent::BackoffApplied { key: key.clone(), cooldown };
                        emit_nonblocking(&sink, FetchEvent::Throttle(event));
                    }
                }
                Err(FetchError::Timeout { timeout, .. }) => tracing::warn!(
                    key = %key,
                    timeout_ms = timeout.as_millis() as u64,
                    "fetch exceeded its deadline; releasing waiters"
                ),
                Err(_) => tracing::warn!(key = %key, "fetch failed; result not cached"),
            }
            cache.resolve(pending, outcome);
        });
    }

    fn emit(&self, event: FetchEvent) {
        emit_nonblocking(&self.sink, event);
    }

    /// Periodically drop stale entries. The task ends once the orchestrator is shut down.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.cache.clone();
        let gate = self.gate.clone();
        let period = interval.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if gate.is_closed() {
                    break;
                }
                let purged = cache.purge_stale();
                if purged > 0 {
                    tracing::debug!(purged, remaining = cache.len(), "swept stale cache entries");
                }
            }
        })
    }
}

impl<T, E, S> RequestOrchestrator<T, E, S> {
    pub fn cache(&self) -> &CacheStore<T, E> {
        &self.cache
    }

    pub fn gate(&self) -> &ThrottleGate {
        &self.gate
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn default_timeout(&self) -> Option<TimeoutPolicy> {
        self.default_timeout
    }

    pub fn fetch_timeout(&self) -> Option<TimeoutPolicy> {
        self.fetch_timeout
    }

    /// Stop admitting new calls.
    ///
    /// Fetches waiting for admission fail with [`FetchError::Closed`], as do their waiters.
    /// Admitted fetches run to completion and fresh cache entries are still served.
    pub fn shutdown(&self) {
        tracing::info!("request orchestrator shutting down");
        self.gate.close();
    }
}

/// Builder for [`RequestOrchestrator`]. Limits are validated by [`build`](Self::build).
///
/// The value and error types are fixed when the builder is created, so
/// `RequestOrchestrator::<T, E>::builder()` and an annotated binding both work.
pub struct OrchestratorBuilder<T, E, S = NullSink> {
    max_concurrent_requests: usize,
    max_requests_in_timeframe: usize,
    sliding_timeframe: Duration,
    policy: MethodPolicy,
    sink: S,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    default_timeout: Option<Duration>,
    fetch_timeout: Option<Duration>,
    _types: PhantomData<fn() -> (T, E)>,
}

impl<T, E, S: std::fmt::Debug> std::fmt::Debug for OrchestratorBuilder<T, E, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("max_concurrent_requests", &self.max_concurrent_requests)
            .field("max_requests_in_timeframe", &self.max_requests_in_timeframe)
            .field("sliding_timeframe", &self.sliding_timeframe)
            .field("policy", &self.policy)
            .field("sink", &self.sink)
            .field("default_timeout", &self.default_timeout)
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}

impl<T, E> Default for OrchestratorBuilder<T, E, NullSink> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> OrchestratorBuilder<T, E, NullSink> {
    pub fn new() -> Self {
        let defaults = ThrottleConfig::default();
        Self {
            max_concurrent_requests: defaults.max_concurrent_requests(),
            max_requests_in_timeframe: defaults.max_requests_in_timeframe(),
            sliding_timeframe: defaults.sliding_timeframe(),
            policy: MethodPolicy::default(),
            sink: NullSink,
            clock: None,
            sleeper: None,
            default_timeout: None,
            fetch_timeout: None,
            _types: PhantomData,
        }
    }
}

impl<T, E, S> OrchestratorBuilder<T, E, S> {
    /// Use an already validated throttle config.
    pub fn throttle(mut self, config: ThrottleConfig) -> Self {
        self.max_concurrent_requests = config.max_concurrent_requests();
        self.max_requests_in_timeframe = config.max_requests_in_timeframe();
        self.sliding_timeframe = config.sliding_timeframe();
        self
    }

    pub fn max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    pub fn max_requests_in_timeframe(mut self, max: usize) -> Self {
        self.max_requests_in_timeframe = max;
        self
    }

    pub fn sliding_timeframe(mut self, window: Duration) -> Self {
        self.sliding_timeframe = window;
        self
    }

    pub fn policy(mut self, policy: MethodPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Report events to `sink`.
    pub fn telemetry<S2>(self, sink: S2) -> OrchestratorBuilder<T, E, S2> {
        OrchestratorBuilder {
            max_concurrent_requests: self.max_concurrent_requests,
            max_requests_in_timeframe: self.max_requests_in_timeframe,
            sliding_timeframe: self.sliding_timeframe,
            policy: self.policy,
            sink,
            clock: self.clock,
            sleeper: self.sleeper,
            default_timeout: self.default_timeout,
            fetch_timeout: self.fetch_timeout,
            _types: PhantomData,
        }
    }

    /// Time source shared by the cache and the throttle.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Deadline applied to every call that does not set its own.
    ///
    /// Deadlines are measured on tokio time, not on the [`clock`](Self::clock), so a paused
    /// tokio runtime drives them in tests.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Upper bound on a single fetch once admitted. A fetch that exceeds it is resolved with
    /// [`FetchError::Timeout`] for every waiter and nothing is cached.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<RequestOrchestrator<T, E, S>, ConfigError>
    where
        T: Clone,
    {
        let throttle = ThrottleConfig::new(
            self.max_concurrent_requests,
            self.max_requests_in_timeframe,
            self.sliding_timeframe,
        )?;
        let default_timeout = self.default_timeout.map(TimeoutPolicy::new).transpose()?;
        let fetch_timeout = self.fetch_timeout.map(TimeoutPolicy::new).transpose()?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default()));
        let sleeper = self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper));

        tracing::debug!(
            max_concurrent = throttle.max_concurrent_requests(),
            max_in_window = throttle.max_requests_in_timeframe(),
            window_ms = throttle.sliding_timeframe().as_millis() as u64,
            "building request orchestrator"
        );

        Ok(RequestOrchestrator {
            cache: CacheStore::with_clock(self.policy, Arc::clone(&clock)),
            gate: ThrottleGate::with_time(throttle, Arc::clone(&clock), sleeper),
            sink: self.sink,
            clock,
            default_timeout,
            fetch_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;
    use futures::future::{join_all, BoxFuture};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct ApiError(&'static str);

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Reply {
        body: &'static str,
        retry_after: Option<Duration>,
    }

    impl BackoffHint for Reply {
        fn backoff_hint(&self) -> Option<Duration> {
            self.retry_after
        }
    }

    fn reply(body: &'static str) -> Reply {
        Reply { body, retry_after: None }
    }

    type Orchestrator<S = NullSink> = RequestOrchestrator<Reply, ApiError, S>;

    fn counting(
        calls: &Arc<AtomicUsize>,
        delay: Duration,
        result: Result<Reply, ApiError>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<Reply, ApiError>> + Send + 'static {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                result
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_call_is_served_from_cache() {
        let orch: Orchestrator = Orchestrator::builder().build().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let first =
            orch.fetch("athlete?id=1", counting(&calls, Duration::ZERO, Ok(reply("a")))).await.unwrap();
        assert_eq!(first.source, FetchSource::Fetched);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let second = orch
            .fetch("ATHLETE?ID=1", counting(&calls, Duration::ZERO, Ok(reply("b"))))
            .await
            .unwrap();
        assert!(second.is_cache_hit());
        assert_eq!(second.value.body, "a");
        assert_eq!(second.age, Duration::from_secs(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_fetch() {
        let orch: Orchestrator = Orchestrator::builder().build().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let results = join_all((0..8).map(|_| {
            orch.fetch("segments?id=4", counting(&calls, Duration::from_millis(50), Ok(reply("s"))))
        }))
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let sources: Vec<_> = results.into_iter().map(|r| r.unwrap().source).collect();
        assert_eq!(sources.iter().filter(|s| **s == FetchSource::Fetched).count(), 1);
        assert_eq!(sources.iter().filter(|s| **s == FetchSource::Joined).count(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_reach_every_waiter_and_are_not_cached() {
        let orch: Orchestrator = Orchestrator::builder().build().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let results = join_all((0..3).map(|_| {
            orch.fetch("m", counting(&calls, Duration::from_millis(10), Err(ApiError("503"))))
        }))
        .await;
        for result in results {
            assert_eq!(result.unwrap_err().as_inner(), Some(&ApiError("503")));
        }
        assert!(orch.cache().is_empty());

        let retry = orch.fetch("m", counting(&calls, Duration::ZERO, Ok(reply("ok")))).await;
        assert_eq!(retry.unwrap().source, FetchSource::Fetched);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn caller_deadline_does_not_cancel_shared_fetch() {
        let orch: Orchestrator = Orchestrator::builder().build().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let deadline = TimeoutPolicy::new(Duration::from_millis(10)).unwrap();

        let slow = counting(&calls, Duration::from_millis(200), Ok(reply("late")));
        let err = orch.fetch_with_timeout("slow", deadline, slow).await.unwrap_err();
        assert_eq!(err.timeout_details().map(|(_, limit)| limit), Some(Duration::from_millis(10)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        let later = orch.fetch("slow", counting(&calls, Duration::ZERO, Ok(reply("x")))).await.unwrap();
        assert!(later.is_cache_hit());
        assert_eq!(later.value.body, "late");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_hint_closes_the_gate() {
        let sink = MemorySink::new();
        let orch: Orchestrator<MemorySink> =
            Orchestrator::builder().telemetry(sink.clone()).build().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let throttled = Reply { body: "slow down", retry_after: Some(Duration::from_secs(15)) };

        orch.fetch("a", counting(&calls, Duration::ZERO, Ok(throttled))).await.unwrap();
        assert_eq!(orch.gate().stats().backoff_remaining, Some(Duration::from_secs(15)));

        let started = tokio::time::Instant::now();
        orch.fetch("b", counting(&calls, Duration::ZERO, Ok(reply("b")))).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(15));

        let events = sink.events();
        assert!(events.iter().any(|e| matches!(
            e,
            FetchEvent::Throttle(ThrottleEvent::BackoffApplied { cooldown, .. })
                if *cooldown == Duration::from_secs(15)
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, FetchEvent::Throttle(ThrottleEvent::Delayed { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn events_describe_miss_then_hit() {
        let sink = MemorySink::new();
        let orch: Orchestrator<MemorySink> =
            Orchestrator::builder().telemetry(sink.clone()).build().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        orch.fetch("k", counting(&calls, Duration::ZERO, Ok(reply("v")))).await.unwrap();
        orch.fetch("k", counting(&calls, Duration::ZERO, Ok(reply("v")))).await.unwrap();

        let kinds: Vec<String> = sink
            .events()
            .iter()
            .map(|e| e.to_string().split('(').next().unwrap_or_default().to_string())
            .collect();
        assert_eq!(kinds, vec!["Cache::Miss", "Request::Success", "Cache::Hit"]);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_fetch_abandons_waiters() {
        let orch: Orchestrator = Orchestrator::builder().build().unwrap();
        let err = orch
            .fetch("boom", || async {
                let dies = true;
                if dies {
                    panic!("fetch task died");
                }
                Ok::<_, ApiError>(reply("never"))
            })
            .await
            .unwrap_err();
        assert!(err.is_abandoned());
        assert!(orch.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_refuses_new_fetches_but_serves_cache() {
        let orch: Orchestrator = Orchestrator::builder().build().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        orch.fetch("cached", counting(&calls, Duration::ZERO, Ok(reply("v")))).await.unwrap();

        orch.shutdown();
        let err = orch.fetch("new", counting(&calls, Duration::ZERO, Ok(reply("n")))).await;
        assert!(err.unwrap_err().is_closed());
        let hit = orch.fetch("cached", counting(&calls, Duration::ZERO, Ok(reply("x")))).await;
        assert!(hit.unwrap().is_cache_hit());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_reclaims_stale_entries() {
        let policy = MethodPolicy::new(Duration::from_secs(1));
        let orch: Orchestrator = Orchestrator::builder().policy(policy).build().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        orch.fetch("k", counting(&calls, Duration::ZERO, Ok(reply("v")))).await.unwrap();
        assert_eq!(orch.cache().len(), 1);

        let sweeper = orch.spawn_sweeper(Duration::from_millis(500));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(orch.cache().is_empty());

        orch.shutdown();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(sweeper.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_fetch_is_resolved_with_timeout_for_all_waiters() {
        let orch: Orchestrator =
            Orchestrator::builder().fetch_timeout(Duration::from_secs(5)).build().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let hang = Duration::from_secs(3600);

        let results = join_all((0..3).map(|_| orch.fetch("hang", counting(&calls, hang, Ok(reply("x"))))))
            .await;
        for result in results {
            let (_, limit) = result.unwrap_err().timeout_details().unwrap();
            assert_eq!(limit, Duration::from_secs(5));
        }
        assert!(orch.cache().is_empty());
        assert_eq!(orch.gate().stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_fetch_is_reported_as_failure_not_caller_timeout() {
        let sink = MemorySink::new();
        let orch: Orchestrator<MemorySink> = Orchestrator::builder()
            .telemetry(sink.clone())
            .fetch_timeout(Duration::from_secs(1))
            .build()
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let err = orch
            .fetch("h", counting(&calls, Duration::from_secs(100), Ok(reply("x"))))
            .await
            .unwrap_err();
        assert_eq!(err.timeout_details().map(|(_, limit)| limit), Some(Duration::from_secs(1)));

        let events = sink.events();
        assert!(!events
            .iter()
            .any(|e| matches!(e, FetchEvent::Request(RequestOutcome::TimedOut { .. }))));
        assert!(events
            .iter()
            .any(|e| matches!(e, FetchEvent::Request(RequestOutcome::Failure { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn caller_deadline_runs_on_tokio_time_not_the_injected_clock() {
        let clock = Arc::new(crate::clock::ManualClock::new());
        let orch: Orchestrator = Orchestrator::builder()
            .clock(clock.clone())
            .default_timeout(Duration::from_millis(50))
            .build()
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let err = orch
            .fetch("slow", counting(&calls, Duration::from_secs(10), Ok(reply("x"))))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(clock.now_millis(), 0);
    }

    #[test]
    fn builder_validates_limits() {
        let err = Orchestrator::builder().max_concurrent_requests(0).build();
        assert_eq!(
            err.unwrap_err(),
            ConfigError::CapacityMisconfigured { field: "max_concurrent_requests", value: 0 }
        );
        let err = Orchestrator::builder().default_timeout(Duration::ZERO).build();
        assert_eq!(err.unwrap_err(), ConfigError::ZeroTimeout);
    }
}
