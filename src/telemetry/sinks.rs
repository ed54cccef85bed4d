use super::events::FetchEvent;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tower::Service;

type SinkFuture<E> = Pin<Box<dyn Future<Output = Result<(), E>> + Send>>;

/// A telemetry sink that consumes fetch events.
pub trait TelemetrySink:
    tower::Service<FetchEvent, Response = (), Error = Self::SinkError> + Clone + Send + Sync + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: FetchEvent)
where
    S: tower::Service<FetchEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        if let Err(e) = ready_sink.call(event).await {
            tracing::trace!(error = %e, "telemetry: dropped event");
        }
    }
}

/// Hand `event` to `sink` without ever waiting on it.
///
/// A sink that is not ready right now loses the event. The call future is polled once in place;
/// if it still has work to do it finishes on a spawned task. Must be called inside a tokio
/// runtime.
pub fn emit_nonblocking<S>(sink: &S, event: FetchEvent)
where
    S: tower::Service<FetchEvent, Response = ()> + Clone + Send + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use futures::FutureExt;
    use tower::ServiceExt;

    let mut sink = sink.clone();
    match sink.ready().now_or_never() {
        Some(Ok(ready)) => {
            let mut call = Box::pin(ready.call(event));
            let first_poll = call.as_mut().now_or_never();
            match first_poll {
                Some(Ok(())) => {}
                Some(Err(e)) => tracing::trace!(error = %e, "telemetry: dropped event"),
                None => {
                    tokio::spawn(async move {
                        if let Err(e) = call.await {
                            tracing::trace!(error = %e, "telemetry: dropped event");
                        }
                    });
                }
            }
        }
        Some(Err(e)) => tracing::trace!(error = %e, "telemetry: sink failed readiness"),
        None => tracing::trace!(event = %event, "telemetry: sink not ready; dropped event"),
    }
}

/// Puts a bounded queue between the fetch path and a slow sink.
///
/// A background task forwards queued events to the wrapped sink. When the queue is full new
/// events are dropped and counted. Must be created inside a tokio runtime.
#[derive(Clone, Debug)]
pub struct NonBlockingSink {
    tx: tokio::sync::mpsc::Sender<FetchEvent>,
    dropped: Arc<AtomicU64>,
}

impl NonBlockingSink {
    pub fn with_capacity<S>(sink: S, capacity: usize) -> Self
    where
        S: tower::Service<FetchEvent, Response = ()> + Send + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));

        tokio::spawn(async move {
            use tower::ServiceExt;

            let mut sink = sink;
            while let Some(event) = rx.recv().await {
                match sink.ready().await {
                    Ok(ready) => {
                        if let Err(e) = ready.call(event).await {
                            tracing::trace!(error = %e, "telemetry: dropped event");
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "telemetry: sink failed; forwarder stopping");
                        break;
                    }
                }
            }
        });

        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Events dropped because the queue was full or the forwarder had stopped.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Service<FetchEvent> for NonBlockingSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: FetchEvent) -> Self::Future {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NonBlockingSink {
    type SinkError = Infallible;
}

/// Discards every event.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<FetchEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: FetchEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// Forwards events to `tracing` at info level.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<FetchEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: FetchEvent) -> Self::Future {
        tracing::info!(event = %event, key = %event.key(), "fetch_event");
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// Keeps the most recent events in memory; the oldest is evicted once full.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<VecDeque<FetchEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<FetchEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn events(&self) -> Vec<FetchEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events dropped to stay within capacity.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<FetchEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture<Infallible>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: FetchEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Error from one half of a [`MulticastSink`].
#[derive(Debug)]
pub struct ComposedSinkError(Box<dyn std::error::Error + Send + Sync>);

impl std::fmt::Display for ComposedSinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "telemetry sink error: {}", self.0)
    }
}

impl std::error::Error for ComposedSinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

/// Sends every event to two sinks concurrently.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

impl<A, B> Service<FetchEvent> for MulticastSink<A, B>
where
    A: tower::Service<FetchEvent, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<FetchEvent, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = SinkFuture<ComposedSinkError>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: FetchEvent) -> Self::Future {
        let mut sink_a = self.sink_a.clone();
        let mut sink_b = self.sink_b.clone();
        let event_clone = event.clone();

        Box::pin(async move {
            let (res_a, res_b) = tokio::join!(sink_a.call(event), sink_b.call(event_clone));
            res_a.map_err(|e| ComposedSinkError(Box::new(e)))?;
            res_b.map_err(|e| ComposedSinkError(Box::new(e)))?;
            Ok(())
        })
    }
}

impl<A, B> TelemetrySink for MulticastSink<A, B>
where
    A: tower::Service<FetchEvent, Response = ()> + Clone + Send + Sync + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<FetchEvent, Response = ()> + Clone + Send + Sync + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type SinkError = ComposedSinkError;
}
