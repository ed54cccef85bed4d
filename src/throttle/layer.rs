//! Tower middleware that routes every call of a service through a [`ThrottleGate`].

use crate::error::FetchError;
use crate::throttle::ThrottleGate;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Layer that admits each request through a shared [`ThrottleGate`].
#[derive(Clone, Debug)]
pub struct ThrottleLayer {
    gate: ThrottleGate,
}

impl ThrottleLayer {
    pub fn new(gate: ThrottleGate) -> Self {
        Self { gate }
    }
}

impl<S> Layer<S> for ThrottleLayer {
    type Service = ThrottleService<S>;

    fn layer(&self, service: S) -> Self::Service {
        ThrottleService { inner: service, gate: self.gate.clone() }
    }
}

/// Service produced by [`ThrottleLayer`]. The permit is held until the inner future completes.
#[derive(Clone, Debug)]
pub struct ThrottleService<S> {
    inner: S,
    gate: ThrottleGate,
}

impl<S> ThrottleService<S> {
    pub fn gate(&self) -> &ThrottleGate {
        &self.gate
    }
}

impl<S, Req> Service<Req> for ThrottleService<S>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = FetchError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.gate.is_closed() {
            return Poll::Ready(Err(FetchError::Closed));
        }
        self.inner.poll_ready(cx).map_err(|e| FetchError::FetchFailed(Arc::new(e)))
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let gate = self.gate.clone();
        // Take the readied service and leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let _permit = gate.admit().await.map_err(|_| FetchError::Closed)?;
            inner.call(req).await.map_err(|e| FetchError::FetchFailed(Arc::new(e)))
        })
    }
}
