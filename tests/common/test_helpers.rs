#![allow(dead_code)]

use fetchgate::BackoffHint;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError(pub &'static str);

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "api error: {}", self.0)
    }
}

impl std::error::Error for ApiError {}

/// Response body plus an optional server-requested cooldown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub body: String,
    pub retry_after: Option<Duration>,
}

impl Reply {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into(), retry_after: None }
    }
}

impl BackoffHint for Reply {
    fn backoff_hint(&self) -> Option<Duration> {
        self.retry_after
    }
}

pub type FetchFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<Reply, ApiError>> + Send>;

/// Fetch function that bumps `calls`, takes `delay`, then yields `result`.
pub fn counting_fetch(
    calls: &Arc<AtomicUsize>,
    delay: Duration,
    result: Result<Reply, ApiError>,
) -> FetchFn {
    let calls = Arc::clone(calls);
    Box::new(move || {
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            result
        }
        .boxed()
    })
}
