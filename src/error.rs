//! Error types for cache, throttle, and orchestrator
use crate::cache::CacheKey;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Error returned to every caller of a fetch.
///
/// One outcome is shared by the caller that ran the fetch and by every waiter joined to it, so
/// the error is cheap to clone: the fetch function's error sits behind an `Arc`.
#[derive(Debug)]
pub enum FetchError<E> {
    /// The injected fetch function failed, either locally or with an error reported by the
    /// remote API.
    FetchFailed(Arc<E>),
    /// The caller's own deadline elapsed while it was joined to a pending entry or waiting for
    /// throttle admission.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The task running the shared fetch went away without producing a result.
    Abandoned { key: CacheKey },
    /// The throttle gate was shut down before the call was admitted.
    Closed,
}

impl<E> Clone for FetchError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::FetchFailed(e) => Self::FetchFailed(Arc::clone(e)),
            Self::Timeout { elapsed, timeout } => {
                Self::Timeout { elapsed: *elapsed, timeout: *timeout }
            }
            Self::Abandoned { key } => Self::Abandoned { key: key.clone() },
            Self::Closed => Self::Closed,
        }
    }
}

impl<E: fmt::Display> fmt::Display for FetchError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FetchFailed(e) => write!(f, "fetch failed: {}", e),
            Self::Timeout { elapsed, timeout } => {
                write!(f, "fetch timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::Abandoned { key } => {
                write!(f, "fetch for '{}' was abandoned before producing a result", key)
            }
            Self::Closed => write!(f, "throttle gate is closed"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for FetchError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::FetchFailed(e) => Some(&**e),
            _ => None,
        }
    }
}

impl<E> FetchError<E> {
    /// Wrap a fetch function error.
    pub fn failed(error: E) -> Self {
        Self::FetchFailed(Arc::new(error))
    }

    /// Check if the fetch function itself failed
    pub fn is_fetch_failed(&self) -> bool {
        matches!(self, Self::FetchFailed(_))
    }
    /// Check if this error is due to the caller's deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Abandoned { .. })
    }
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
    /// Borrow the fetch function's error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::FetchFailed(e) => Some(&**e),
            _ => None,
        }
    }
    /// Access timeout details as (elapsed, limit).
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }
}

/// Construction-time configuration errors. A component that fails validation is never built.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A concurrency or rate ceiling is not positive.
    #[error("{field} must be > 0 (got {value})")]
    CapacityMisconfigured {
        /// Name of the offending setting.
        field: &'static str,
        /// Value provided by caller.
        value: usize,
    },
    /// The sliding timeframe has zero length.
    #[error("sliding_timeframe must be non-zero")]
    ZeroWindow,
    /// A caller deadline is zero.
    #[error("timeout must be non-zero")]
    ZeroTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io;

    #[derive(Debug, PartialEq, Eq)]
    struct DummyError(&'static str);
    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }
    impl std::error::Error for DummyError {}

    #[test]
    fn fetch_failed_display_and_source() {
        let err = FetchError::failed(DummyError("quota exceeded"));
        assert_eq!(err.to_string(), "fetch failed: quota exceeded");
        assert_eq!(err.source().map(|s| s.to_string()), Some("quota exceeded".to_string()));
        assert_eq!(err.as_inner(), Some(&DummyError("quota exceeded")));
    }

    #[test]
    fn clone_shares_inner_error_without_clone_bound() {
        let err: FetchError<io::Error> = FetchError::failed(io::Error::new(io::ErrorKind::Other, "x"));
        let copy = err.clone();
        match (&err, &copy) {
            (FetchError::FetchFailed(a), FetchError::FetchFailed(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected FetchFailed"),
        }
    }

    #[test]
    fn timeout_display_and_details() {
        let err: FetchError<DummyError> = FetchError::Timeout {
            elapsed: Duration::from_millis(5100),
            timeout: Duration::from_secs(5),
        };
        let msg = err.to_string();
        assert!(msg.contains("timed out"));
        assert!(msg.contains("5.1"));
        assert_eq!(
            err.timeout_details(),
            Some((Duration::from_millis(5100), Duration::from_secs(5)))
        );
        assert!(err.source().is_none());
    }

    #[test]
    fn predicates_cover_all_variants() {
        let failed = FetchError::failed(DummyError("x"));
        assert!(failed.is_fetch_failed());
        assert!(!failed.is_timeout());

        let abandoned: FetchError<DummyError> =
            FetchError::Abandoned { key: CacheKey::new("users.get?id=1") };
        assert!(abandoned.is_abandoned());
        assert!(abandoned.to_string().contains("users.get?id=1"));

        let closed: FetchError<DummyError> = FetchError::Closed;
        assert!(closed.is_closed());
        assert!(closed.as_inner().is_none());
    }

    #[test]
    fn config_error_messages() {
        let err = ConfigError::CapacityMisconfigured { field: "max_concurrent_requests", value: 0 };
        assert_eq!(err.to_string(), "max_concurrent_requests must be > 0 (got 0)");
        assert_eq!(ConfigError::ZeroWindow.to_string(), "sliding_timeframe must be non-zero");
        assert_eq!(ConfigError::ZeroTimeout.to_string(), "timeout must be non-zero");
    }
}
