//! Live-updatable shared values.
//!
//! Reads are lock-free snapshots through `ArcSwap`; writers publish a whole new value. The
//! method policy table keeps its runtime overrides here.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// `DynamicConfig<T>` gives cheap reads and controlled updates for shared config.
///
/// Clones share the same underlying value.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Default> Default for DynamicConfig<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value.
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Derive a new value from the current one.
    ///
    /// Concurrent updates are not lost: `f` is re-run against the winner if another writer
    /// published first.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        self.inner.rcu(|current| f(current));
    }
}
