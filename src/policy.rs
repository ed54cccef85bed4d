//! Method policy table: how long a response for each API method stays fresh.
//!
//! Resolution order for a method is runtime override, then the compiled-in per-method default,
//! then the table's fallback. Method names are matched case-insensitively, in the same
//! normalized form [`CacheKey::method`](crate::CacheKey::method) returns.
//!
//! A zero life span means "never cache": concurrent callers still share one fetch, but the
//! result is not kept once it has been handed out.

use crate::adaptive::DynamicConfig;
use std::collections::HashMap;
use std::time::Duration;

/// Life span used when nothing more specific is configured.
pub const DEFAULT_LIFE_SPAN: Duration = Duration::from_secs(60);

/// Per-method cache life spans. Clones share the override table.
#[derive(Debug, Clone)]
pub struct MethodPolicy {
    fallback: Duration,
    defaults: HashMap<String, Duration>,
    overrides: DynamicConfig<HashMap<String, Duration>>,
}

impl Default for MethodPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_LIFE_SPAN)
    }
}

impl MethodPolicy {
    /// Table where every method uses `fallback` until configured otherwise.
    pub fn new(fallback: Duration) -> Self {
        Self { fallback, defaults: HashMap::new(), overrides: DynamicConfig::default() }
    }

    /// Register a compiled-in default for `method`.
    pub fn with_default(mut self, method: &str, life_span: Duration) -> Self {
        self.defaults.insert(normalize(method), life_span);
        self
    }

    /// Override the life span for `method` at runtime.
    ///
    /// Entries already cached keep the life span they were created with.
    pub fn set_override(&self, method: &str, life_span: Duration) {
        let method = normalize(method);
        self.overrides.update(|current| {
            let mut next = current.clone();
            next.insert(method.clone(), life_span);
            next
        });
    }

    /// Drop a runtime override, falling back to the default again.
    pub fn clear_override(&self, method: &str) {
        let method = normalize(method);
        self.overrides.update(|current| {
            let mut next = current.clone();
            next.remove(&method);
            next
        });
    }

    /// Resolve the life span for `method`.
    pub fn life_span(&self, method: &str) -> Duration {
        let method = normalize(method);
        if let Some(span) = self.overrides.get().get(&method) {
            return *span;
        }
        self.defaults.get(&method).copied().unwrap_or(self.fallback)
    }

    pub fn fallback(&self) -> Duration {
        self.fallback
    }
}

fn normalize(method: &str) -> String {
    method.trim().to_lowercase()
}
