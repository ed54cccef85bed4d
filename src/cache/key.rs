//! Canonical endpoint keys.
//!
//! Two logically identical requests must produce the same key, otherwise single-flight
//! deduplication and cache hits silently stop working. Normalization lower-cases the method and
//! every parameter name and value, and orders parameters by name then value.

use std::fmt;
use std::sync::Arc;

/// Fully-resolved endpoint identity: `method?name=value&name=value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Normalize an already rendered key such as `"Users.Get?ID=7&fields=Name"`.
    pub fn new(raw: &str) -> Self {
        let (method, query) = match raw.split_once('?') {
            Some((method, query)) => (method, query),
            None => (raw, ""),
        };
        let params = query
            .split('&')
            .filter(|pair| !pair.trim().is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((name, value)) => (name, value),
                None => (pair, ""),
            });
        Self::from_parts(method, params)
    }

    /// Build a key from a method identity and its query parameters, in any order and case.
    pub fn from_parts<I, K, V>(method: &str, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params: Vec<(String, String)> = params
            .into_iter()
            .map(|(k, v)| (k.as_ref().trim().to_lowercase(), v.as_ref().trim().to_lowercase()))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        params.sort();

        let mut rendered = method.trim().to_lowercase();
        for (i, (name, value)) in params.iter().enumerate() {
            rendered.push(if i == 0 { '?' } else { '&' });
            rendered.push_str(name);
            rendered.push('=');
            rendered.push_str(value);
        }
        Self(rendered.into())
    }

    /// Method identity, used to resolve the entry's life span.
    pub fn method(&self) -> &str {
        match self.0.split_once('?') {
            Some((method, _)) => method,
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for CacheKey {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}
