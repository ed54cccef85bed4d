//! Single-flight response cache.
//!
//! Every key maps to at most one entry, which is either *pending* (a fetch is in flight and
//! callers can join it) or holds a value that is *fresh* or *stale* depending on its age.
//!
//! Semantics:
//! - [`CacheStore::reserve`] atomically inspects the entry for a key. Fresh values are returned
//!   directly, pending entries hand out a [`WaitHandle`], and absent or stale entries are
//!   replaced by a new pending entry whose [`PendingFetch`] ticket goes to the caller.
//! - [`CacheStore::resolve`] consumes the ticket exactly once. Success stores the value and
//!   releases every waiter with it; failure deletes the entry and releases every waiter with the
//!   error. Failures are never cached.
//! - Staleness is computed from `now - updated_at` on every read, so no background sweep is
//!   needed for correctness. [`CacheStore::purge_stale`] only reclaims memory.
//!
//! Invariants:
//! - A pending entry has no value; at most one pending entry exists per key.
//! - The life span is resolved once, when the pending entry is created.
//! - Dropping a [`PendingFetch`] without resolving it deletes the entry and releases waiters
//!   with [`FetchError::Abandoned`].
//! - Dropping a [`WaitHandle`] only removes that waiter; the fetch keeps going for the others.

pub mod key;

pub use key::CacheKey;

use crate::clock::{Clock, MonotonicClock};
use crate::error::FetchError;
use crate::policy::MethodPolicy;
use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use pin_project::pin_project;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

/// Result shared between the fetching caller and every waiter.
pub type Outcome<T, E> = Result<T, FetchError<E>>;

type Completion<T, E> = Shared<oneshot::Receiver<Outcome<T, E>>>;

/// Observable state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// A fetch is in flight; callers join it.
    Pending,
    /// Holds a value younger than its life span.
    Fresh,
    /// Holds a value at or past its life span; treated as absent by `reserve`.
    Stale,
}

/// A value served from the cache together with its age.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue<T> {
    pub value: T,
    pub age: Duration,
}

/// Diagnostics snapshot of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub state: EntryState,
    /// Clock reading when the current entry was created.
    pub created_at: Duration,
    /// Clock reading of the last successful write (equal to `created_at` while pending).
    pub updated_at: Duration,
    pub life_span: Duration,
    /// Live [`WaitHandle`]s on the pending fetch, joined callers and
    /// [`PendingFetch::subscribe`] handles alike.
    pub waiters: usize,
}

/// Result of [`CacheStore::reserve`].
#[derive(Debug)]
pub enum Reservation<T, E> {
    /// A fresh value was cached; no fetch needed.
    Fresh(CachedValue<T>),
    /// Another caller is already fetching; await the handle for its result.
    Joined(WaitHandle<T, E>),
    /// The caller now owns the fetch and must hand its result to [`CacheStore::resolve`].
    Created(PendingFetch<T, E>),
}

struct CacheEntry<T, E> {
    value: Option<T>,
    created_at: u64,
    updated_at: u64,
    life_span: Duration,
    completion: Option<Completion<T, E>>,
    generation: u64,
}

impl<T, E> CacheEntry<T, E> {
    fn state_at(&self, now: u64) -> EntryState {
        if self.completion.is_some() {
            EntryState::Pending
        } else if self.age_at(now) < self.life_span {
            EntryState::Fresh
        } else {
            EntryState::Stale
        }
    }

    fn age_at(&self, now: u64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.updated_at))
    }
}

impl<T: Clone, E> CacheEntry<T, E> {
    fn waiters(&self) -> usize {
        // One handle is held by the entry and one by the outstanding `PendingFetch`.
        self.completion
            .as_ref()
            .and_then(Shared::strong_count)
            .map_or(0, |count| count.saturating_sub(2))
    }
}

struct StoreInner<T, E> {
    entries: Mutex<HashMap<CacheKey, CacheEntry<T, E>>>,
    policy: MethodPolicy,
    clock: Arc<dyn Clock>,
    generations: AtomicU64,
}

impl<T, E> StoreInner<T, E> {
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry<T, E>>> {
        // Critical sections never panic halfway through an update, so a poisoned map is intact.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delete the entry for `key` if it still belongs to `generation`.
    fn remove_generation(&self, key: &CacheKey, generation: u64) -> bool {
        let mut entries = self.lock_entries();
        if entries.get(key).map_or(false, |e| e.generation == generation) {
            entries.remove(key);
            true
        } else {
            false
        }
    }
}

/// In-memory response cache with per-key single-flight fetch deduplication.
///
/// Clones share the same entries.
pub struct CacheStore<T, E> {
    inner: Arc<StoreInner<T, E>>,
}

impl<T, E> Clone for CacheStore<T, E> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T, E> std::fmt::Debug for CacheStore<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entries", &self.inner.lock_entries().len())
            .field("policy", &self.inner.policy)
            .field("clock", &self.inner.clock)
            .finish()
    }
}

impl<T, E> CacheStore<T, E>
where
    T: Clone,
{
    pub fn new(policy: MethodPolicy) -> Self {
        Self::with_clock(policy, Arc::new(MonotonicClock::default()))
    }

    /// Create a store reading time from `clock` (useful for deterministic tests).
    pub fn with_clock(policy: MethodPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                entries: Mutex::new(HashMap::new()),
                policy,
                clock,
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn policy(&self) -> &MethodPolicy {
        &self.inner.policy
    }

    /// Look up `key`, reserving a pending entry if there is nothing fresh to serve or join.
    pub fn reserve(&self, key: &CacheKey) -> Reservation<T, E> {
        self.reserve_with(key, None)
    }

    /// Like [`reserve`](Self::reserve), but a newly created entry uses `life_span` instead of
    /// the policy table's value for the key's method.
    pub fn reserve_with(&self, key: &CacheKey, life_span: Option<Duration>) -> Reservation<T, E> {
        let now = self.inner.clock.now_millis();
        let mut entries = self.inner.lock_entries();

        if let Some(entry) = entries.get(key) {
            match entry.state_at(now) {
                EntryState::Fresh => {
                    if let Some(value) = &entry.value {
                        return Reservation::Fresh(CachedValue {
                            value: value.clone(),
                            age: entry.age_at(now),
                        });
                    }
                }
                EntryState::Pending => {
                    if let Some(completion) = &entry.completion {
                        return Reservation::Joined(WaitHandle {
                            completion: completion.clone(),
                            key: key.clone(),
                        });
                    }
                }
                // Superseded below, inside the same critical section.
                EntryState::Stale => {}
            }
        }

        let life_span =
            life_span.unwrap_or_else(|| self.inner.policy.life_span(key.method()));
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        let completion = receiver.shared();
        entries.insert(
            key.clone(),
            CacheEntry {
                value: None,
                created_at: now,
                updated_at: now,
                life_span,
                completion: Some(completion.clone()),
                generation,
            },
        );
        drop(entries);

        Reservation::Created(PendingFetch {
            key: key.clone(),
            generation,
            sender: Some(sender),
            completion,
            store: Arc::clone(&self.inner),
        })
    }

    /// Complete a reservation, storing a success and releasing every waiter with `result`.
    pub fn resolve(&self, mut pending: PendingFetch<T, E>, result: Outcome<T, E>) {
        debug_assert!(Arc::ptr_eq(&self.inner, &pending.store), "ticket from another store");
        let Some(sender) = pending.sender.take() else {
            return;
        };
        let now = self.inner.clock.now_millis();

        {
            let mut entries = self.inner.lock_entries();
            let owned = entries
                .get(&pending.key)
                .filter(|e| e.generation == pending.generation)
                .map(|e| e.life_span);
            match (owned, &result) {
                (Some(life_span), Ok(value)) if !life_span.is_zero() => {
                    if let Some(entry) = entries.get_mut(&pending.key) {
                        entry.value = Some(value.clone());
                        entry.updated_at = now;
                        entry.completion = None;
                    }
                }
                (Some(_), _) => {
                    entries.remove(&pending.key);
                }
                (None, _) => {}
            }
        }

        // Every waiter may have given up already; that is not an error.
        let _ = sender.send(result);
    }

    /// The fresh value for `key`, if any. Does not affect state.
    pub fn peek(&self, key: &CacheKey) -> Option<T> {
        let now = self.inner.clock.now_millis();
        let entries = self.inner.lock_entries();
        entries
            .get(key)
            .filter(|e| e.state_at(now) == EntryState::Fresh)
            .and_then(|e| e.value.clone())
    }

    pub fn state(&self, key: &CacheKey) -> Option<EntryState> {
        let now = self.inner.clock.now_millis();
        self.inner.lock_entries().get(key).map(|e| e.state_at(now))
    }

    pub fn entry_info(&self, key: &CacheKey) -> Option<EntryInfo> {
        let now = self.inner.clock.now_millis();
        self.inner.lock_entries().get(key).map(|e| EntryInfo {
            state: e.state_at(now),
            created_at: Duration::from_millis(e.created_at),
            updated_at: Duration::from_millis(e.updated_at),
            life_span: e.life_span,
            waiters: e.waiters(),
        })
    }

    /// Number of live [`WaitHandle`]s on the pending fetch for `key`.
    ///
    /// The fetching caller's own [`PendingFetch::subscribe`] handle counts too, so an
    /// orchestrated fetch with two joined callers reports three.
    pub fn waiter_count(&self, key: &CacheKey) -> usize {
        self.inner.lock_entries().get(key).map_or(0, CacheEntry::waiters)
    }

    /// Drop the cached value for `key`. Pending entries are left to resolve their waiters.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut entries = self.inner.lock_entries();
        if entries.get(key).map_or(false, |e| e.completion.is_none()) {
            entries.remove(key);
            true
        } else {
            false
        }
    }

    /// Drop every cached value, keeping pending entries. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut entries = self.inner.lock_entries();
        let before = entries.len();
        entries.retain(|_, e| e.completion.is_some());
        before - entries.len()
    }

    /// Remove stale entries to reclaim memory. Returns how many were removed.
    pub fn purge_stale(&self) -> usize {
        let now = self.inner.clock.now_millis();
        let mut entries = self.inner.lock_entries();
        let before = entries.len();
        entries.retain(|_, e| e.state_at(now) != EntryState::Stale);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock_entries().is_empty()
    }
}

/// Ticket for a reserved fetch. Hand it back to [`CacheStore::resolve`] with the result.
///
/// Dropping it unresolved deletes the pending entry and releases waiters with
/// [`FetchError::Abandoned`].
pub struct PendingFetch<T, E> {
    key: CacheKey,
    generation: u64,
    sender: Option<oneshot::Sender<Outcome<T, E>>>,
    completion: Completion<T, E>,
    store: Arc<StoreInner<T, E>>,
}

impl<T, E> PendingFetch<T, E> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Handle that completes with this fetch's outcome, like a joined waiter's.
    pub fn subscribe(&self) -> WaitHandle<T, E> {
        WaitHandle { completion: self.completion.clone(), key: self.key.clone() }
    }
}

impl<T, E> std::fmt::Debug for PendingFetch<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingFetch")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("resolved", &self.sender.is_none())
            .finish()
    }
}

impl<T, E> Drop for PendingFetch<T, E> {
    fn drop(&mut self) {
        if self.sender.is_some() && self.store.remove_generation(&self.key, self.generation) {
            tracing::warn!(key = %self.key, "pending fetch dropped without a result");
        }
        // The sender drops with `self`, which cancels every waiter.
    }
}

/// Future resolving to the outcome of a pending fetch.
///
/// Dropping the handle (for example when the caller's deadline passes) removes only this
/// waiter.
#[pin_project]
#[must_use = "futures do nothing unless polled"]
pub struct WaitHandle<T, E> {
    #[pin]
    completion: Completion<T, E>,
    key: CacheKey,
}

impl<T, E> WaitHandle<T, E> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl<T, E> std::fmt::Debug for WaitHandle<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitHandle").field("key", &self.key).finish()
    }
}

impl<T: Clone, E> Future for WaitHandle<T, E> {
    type Output = Outcome<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match futures::ready!(this.completion.poll(cx)) {
            Ok(outcome) => Poll::Ready(outcome),
            Err(oneshot::Canceled) => {
                Poll::Ready(Err(FetchError::Abandoned { key: this.key.clone() }))
            }
        }
    }
}
