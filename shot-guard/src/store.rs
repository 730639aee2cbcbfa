//! Per-key state storage.
//!
//! [`CounterStore`] is the pluggable interface the rate limiter records
//! request timestamps through. [`InMemoryCounterStore`] is the in-process
//! reference implementation; an external backend only has to honour the
//! same atomic check-and-record contract.
//!
//! Internally every keyed component keeps its state in a `Registry`: a
//! sharded concurrent map from key to an individually locked slot.
//! Looking a key up never holds a global lock, and each key's state
//! transitions are serialized by that key's own mutex.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;

use crate::key::RateLimitKey;

/// Soft cap on tracked keys; idle keys are evicted first when it is reached.
pub const DEFAULT_MAX_KEYS: usize = 10_000;
/// Keys untouched for this long become eligible for eviction.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(600);
/// At most one eviction pass per this interval is triggered by inserts at capacity.
pub(crate) const CAPACITY_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A limit of `limit` requests in any trailing `window`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WindowLimit {
    pub limit: usize,
    pub window: Duration,
}

impl WindowLimit {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// The result of checking a key against one or more windows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowOutcome {
    pub allowed: bool,
    /// Limit of the window that decided the outcome.
    pub limit: usize,
    /// Requests still available in the tightest window. Zero when rejected.
    pub remaining: usize,
    /// Clock offset at which the deciding window frees its oldest slot.
    pub reset_at: Duration,
}

/// Storage for sliding-window request logs.
///
/// [`hit`](Self::hit) must be atomic per key: purge, evaluate every window
/// and record the request in all of them (or none) without another caller
/// for the same key observing an intermediate state.
pub trait CounterStore: Send + Sync + Debug {
    /// Checks `key` against `windows` in order at clock offset `now`.
    ///
    /// The first window at its limit rejects the request and nothing is
    /// recorded. Otherwise `now` is recorded in every window.
    fn hit(&self, key: &RateLimitKey, windows: &[WindowLimit], now: Duration) -> WindowOutcome;

    /// Drops keys whose logs are empty and idle. Returns how many were removed.
    fn sweep(&self, now: Duration) -> usize;

    /// The number of keys currently tracked.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Locks a slot, recovering the data if a previous holder panicked.
///
/// Every mutation leaves the state consistent before any call that could
/// panic, so a poisoned slot is still valid.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub(crate) struct Slot<T> {
    pub(crate) value: T,
    pub(crate) last_seen: Duration,
}

pub(crate) type SharedSlot<T> = Arc<Mutex<Slot<T>>>;

/// Concurrent key → state map with idle eviction.
#[derive(Debug)]
pub(crate) struct Registry<T> {
    slots: DashMap<RateLimitKey, SharedSlot<T>>,
    max_keys: usize,
    idle_ttl: Duration,
    /// Clock offset in nanos before which inserts at capacity do not sweep.
    next_capacity_sweep: AtomicU64,
}

fn as_nanos(offset: Duration) -> u64 {
    u64::try_from(offset.as_nanos()).unwrap_or(u64::MAX)
}

impl<T> Registry<T> {
    pub(crate) fn new(max_keys: usize, idle_ttl: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            max_keys: max_keys.max(1),
            idle_ttl,
            next_capacity_sweep: AtomicU64::new(0),
        }
    }

    /// Claims the capacity sweep for `now`. Only one caller per
    /// [`CAPACITY_SWEEP_INTERVAL`] wins; everyone else inserts straight away.
    fn claim_capacity_sweep(&self, now: Duration) -> bool {
        let now = as_nanos(now);
        let next = self.next_capacity_sweep.load(Ordering::Acquire);
        now >= next
            && self
                .next_capacity_sweep
                .compare_exchange(
                    next,
                    now.saturating_add(as_nanos(CAPACITY_SWEEP_INTERVAL)),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns the slot for `key`, creating it with `init` if absent.
    ///
    /// Creation goes through the shard's entry lock, so two racing callers
    /// for a new key always end up sharing one slot.
    pub(crate) fn get_or_insert_with(
        &self,
        key: &RateLimitKey,
        now: Duration,
        init: impl FnOnce() -> T,
        evictable: impl Fn(&T, Duration) -> bool,
    ) -> SharedSlot<T> {
        if let Some(slot) = self.slots.get(key) {
            return Arc::clone(slot.value());
        }
        if self.slots.len() >= self.max_keys && self.claim_capacity_sweep(now) {
            // Over capacity: make room from idle keys. If every key is busy
            // the map grows past the cap rather than dropping live state.
            self.sweep(now, evictable);
        }
        Arc::clone(
            self.slots
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Slot {
                        value: init(),
                        last_seen: now,
                    }))
                })
                .value(),
        )
    }

    pub(crate) fn get(&self, key: &RateLimitKey) -> Option<SharedSlot<T>> {
        self.slots.get(key).map(|slot| Arc::clone(slot.value()))
    }

    /// Runs `f` on the state for `key` under its lock, creating it if absent.
    pub(crate) fn with<R>(
        &self,
        key: &RateLimitKey,
        now: Duration,
        init: impl FnOnce() -> T,
        evictable: impl Fn(&T, Duration) -> bool,
        f: impl FnOnce(&mut T) -> R,
    ) -> R {
        let slot = self.get_or_insert_with(key, now, init, evictable);
        let mut guard = lock(&slot);
        guard.last_seen = now;
        f(&mut guard.value)
    }

    /// Runs `f` on the existing state for `key`, if any.
    pub(crate) fn with_existing<R>(
        &self,
        key: &RateLimitKey,
        now: Duration,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let slot = self.get(key)?;
        let mut guard = lock(&slot);
        guard.last_seen = now;
        Some(f(&mut guard.value))
    }

    /// Removes idle entries accepted by `evictable(state, now)`.
    ///
    /// An entry referenced outside the map is mid-update (or parked on by a
    /// waiter) and is always kept. The check is race free because new
    /// references are only handed out under the shard lock `retain` holds.
    pub(crate) fn sweep(&self, now: Duration, evictable: impl Fn(&T, Duration) -> bool) -> usize {
        let before = self.slots.len();
        let idle_ttl = self.idle_ttl;
        self.slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let Ok(guard) = slot.try_lock() else {
                return true;
            };
            let idle = now.saturating_sub(guard.last_seen) >= idle_ttl;
            !(idle && evictable(&guard.value, now))
        });
        before.saturating_sub(self.slots.len())
    }
}

/// The request log for one key: one timestamp queue per window.
#[derive(Debug, Default)]
pub(crate) struct WindowLog {
    windows: Vec<(Duration, VecDeque<Duration>)>,
}

impl WindowLog {
    fn align(&mut self, limits: &[WindowLimit]) {
        self.windows.resize_with(limits.len(), Default::default);
        for ((window, _), limit) in self.windows.iter_mut().zip(limits) {
            *window = limit.window;
        }
    }

    /// Drops entries that no longer count. An entry stops counting exactly
    /// `window` after it was recorded.
    fn purge(&mut self, now: Duration) {
        for (window, log) in &mut self.windows {
            while log
                .front()
                .is_some_and(|&recorded| recorded + *window <= now)
            {
                log.pop_front();
            }
        }
    }

    fn hit(&mut self, limits: &[WindowLimit], now: Duration) -> WindowOutcome {
        self.align(limits);
        self.purge(now);

        for (limit, (_, log)) in limits.iter().zip(&self.windows) {
            if log.len() >= limit.limit {
                let reset_at = log
                    .front()
                    .map_or(now + limit.window, |&oldest| oldest + limit.window);
                return WindowOutcome {
                    allowed: false,
                    limit: limit.limit,
                    remaining: 0,
                    reset_at,
                };
            }
        }

        let mut tightest: Option<WindowOutcome> = None;
        for (limit, (_, log)) in limits.iter().zip(&mut self.windows) {
            log.push_back(now);
            let remaining = limit.limit - log.len();
            let oldest = log.front().copied().unwrap_or(now);
            if tightest.is_none_or(|current| remaining < current.remaining) {
                tightest = Some(WindowOutcome {
                    allowed: true,
                    limit: limit.limit,
                    remaining,
                    reset_at: oldest + limit.window,
                });
            }
        }

        // No windows configured: nothing limits this key.
        tightest.unwrap_or(WindowOutcome {
            allowed: true,
            limit: usize::MAX,
            remaining: usize::MAX,
            reset_at: now,
        })
    }
}

/// In-process [`CounterStore`] keeping a timestamp log per key.
///
/// State is lost on restart, which is acceptable for best-effort limits.
#[derive(Debug)]
pub struct InMemoryCounterStore {
    registry: Registry<WindowLog>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_KEYS, DEFAULT_IDLE_TTL)
    }

    /// `max_keys` is a soft cap: idle keys are evicted first, and if all
    /// keys are active the map may exceed it to preserve window correctness.
    pub fn with_capacity(max_keys: usize, idle_ttl: Duration) -> Self {
        Self {
            registry: Registry::new(max_keys, idle_ttl),
        }
    }

    /// A log can go once even its newest entry has aged out of every window.
    fn evictable(log: &WindowLog, now: Duration) -> bool {
        log.windows.iter().all(|(window, entries)| {
            entries
                .back()
                .is_none_or(|&newest| newest + *window <= now)
        })
    }
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore for InMemoryCounterStore {
    fn hit(&self, key: &RateLimitKey, windows: &[WindowLimit], now: Duration) -> WindowOutcome {
        self.registry.with(
            key,
            now,
            WindowLog::default,
            Self::evictable,
            |log| log.hit(windows, now),
        )
    }

    fn sweep(&self, now: Duration) -> usize {
        let evicted = self.registry.sweep(now, Self::evictable);
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.registry.len(), "swept idle rate limit keys");
        }
        evicted
    }

    fn len(&self) -> usize {
        self.registry.len()
    }
}
