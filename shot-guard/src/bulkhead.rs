//! Bounded concurrency with a bounded FIFO wait queue.
//!
//! A release never wakes every waiter: the freed slot is moved to the
//! longest waiter under the partition lock, so the waiter wakes already
//! holding it.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::clock::Clock;
use crate::config::BulkheadConfig;
use crate::error::Rejection;
use crate::key::RateLimitKey;
use crate::key::RequestDescriptor;
use crate::store::DEFAULT_IDLE_TTL;
use crate::store::DEFAULT_MAX_KEYS;
use crate::store::Registry;
use crate::store::SharedSlot;
use crate::store::Slot;
use crate::store::lock;
use crate::telemetry::Telemetry;

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Debug, PartialEq, Eq)]
enum Vacated {
    Unknown,
    Freed,
    HandedOff,
}

#[derive(Debug, PartialEq, Eq)]
enum Departure {
    /// Still queued; removed without disturbing the others.
    Dequeued,
    /// A slot was handed over before the waiter left.
    Holding,
    /// Already skipped by a release.
    Gone,
}

#[derive(Debug, Default)]
struct Partition {
    in_flight: HashSet<u64>,
    waiters: VecDeque<Waiter>,
}

impl Partition {
    /// Frees `id`'s slot, moving it to the longest waiter still listening.
    fn vacate(&mut self, id: u64) -> Vacated {
        if !self.in_flight.remove(&id) {
            return Vacated::Unknown;
        }
        while let Some(waiter) = self.waiters.pop_front() {
            // A failed send means the waiter's future is being dropped.
            if waiter.tx.send(()).is_ok() {
                self.in_flight.insert(waiter.id);
                return Vacated::HandedOff;
            }
        }
        Vacated::Freed
    }

    fn depart(&mut self, id: u64) -> Departure {
        if let Some(position) = self.waiters.iter().position(|waiter| waiter.id == id) {
            self.waiters.remove(position);
            Departure::Dequeued
        } else if self.in_flight.contains(&id) {
            Departure::Holding
        } else {
            Departure::Gone
        }
    }

    fn is_idle(&self) -> bool {
        self.in_flight.is_empty() && self.waiters.is_empty()
    }
}

/// Removes a parked waiter from its queue if the acquire future is dropped.
struct QueuedWaiter {
    slot: SharedSlot<Partition>,
    id: u64,
    armed: bool,
}

impl QueuedWaiter {
    /// Stops waiting. Returns whether a slot was handed over first.
    fn leave(&mut self) -> bool {
        self.armed = false;
        lock(&self.slot).value.depart(self.id) == Departure::Holding
    }

    fn admitted(&mut self) {
        self.armed = false;
    }
}

impl Drop for QueuedWaiter {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut guard = lock(&self.slot);
        if guard.value.depart(self.id) == Departure::Holding {
            // Cancelled after being handed a slot: pass it on.
            guard.value.vacate(self.id);
        }
    }
}

/// Proof that a request holds a bulkhead slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkheadToken {
    partition: Option<RateLimitKey>,
    id: u64,
}

impl BulkheadToken {
    /// The partition the slot belongs to, `None` for the global pool.
    pub fn partition(&self) -> Option<&RateLimitKey> {
        self.partition.as_ref()
    }
}

/// Limits concurrent work, globally or per partition.
#[derive(Debug)]
pub struct Bulkhead {
    max_concurrent: usize,
    max_waiting: usize,
    wait_timeout: Duration,
    per_path: bool,
    global: SharedSlot<Partition>,
    partitions: Registry<Partition>,
    next_id: AtomicU64,
    clock: Clock,
    telemetry: Telemetry,
}

impl Bulkhead {
    pub fn new(config: &BulkheadConfig) -> Self {
        Self::with_clock(config, Clock::new())
    }

    pub fn with_clock(config: &BulkheadConfig, clock: Clock) -> Self {
        Self {
            max_concurrent: config.max_concurrent.max(1),
            max_waiting: config.max_waiting,
            wait_timeout: config.wait_timeout(),
            per_path: config.per_path,
            global: Arc::new(Mutex::new(Slot {
                value: Partition::default(),
                last_seen: Duration::ZERO,
            })),
            partitions: Registry::new(DEFAULT_MAX_KEYS, DEFAULT_IDLE_TTL),
            next_id: AtomicU64::new(0),
            clock,
            telemetry: Telemetry::new(),
        }
    }

    /// Overrides the idle eviction limits for per-path partitions.
    pub fn with_key_limits(mut self, max_keys: usize, idle_ttl: Duration) -> Self {
        self.partitions = Registry::new(max_keys, idle_ttl);
        self
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    /// The partition a request belongs to: its path when per-path,
    /// otherwise the global pool.
    pub fn key_for(&self, request: &RequestDescriptor) -> Option<RateLimitKey> {
        self.per_path
            .then(|| RateLimitKey::or_unknown(&request.path))
    }

    fn slot(&self, key: Option<&RateLimitKey>, now: Duration) -> SharedSlot<Partition> {
        match key {
            None => Arc::clone(&self.global),
            Some(key) => {
                self.partitions
                    .get_or_insert_with(key, now, Partition::default, |partition, _| {
                        partition.is_idle()
                    })
            }
        }
    }

    fn existing_slot(&self, key: Option<&RateLimitKey>) -> Option<SharedSlot<Partition>> {
        match key {
            None => Some(Arc::clone(&self.global)),
            Some(key) => self.partitions.get(key),
        }
    }

    /// Takes a slot in the partition for `key` (the global pool for `None`).
    ///
    /// Admits at once when a slot is free. Otherwise parks in FIFO order
    /// for at most `timeout`, or rejects straight away when the queue is
    /// full. Dropping the returned future while parked leaves the queue
    /// cleanly.
    pub async fn acquire(
        &self,
        key: Option<&RateLimitKey>,
        timeout: Duration,
    ) -> Result<BulkheadToken, Rejection> {
        let now = self.clock.now();
        let slot = self.slot(key, now);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = BulkheadToken {
            partition: key.cloned(),
            id,
        };

        let rx = {
            let mut guard = lock(&slot);
            guard.last_seen = now;
            let partition = &mut guard.value;
            if partition.in_flight.len() < self.max_concurrent {
                partition.in_flight.insert(id);
                return Ok(token);
            }
            if partition.waiters.len() >= self.max_waiting {
                tracing::trace!(partition = ?key, "bulkhead full");
                return Err(Rejection::BulkheadOverloaded);
            }
            let (tx, rx) = oneshot::channel();
            partition.waiters.push_back(Waiter { id, tx });
            rx
        };

        self.telemetry.queued();
        let mut waiter = QueuedWaiter {
            slot,
            id,
            armed: true,
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => {
                waiter.admitted();
                Ok(token)
            }
            // A slot handed over right as the wait expired is kept.
            Ok(Err(_)) | Err(_) => {
                if waiter.leave() {
                    Ok(token)
                } else {
                    tracing::trace!(partition = ?key, "bulkhead wait timed out");
                    Err(Rejection::BulkheadTimeout)
                }
            }
        }
    }

    /// Frees the slot held by `token`, handing it to the next waiter.
    ///
    /// Releasing twice, or a token this bulkhead never issued, is logged
    /// and ignored.
    pub fn release(&self, token: &BulkheadToken) {
        let now = self.clock.now();
        let vacated = self
            .existing_slot(token.partition.as_ref())
            .map_or(Vacated::Unknown, |slot| {
                let mut guard = lock(&slot);
                guard.last_seen = now;
                guard.value.vacate(token.id)
            });

        match vacated {
            Vacated::Unknown => {
                tracing::warn!(partition = ?token.partition, "release of unknown or already released bulkhead token");
            }
            Vacated::HandedOff => {
                tracing::trace!(partition = ?token.partition, "bulkhead slot handed to waiter");
            }
            Vacated::Freed => {}
        }
    }

    pub fn in_flight(&self, key: Option<&RateLimitKey>) -> usize {
        self.existing_slot(key)
            .map_or(0, |slot| lock(&slot).value.in_flight.len())
    }

    pub fn waiting(&self, key: Option<&RateLimitKey>) -> usize {
        self.existing_slot(key)
            .map_or(0, |slot| lock(&slot).value.waiters.len())
    }

    /// Evicts idle per-path partitions.
    pub fn sweep(&self) -> usize {
        let evicted = self
            .partitions
            .sweep(self.clock.now(), |partition, _| partition.is_idle());
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.partitions.len(), "swept idle bulkhead partitions");
        }
        evicted
    }
}
