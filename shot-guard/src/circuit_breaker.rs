//! A per-key circuit breaker.
//!
//! ```text
//!            failures >= threshold
//!   Closed ───────────────────────────▶ Open
//!     ▲                                 │  ▲
//!     │ trials succeeded                │  │ any trial failed
//!     │                 recovery elapsed│  │
//!     └──────────── HalfOpen ◀──────────┘  │
//!                      └───────────────────┘
//! ```
//!
//! Open → HalfOpen is evaluated lazily on the next acquire; there are no
//! timers. Every transition bumps the circuit's generation, and an outcome
//! reported on a ticket from an older generation only retires the ticket.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::Outcome;
use crate::clock::Clock;
use crate::config::CircuitBreakerConfig;
use crate::error::Rejection;
use crate::key::RateLimitKey;
use crate::key::RequestDescriptor;
use crate::store::DEFAULT_IDLE_TTL;
use crate::store::DEFAULT_MAX_KEYS;
use crate::store::Registry;
use crate::store::lock;
use crate::telemetry::Telemetry;

/// The externally visible state of a circuit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
enum State {
    Closed {
        consecutive_failures: u32,
        /// Most recent outcomes, `true` for failure. Empty when windowing is off.
        window: VecDeque<bool>,
    },
    Open {
        opened_at: Duration,
    },
    HalfOpen {
        trial_count: u32,
        trial_successes: u32,
    },
}

impl State {
    fn closed() -> Self {
        Self::Closed {
            consecutive_failures: 0,
            window: VecDeque::new(),
        }
    }

    fn public(&self) -> CircuitState {
        match self {
            Self::Closed { .. } => CircuitState::Closed,
            Self::Open { .. } => CircuitState::Open,
            Self::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

#[derive(Debug)]
struct Circuit {
    state: State,
    generation: u64,
    /// Tickets handed out and not yet released.
    outstanding: HashSet<u64>,
    total_requests: u64,
    total_failures: u64,
    total_rejections: u64,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: State::closed(),
            generation: 0,
            outstanding: HashSet::new(),
            total_requests: 0,
            total_failures: 0,
            total_rejections: 0,
        }
    }

    /// An open circuit is kept until its recovery timeout has passed so an
    /// eviction can never close it early.
    fn evictable(&self, now: Duration, recovery_timeout: Duration) -> bool {
        if !self.outstanding.is_empty() {
            return false;
        }
        match self.state {
            State::Open { opened_at } => now >= opened_at + recovery_timeout,
            State::Closed { .. } | State::HalfOpen { .. } => true,
        }
    }
}

/// Proof that a request passed the breaker. Report its outcome with
/// [`CircuitBreaker::release`] or give it back with [`CircuitBreaker::abandon`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircuitTicket {
    key: RateLimitKey,
    id: u64,
    generation: u64,
    trial: bool,
}

impl CircuitTicket {
    pub fn key(&self) -> &RateLimitKey {
        &self.key
    }

    /// Whether this request is a half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

/// A point-in-time view of one circuit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Trials admitted in the current half-open period.
    pub trial_count: u32,
    /// Time until an open circuit admits a trial.
    pub retry_after: Option<Duration>,
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
}

/// Maps response status codes to outcomes.
///
/// Excluded statuses (client errors by default) never count against the
/// downstream. A handler that errored without a response is a failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusClassifier {
    failure_status_codes: Vec<u16>,
    excluded_status_codes: Vec<u16>,
}

impl StatusClassifier {
    pub fn new(failure_status_codes: Vec<u16>, excluded_status_codes: Vec<u16>) -> Self {
        Self {
            failure_status_codes,
            excluded_status_codes,
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(
            config.failure_status_codes.clone(),
            config.excluded_status_codes.clone(),
        )
    }

    pub fn classify(&self, status: u16) -> Outcome {
        if self.excluded_status_codes.contains(&status) {
            Outcome::Success
        } else if self.failure_status_codes.contains(&status) {
            Outcome::Failure
        } else {
            Outcome::Success
        }
    }

    /// Classifies a handler result; any error is a failure.
    pub fn classify_result<E>(&self, result: &Result<u16, E>) -> Outcome {
        match result {
            Ok(status) => self.classify(*status),
            Err(_) => Outcome::Failure,
        }
    }
}

impl Default for StatusClassifier {
    fn default() -> Self {
        Self::from_config(&CircuitBreakerConfig::default())
    }
}

/// A registry of independent circuits, one per key.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_trials: u32,
    failure_window_size: usize,
    per_endpoint: bool,
    circuits: Registry<Circuit>,
    next_id: AtomicU64,
    clock: Clock,
    telemetry: Telemetry,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Clock::new())
    }

    pub fn with_clock(config: &CircuitBreakerConfig, clock: Clock) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
            half_open_trials: config.half_open_trial_requests.max(1),
            failure_window_size: config.failure_window_size,
            per_endpoint: config.per_endpoint,
            circuits: Registry::new(DEFAULT_MAX_KEYS, DEFAULT_IDLE_TTL),
            next_id: AtomicU64::new(0),
            clock,
            telemetry: Telemetry::new(),
        }
    }

    /// Overrides the idle eviction limits.
    pub fn with_key_limits(mut self, max_keys: usize, idle_ttl: Duration) -> Self {
        self.circuits = Registry::new(max_keys, idle_ttl);
        self
    }

    /// The circuit a request is accounted under: `METHOD:path` when
    /// per-endpoint, otherwise the single global circuit.
    pub fn key_for(&self, request: &RequestDescriptor) -> RateLimitKey {
        if self.per_endpoint {
            RateLimitKey::or_unknown(request.endpoint())
        } else {
            RateLimitKey::global()
        }
    }

    /// Asks to send a request through the circuit for `key`.
    ///
    /// Rejects with the time left until recovery while open, and with a
    /// zero wait while half-open with every trial slot taken.
    pub fn try_acquire(&self, key: &RateLimitKey) -> Result<CircuitTicket, Rejection> {
        let now = self.clock.now();
        let recovery_timeout = self.recovery_timeout;
        self.circuits.with(
            key,
            now,
            Circuit::new,
            |circuit, now| circuit.evictable(now, recovery_timeout),
            |circuit| {
                let trial = match circuit.state {
                    State::Closed { .. } => false,
                    State::Open { opened_at } => {
                        let elapsed = now.saturating_sub(opened_at);
                        if elapsed < self.recovery_timeout {
                            circuit.total_rejections += 1;
                            return Err(Rejection::CircuitOpen {
                                retry_after: self.recovery_timeout - elapsed,
                            });
                        }
                        self.transition(
                            key,
                            circuit,
                            State::HalfOpen {
                                trial_count: 1,
                                trial_successes: 0,
                            },
                        );
                        true
                    }
                    State::HalfOpen {
                        ref mut trial_count,
                        ..
                    } => {
                        if *trial_count >= self.half_open_trials {
                            circuit.total_rejections += 1;
                            return Err(Rejection::CircuitOpen {
                                retry_after: Duration::ZERO,
                            });
                        }
                        *trial_count += 1;
                        true
                    }
                };

                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                circuit.outstanding.insert(id);
                circuit.total_requests += 1;
                Ok(CircuitTicket {
                    key: key.clone(),
                    id,
                    generation: circuit.generation,
                    trial,
                })
            },
        )
    }

    /// Reports the outcome of an admitted request.
    ///
    /// Releasing a ticket twice, or one this breaker never issued, is
    /// logged and ignored.
    pub fn release(&self, ticket: &CircuitTicket, outcome: Outcome) {
        let now = self.clock.now();
        let known = self
            .circuits
            .with_existing(&ticket.key, now, |circuit| {
                if !circuit.outstanding.remove(&ticket.id) {
                    return false;
                }
                if outcome.is_failure() {
                    circuit.total_failures += 1;
                }
                if ticket.generation != circuit.generation {
                    tracing::trace!(key = %ticket.key, ?outcome, "stale circuit outcome ignored");
                    return true;
                }
                self.record(&ticket.key, circuit, outcome, now);
                true
            })
            .unwrap_or(false);

        if !known {
            tracing::warn!(key = %ticket.key, ?outcome, "release of unknown or already released circuit ticket");
        }
    }

    /// Retires a ticket without an outcome, freeing its trial slot.
    pub fn abandon(&self, ticket: &CircuitTicket) {
        let now = self.clock.now();
        let known = self
            .circuits
            .with_existing(&ticket.key, now, |circuit| {
                if !circuit.outstanding.remove(&ticket.id) {
                    return false;
                }
                if ticket.trial
                    && ticket.generation == circuit.generation
                    && let State::HalfOpen { trial_count, .. } = &mut circuit.state
                {
                    *trial_count = trial_count.saturating_sub(1);
                }
                true
            })
            .unwrap_or(false);

        if known {
            tracing::debug!(key = %ticket.key, trial = ticket.trial, "circuit ticket abandoned");
        } else {
            tracing::warn!(key = %ticket.key, "abandon of unknown or already released circuit ticket");
        }
    }

    fn record(&self, key: &RateLimitKey, circuit: &mut Circuit, outcome: Outcome, now: Duration) {
        let failure = outcome.is_failure();
        match &mut circuit.state {
            State::Closed {
                consecutive_failures,
                window,
            } => {
                if failure {
                    *consecutive_failures += 1;
                } else {
                    *consecutive_failures = 0;
                }
                let mut windowed_failures = 0;
                if self.failure_window_size > 0 {
                    window.push_back(failure);
                    if window.len() > self.failure_window_size {
                        window.pop_front();
                    }
                    windowed_failures = window.iter().filter(|&&failed| failed).count();
                }
                if *consecutive_failures >= self.failure_threshold
                    || windowed_failures >= self.failure_threshold as usize
                {
                    self.transition(key, circuit, State::Open { opened_at: now });
                }
            }
            State::HalfOpen {
                trial_successes, ..
            } => {
                if failure {
                    self.transition(key, circuit, State::Open { opened_at: now });
                } else {
                    *trial_successes += 1;
                    if *trial_successes >= self.half_open_trials {
                        self.transition(key, circuit, State::closed());
                    }
                }
            }
            // Opening bumps the generation, so no live ticket can land here.
            State::Open { .. } => {}
        }
    }

    fn transition(&self, key: &RateLimitKey, circuit: &mut Circuit, to: State) {
        let from = circuit.state.public();
        circuit.state = to;
        circuit.generation += 1;
        let to = circuit.state.public();
        tracing::debug!(key = %key, from = from.as_str(), to = to.as_str(), "circuit transition");
        self.telemetry.transition(to);
    }

    /// The state of the circuit for `key`; unknown keys are closed.
    pub fn state(&self, key: &RateLimitKey) -> CircuitState {
        self.snapshot(key)
            .map_or(CircuitState::Closed, |snapshot| snapshot.state)
    }

    /// Reads a circuit without touching its idle timer.
    pub fn snapshot(&self, key: &RateLimitKey) -> Option<CircuitSnapshot> {
        let slot = self.circuits.get(key)?;
        let guard = lock(&slot);
        let circuit = &guard.value;
        let now = self.clock.now();

        let (consecutive_failures, trial_count, retry_after) = match circuit.state {
            State::Closed {
                consecutive_failures,
                ..
            } => (consecutive_failures, 0, None),
            State::Open { opened_at } => (
                0,
                0,
                Some((opened_at + self.recovery_timeout).saturating_sub(now)),
            ),
            State::HalfOpen { trial_count, .. } => (0, trial_count, None),
        };

        Some(CircuitSnapshot {
            state: circuit.state.public(),
            consecutive_failures,
            trial_count,
            retry_after,
            total_requests: circuit.total_requests,
            total_failures: circuit.total_failures,
            total_rejections: circuit.total_rejections,
        })
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts idle circuits that hold no information worth keeping.
    pub fn sweep(&self) -> usize {
        let recovery_timeout = self.recovery_timeout;
        let evicted = self
            .circuits
            .sweep(self.clock.now(), |circuit, now| {
                circuit.evictable(now, recovery_timeout)
            });
        if evicted > 0 {
            tracing::debug!(evicted, remaining = self.circuits.len(), "swept idle circuits");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn breaker(config: CircuitBreakerConfig) -> (CircuitBreaker, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        (CircuitBreaker::with_clock(&config, clock), mock)
    }

    fn config(failure_threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout_seconds: 30,
            half_open_trial_requests: 2,
            ..Default::default()
        }
    }

    fn fail(breaker: &CircuitBreaker, key: &RateLimitKey) {
        let ticket = breaker.try_acquire(key).unwrap();
        breaker.release(&ticket, Outcome::Failure);
    }

    fn succeed(breaker: &CircuitBreaker, key: &RateLimitKey) {
        let ticket = breaker.try_acquire(key).unwrap();
        breaker.release(&ticket, Outcome::Success);
    }

    #[test]
    fn it_opens_after_consecutive_failures() {
        let (breaker, _mock) = breaker(config(3));
        let key = RateLimitKey::new("GET:/api").unwrap();

        fail(&breaker, &key);
        fail(&breaker, &key);
        assert_eq!(breaker.state(&key), CircuitState::Closed);

        fail(&breaker, &key);
        assert_eq!(breaker.state(&key), CircuitState::Open);
        assert_eq!(
            breaker.try_acquire(&key),
            Err(Rejection::CircuitOpen {
                retry_after: secs(30)
            })
        );
    }

    #[test]
    fn a_success_resets_the_consecutive_count() {
        let (breaker, _mock) = breaker(config(3));
        let key = RateLimitKey::new("k").unwrap();

        fail(&breaker, &key);
        fail(&breaker, &key);
        succeed(&breaker, &key);
        fail(&breaker, &key);
        fail(&breaker, &key);

        let snapshot = breaker.snapshot(&key).unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 2);
        assert_eq!(snapshot.total_requests, 5);
        assert_eq!(snapshot.total_failures, 4);
    }

    #[test]
    fn it_recovers_through_half_open_trials() {
        let (breaker, mock) = breaker(config(1));
        let key = RateLimitKey::new("k").unwrap();

        // 1. Trip the circuit
        fail(&breaker, &key);
        mock.increment(secs(10));
        assert_eq!(
            breaker.try_acquire(&key),
            Err(Rejection::CircuitOpen {
                retry_after: secs(20)
            })
        );

        // 2. After the recovery timeout two trials are admitted, no more
        mock.increment(secs(20));
        let first = breaker.try_acquire(&key).unwrap();
        let second = breaker.try_acquire(&key).unwrap();
        assert!(first.is_trial() && second.is_trial());
        assert_eq!(breaker.state(&key), CircuitState::HalfOpen);
        assert_eq!(
            breaker.try_acquire(&key),
            Err(Rejection::CircuitOpen {
                retry_after: Duration::ZERO
            })
        );

        // 3. Both succeed and the circuit closes
        breaker.release(&first, Outcome::Success);
        assert_eq!(breaker.state(&key), CircuitState::HalfOpen);
        breaker.release(&second, Outcome::Success);
        assert_eq!(breaker.state(&key), CircuitState::Closed);
        assert!(!breaker.try_acquire(&key).unwrap().is_trial());
    }

    #[test]
    fn a_failed_trial_reopens_with_a_fresh_timer() {
        let (breaker, mock) = breaker(config(1));
        let key = RateLimitKey::new("k").unwrap();

        fail(&breaker, &key);
        mock.increment(secs(30));
        let trial = breaker.try_acquire(&key).unwrap();
        mock.increment(secs(5));
        breaker.release(&trial, Outcome::Timeout);

        assert_eq!(breaker.state(&key), CircuitState::Open);
        assert_eq!(
            breaker.try_acquire(&key),
            Err(Rejection::CircuitOpen {
                retry_after: secs(30)
            })
        );
    }

    #[test]
    fn stale_outcomes_do_not_drive_transitions() {
        let (breaker, mock) = breaker(config(2));
        let key = RateLimitKey::new("k").unwrap();

        // Issued while closed, released after the circuit went half-open.
        let slow = breaker.try_acquire(&key).unwrap();
        fail(&breaker, &key);
        fail(&breaker, &key);
        mock.increment(secs(30));
        let trial = breaker.try_acquire(&key).unwrap();

        breaker.release(&slow, Outcome::Failure);
        assert_eq!(breaker.state(&key), CircuitState::HalfOpen);

        breaker.release(&trial, Outcome::Success);
        assert_eq!(breaker.state(&key), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot(&key).unwrap().total_failures, 3);
    }

    #[test]
    fn double_release_is_ignored() {
        let (breaker, _mock) = breaker(config(2));
        let key = RateLimitKey::new("k").unwrap();

        let ticket = breaker.try_acquire(&key).unwrap();
        breaker.release(&ticket, Outcome::Failure);
        breaker.release(&ticket, Outcome::Failure);
        breaker.abandon(&ticket);

        let snapshot = breaker.snapshot(&key).unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 1);
        assert_eq!(snapshot.total_failures, 1);
    }

    #[test]
    fn abandoned_trials_free_their_slot() {
        let (breaker, mock) = breaker(CircuitBreakerConfig {
            half_open_trial_requests: 1,
            ..config(1)
        });
        let key = RateLimitKey::new("k").unwrap();

        fail(&breaker, &key);
        mock.increment(secs(30));
        let trial = breaker.try_acquire(&key).unwrap();
        assert!(breaker.try_acquire(&key).is_err());

        breaker.abandon(&trial);
        let retry = breaker.try_acquire(&key).unwrap();
        breaker.release(&retry, Outcome::Success);
        assert_eq!(breaker.state(&key), CircuitState::Closed);
    }

    #[test]
    fn windowed_failures_trip_without_a_streak() {
        let (breaker, _mock) = breaker(CircuitBreakerConfig {
            failure_window_size: 5,
            ..config(3)
        });
        let key = RateLimitKey::new("k").unwrap();

        for _ in 0..2 {
            fail(&breaker, &key);
            succeed(&breaker, &key);
        }
        assert_eq!(breaker.state(&key), CircuitState::Closed);

        fail(&breaker, &key);
        assert_eq!(breaker.state(&key), CircuitState::Open);
    }

    #[test]
    fn circuits_are_isolated_per_key() {
        let (breaker, _mock) = breaker(config(1));
        let broken = RateLimitKey::new("GET:/broken").unwrap();
        let healthy = RateLimitKey::new("GET:/healthy").unwrap();

        fail(&breaker, &broken);
        assert!(breaker.try_acquire(&broken).is_err());
        assert!(breaker.try_acquire(&healthy).is_ok());
    }

    #[test]
    fn scope_follows_per_endpoint() {
        let request = RequestDescriptor::new("POST", "/orders");

        let (per_endpoint, _mock) = breaker(CircuitBreakerConfig::default());
        assert_eq!(per_endpoint.key_for(&request).as_str(), "POST:/orders");

        let (global, _mock) = breaker(CircuitBreakerConfig {
            per_endpoint: false,
            ..Default::default()
        });
        assert_eq!(global.key_for(&request), RateLimitKey::global());
    }

    #[test]
    fn sweep_keeps_open_circuits_until_recovery() {
        let (breaker, mock) = breaker(config(1));
        let breaker = breaker.with_key_limits(100, secs(1));
        let open = RateLimitKey::new("open").unwrap();
        let idle = RateLimitKey::new("idle").unwrap();

        fail(&breaker, &open);
        succeed(&breaker, &idle);
        let held = breaker.try_acquire(&RateLimitKey::new("held").unwrap()).unwrap();

        mock.increment(secs(5));
        assert_eq!(breaker.sweep(), 1);
        assert_eq!(breaker.state(&open), CircuitState::Open);
        assert!(breaker.snapshot(&idle).is_none());

        mock.increment(secs(30));
        breaker.release(&held, Outcome::Success);
        mock.increment(secs(5));
        assert_eq!(breaker.sweep(), 2);
        assert!(breaker.is_empty());
    }

    #[test]
    fn status_classifier_honours_exclusions() {
        let classifier = StatusClassifier::default();
        assert_eq!(classifier.classify(200), Outcome::Success);
        assert_eq!(classifier.classify(404), Outcome::Success);
        assert_eq!(classifier.classify(503), Outcome::Failure);
        assert_eq!(classifier.classify(418), Outcome::Success);
        assert_eq!(
            classifier.classify_result::<std::io::Error>(&Err(std::io::ErrorKind::Other.into())),
            Outcome::Failure
        );
    }
}
