//! # shot-guard
//!
//! `shot-guard` is the admission control core of a request pipeline: it
//! decides, before any work is done, whether a request may proceed.
//!
//! ## Components
//!
//! * [`SlidingWindowRateLimiter`]: per-key limits over trailing windows,
//!   with optional burst and long windows checked together.
//! * [`CircuitBreaker`]: per-key Closed / Open / HalfOpen state machine.
//! * [`Bulkhead`]: bounded concurrency with a bounded FIFO wait queue.
//! * [`LoadShedder`]: probabilistic rejection once global load passes a
//!   threshold.
//! * [`AdmissionPipeline`]: runs the above in order and returns either a
//!   [`Rejection`] or an [`AdmissionPermit`] that must be released with the
//!   request's [`Outcome`].
//!
//! ## Key Concepts
//!
//! * **Lazy Evaluation**: windows are purged and circuits move to
//!   half-open at the moment of the next request, with no timers.
//! * **Per-key isolation**: state lives in a sharded map with one lock per
//!   key, so unrelated keys never contend.
//! * **Injectable time**: every component reads a shared [`Clock`], which
//!   tests replace with a mock.
//!
//! ## Example
//!
//! ```rust
//! use shot_guard::AdmissionPipeline;
//! use shot_guard::GuardConfig;
//! use shot_guard::Outcome;
//! use shot_guard::RequestDescriptor;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), shot_guard::ConfigError> {
//! let pipeline = AdmissionPipeline::from_config(&GuardConfig::all_stages())?;
//! let request = RequestDescriptor::new("GET", "/orders");
//!
//! match pipeline.try_admit(&request).await.into_result() {
//!     Ok(permit) => {
//!         // Call the handler, then report how it went.
//!         permit.release(Outcome::Success);
//!     }
//!     Err(rejection) => {
//!         assert!(rejection.status_code() == 429 || rejection.status_code() == 503);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod bulkhead;
mod circuit_breaker;
mod clock;
mod config;
mod error;
mod key;
mod load_shed;
mod pipeline;
mod sliding_window;
mod store;
mod telemetry;

pub use bulkhead::Bulkhead;
pub use bulkhead::BulkheadToken;
pub use circuit_breaker::CircuitBreaker;
pub use circuit_breaker::CircuitSnapshot;
pub use circuit_breaker::CircuitState;
pub use circuit_breaker::CircuitTicket;
pub use circuit_breaker::StatusClassifier;
pub use clock::Clock;
pub use config::BulkheadConfig;
pub use config::CircuitBreakerConfig;
pub use config::GuardConfig;
pub use config::LoadShedConfig;
pub use config::PipelineConfig;
pub use config::RateLimitConfig;
pub use config::ShedMode;
pub use error::ConfigError;
pub use error::KeyError;
pub use error::Rejection;
pub use key::KeyExtractor;
pub use key::KeyStrategy;
pub use key::MAX_KEY_LEN;
pub use key::RateLimitKey;
pub use key::RequestDescriptor;
pub use load_shed::ConcurrencyGauge;
pub use load_shed::FixedRandom;
pub use load_shed::LoadShedder;
pub use load_shed::RandomSource;
pub use load_shed::SeededRandom;
pub use load_shed::ShedPolicy;
pub use load_shed::ThreadRandom;
pub use pipeline::AdmissionDecision;
pub use pipeline::AdmissionPermit;
pub use pipeline::AdmissionPipeline;
pub use pipeline::AdmissionPipelineBuilder;
pub use pipeline::Stage;
pub use sliding_window::RateLimitDecision;
pub use sliding_window::SlidingWindowRateLimiter;
pub use store::CounterStore;
pub use store::DEFAULT_IDLE_TTL;
pub use store::DEFAULT_MAX_KEYS;
pub use store::InMemoryCounterStore;
pub use store::WindowLimit;
pub use store::WindowOutcome;

/// How an admitted request ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Failure,
    /// The request ran out of time. Counts as a failure.
    Timeout,
}

impl Outcome {
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Success)
    }
}
