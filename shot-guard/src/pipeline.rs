use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::Outcome;
use crate::bulkhead::Bulkhead;
use crate::bulkhead::BulkheadToken;
use crate::circuit_breaker::CircuitBreaker;
use crate::circuit_breaker::CircuitTicket;
use crate::clock::Clock;
use crate::config::GuardConfig;
use crate::error::ConfigError;
use crate::error::Rejection;
use crate::key::KeyExtractor;
use crate::key::RequestDescriptor;
use crate::load_shed::ConcurrencyGauge;
use crate::load_shed::LoadShedder;
use crate::load_shed::RandomSource;
use crate::load_shed::ThreadRandom;
use crate::sliding_window::RateLimitDecision;
use crate::sliding_window::SlidingWindowRateLimiter;
use crate::store::CounterStore;
use crate::store::InMemoryCounterStore;
use crate::telemetry::Telemetry;

/// One step of the admission chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    LoadShed,
    Bulkhead,
    CircuitBreaker,
    RateLimit,
}

impl Stage {
    /// Coarse to fine: global pressure first, per-key limits last.
    pub const DEFAULT_ORDER: [Stage; 4] = [
        Stage::LoadShed,
        Stage::Bulkhead,
        Stage::CircuitBreaker,
        Stage::RateLimit,
    ];
}

struct Inner {
    order: Vec<Stage>,
    load_shedder: Option<LoadShedder>,
    bulkhead: Option<Bulkhead>,
    circuit_breaker: Option<CircuitBreaker>,
    rate_limiter: Option<SlidingWindowRateLimiter<dyn CounterStore>>,
    key_extractor: Box<dyn KeyExtractor>,
    exclude_paths: HashSet<String>,
    exclude_methods: Vec<String>,
    sweep_interval: Duration,
    gauge: ConcurrencyGauge,
    clock: Clock,
    telemetry: Telemetry,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPipeline")
            .field("order", &self.order)
            .field("load_shedder", &self.load_shedder)
            .field("bulkhead", &self.bulkhead)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("rate_limiter", &self.rate_limiter)
            .field("exclude_paths", &self.exclude_paths)
            .field("exclude_methods", &self.exclude_methods)
            .field("in_flight", &self.gauge.get())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn is_excluded(&self, request: &RequestDescriptor) -> bool {
        self.exclude_paths.contains(request.path.as_str())
            || self
                .exclude_methods
                .iter()
                .any(|method| method.eq_ignore_ascii_case(&request.method))
    }

    fn sweep(&self) -> usize {
        let evicted = self.rate_limiter.as_ref().map_or(0, |limiter| limiter.sweep())
            + self
                .circuit_breaker
                .as_ref()
                .map_or(0, |breaker| breaker.sweep())
            + self.bulkhead.as_ref().map_or(0, |bulkhead| bulkhead.sweep());
        tracing::debug!(evicted, "admission sweep finished");
        evicted
    }
}

/// Builds an [`AdmissionPipeline`] with injected collaborators.
pub struct AdmissionPipelineBuilder {
    config: GuardConfig,
    clock: Clock,
    store: Option<Arc<dyn CounterStore>>,
    random: Arc<dyn RandomSource>,
    key_extractor: Option<Box<dyn KeyExtractor>>,
    gauge: ConcurrencyGauge,
}

impl AdmissionPipelineBuilder {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            clock: Clock::new(),
            store: None,
            random: Arc::new(ThreadRandom),
            key_extractor: None,
            gauge: ConcurrencyGauge::new(),
        }
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Rate limit state backend. Defaults to an in-memory store sized by
    /// the pipeline key limits.
    pub fn counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// Replaces the configured [`KeyStrategy`](crate::KeyStrategy).
    pub fn key_extractor(mut self, extractor: impl KeyExtractor + 'static) -> Self {
        self.key_extractor = Some(Box::new(extractor));
        self
    }

    /// Shares an existing in-flight gauge with the load shedder.
    pub fn gauge(mut self, gauge: ConcurrencyGauge) -> Self {
        self.gauge = gauge;
        self
    }

    /// Validates the configuration and assembles the pipeline.
    pub fn build(self) -> Result<AdmissionPipeline, ConfigError> {
        self.config.validate()?;
        let pipeline = &self.config.pipeline;
        let max_keys = pipeline.max_keys;
        let idle_ttl = pipeline.idle_ttl();

        let rate_limiter = self.config.rate_limit.as_ref().map(|config| {
            let store: Arc<dyn CounterStore> = match self.store {
                Some(store) => store,
                None => Arc::new(InMemoryCounterStore::with_capacity(max_keys, idle_ttl)),
            };
            SlidingWindowRateLimiter::with_store(config, store, self.clock.clone())
        });
        let circuit_breaker = self.config.circuit_breaker.as_ref().map(|config| {
            CircuitBreaker::with_clock(config, self.clock.clone()).with_key_limits(max_keys, idle_ttl)
        });
        let bulkhead = self.config.bulkhead.as_ref().map(|config| {
            Bulkhead::with_clock(config, self.clock.clone()).with_key_limits(max_keys, idle_ttl)
        });
        let load_shedder = self.config.load_shed.as_ref().map(|config| {
            LoadShedder::with_random(config, self.gauge.clone(), Arc::clone(&self.random))
        });

        let key_extractor: Box<dyn KeyExtractor> = match self.key_extractor {
            Some(extractor) => extractor,
            None => Box::new(pipeline.key_strategy),
        };

        Ok(AdmissionPipeline {
            inner: Arc::new(Inner {
                order: pipeline.order.clone(),
                load_shedder,
                bulkhead,
                circuit_breaker,
                rate_limiter,
                key_extractor,
                exclude_paths: pipeline.exclude_paths.iter().cloned().collect(),
                exclude_methods: pipeline.exclude_methods.clone(),
                sweep_interval: pipeline.sweep_interval(),
                gauge: self.gauge,
                clock: self.clock,
                telemetry: Telemetry::new(),
            }),
        })
    }
}

/// The result of running a request through the pipeline.
#[derive(Debug)]
pub enum AdmissionDecision {
    Admit(AdmissionPermit),
    Reject(Rejection),
}

impl AdmissionDecision {
    pub fn into_result(self) -> Result<AdmissionPermit, Rejection> {
        match self {
            Self::Admit(permit) => Ok(permit),
            Self::Reject(rejection) => Err(rejection),
        }
    }

    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Admit(_) => None,
            Self::Reject(rejection) => Some(rejection),
        }
    }
}

/// Everything an admitted request holds, released in one go.
///
/// Call [`release`](Self::release) with the request's outcome. A permit
/// dropped without that (handler panicked, future cancelled) is released
/// as abandoned: capacity is returned but the circuit records nothing.
#[must_use = "an admission permit must be released with the request outcome"]
#[derive(Debug)]
pub struct AdmissionPermit {
    inner: Arc<Inner>,
    /// Stages that hold something, in acquisition order.
    acquired: Vec<Stage>,
    bulkhead: Option<BulkheadToken>,
    circuit: Option<CircuitTicket>,
    rate_limit: Option<RateLimitDecision>,
    counted: bool,
    bypassed: bool,
    released: bool,
}

impl AdmissionPermit {
    fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            acquired: Vec::with_capacity(2),
            bulkhead: None,
            circuit: None,
            rate_limit: None,
            counted: false,
            bypassed: false,
            released: false,
        }
    }

    /// Rate limit metadata, when the rate limit stage ran.
    pub fn rate_limit(&self) -> Option<&RateLimitDecision> {
        self.rate_limit.as_ref()
    }

    pub fn circuit_ticket(&self) -> Option<&CircuitTicket> {
        self.circuit.as_ref()
    }

    pub fn bulkhead_token(&self) -> Option<&BulkheadToken> {
        self.bulkhead.as_ref()
    }

    /// Whether the request skipped admission as an excluded path or method.
    pub fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    /// Reports the outcome and frees everything, in reverse order.
    pub fn release(mut self, outcome: Outcome) {
        self.finish(Some(outcome));
    }

    fn finish(&mut self, outcome: Option<Outcome>) {
        if self.released {
            return;
        }
        self.released = true;

        for stage in std::mem::take(&mut self.acquired).into_iter().rev() {
            match stage {
                Stage::Bulkhead => {
                    if let (Some(bulkhead), Some(token)) =
                        (&self.inner.bulkhead, self.bulkhead.take())
                    {
                        bulkhead.release(&token);
                    }
                }
                Stage::CircuitBreaker => {
                    if let (Some(breaker), Some(ticket)) =
                        (&self.inner.circuit_breaker, self.circuit.take())
                    {
                        match outcome {
                            Some(outcome) => breaker.release(&ticket, outcome),
                            None => breaker.abandon(&ticket),
                        }
                    }
                }
                Stage::LoadShed | Stage::RateLimit => {}
            }
        }

        if self.counted {
            self.inner.gauge.decrement();
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if !self.released {
            tracing::debug!(bypassed = self.bypassed, "admission permit dropped without release, abandoning");
            self.finish(None);
        }
    }
}

/// An ordered admission chain. Cheap to clone; clones share all state.
#[derive(Clone, Debug)]
pub struct AdmissionPipeline {
    inner: Arc<Inner>,
}

impl AdmissionPipeline {
    pub fn builder(config: GuardConfig) -> AdmissionPipelineBuilder {
        AdmissionPipelineBuilder::new(config)
    }

    pub fn from_config(config: &GuardConfig) -> Result<Self, ConfigError> {
        Self::builder(config.clone()).build()
    }

    /// Runs `request` through every enabled stage in order.
    ///
    /// The first rejection wins; anything acquired by earlier stages is
    /// given back without recording an outcome. Only the bulkhead stage
    /// can suspend.
    pub async fn try_admit(&self, request: &RequestDescriptor) -> AdmissionDecision {
        let inner = &self.inner;
        let mut permit = AdmissionPermit::new(Arc::clone(inner));

        if inner.is_excluded(request) {
            permit.bypassed = true;
            return AdmissionDecision::Admit(permit);
        }

        for stage in &inner.order {
            if let Err(rejection) = self.run_stage(*stage, request, &mut permit).await {
                permit.finish(None);
                tracing::trace!(
                    method = %request.method,
                    path = %request.path,
                    reason = rejection.reason(),
                    "request rejected"
                );
                inner.telemetry.rejected(&rejection);
                return AdmissionDecision::Reject(rejection);
            }
        }

        inner.gauge.increment();
        permit.counted = true;
        inner.telemetry.admitted();
        AdmissionDecision::Admit(permit)
    }

    async fn run_stage(
        &self,
        stage: Stage,
        request: &RequestDescriptor,
        permit: &mut AdmissionPermit,
    ) -> Result<(), Rejection> {
        let inner = &self.inner;
        match stage {
            Stage::LoadShed => {
                if let Some(shedder) = &inner.load_shedder {
                    shedder.check(&request.path)?;
                }
            }
            Stage::Bulkhead => {
                if let Some(bulkhead) = &inner.bulkhead {
                    let key = bulkhead.key_for(request);
                    let token = bulkhead
                        .acquire(key.as_ref(), bulkhead.wait_timeout())
                        .await?;
                    permit.bulkhead = Some(token);
                    permit.acquired.push(stage);
                }
            }
            Stage::CircuitBreaker => {
                if let Some(breaker) = &inner.circuit_breaker {
                    let ticket = breaker.try_acquire(&breaker.key_for(request))?;
                    permit.circuit = Some(ticket);
                    permit.acquired.push(stage);
                }
            }
            Stage::RateLimit => {
                if let Some(limiter) = &inner.rate_limiter {
                    let key = inner.key_extractor.key(request);
                    let decision = limiter.check_key(&key).into_result()?;
                    permit.rate_limit = Some(decision);
                }
            }
        }
        Ok(())
    }

    /// Admits `request`, runs `handler` and releases with its outcome.
    ///
    /// The permit is released as abandoned if the returned future is
    /// dropped before `handler` completes.
    pub async fn execute<F, Fut, T, E>(
        &self,
        request: &RequestDescriptor,
        handler: F,
    ) -> Result<Result<T, E>, Rejection>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_admit(request).await.into_result()?;
        let result = handler().await;
        permit.release(if result.is_ok() {
            Outcome::Success
        } else {
            Outcome::Failure
        });
        Ok(result)
    }

    /// Evicts idle keys from every component. Returns how many went.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Sweeps every `every` on the current tokio runtime until the last
    /// pipeline handle is dropped. A zero period is rejected.
    pub fn spawn_sweeper(&self, every: Duration) -> Result<JoinHandle<()>, ConfigError> {
        if every.is_zero() {
            return Err(ConfigError::Invalid(vec![
                "sweep interval must be > 0".to_string(),
            ]));
        }
        let weak = Arc::downgrade(&self.inner);
        Ok(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.sweep();
            }
            tracing::debug!("admission sweeper stopped");
        }))
    }

    /// The configured sweep interval.
    pub fn sweep_interval(&self) -> Duration {
        self.inner.sweep_interval
    }

    /// Requests admitted and not yet released.
    pub fn in_flight(&self) -> usize {
        self.inner.gauge.get()
    }

    pub fn gauge(&self) -> &ConcurrencyGauge {
        &self.inner.gauge
    }

    /// The clock every stage reads; converts `reset_at` to wall-clock time.
    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    pub fn order(&self) -> &[Stage] {
        &self.inner.order
    }

    pub fn load_shedder(&self) -> Option<&LoadShedder> {
        self.inner.load_shedder.as_ref()
    }

    pub fn bulkhead(&self) -> Option<&Bulkhead> {
        self.inner.bulkhead.as_ref()
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.inner.circuit_breaker.as_ref()
    }

    pub fn rate_limiter(&self) -> Option<&SlidingWindowRateLimiter<dyn CounterStore>> {
        self.inner.rate_limiter.as_ref()
    }
}
