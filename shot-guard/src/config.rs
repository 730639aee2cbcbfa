//! Typed configuration for every admission component.
//!
//! Each component has its own struct with documented defaults. All of them
//! deserialize from TOML with missing fields filled from `Default`, so a
//! config file only names what it changes:
//!
//! ```toml
//! [rate_limit]
//! requests_per_window = 100
//! burst_limit = 20
//!
//! [circuit_breaker]
//! failure_threshold = 3
//!
//! [pipeline]
//! key_strategy = "client_ip"
//! ```
//!
//! A component whose section is absent is disabled.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Deserializer;
use serde::de;

use crate::error::ConfigError;
use crate::key::KeyStrategy;
use crate::pipeline::Stage;
use crate::store::DEFAULT_IDLE_TTL;
use crate::store::DEFAULT_MAX_KEYS;
use crate::store::WindowLimit;

/// Root configuration for an [`AdmissionPipeline`](crate::AdmissionPipeline).
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct GuardConfig {
    pub rate_limit: Option<RateLimitConfig>,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub bulkhead: Option<BulkheadConfig>,
    pub load_shed: Option<LoadShedConfig>,
    pub pipeline: PipelineConfig,
}

impl GuardConfig {
    /// Every stage enabled with its defaults.
    pub fn all_stages() -> Self {
        Self {
            rate_limit: Some(RateLimitConfig::default()),
            circuit_breaker: Some(CircuitBreakerConfig::default()),
            bulkhead: Some(BulkheadConfig::default()),
            load_shed: Some(LoadShedConfig::default()),
            pipeline: PipelineConfig::default(),
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Checks value ranges, reporting every violation found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.collect_errors(&mut errors);
        }
        if let Some(circuit_breaker) = &self.circuit_breaker {
            circuit_breaker.collect_errors(&mut errors);
        }
        if let Some(bulkhead) = &self.bulkhead {
            bulkhead.collect_errors(&mut errors);
        }
        if let Some(load_shed) = &self.load_shed {
            load_shed.collect_errors(&mut errors);
        }
        self.pipeline.collect_errors(&mut errors);

        let configured = [
            (Stage::LoadShed, self.load_shed.is_some()),
            (Stage::Bulkhead, self.bulkhead.is_some()),
            (Stage::CircuitBreaker, self.circuit_breaker.is_some()),
            (Stage::RateLimit, self.rate_limit.is_some()),
        ];
        for (stage, enabled) in configured {
            if enabled && !self.pipeline.order.contains(&stage) {
                errors.push(format!(
                    "{stage:?} is configured but missing from pipeline.order"
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

/// Deserializes a window length given in (possibly fractional) seconds.
fn seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
}

/// Sliding-window rate limiter settings.
///
/// Window lengths are read from `*_seconds` keys and may be fractional,
/// so `window_seconds = 0.5` is a half-second window.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Requests allowed per steady window (default: 60).
    pub requests_per_window: usize,

    /// Steady window length (default: 60 s).
    #[serde(rename = "window_seconds", deserialize_with = "seconds")]
    pub window: Duration,

    /// Requests allowed per burst window, checked first (default: disabled).
    pub burst_limit: Option<usize>,

    /// Burst window length (default: 1 s).
    #[serde(rename = "burst_window_seconds", deserialize_with = "seconds")]
    pub burst_window: Duration,

    /// Requests allowed per long window (default: disabled).
    pub requests_per_long_window: Option<usize>,

    /// Long window length (default: 3600 s).
    #[serde(rename = "long_window_seconds", deserialize_with = "seconds")]
    pub long_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 60,
            window: Duration::from_secs(60),
            burst_limit: None,
            burst_window: Duration::from_secs(1),
            requests_per_long_window: None,
            long_window: Duration::from_secs(3600),
        }
    }
}

impl RateLimitConfig {
    /// A single steady window.
    pub fn new(requests_per_window: usize, window: Duration) -> Self {
        Self {
            requests_per_window,
            window,
            ..Default::default()
        }
    }

    pub fn with_burst(mut self, burst_limit: usize) -> Self {
        self.burst_limit = Some(burst_limit);
        self
    }

    pub fn with_long_window(mut self, limit: usize, window: Duration) -> Self {
        self.requests_per_long_window = Some(limit);
        self.long_window = window;
        self
    }

    /// The enabled windows in evaluation order: burst, steady, long.
    pub fn windows(&self) -> Vec<WindowLimit> {
        let mut windows = Vec::with_capacity(3);
        if let Some(burst) = self.burst_limit {
            windows.push(WindowLimit::new(burst, self.burst_window));
        }
        windows.push(WindowLimit::new(self.requests_per_window, self.window));
        if let Some(long) = self.requests_per_long_window {
            windows.push(WindowLimit::new(long, self.long_window));
        }
        windows
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.window.is_zero() {
            errors.push("rate_limit.window_seconds must be > 0".to_string());
        }
        if self.burst_limit.is_some() && self.burst_window.is_zero() {
            errors.push("rate_limit.burst_window_seconds must be > 0".to_string());
        }
        if self.requests_per_long_window.is_some() && self.long_window.is_zero() {
            errors.push("rate_limit.long_window_seconds must be > 0".to_string());
        }
    }
}

/// Circuit breaker settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Failures that open the circuit (default: 5).
    pub failure_threshold: u32,

    /// Seconds an open circuit waits before admitting trials (default: 60).
    pub recovery_timeout_seconds: u64,

    /// Successful trials needed to close a half-open circuit (default: 2).
    pub half_open_trial_requests: u32,

    /// Outcomes remembered while closed for windowed counting (default: 0, off).
    pub failure_window_size: usize,

    /// One circuit per `METHOD:path` instead of a single global one (default: true).
    pub per_endpoint: bool,

    /// Response statuses that count as failures.
    pub failure_status_codes: Vec<u16>,

    /// Response statuses that never count as failures.
    pub excluded_status_codes: Vec<u16>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_seconds: 60,
            half_open_trial_requests: 2,
            failure_window_size: 0,
            per_endpoint: true,
            failure_status_codes: vec![500, 502, 503, 504],
            excluded_status_codes: vec![400, 401, 403, 404, 422],
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_seconds)
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.failure_threshold == 0 {
            errors.push("circuit_breaker.failure_threshold must be > 0".to_string());
        }
        if self.half_open_trial_requests == 0 {
            errors.push("circuit_breaker.half_open_trial_requests must be > 0".to_string());
        }
        if self.failure_window_size > 0
            && self.failure_window_size < self.failure_threshold as usize
        {
            errors.push(
                "circuit_breaker.failure_window_size must be 0 or >= failure_threshold"
                    .to_string(),
            );
        }
        if let Some(code) = self
            .failure_status_codes
            .iter()
            .find(|code| self.excluded_status_codes.contains(code))
        {
            errors.push(format!(
                "circuit_breaker status {code} is both a failure and excluded"
            ));
        }
    }
}

/// Bulkhead settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BulkheadConfig {
    /// Requests running at once (default: 10).
    pub max_concurrent: usize,

    /// Requests parked waiting for a slot (default: 100).
    pub max_waiting: usize,

    /// Seconds a parked request waits before giving up (default: 5).
    pub wait_timeout_seconds: u64,

    /// One partition per request path instead of one global pool (default: false).
    pub per_path: bool,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_waiting: 100,
            wait_timeout_seconds: 5,
            per_path: false,
        }
    }
}

impl BulkheadConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_seconds)
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.max_concurrent == 0 {
            errors.push("bulkhead.max_concurrent must be > 0".to_string());
        }
    }
}

/// How the shed probability grows once load exceeds the threshold.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShedMode {
    /// `shed_probability` regardless of how far over the threshold.
    #[default]
    Fixed,
    /// `min(max_shed_probability, (load / max_concurrent - 1) * slope)`.
    Gradual,
}

/// Load shedder settings.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LoadShedConfig {
    /// Load at or below which nothing is shed (default: 100).
    pub max_concurrent: usize,

    /// Fixed shed probability above the threshold (default: 0.5).
    pub shed_probability: f64,

    pub mode: ShedMode,

    /// Growth rate for gradual shedding (default: 1.0).
    pub slope: f64,

    /// Ceiling for gradual shedding (default: 1.0).
    pub max_shed_probability: f64,

    /// Path prefixes that are never shed.
    pub priority_paths: Vec<String>,
}

impl Default for LoadShedConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            shed_probability: 0.5,
            mode: ShedMode::Fixed,
            slope: 1.0,
            max_shed_probability: 1.0,
            priority_paths: Vec::new(),
        }
    }
}

impl LoadShedConfig {
    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.max_concurrent == 0 {
            errors.push("load_shed.max_concurrent must be > 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.shed_probability) {
            errors.push("load_shed.shed_probability must be within 0.0..=1.0".to_string());
        }
        if !(0.0..=1.0).contains(&self.max_shed_probability) {
            errors.push("load_shed.max_shed_probability must be within 0.0..=1.0".to_string());
        }
        if !self.slope.is_finite() || self.slope < 0.0 {
            errors.push("load_shed.slope must be a finite value >= 0".to_string());
        }
    }
}

/// Pipeline-wide settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Stage evaluation order (default: load shed, bulkhead, circuit breaker, rate limit).
    pub order: Vec<Stage>,

    /// How the rate limit partition key is derived (default: client + route).
    pub key_strategy: KeyStrategy,

    /// Paths that bypass admission entirely (exact match).
    pub exclude_paths: Vec<String>,

    /// Methods that bypass admission entirely.
    pub exclude_methods: Vec<String>,

    /// Seconds between background sweeps (default: 300).
    pub sweep_interval_seconds: u64,

    /// Seconds a key may sit idle before it can be evicted (default: 600).
    pub idle_ttl_seconds: u64,

    /// Soft cap on tracked keys per component (default: 10 000).
    pub max_keys: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            order: Stage::DEFAULT_ORDER.to_vec(),
            key_strategy: KeyStrategy::default(),
            exclude_paths: ["/health", "/healthz", "/ready", "/metrics"]
                .into_iter()
                .map(String::from)
                .collect(),
            exclude_methods: vec!["OPTIONS".to_string()],
            sweep_interval_seconds: 300,
            idle_ttl_seconds: DEFAULT_IDLE_TTL.as_secs(),
            max_keys: DEFAULT_MAX_KEYS,
        }
    }
}

impl PipelineConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_seconds)
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        for (i, stage) in self.order.iter().enumerate() {
            if self.order[..i].contains(stage) {
                errors.push(format!("pipeline.order lists {stage:?} more than once"));
            }
        }
        if self.sweep_interval_seconds == 0 {
            errors.push("pipeline.sweep_interval_seconds must be > 0".to_string());
        }
        if self.max_keys == 0 {
            errors.push("pipeline.max_keys must be > 0".to_string());
        }
    }
}
