use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::LoadShedConfig;
use crate::config::ShedMode;
use crate::error::Rejection;
use crate::store::lock;

/// A live count of requests currently in flight.
///
/// Clones share the same counter.
#[derive(Clone, Debug, Default)]
pub struct ConcurrencyGauge(Arc<AtomicUsize>);

impl ConcurrencyGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements, saturating at zero.
    pub fn decrement(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Uniform samples in `[0, 1)` for shedding decisions.
pub trait RandomSource: Send + Sync + Debug {
    fn next_f64(&self) -> f64;
}

/// The thread-local generator.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::rng().random()
    }
}

/// A reproducible generator for tests and simulations.
#[derive(Debug)]
pub struct SeededRandom(Mutex<StdRng>);

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&self) -> f64 {
        lock(&self.0).random()
    }
}

/// Always returns the same sample.
#[derive(Clone, Copy, Debug)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.0
    }
}

/// How likely a request above the threshold is to be shed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ShedPolicy {
    Fixed {
        probability: f64,
    },
    /// Grows linearly with the overload ratio, capped at `max_probability`.
    Gradual {
        slope: f64,
        max_probability: f64,
    },
}

impl ShedPolicy {
    pub fn from_config(config: &LoadShedConfig) -> Self {
        match config.mode {
            ShedMode::Fixed => Self::Fixed {
                probability: config.shed_probability,
            },
            ShedMode::Gradual => Self::Gradual {
                slope: config.slope,
                max_probability: config.max_shed_probability,
            },
        }
    }
}

/// Probabilistic admission under global concurrency pressure.
///
/// Reads a shared [`ConcurrencyGauge`]; it never changes it.
#[derive(Debug)]
pub struct LoadShedder {
    max_concurrent: usize,
    policy: ShedPolicy,
    priority_paths: Vec<String>,
    gauge: ConcurrencyGauge,
    random: Arc<dyn RandomSource>,
}

impl LoadShedder {
    pub fn new(config: &LoadShedConfig, gauge: ConcurrencyGauge) -> Self {
        Self::with_random(config, gauge, Arc::new(ThreadRandom))
    }

    pub fn with_random(
        config: &LoadShedConfig,
        gauge: ConcurrencyGauge,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            max_concurrent: config.max_concurrent.max(1),
            policy: ShedPolicy::from_config(config),
            priority_paths: config.priority_paths.clone(),
            gauge,
            random,
        }
    }

    /// The shed probability at `load`. Zero at or below `max_concurrent`,
    /// non-decreasing above it.
    pub fn shed_probability_for(&self, load: usize) -> f64 {
        if load <= self.max_concurrent {
            return 0.0;
        }
        let probability = match self.policy {
            ShedPolicy::Fixed { probability } => probability,
            ShedPolicy::Gradual {
                slope,
                max_probability,
            } => {
                let overload = load as f64 / self.max_concurrent as f64 - 1.0;
                (overload * slope).min(max_probability)
            }
        };
        probability.clamp(0.0, 1.0)
    }

    pub fn should_shed(&self, load: usize) -> bool {
        let probability = self.shed_probability_for(load);
        probability > 0.0 && self.random.next_f64() < probability
    }

    /// Whether `path` is one of the priority paths or lies beneath one.
    ///
    /// Matching respects segment boundaries: `/admin` covers `/admin` and
    /// `/admin/users` but not `/administrator`.
    pub fn is_priority(&self, path: &str) -> bool {
        self.priority_paths.iter().any(|prefix| {
            path.strip_prefix(prefix.as_str()).is_some_and(|rest| {
                rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/')
            })
        })
    }

    /// Decides for a request arriving now, counting it in the load.
    pub fn check(&self, path: &str) -> Result<(), Rejection> {
        if self.is_priority(path) {
            return Ok(());
        }
        let load = self.gauge.get() + 1;
        if self.should_shed(load) {
            tracing::trace!(load, path, "request shed");
            Err(Rejection::Shed)
        } else {
            Ok(())
        }
    }

    pub fn gauge(&self) -> &ConcurrencyGauge {
        &self.gauge
    }
}

#[cfg(test)]
mod tests {
    use more_asserts::assert_ge;

    use super::*;

    fn gradual(max_concurrent: usize, slope: f64, max_probability: f64) -> LoadShedConfig {
        LoadShedConfig {
            max_concurrent,
            mode: ShedMode::Gradual,
            slope,
            max_shed_probability: max_probability,
            ..Default::default()
        }
    }

    #[test]
    fn it_never_sheds_at_or_below_capacity() {
        let shedder = LoadShedder::with_random(
            &LoadShedConfig {
                max_concurrent: 10,
                shed_probability: 1.0,
                ..Default::default()
            },
            ConcurrencyGauge::new(),
            Arc::new(FixedRandom(0.0)),
        );

        for load in 0..=10 {
            assert!(!shedder.should_shed(load), "shed at load {load}");
        }
        assert!(shedder.should_shed(11));
    }

    #[test]
    fn gradual_probability_is_monotonic_and_capped() {
        let shedder = LoadShedder::new(&gradual(100, 2.0, 0.8), ConcurrencyGauge::new());

        assert_eq!(shedder.shed_probability_for(100), 0.0);
        assert!((shedder.shed_probability_for(110) - 0.2).abs() < 1e-9);
        assert!((shedder.shed_probability_for(130) - 0.6).abs() < 1e-9);
        assert_eq!(shedder.shed_probability_for(500), 0.8);

        let mut previous = 0.0;
        for load in 0..1000 {
            let probability = shedder.shed_probability_for(load);
            assert_ge!(probability, previous);
            previous = probability;
        }
    }

    #[test]
    fn shed_rate_tracks_probability() {
        let shedder = LoadShedder::with_random(
            &LoadShedConfig {
                max_concurrent: 1,
                shed_probability: 0.25,
                ..Default::default()
            },
            ConcurrencyGauge::new(),
            Arc::new(SeededRandom::new(7)),
        );

        let shed = (0..10_000).filter(|_| shedder.should_shed(2)).count();
        assert!((2_000..3_000).contains(&shed), "shed {shed} of 10000");
    }

    #[test]
    fn priority_paths_bypass_by_prefix() {
        let gauge = ConcurrencyGauge::new();
        let shedder = LoadShedder::with_random(
            &LoadShedConfig {
                max_concurrent: 1,
                shed_probability: 1.0,
                priority_paths: vec!["/admin".to_string()],
                ..Default::default()
            },
            gauge.clone(),
            Arc::new(FixedRandom(0.0)),
        );
        gauge.increment();
        gauge.increment();

        assert_eq!(shedder.check("/api/orders"), Err(Rejection::Shed));
        assert_eq!(shedder.check("/admin/users"), Ok(()));
        assert_eq!(shedder.check("/admin"), Ok(()));
    }

    #[test]
    fn priority_paths_stop_at_segment_boundaries() {
        let shedder = LoadShedder::new(
            &LoadShedConfig {
                priority_paths: vec!["/admin".to_string(), "/internal/".to_string()],
                ..Default::default()
            },
            ConcurrencyGauge::new(),
        );

        assert!(shedder.is_priority("/admin"));
        assert!(shedder.is_priority("/admin/"));
        assert!(shedder.is_priority("/admin/users/7"));
        assert!(!shedder.is_priority("/administrator-export"));
        assert!(!shedder.is_priority("/adminx"));

        assert!(shedder.is_priority("/internal/jobs"));
        assert!(!shedder.is_priority("/internal"));
        assert!(!shedder.is_priority("/internals"));
    }

    #[test]
    fn check_counts_the_arriving_request() {
        let gauge = ConcurrencyGauge::new();
        let shedder = LoadShedder::with_random(
            &LoadShedConfig {
                max_concurrent: 2,
                shed_probability: 1.0,
                ..Default::default()
            },
            gauge.clone(),
            Arc::new(FixedRandom(0.5)),
        );

        gauge.increment();
        assert_eq!(shedder.check("/"), Ok(()));
        gauge.increment();
        assert_eq!(shedder.check("/"), Err(Rejection::Shed));
    }

    #[test]
    fn gauge_decrement_saturates() {
        let gauge = ConcurrencyGauge::new();
        gauge.decrement();
        assert_eq!(gauge.get(), 0);
        gauge.increment();
        gauge.clone().decrement();
        assert_eq!(gauge.get(), 0);
    }
}
