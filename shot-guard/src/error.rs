use std::time::Duration;

/// Why a request was not admitted.
///
/// Every variant is an expected, recoverable overload signal. None of them
/// is retried internally; the retry decision belongs to the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// The caller exhausted a sliding window.
    ///
    /// Maps to `429 Too Many Requests` with a `Retry-After` header.
    #[error("Rate limit exceeded; retry after {retry_after:?}")]
    RateLimited {
        /// Time until the oldest request in the rejecting window ages out.
        retry_after: Duration,
        /// The limit of the window that rejected the request.
        limit: usize,
        /// Clock offset at which the rejecting window frees a slot; see
        /// [`Clock::unix_time`](crate::Clock::unix_time) for wall-clock time.
        reset_at: Duration,
    },

    /// The downstream circuit is open, or all half-open trial slots are taken.
    ///
    /// Maps to `503 Service Unavailable` with a `Retry-After` header.
    #[error("Circuit open; retry after {retry_after:?}")]
    CircuitOpen {
        /// Time remaining until the circuit admits a trial request.
        retry_after: Duration,
    },

    /// All bulkhead slots are busy and the wait queue is full.
    ///
    /// Maps to `429 Too Many Requests`.
    #[error("Bulkhead is full; request rejected")]
    BulkheadOverloaded,

    /// The request waited in the bulkhead queue longer than allowed.
    ///
    /// Maps to `429 Too Many Requests`.
    #[error("Request timed out waiting for bulkhead capacity")]
    BulkheadTimeout,

    /// The load shedder dropped the request under global pressure.
    ///
    /// Maps to `503 Service Unavailable`.
    #[error("Service is overloaded; request shed")]
    Shed,
}

impl Rejection {
    /// The HTTP status the boundary layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::RateLimited { .. } | Self::BulkheadOverloaded | Self::BulkheadTimeout => 429,
            Self::CircuitOpen { .. } | Self::Shed => 503,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::CircuitOpen { retry_after } => {
                Some(*retry_after)
            }
            Self::BulkheadOverloaded | Self::BulkheadTimeout | Self::Shed => None,
        }
    }

    /// `Retry-After` in whole seconds, rounded up and never below one.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after().map(|wait| {
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            secs.max(1)
        })
    }

    /// A stable, low-cardinality label for logs and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::BulkheadOverloaded => "bulkhead_overloaded",
            Self::BulkheadTimeout => "bulkhead_timeout",
            Self::Shed => "shed",
        }
    }
}

/// A partition key that cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key is empty")]
    Empty,

    #[error("key is {len} bytes, longer than {max}", max = crate::key::MAX_KEY_LEN)]
    TooLong { len: usize },

    #[error("key contains a control character")]
    ControlCharacter,
}

/// Failure to load or validate a [`GuardConfig`](crate::GuardConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Every semantic violation found, not just the first.
    #[error("invalid configuration: {}", .0.join(", "))]
    Invalid(Vec<String>),
}
