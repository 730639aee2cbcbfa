use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;

use crate::circuit_breaker::CircuitState;
use crate::error::Rejection;

/// Admission counters, recorded through the global meter provider.
///
/// Nothing is exported unless the application installs a provider.
#[derive(Clone, Debug)]
pub(crate) struct Telemetry {
    admitted: Counter<u64>,
    rejected: Counter<u64>,
    transitions: Counter<u64>,
    queued: Counter<u64>,
}

impl Telemetry {
    pub(crate) fn new() -> Self {
        let meter = global::meter("shot_guard");
        Self {
            admitted: meter.u64_counter("admission.admitted").build(),
            rejected: meter.u64_counter("admission.rejected").build(),
            transitions: meter.u64_counter("circuit.transitions").build(),
            queued: meter.u64_counter("bulkhead.queued").build(),
        }
    }

    pub(crate) fn admitted(&self) {
        self.admitted.add(1, &[]);
    }

    pub(crate) fn rejected(&self, rejection: &Rejection) {
        self.rejected
            .add(1, &[KeyValue::new("reason", rejection.reason())]);
    }

    pub(crate) fn transition(&self, to: CircuitState) {
        self.transitions.add(1, &[KeyValue::new("to", to.as_str())]);
    }

    pub(crate) fn queued(&self) {
        self.queued.add(1, &[]);
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}
