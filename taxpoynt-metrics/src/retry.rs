//! Retry and circuit breaker metrics

use std::sync::atomic::{AtomicU64, Ordering};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

/// Retry metrics collector
#[derive(Debug)]
pub struct RetryMetrics {
    /// Failures handed to the retry handler, by classified reason
    failures_total: Counter<u64>,

    /// Retry attempts scheduled
    scheduled_total: Counter<u64>,

    /// Retry outcomes (succeeded, dead_lettered, cancelled)
    outcomes_total: Counter<u64>,

    /// Scheduled delay before each retry
    delay_seconds: Histogram<f64>,

    /// Circuit breaker transitions into OPEN and rejections while open
    circuit_events_total: Counter<u64>,

    scheduled: AtomicU64,
    succeeded: AtomicU64,
    dead_lettered: AtomicU64,
    circuit_rejections: AtomicU64,
}

/// Point-in-time view of the local counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySnapshot {
    pub scheduled: u64,
    pub succeeded: u64,
    pub dead_lettered: u64,
    pub circuit_rejections: u64,
}

impl RetryMetrics {
    pub(crate) fn new(meter: &Meter) -> Self {
        Self {
            failures_total: meter
                .u64_counter("taxpoynt.retry.failures.total")
                .with_description("Failures handed to the retry handler, by reason")
                .build(),
            scheduled_total: meter
                .u64_counter("taxpoynt.retry.scheduled.total")
                .with_description("Retry attempts scheduled")
                .build(),
            outcomes_total: meter
                .u64_counter("taxpoynt.retry.outcomes.total")
                .with_description("Terminal retry outcomes")
                .build(),
            delay_seconds: meter
                .f64_histogram("taxpoynt.retry.delay.seconds")
                .with_description("Scheduled delay before each retry")
                .build(),
            circuit_events_total: meter
                .u64_counter("taxpoynt.circuit.events.total")
                .with_description("Circuit breaker trips and rejections")
                .build(),
            scheduled: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            circuit_rejections: AtomicU64::new(0),
        }
    }

    pub fn record_failure(&self, reason: &'static str) {
        self.failures_total
            .add(1, &[KeyValue::new("reason", reason)]);
    }

    pub fn record_scheduled(&self) {
        self.scheduled.fetch_add(1, Ordering::Relaxed);
        self.scheduled_total.add(1, &[]);
    }

    pub fn record_delay(&self, delay_secs: f64) {
        self.delay_seconds.record(delay_secs, &[]);
    }

    pub fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.outcomes_total
            .add(1, &[KeyValue::new("outcome", "succeeded")]);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.outcomes_total
            .add(1, &[KeyValue::new("outcome", "dead_lettered")]);
    }

    pub fn record_cancelled(&self) {
        self.outcomes_total
            .add(1, &[KeyValue::new("outcome", "cancelled")]);
    }

    pub fn record_circuit_opened(&self, endpoint: &str) {
        self.circuit_events_total.add(
            1,
            &[
                KeyValue::new("event", "opened"),
                KeyValue::new("endpoint", endpoint.to_string()),
            ],
        );
    }

    pub fn record_circuit_rejection(&self, endpoint: &str) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
        self.circuit_events_total.add(
            1,
            &[
                KeyValue::new("event", "rejected"),
                KeyValue::new("endpoint", endpoint.to_string()),
            ],
        );
    }

    pub fn snapshot(&self) -> RetrySnapshot {
        RetrySnapshot {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
        }
    }
}
