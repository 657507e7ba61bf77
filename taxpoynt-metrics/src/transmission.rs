//! Transmission metrics
//!
//! Covers direct, batch and real-time transmissions:
//! - Transmissions by outcome and their durations
//! - Time spent in each pipeline stage
//! - Batch outcomes
//! - Real-time queue depth and dropped stream events

use std::sync::{
    Arc,
    atomic::{AtomicI64, AtomicU64, Ordering},
};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter, UpDownCounter},
};

/// Transmission metrics collector
#[derive(Debug)]
pub struct TransmissionMetrics {
    /// Finished transmissions by outcome
    transmissions_total: Counter<u64>,

    /// End-to-end transmission duration
    duration_seconds: Histogram<f64>,

    /// Duration of individual pipeline stages
    stage_duration_seconds: Histogram<f64>,

    /// Transmissions currently in flight
    active_transmissions: UpDownCounter<i64>,

    /// Finished batches by status
    batches_total: Counter<u64>,

    /// Items processed across all batches
    batch_items_total: Counter<u64>,

    /// Stream events dropped because a buffer was full
    events_dropped: Counter<u64>,

    started: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    active: AtomicI64,
    batches: AtomicU64,
    dropped_events: AtomicU64,
    // Shared with the observable gauge callback
    queue_depth: Arc<AtomicU64>,
}

/// Point-in-time view of the local counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmissionSnapshot {
    pub started: u64,
    pub delivered: u64,
    pub failed: u64,
    pub active: i64,
    pub batches: u64,
    pub dropped_events: u64,
    pub queue_depth: u64,
}

impl TransmissionMetrics {
    pub(crate) fn new(meter: &Meter) -> Self {
        let transmissions_total = meter
            .u64_counter("taxpoynt.transmission.total")
            .with_description("Finished transmissions by outcome")
            .build();

        let duration_seconds = meter
            .f64_histogram("taxpoynt.transmission.duration.seconds")
            .with_description("End-to-end transmission duration")
            .build();

        let stage_duration_seconds = meter
            .f64_histogram("taxpoynt.transmission.stage.duration.seconds")
            .with_description("Duration of individual pipeline stages")
            .build();

        let active_transmissions = meter
            .i64_up_down_counter("taxpoynt.transmission.active")
            .with_description("Transmissions currently in flight")
            .build();

        let batches_total = meter
            .u64_counter("taxpoynt.batch.total")
            .with_description("Finished batches by status")
            .build();

        let batch_items_total = meter
            .u64_counter("taxpoynt.batch.items.total")
            .with_description("Items processed across all batches")
            .build();

        let events_dropped = meter
            .u64_counter("taxpoynt.stream.events.dropped.total")
            .with_description("Stream events dropped because a buffer was full")
            .build();

        let queue_depth = Arc::new(AtomicU64::new(0));
        let depth = queue_depth.clone();
        meter
            .u64_observable_gauge("taxpoynt.realtime.queue.depth")
            .with_description("Requests waiting in the real-time priority queue")
            .with_callback(move |observer| {
                observer.observe(depth.load(Ordering::Relaxed), &[]);
            })
            .build();

        Self {
            transmissions_total,
            duration_seconds,
            stage_duration_seconds,
            active_transmissions,
            batches_total,
            batch_items_total,
            events_dropped,
            started: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            active: AtomicI64::new(0),
            batches: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
            queue_depth,
        }
    }

    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        self.active_transmissions.add(1, &[]);
    }

    pub fn record_finished(&self, delivered: bool, duration_secs: f64) {
        let outcome = if delivered {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            "delivered"
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            "failed"
        };

        self.active.fetch_sub(1, Ordering::Relaxed);
        self.active_transmissions.add(-1, &[]);
        self.transmissions_total
            .add(1, &[KeyValue::new("status", outcome)]);
        self.duration_seconds
            .record(duration_secs, &[KeyValue::new("status", outcome)]);
    }

    pub fn record_stage(&self, stage: &'static str, duration_secs: f64) {
        self.stage_duration_seconds
            .record(duration_secs, &[KeyValue::new("stage", stage)]);
    }

    pub fn record_batch(&self, status: &'static str, items: u64) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.batches_total
            .add(1, &[KeyValue::new("status", status)]);
        self.batch_items_total.add(items, &[]);
    }

    pub fn record_event_dropped(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
        self.events_dropped.add(1, &[]);
    }

    pub fn set_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransmissionSnapshot {
        TransmissionSnapshot {
            started: self.started.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
        }
    }
}
