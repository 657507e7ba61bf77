//! Delivery tracking metrics

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Meter},
};

/// Tracking metrics collector
#[derive(Debug)]
pub struct TrackingMetrics {
    /// Lifecycle transitions by target status
    transitions_total: Counter<u64>,

    /// Records purged by the retention sweep
    purged_total: Counter<u64>,

    /// Notifications dropped because the queue was full
    notifications_dropped_total: Counter<u64>,

    transitions: AtomicU64,
    expired: AtomicU64,
    notifications_dropped: AtomicU64,
    // Shared with the observable gauge callback
    tracked: Arc<AtomicU64>,
}

/// Point-in-time view of the local counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackingSnapshot {
    pub transitions: u64,
    pub expired: u64,
    pub notifications_dropped: u64,
    pub tracked: u64,
}

impl TrackingMetrics {
    pub(crate) fn new(meter: &Meter) -> Self {
        let tracked = Arc::new(AtomicU64::new(0));
        let gauge = tracked.clone();
        meter
            .u64_observable_gauge("taxpoynt.tracking.records")
            .with_description("Delivery records held in memory")
            .with_callback(move |observer| {
                observer.observe(gauge.load(Ordering::Relaxed), &[]);
            })
            .build();

        Self {
            transitions_total: meter
                .u64_counter("taxpoynt.tracking.transitions.total")
                .with_description("Lifecycle transitions by target status")
                .build(),
            purged_total: meter
                .u64_counter("taxpoynt.tracking.purged.total")
                .with_description("Records purged by the retention sweep")
                .build(),
            notifications_dropped_total: meter
                .u64_counter("taxpoynt.tracking.notifications.dropped.total")
                .with_description("Notifications dropped because the queue was full")
                .build(),
            transitions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            notifications_dropped: AtomicU64::new(0),
            tracked,
        }
    }

    pub fn record_transition(&self, status: &'static str) {
        self.transitions.fetch_add(1, Ordering::Relaxed);
        if status == "EXPIRED" {
            self.expired.fetch_add(1, Ordering::Relaxed);
        }
        self.transitions_total
            .add(1, &[KeyValue::new("status", status)]);
    }

    pub fn record_purged(&self, count: u64) {
        self.purged_total.add(count, &[]);
    }

    pub fn record_notification_dropped(&self) {
        self.notifications_dropped.fetch_add(1, Ordering::Relaxed);
        self.notifications_dropped_total.add(1, &[]);
    }

    pub fn set_tracked(&self, count: u64) {
        self.tracked.store(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrackingSnapshot {
        TrackingSnapshot {
            transitions: self.transitions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            notifications_dropped: self.notifications_dropped.load(Ordering::Relaxed),
            tracked: self.tracked.load(Ordering::Relaxed),
        }
    }
}
