//! Running delivery analytics.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::Serialize;

use crate::record::{DeliveryRecord, DeliveryStatus};

/// Outcome counts for one endpoint or document type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutcomeStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub expired: u64,
    /// Mean seconds from transmission to delivery, over successful deliveries.
    pub average_delivery_time: Option<f64>,
    #[serde(skip)]
    delivery_time_sum: f64,
    #[serde(skip)]
    timed: u64,
}

impl OutcomeStats {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        let finished = self.successful + self.failed + self.expired;
        if finished == 0 {
            0.0
        } else {
            self.successful as f64 / finished as f64
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn record_outcome(&mut self, record: &DeliveryRecord, status: DeliveryStatus) {
        match status {
            DeliveryStatus::Delivered => {
                self.successful += 1;
                if let Some(seconds) = record.delivery_time {
                    self.delivery_time_sum += seconds;
                    self.timed += 1;
                    self.average_delivery_time = Some(self.delivery_time_sum / self.timed as f64);
                }
            }
            DeliveryStatus::Failed => self.failed += 1,
            DeliveryStatus::Expired => self.expired += 1,
            DeliveryStatus::Pending
            | DeliveryStatus::Transmitted
            | DeliveryStatus::Acknowledged
            | DeliveryStatus::Confirmed => {}
        }
    }
}

/// Aggregates fed by every tracked delivery and every transition.
#[derive(Debug, Default)]
pub struct Analytics {
    total: OutcomeStats,
    by_endpoint: HashMap<String, OutcomeStats>,
    by_document_type: HashMap<String, OutcomeStats>,
    /// Deliveries started, by hour of day (UTC).
    hourly: [u64; 24],
    /// Deliveries started, by calendar day (UTC).
    daily: BTreeMap<NaiveDate, u64>,
}

impl Analytics {
    pub fn record_created(&mut self, record: &DeliveryRecord) {
        self.total.total += 1;
        self.by_endpoint
            .entry(record.destination_endpoint.clone())
            .or_default()
            .total += 1;
        self.by_document_type
            .entry(record.document_type.clone())
            .or_default()
            .total += 1;

        self.record_started_at(record.created_at);
    }

    pub fn record_transition(&mut self, record: &DeliveryRecord, status: DeliveryStatus) {
        self.total.record_outcome(record, status);
        if let Some(stats) = self.by_endpoint.get_mut(&record.destination_endpoint) {
            stats.record_outcome(record, status);
        }
        if let Some(stats) = self.by_document_type.get_mut(&record.document_type) {
            stats.record_outcome(record, status);
        }
    }

    fn record_started_at(&mut self, at: DateTime<Utc>) {
        self.hourly[at.hour() as usize] += 1;
        *self.daily.entry(at.date_naive()).or_default() += 1;
    }

    /// Drop daily buckets before `cutoff`.
    pub fn prune_before(&mut self, cutoff: DateTime<Utc>) {
        let cutoff = cutoff.date_naive();
        self.daily.retain(|day, _| *day >= cutoff);
    }

    #[must_use]
    pub fn snapshot(&self, by_status: HashMap<DeliveryStatus, u64>) -> AnalyticsSnapshot {
        AnalyticsSnapshot {
            total_deliveries: self.total.total,
            successful_deliveries: self.total.successful,
            failed_deliveries: self.total.failed,
            expired_deliveries: self.total.expired,
            success_rate: self.total.success_rate(),
            average_delivery_time: self.total.average_delivery_time,
            by_status,
            by_endpoint: self.by_endpoint.clone(),
            by_document_type: self.by_document_type.clone(),
            hourly: self.hourly,
            daily: self.daily.clone(),
        }
    }
}

/// Point-in-time copy of [`Analytics`], plus live counts per status.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSnapshot {
    pub total_deliveries: u64,
    pub successful_deliveries: u64,
    pub failed_deliveries: u64,
    pub expired_deliveries: u64,
    pub success_rate: f64,
    pub average_delivery_time: Option<f64>,
    /// Records currently held in memory, by status.
    pub by_status: HashMap<DeliveryStatus, u64>,
    pub by_endpoint: HashMap<String, OutcomeStats>,
    pub by_document_type: HashMap<String, OutcomeStats>,
    pub hourly: [u64; 24],
    pub daily: BTreeMap<NaiveDate, u64>,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serde_json::Value;

    use super::*;
    use crate::record::NewDelivery;

    fn record(endpoint: &str, at: DateTime<Utc>) -> DeliveryRecord {
        DeliveryRecord::new(NewDelivery::new("INV", "invoice", endpoint), at)
    }

    #[test]
    fn test_success_rate_and_endpoint_breakdown() {
        let mut analytics = Analytics::default();
        let now = Utc::now();

        let mut ok = record("/submit", now);
        analytics.record_created(&ok);
        ok.apply(DeliveryStatus::Transmitted, Value::Null, now);
        ok.apply(
            DeliveryStatus::Delivered,
            Value::Null,
            now + Duration::seconds(2),
        );
        analytics.record_transition(&ok, DeliveryStatus::Transmitted);
        analytics.record_transition(&ok, DeliveryStatus::Delivered);

        let failed = record("/b2b", now);
        analytics.record_created(&failed);
        analytics.record_transition(&failed, DeliveryStatus::Failed);

        let pending = record("/submit", now);
        analytics.record_created(&pending);

        let snapshot = analytics.snapshot(HashMap::new());
        assert_eq!(snapshot.total_deliveries, 3);
        assert_eq!(snapshot.successful_deliveries, 1);
        assert_eq!(snapshot.failed_deliveries, 1);
        assert!((snapshot.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(snapshot.average_delivery_time, Some(2.0));

        let submit = &snapshot.by_endpoint["/submit"];
        assert_eq!(submit.total, 2);
        assert_eq!(submit.successful, 1);
        assert_eq!(snapshot.by_endpoint["/b2b"].failed, 1);
        assert_eq!(snapshot.by_document_type["invoice"].total, 3);
    }

    #[test]
    fn test_histograms_bucket_by_start_time() {
        let mut analytics = Analytics::default();
        let morning = Utc.with_ymd_and_hms(2026, 3, 2, 9, 15, 0).unwrap();
        let next_day = morning + Duration::days(1);

        analytics.record_created(&record("/submit", morning));
        analytics.record_created(&record("/submit", morning));
        analytics.record_created(&record("/submit", next_day));

        let snapshot = analytics.snapshot(HashMap::new());
        assert_eq!(snapshot.hourly[9], 3);
        assert_eq!(snapshot.hourly.iter().sum::<u64>(), 3);
        assert_eq!(snapshot.daily.len(), 2);
        assert_eq!(snapshot.daily[&morning.date_naive()], 2);

        analytics.prune_before(next_day);
        assert_eq!(analytics.snapshot(HashMap::new()).daily.len(), 1);
    }

    #[test]
    fn test_empty_success_rate_is_zero() {
        assert!(OutcomeStats::default().success_rate().abs() < f64::EPSILON);
    }
}
