//! The delivery tracker.
//!
//! Every transition is applied to the in-memory record, persisted (record
//! upsert plus event append, atomically) and only then published: analytics are updated,
//! the event goes to registered callbacks and a notification is queued for
//! the webhooks. Writes are serialised so a record's audit trail is stored in
//! the order it was produced.

use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Value, json};
use taxpoynt_common::{
    DeliveryReporter, Signal, TransmissionRequest, TransmissionResult, TransmissionStatus,
    WebhookClient, internal, outgoing,
};
use taxpoynt_metrics::Metrics;
use taxpoynt_tracing::traced;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinSet,
};
use uuid::Uuid;

use crate::{
    analytics::{Analytics, AnalyticsSnapshot},
    config::TrackerConfig,
    error::TrackingError,
    record::{DeliveryRecord, DeliveryStatus, NewDelivery, TrackingEvent},
    store::{MemoryStore, SqliteStore, TrackingStore},
};

const EXPIRED_REASON: &str = "Expected delivery time exceeded";

/// Invoked with every event of the tracking id it was registered for.
pub type StatusCallback = Arc<dyn Fn(&TrackingEvent) + Send + Sync>;

#[derive(Debug)]
struct Notification {
    url: String,
    payload: Value,
}

struct Receivers {
    events: mpsc::Receiver<TrackingEvent>,
    notifications: mpsc::Receiver<Notification>,
}

pub struct DeliveryTracker {
    config: TrackerConfig,
    store: Arc<dyn TrackingStore>,
    records: DashMap<Uuid, DeliveryRecord>,
    by_document: DashMap<String, Vec<Uuid>>,
    analytics: Mutex<Analytics>,
    callbacks: DashMap<Uuid, Vec<StatusCallback>>,
    events: mpsc::Sender<TrackingEvent>,
    notifications: mpsc::Sender<Notification>,
    receivers: Mutex<Option<Receivers>>,
    /// Held across apply and persist.
    write_lock: tokio::sync::Mutex<()>,
    webhook: WebhookClient,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for DeliveryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryTracker")
            .field("store", &self.store)
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl DeliveryTracker {
    /// # Errors
    ///
    /// Returns an error if the notification client cannot be built.
    pub fn new(
        config: TrackerConfig,
        store: Arc<dyn TrackingStore>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, TrackingError> {
        let (events, event_receiver) = mpsc::channel(config.event_queue_size.max(1));
        let (notifications, notification_receiver) =
            mpsc::channel(config.notification_queue_size.max(1));
        let webhook = WebhookClient::new(config.webhook_timeout())?;

        Ok(Self {
            config,
            store,
            records: DashMap::new(),
            by_document: DashMap::new(),
            analytics: Mutex::new(Analytics::default()),
            callbacks: DashMap::new(),
            events,
            notifications,
            receivers: Mutex::new(Some(Receivers {
                events: event_receiver,
                notifications: notification_receiver,
            })),
            write_lock: tokio::sync::Mutex::new(()),
            webhook,
            metrics,
        })
    }

    /// Build a tracker over the store `config` names, then restore its
    /// unfinished records.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or read.
    pub async fn open(config: TrackerConfig, metrics: Arc<Metrics>) -> Result<Self, TrackingError> {
        let store: Arc<dyn TrackingStore> = match &config.database_path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => {
                internal!(
                    level = WARN,
                    "No tracking database configured, delivery records will not survive a restart"
                );
                Arc::new(MemoryStore::new())
            }
        };

        let tracker = Self::new(config, store, metrics)?;
        tracker.restore().await?;
        Ok(tracker)
    }

    /// Load every unfinished record from the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn restore(&self) -> Result<usize, TrackingError> {
        let records = self.store.load_active().await?;
        let restored = records.len();

        {
            let mut analytics = self.analytics.lock();
            for record in &records {
                analytics.record_created(record);
            }
        }
        for record in records {
            self.index(record);
        }
        self.publish_tracked();

        internal!(level = INFO, "Restored {restored} unfinished deliveries");
        Ok(restored)
    }

    /// Start tracking a delivery in `PENDING`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be persisted; nothing is tracked
    /// in that case.
    #[traced(
        instrument(level = tracing::Level::DEBUG, skip_all, fields(document_id = %delivery.document_id)),
        timing(precision = "ms")
    )]
    pub async fn track_delivery(&self, delivery: NewDelivery) -> Result<Uuid, TrackingError> {
        let _write = self.write_lock.lock().await;

        let mut record = DeliveryRecord::new(delivery, Utc::now());
        let event = record.initial_event();
        self.store.save_transition(&record, &event).await?;
        record.events.push(event.clone());

        let tracking_id = record.tracking_id;
        self.analytics.lock().record_created(&record);
        self.metrics
            .tracking
            .record_transition(DeliveryStatus::Pending.as_str());
        self.publish(&record, event);
        self.index(record);
        self.publish_tracked();

        tracing::debug!(%tracking_id, "Delivery tracking started");
        Ok(tracking_id)
    }

    /// Move a record to `status`.
    ///
    /// `details` is stored with the event; `transmission_id` and
    /// `error_message` keys are also copied onto the record.
    ///
    /// # Errors
    ///
    /// - [`TrackingError::NotFound`] for an unknown tracking id
    /// - [`TrackingError::InvalidTransition`] if the lifecycle forbids the move
    /// - [`TrackingError::Store`] if persisting fails, leaving the record as it was
    #[traced(
        instrument(level = tracing::Level::DEBUG, skip_all, fields(tracking_id = %tracking_id, status = %status)),
        timing(precision = "ms")
    )]
    pub async fn update_status(
        &self,
        tracking_id: Uuid,
        status: DeliveryStatus,
        details: Value,
    ) -> Result<DeliveryRecord, TrackingError> {
        let _write = self.write_lock.lock().await;

        let mut record = self
            .records
            .get(&tracking_id)
            .map(|record| record.clone())
            .ok_or(TrackingError::NotFound(tracking_id))?;

        if !record.current_status.can_transition_to(status) {
            return Err(TrackingError::InvalidTransition {
                tracking_id,
                from: record.current_status,
                to: status,
            });
        }

        let event = record.apply(status, details, Utc::now());
        self.store.save_transition(&record, &event).await?;

        self.records.insert(tracking_id, record.clone());
        self.analytics.lock().record_transition(&record, status);
        self.metrics.tracking.record_transition(status.as_str());
        self.publish(&record, event);

        Ok(record)
    }

    #[must_use]
    pub fn get_record(&self, tracking_id: Uuid) -> Option<DeliveryRecord> {
        self.records.get(&tracking_id).map(|record| record.clone())
    }

    /// Every record held for `document_id`, oldest first.
    #[must_use]
    pub fn records_for_document(&self, document_id: &str) -> Vec<DeliveryRecord> {
        let Some(ids) = self.by_document.get(document_id).map(|ids| ids.clone()) else {
            return Vec::new();
        };

        let mut records: Vec<_> = ids.iter().filter_map(|id| self.get_record(*id)).collect();
        records.sort_by_key(|record| record.created_at);
        records
    }

    #[must_use]
    pub fn records_by_status(&self, status: DeliveryStatus) -> Vec<DeliveryRecord> {
        self.records
            .iter()
            .filter(|record| record.current_status == status)
            .map(|record| record.clone())
            .collect()
    }

    /// Call `callback` with every later event of `tracking_id`.
    ///
    /// Callbacks run on the event dispatch task; a panicking callback is
    /// logged and does not affect the others.
    pub fn register_callback(
        &self,
        tracking_id: Uuid,
        callback: impl Fn(&TrackingEvent) + Send + Sync + 'static,
    ) {
        self.callbacks
            .entry(tracking_id)
            .or_default()
            .push(Arc::new(callback));
    }

    #[must_use]
    pub fn analytics(&self) -> AnalyticsSnapshot {
        let mut by_status: HashMap<DeliveryStatus, u64> = HashMap::new();
        for record in &self.records {
            *by_status.entry(record.current_status).or_default() += 1;
        }

        self.analytics.lock().snapshot(by_status)
    }

    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }

    /// Flip every overdue `PENDING` or `TRANSMITTED` record to `EXPIRED`.
    ///
    /// Returns how many records expired. Failures are logged per record.
    pub async fn check_expired(&self, now: DateTime<Utc>) -> usize {
        let overdue: Vec<Uuid> = self
            .records
            .iter()
            .filter(|record| record.is_overdue(now))
            .map(|record| record.tracking_id)
            .collect();

        let mut expired = 0;
        for tracking_id in overdue {
            match self
                .update_status(
                    tracking_id,
                    DeliveryStatus::Expired,
                    json!({ "reason": EXPIRED_REASON }),
                )
                .await
            {
                Ok(_) => expired += 1,
                // Finished between the scan and the update.
                Err(TrackingError::InvalidTransition { .. }) => {}
                Err(e) => {
                    tracing::error!(%tracking_id, error = %e, "Failed to expire delivery");
                }
            }
        }

        if expired > 0 {
            internal!(level = INFO, "Expired {expired} overdue deliveries");
        }
        expired
    }

    /// Purge finished records older than the retention period, from the store
    /// and from memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the store purge fails; memory is left untouched.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<u64, TrackingError> {
        let Some(cutoff) = now.checked_sub_signed(self.config.retention()) else {
            tracing::debug!(
                retention_days = self.config.retention_days,
                "Retention reaches past the earliest representable time, nothing to purge"
            );
            return Ok(0);
        };
        let purged = self.store.purge_before(cutoff).await?;

        let stale: Vec<(Uuid, String)> = self
            .records
            .iter()
            .filter(|record| record.current_status.is_terminal() && record.updated_at < cutoff)
            .map(|record| (record.tracking_id, record.document_id.clone()))
            .collect();

        for (tracking_id, document_id) in &stale {
            self.records.remove(tracking_id);
            self.callbacks.remove(tracking_id);
            self.by_document.remove_if_mut(document_id, |_, ids| {
                ids.retain(|id| id != tracking_id);
                ids.is_empty()
            });
        }

        self.analytics.lock().prune_before(cutoff);
        self.metrics.tracking.record_purged(purged);
        self.publish_tracked();

        if purged > 0 || !stale.is_empty() {
            internal!(
                level = INFO,
                "Purged {purged} stored and {} in-memory deliveries older than {cutoff}",
                stale.len()
            );
        }
        Ok(purged)
    }

    /// Run the monitor, cleanup, event and notification loops until a
    /// shutdown signal arrives, then stop all four.
    ///
    /// # Errors
    ///
    /// Returns [`TrackingError::AlreadyRunning`] if called twice.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing(precision = "s"))]
    pub async fn serve(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), TrackingError> {
        let Some(receivers) = self.receivers.lock().take() else {
            return Err(TrackingError::AlreadyRunning);
        };

        internal!(level = INFO, "Delivery tracker starting");

        let mut loops = JoinSet::new();
        loops.spawn(Arc::clone(&self).monitor());
        loops.spawn(Arc::clone(&self).purge());
        loops.spawn(Arc::clone(&self).dispatch_events(receivers.events));
        loops.spawn(Arc::clone(&self).dispatch_notifications(receivers.notifications));

        match shutdown.recv().await {
            Ok(Signal::Shutdown | Signal::Finalised) => {
                internal!(level = INFO, "Delivery tracker received shutdown signal");
            }
            Err(e) => {
                tracing::error!("Delivery tracker shutdown channel error: {e}");
            }
        }

        loops.shutdown().await;
        internal!(level = INFO, "Delivery tracker shutdown complete");
        Ok(())
    }

    async fn monitor(self: Arc<Self>) {
        let mut timer = tokio::time::interval(self.config.polling_interval());
        timer.tick().await;

        loop {
            timer.tick().await;
            self.check_expired(Utc::now()).await;
        }
    }

    async fn purge(self: Arc<Self>) {
        let mut timer = tokio::time::interval(self.config.cleanup_interval());
        timer.tick().await;

        loop {
            timer.tick().await;
            if let Err(e) = self.cleanup(Utc::now()).await {
                tracing::error!(error = %e, "Delivery cleanup failed");
            }
        }
    }

    async fn dispatch_events(self: Arc<Self>, mut events: mpsc::Receiver<TrackingEvent>) {
        while let Some(event) = events.recv().await {
            let Some(callbacks) = self
                .callbacks
                .get(&event.tracking_id)
                .map(|callbacks| callbacks.clone())
            else {
                continue;
            };

            for callback in callbacks {
                if std::panic::catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                    tracing::warn!(
                        tracking_id = %event.tracking_id,
                        "Tracking callback panicked"
                    );
                }
            }
        }
    }

    async fn dispatch_notifications(self: Arc<Self>, mut notifications: mpsc::Receiver<Notification>) {
        while let Some(notification) = notifications.recv().await {
            match self
                .webhook
                .post(&notification.url, &notification.payload)
                .await
            {
                Ok(()) => {
                    outgoing!("Notification sent to {}", notification.url);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Delivery notification dropped");
                }
            }
        }
    }

    fn index(&self, record: DeliveryRecord) {
        self.by_document
            .entry(record.document_id.clone())
            .or_default()
            .push(record.tracking_id);
        self.records.insert(record.tracking_id, record);
    }

    fn publish_tracked(&self) {
        self.metrics.tracking.set_tracked(self.records.len() as u64);
    }

    /// Queue `event` for callbacks and a notification for each webhook.
    ///
    /// Both queues are bounded; when full the item is dropped.
    fn publish(&self, record: &DeliveryRecord, event: TrackingEvent) {
        let urls = record
            .callback_url
            .iter()
            .chain(self.config.webhook_url.iter());
        for url in urls {
            let notification = Notification {
                url: url.clone(),
                payload: json!({
                    "tracking_id": record.tracking_id,
                    "document_id": record.document_id,
                    "status": event.status,
                    "timestamp": event.timestamp,
                    "details": event.details,
                }),
            };
            if self.notifications.try_send(notification).is_err() {
                self.metrics.tracking.record_notification_dropped();
                tracing::warn!(
                    tracking_id = %record.tracking_id,
                    "Notification queue full, dropping notification"
                );
            }
        }

        if self.callbacks.contains_key(&record.tracking_id)
            && self.events.try_send(event).is_err()
        {
            tracing::warn!(
                tracking_id = %record.tracking_id,
                "Tracking event queue full, dropping event"
            );
        }
    }

    /// The newest unfinished record for `document_id`.
    fn active_record(&self, document_id: &str) -> Option<DeliveryRecord> {
        self.records_for_document(document_id)
            .into_iter()
            .rev()
            .find(|record| !record.current_status.is_terminal())
    }
}

#[async_trait]
impl DeliveryReporter for DeliveryTracker {
    /// Advance the newest unfinished record for the document, walking any
    /// skipped milestones. Documents nobody tracked yet are tracked first.
    async fn report(&self, request: &TransmissionRequest, result: &TransmissionResult) {
        let (target, details) = match result.status {
            TransmissionStatus::Delivered => (
                DeliveryStatus::Delivered,
                json!({
                    "transmission_id": result.transmission_id,
                    "request_id": result.request_id,
                }),
            ),
            TransmissionStatus::Failed => (
                DeliveryStatus::Failed,
                json!({
                    "error_message": result.error_message,
                    "request_id": result.request_id,
                }),
            ),
            TransmissionStatus::Pending
            | TransmissionStatus::Encrypting
            | TransmissionStatus::Signing
            | TransmissionStatus::Transmitting => return,
        };

        let record = match self.active_record(&request.document_id) {
            Some(record) => record,
            None => {
                let mut delivery = NewDelivery::new(
                    &request.document_id,
                    &request.document_type,
                    &request.destination_endpoint,
                )
                .with_request_id(result.request_id);
                delivery.expected_delivery_time = request.expires_at;
                delivery.metadata = request.metadata.clone();

                let tracking_id = match self.track_delivery(delivery).await {
                    Ok(tracking_id) => tracking_id,
                    Err(e) => {
                        tracing::error!(
                            document_id = %request.document_id,
                            error = %e,
                            "Failed to track reported delivery"
                        );
                        return;
                    }
                };
                let Some(record) = self.get_record(tracking_id) else {
                    return;
                };
                record
            }
        };

        let path = record.current_status.path_to(target);
        if path.is_empty() {
            tracing::debug!(
                tracking_id = %record.tracking_id,
                from = %record.current_status,
                to = %target,
                "Ignoring report that does not advance the delivery"
            );
            return;
        }

        for status in path {
            if let Err(e) = self
                .update_status(record.tracking_id, status, details.clone())
                .await
            {
                tracing::error!(
                    tracking_id = %record.tracking_id,
                    error = %e,
                    "Failed to record reported transmission"
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Duration;

    use super::*;

    fn tracker() -> DeliveryTracker {
        DeliveryTracker::new(
            TrackerConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(Metrics::local()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_record_unchanged() {
        let tracker = tracker();
        let id = tracker
            .track_delivery(NewDelivery::new("INV-1", "invoice", "/submit"))
            .await
            .unwrap();

        let err = tracker
            .update_status(id, DeliveryStatus::Confirmed, Value::Null)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            TrackingError::InvalidTransition {
                from: DeliveryStatus::Pending,
                to: DeliveryStatus::Confirmed,
                ..
            }
        ));
        let record = tracker.get_record(id).unwrap();
        assert_eq!(record.current_status, DeliveryStatus::Pending);
        assert_eq!(record.events.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_tracking_id() {
        let tracker = tracker();
        let id = Uuid::new_v4();
        assert!(matches!(
            tracker
                .update_status(id, DeliveryStatus::Failed, Value::Null)
                .await,
            Err(TrackingError::NotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn test_callbacks_receive_events_and_survive_panics() {
        let tracker = Arc::new(tracker());
        let (shutdown, receiver) = broadcast::channel(1);
        let serving = tokio::spawn(Arc::clone(&tracker).serve(receiver));

        let id = tracker
            .track_delivery(NewDelivery::new("INV-2", "invoice", "/submit"))
            .await
            .unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        tracker.register_callback(id, |_| panic!("misbehaving callback"));
        tracker.register_callback(id, move |event| {
            assert_eq!(event.status, DeliveryStatus::Transmitted);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tracker
            .update_status(id, DeliveryStatus::Transmitted, Value::Null)
            .await
            .unwrap();

        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        shutdown.send(Signal::Shutdown).unwrap();
        serving.await.unwrap().unwrap();

        let (_tx, receiver) = broadcast::channel(1);
        assert!(matches!(
            Arc::clone(&tracker).serve(receiver).await,
            Err(TrackingError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn test_cleanup_forgets_old_finished_records() {
        let tracker = tracker();
        let id = tracker
            .track_delivery(NewDelivery::new("INV-3", "invoice", "/submit"))
            .await
            .unwrap();
        tracker
            .update_status(id, DeliveryStatus::Failed, Value::Null)
            .await
            .unwrap();
        let pending = tracker
            .track_delivery(NewDelivery::new("INV-3", "invoice", "/submit"))
            .await
            .unwrap();

        let purged = tracker
            .cleanup(Utc::now() + Duration::days(31))
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert!(tracker.get_record(id).is_none());
        assert!(tracker.get_record(pending).is_some());
        assert_eq!(tracker.records_for_document("INV-3").len(), 1);
        assert_eq!(tracker.metrics.tracking.snapshot().tracked, 1);
    }

    #[tokio::test]
    async fn test_cleanup_with_unbounded_retention_purges_nothing() {
        let tracker = DeliveryTracker::new(
            TrackerConfig {
                retention_days: 200_000_000,
                ..TrackerConfig::default()
            },
            Arc::new(MemoryStore::new()),
            Arc::new(Metrics::local()),
        )
        .unwrap();
        let id = tracker
            .track_delivery(NewDelivery::new("INV-4", "invoice", "/submit"))
            .await
            .unwrap();
        tracker
            .update_status(id, DeliveryStatus::Failed, Value::Null)
            .await
            .unwrap();

        assert_eq!(tracker.cleanup(Utc::now()).await.unwrap(), 0);
        assert!(tracker.get_record(id).is_some());
    }
}
