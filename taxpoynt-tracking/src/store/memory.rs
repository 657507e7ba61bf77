use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::TrackingStore;
use crate::{
    error::StoreError,
    record::{DeliveryRecord, TrackingEvent},
};

/// Non-durable store, for tests and for running without a database path.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<Uuid, DeliveryRecord>>,
    events: RwLock<HashMap<Uuid, Vec<TrackingEvent>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_events(&self, record: &DeliveryRecord) -> DeliveryRecord {
        let mut record = record.clone();
        record.events = self
            .events
            .read()
            .get(&record.tracking_id)
            .cloned()
            .unwrap_or_default();
        record
    }
}

#[async_trait]
impl TrackingStore for MemoryStore {
    async fn save_transition(
        &self,
        record: &DeliveryRecord,
        event: &TrackingEvent,
    ) -> Result<(), StoreError> {
        if event.tracking_id != record.tracking_id {
            return Err(StoreError::UnknownRecord(event.tracking_id));
        }

        let mut records = self.records.write();
        let mut events = self.events.write();
        records.insert(record.tracking_id, record.without_events());
        events
            .entry(record.tracking_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn load_active(&self) -> Result<Vec<DeliveryRecord>, StoreError> {
        let records = self.records.read();
        Ok(records
            .values()
            .filter(|record| !record.current_status.is_terminal())
            .map(|record| self.with_events(record))
            .collect())
    }

    async fn load_record(&self, tracking_id: Uuid) -> Result<Option<DeliveryRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .get(&tracking_id)
            .map(|record| self.with_events(record)))
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut records = self.records.write();
        let mut events = self.events.write();
        let before = records.len();

        records.retain(|tracking_id, record| {
            let keep = !record.current_status.is_terminal() || record.updated_at >= cutoff;
            if !keep {
                events.remove(tracking_id);
            }
            keep
        });

        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::Value;

    use super::*;
    use crate::record::{DeliveryStatus, NewDelivery};

    #[tokio::test]
    async fn test_events_follow_their_record() {
        let store = MemoryStore::new();
        let mut record = DeliveryRecord::new(NewDelivery::new("INV-1", "invoice", "/submit"), Utc::now());

        store
            .save_transition(&record, &record.initial_event())
            .await
            .unwrap();
        let event = record.apply(DeliveryStatus::Transmitted, Value::Null, Utc::now());
        store.save_transition(&record, &event).await.unwrap();

        let loaded = store.load_record(record.tracking_id).await.unwrap().unwrap();
        assert_eq!(loaded.current_status, DeliveryStatus::Transmitted);
        assert_eq!(loaded.events.len(), 2);
        assert_eq!(loaded.events[1], event);
    }

    #[tokio::test]
    async fn test_foreign_event_writes_nothing() {
        let store = MemoryStore::new();
        let record = DeliveryRecord::new(NewDelivery::new("INV-1", "invoice", "/submit"), Utc::now());
        let other = DeliveryRecord::new(NewDelivery::new("INV-2", "invoice", "/submit"), Utc::now());

        assert!(matches!(
            store.save_transition(&record, &other.initial_event()).await,
            Err(StoreError::UnknownRecord(id)) if id == other.tracking_id
        ));
        assert!(store.is_empty());
        assert!(store.load_record(record.tracking_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_keeps_active_and_recent() {
        let store = MemoryStore::new();
        let old = Utc::now() - Duration::days(40);

        let active = DeliveryRecord::new(NewDelivery::new("A", "invoice", "/submit"), old);
        let mut stale = DeliveryRecord::new(NewDelivery::new("B", "invoice", "/submit"), old);
        stale.apply(DeliveryStatus::Failed, Value::Null, old);
        let mut recent = DeliveryRecord::new(NewDelivery::new("C", "invoice", "/submit"), old);
        recent.apply(DeliveryStatus::Failed, Value::Null, Utc::now());

        for record in [&active, &stale, &recent] {
            store
                .save_transition(record, &record.initial_event())
                .await
                .unwrap();
        }

        let purged = store
            .purge_before(Utc::now() - Duration::days(30))
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert_eq!(store.len(), 2);
        assert!(store.load_record(stale.tracking_id).await.unwrap().is_none());
        assert_eq!(store.load_active().await.unwrap().len(), 1);
    }
}
