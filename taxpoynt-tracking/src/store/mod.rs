//! Durable storage for delivery records and their audit trail.
//!
//! Records are upserted whole on every transition; events are append-only.
//! A record handed to [`TrackingStore::save_transition`] has its `events`
//! ignored, and loaded records carry their events in append order.

mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::{
    error::StoreError,
    record::{DeliveryRecord, TrackingEvent},
};

#[async_trait]
pub trait TrackingStore: Send + Sync + std::fmt::Debug {
    /// Insert or overwrite `record` and append `event` to its audit trail.
    ///
    /// Both writes land or neither does.
    ///
    /// # Errors
    ///
    /// Returns an error if either write fails, or if `event` belongs to a
    /// different record.
    async fn save_transition(
        &self,
        record: &DeliveryRecord,
        event: &TrackingEvent,
    ) -> Result<(), StoreError>;

    /// Every record that has not reached a terminal status, with its events.
    ///
    /// # Errors
    ///
    /// Returns an error if the records cannot be read or decoded.
    async fn load_active(&self) -> Result<Vec<DeliveryRecord>, StoreError>;

    /// # Errors
    ///
    /// Returns an error if the record cannot be read or decoded.
    async fn load_record(&self, tracking_id: Uuid) -> Result<Option<DeliveryRecord>, StoreError>;

    /// Delete terminal records last updated before `cutoff`, and their
    /// events. Returns how many records were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
