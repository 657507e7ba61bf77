//! `SQLite` backend.
//!
//! Two tables: `delivery_records`, one row per tracking id overwritten on
//! every transition, and the append-only `tracking_events`. Calls run on the
//! blocking pool behind a single shared connection.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use uuid::Uuid;

use super::TrackingStore;
use crate::{
    error::StoreError,
    record::{DeliveryRecord, DeliveryStatus, TrackingEvent},
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS delivery_records (
    tracking_id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL,
    status TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    record_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_delivery_records_status ON delivery_records (status);
CREATE INDEX IF NOT EXISTS idx_delivery_records_document ON delivery_records (document_id);
CREATE TABLE IF NOT EXISTS tracking_events (
    event_id TEXT PRIMARY KEY,
    tracking_id TEXT NOT NULL REFERENCES delivery_records (tracking_id) ON DELETE CASCADE,
    status TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    details TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tracking_events_tracking ON tracking_events (tracking_id);
";

const TERMINAL: &str = "('CONFIRMED', 'FAILED', 'EXPIRED')";

#[derive(Debug, Clone)]
pub struct SqliteStore {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open, creating if needed, the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be
    /// created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let connection = Connection::open_with_flags(path, flags)?;
        connection.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::initialise(connection)
    }

    /// A private database that disappears with the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::initialise(Connection::open_in_memory()?)
    }

    fn initialise(mut connection: Connection) -> Result<Self, StoreError> {
        connection.execute_batch("PRAGMA foreign_keys = ON;")?;
        connection.busy_timeout(std::time::Duration::from_secs(5))?;

        let tx = connection.transaction()?;
        tx.execute_batch(SCHEMA)?;
        tx.commit()?;

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    async fn run<T, F>(&self, work: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || work(&mut *connection.lock())).await?
    }
}

fn load_events(
    connection: &Connection,
    record: &mut DeliveryRecord,
) -> Result<(), StoreError> {
    let mut statement = connection.prepare_cached(
        "SELECT event_id, status, timestamp, details FROM tracking_events
         WHERE tracking_id = ?1 ORDER BY rowid",
    )?;
    let rows = statement.query_map(params![record.tracking_id.to_string()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    for row in rows {
        let (event_id, status, timestamp, details) = row?;
        record.events.push(TrackingEvent {
            event_id: parse_uuid(&event_id)?,
            tracking_id: record.tracking_id,
            status: serde_json::from_value::<DeliveryStatus>(serde_json::Value::String(status))?,
            timestamp: DateTime::from_timestamp_millis(timestamp).ok_or_else(|| {
                StoreError::Database(format!("Invalid event timestamp {timestamp}"))
            })?,
            details: serde_json::from_str(&details)?,
        });
    }

    Ok(())
}

fn decode_record(connection: &Connection, json: &str) -> Result<DeliveryRecord, StoreError> {
    let mut record: DeliveryRecord = serde_json::from_str(json)?;
    record.events.clear();
    load_events(connection, &mut record)?;
    Ok(record)
}

struct RecordRow {
    tracking_id: String,
    document_id: String,
    status: &'static str,
    updated_at: i64,
    json: String,
}

impl RecordRow {
    fn new(record: &DeliveryRecord) -> Result<Self, StoreError> {
        Ok(Self {
            tracking_id: record.tracking_id.to_string(),
            document_id: record.document_id.clone(),
            status: record.current_status.as_str(),
            updated_at: record.updated_at.timestamp_millis(),
            json: serde_json::to_string(&record.without_events())?,
        })
    }

    fn upsert(&self, connection: &Connection) -> Result<(), StoreError> {
        connection.execute(
            "INSERT INTO delivery_records (tracking_id, document_id, status, updated_at, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (tracking_id) DO UPDATE SET
                 status = excluded.status,
                 updated_at = excluded.updated_at,
                 record_json = excluded.record_json",
            params![
                self.tracking_id,
                self.document_id,
                self.status,
                self.updated_at,
                self.json
            ],
        )?;
        Ok(())
    }
}

struct EventRow {
    event_id: String,
    tracking_id: String,
    status: &'static str,
    timestamp: i64,
    details: String,
}

impl EventRow {
    fn new(event: &TrackingEvent) -> Result<Self, StoreError> {
        Ok(Self {
            event_id: event.event_id.to_string(),
            tracking_id: event.tracking_id.to_string(),
            status: event.status.as_str(),
            timestamp: event.timestamp.timestamp_millis(),
            details: serde_json::to_string(&event.details)?,
        })
    }

    fn insert(&self, connection: &Connection) -> Result<(), StoreError> {
        connection.execute(
            "INSERT INTO tracking_events (event_id, tracking_id, status, timestamp, details)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.event_id,
                self.tracking_id,
                self.status,
                self.timestamp,
                self.details
            ],
        )?;
        Ok(())
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(value).map_err(|err| StoreError::Database(format!("Invalid id {value}: {err}")))
}

#[async_trait]
impl TrackingStore for SqliteStore {
    async fn save_transition(
        &self,
        record: &DeliveryRecord,
        event: &TrackingEvent,
    ) -> Result<(), StoreError> {
        if event.tracking_id != record.tracking_id {
            return Err(StoreError::UnknownRecord(event.tracking_id));
        }

        let record_row = RecordRow::new(record)?;
        let event_row = EventRow::new(event)?;

        self.run(move |connection| {
            let tx = connection.transaction()?;
            record_row.upsert(&tx)?;
            event_row.insert(&tx)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn load_active(&self) -> Result<Vec<DeliveryRecord>, StoreError> {
        self.run(|connection| {
            let mut statement = connection.prepare(&format!(
                "SELECT record_json FROM delivery_records WHERE status NOT IN {TERMINAL}"
            ))?;
            let rows = statement
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;

            rows.iter()
                .map(|json| decode_record(connection, json))
                .collect()
        })
        .await
    }

    async fn load_record(&self, tracking_id: Uuid) -> Result<Option<DeliveryRecord>, StoreError> {
        self.run(move |connection| {
            let json: Option<String> = connection
                .query_row(
                    "SELECT record_json FROM delivery_records WHERE tracking_id = ?1",
                    params![tracking_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;

            json.map(|json| decode_record(connection, &json)).transpose()
        })
        .await
    }

    async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let cutoff = cutoff.timestamp_millis();

        self.run(move |connection| {
            let tx = connection.transaction()?;
            let removed = tx.execute(
                &format!(
                    "DELETE FROM delivery_records WHERE status IN {TERMINAL} AND updated_at < ?1"
                ),
                params![cutoff],
            )?;
            tx.commit()?;
            Ok(removed as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::record::NewDelivery;

    #[tokio::test]
    async fn test_upsert_overwrites_single_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut record =
            DeliveryRecord::new(NewDelivery::new("INV-1", "invoice", "/submit"), Utc::now());

        store
            .save_transition(&record, &record.initial_event())
            .await
            .unwrap();
        let event = record.apply(
            DeliveryStatus::Transmitted,
            json!({ "transmission_id": "FIRS-1" }),
            Utc::now(),
        );
        store.save_transition(&record, &event).await.unwrap();

        let rows: i64 = store
            .connection
            .lock()
            .query_row("SELECT COUNT(*) FROM delivery_records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);

        let loaded = store.load_record(record.tracking_id).await.unwrap().unwrap();
        assert_eq!(loaded.current_status, DeliveryStatus::Transmitted);
        assert_eq!(loaded.transmission_id.as_deref(), Some("FIRS-1"));
        assert_eq!(loaded.events.len(), 2);
        assert_eq!(loaded.events[0].status, DeliveryStatus::Pending);
        assert_eq!(loaded.events[1].details["transmission_id"], "FIRS-1");
    }

    #[tokio::test]
    async fn test_failed_event_insert_rolls_back_record() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut record =
            DeliveryRecord::new(NewDelivery::new("INV-1", "invoice", "/submit"), Utc::now());
        let initial = record.initial_event();
        store.save_transition(&record, &initial).await.unwrap();

        // Reusing an event id violates the events primary key.
        let mut event = record.apply(DeliveryStatus::Transmitted, json!({}), Utc::now());
        event.event_id = initial.event_id;
        let err = store.save_transition(&record, &event).await.unwrap_err();
        assert!(matches!(err, StoreError::Database(_)));

        let loaded = store.load_record(record.tracking_id).await.unwrap().unwrap();
        assert_eq!(loaded.current_status, DeliveryStatus::Pending);
        assert_eq!(loaded.events.len(), 1);
    }

    #[tokio::test]
    async fn test_event_for_another_record_is_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        let record =
            DeliveryRecord::new(NewDelivery::new("INV-1", "invoice", "/submit"), Utc::now());
        let other =
            DeliveryRecord::new(NewDelivery::new("INV-2", "invoice", "/submit"), Utc::now());

        let err = store
            .save_transition(&record, &other.initial_event())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownRecord(id) if id == other.tracking_id));
        assert!(store.load_record(record.tracking_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_cascades_to_events() {
        let store = SqliteStore::open_in_memory().unwrap();
        let old = Utc::now() - Duration::days(31);
        let mut record = DeliveryRecord::new(NewDelivery::new("INV-1", "invoice", "/submit"), old);
        store
            .save_transition(&record, &record.initial_event())
            .await
            .unwrap();
        let event = record.apply(DeliveryStatus::Expired, json!({}), old);
        store.save_transition(&record, &event).await.unwrap();

        assert_eq!(store.purge_before(Utc::now() - Duration::days(30)).await.unwrap(), 1);

        let events: i64 = store
            .connection
            .lock()
            .query_row("SELECT COUNT(*) FROM tracking_events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(events, 0);
        assert!(store.load_record(record.tracking_id).await.unwrap().is_none());
    }
}
