use thiserror::Error;
use uuid::Uuid;

use crate::record::DeliveryStatus;

/// Errors from the delivery tracker.
#[derive(Debug, Error)]
pub enum TrackingError {
    #[error("No delivery record for tracking id {0}")]
    NotFound(Uuid),

    #[error("Delivery {tracking_id} cannot move from {from} to {to}")]
    InvalidTransition {
        tracking_id: Uuid,
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    #[error("Tracking store error: {0}")]
    Store(#[from] StoreError),

    #[error("Delivery tracker is already running")]
    AlreadyRunning,

    #[error("Failed to build notification client: {0}")]
    Webhook(#[from] taxpoynt_common::WebhookError),
}

/// Errors from a [`TrackingStore`](crate::store::TrackingStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage task failed: {0}")]
    Task(String),

    #[error("Unknown delivery record {0}")]
    UnknownRecord(Uuid),
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        Self::Database(error.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(error: tokio::task::JoinError) -> Self {
        Self::Task(error.to_string())
    }
}
