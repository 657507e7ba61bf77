//! Delivery lifecycle tracking.
//!
//! The [`DeliveryTracker`] keeps one [`DeliveryRecord`] per tracked delivery,
//! persists every transition through a [`TrackingStore`], maintains running
//! analytics and fans transitions out to callbacks and webhooks. It also
//! implements [`taxpoynt_common::DeliveryReporter`], so the transmitters can
//! report outcomes to it directly.

pub mod analytics;
pub mod config;
pub mod error;
pub mod record;
pub mod store;
mod tracker;

pub use analytics::{AnalyticsSnapshot, OutcomeStats};
pub use config::TrackerConfig;
pub use error::{StoreError, TrackingError};
pub use record::{DeliveryRecord, DeliveryStatus, NewDelivery, TrackingEvent};
pub use store::{MemoryStore, SqliteStore, TrackingStore};
pub use tracker::{DeliveryTracker, StatusCallback};
