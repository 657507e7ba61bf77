use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Settings for the [`DeliveryTracker`](crate::DeliveryTracker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// `SQLite` database file. Records are kept in memory only when unset.
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// How often the monitor looks for overdue deliveries.
    #[serde(default = "defaults::polling_interval_secs")]
    pub polling_interval_secs: u64,

    #[serde(default = "defaults::cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Finished records older than this are purged.
    #[serde(default = "defaults::retention_days")]
    pub retention_days: u32,

    #[serde(default = "defaults::event_queue_size")]
    pub event_queue_size: usize,

    #[serde(default = "defaults::notification_queue_size")]
    pub notification_queue_size: usize,

    #[serde(default = "defaults::webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,

    /// Receives every transition, in addition to per-record callback URLs.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            polling_interval_secs: defaults::polling_interval_secs(),
            cleanup_interval_secs: defaults::cleanup_interval_secs(),
            retention_days: defaults::retention_days(),
            event_queue_size: defaults::event_queue_size(),
            notification_queue_size: defaults::notification_queue_size(),
            webhook_timeout_secs: defaults::webhook_timeout_secs(),
            webhook_url: None,
        }
    }
}

impl TrackerConfig {
    #[must_use]
    pub const fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    #[must_use]
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    #[must_use]
    pub const fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

mod defaults {
    pub const fn polling_interval_secs() -> u64 {
        60
    }

    pub const fn cleanup_interval_secs() -> u64 {
        3600
    }

    pub const fn retention_days() -> u32 {
        30
    }

    pub const fn event_queue_size() -> usize {
        1000
    }

    pub const fn notification_queue_size() -> usize {
        1000
    }

    pub const fn webhook_timeout_secs() -> u64 {
        10
    }
}
