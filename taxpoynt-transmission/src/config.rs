//! Configuration for the transmitters and the retry handler.
//!
//! Every field has a serde default so a RON section may name only the values
//! it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::{CircuitBreakerConfig, RetryPolicy};

/// Settings for the [`SecureTransmitter`](crate::SecureTransmitter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransmitterConfig {
    /// Regulator base URL; request endpoints are appended to it.
    #[serde(default = "defaults::base_url")]
    pub base_url: String,

    #[serde(default = "defaults::connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Whole-request timeout, covering connect, send and read.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// In-place retries for network-level failures.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// Base of the `base * 2^attempt` backoff between in-place retries.
    #[serde(default = "defaults::backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Maximum distance between the response timestamp and local time.
    #[serde(default = "defaults::clock_skew_tolerance_secs")]
    pub clock_skew_tolerance_secs: u64,

    /// Path, relative to `base_url`, that issues new session tokens.
    #[serde(default = "defaults::auth_refresh_path")]
    pub auth_refresh_path: String,

    /// Accept invalid TLS certificates (for testing only)
    ///
    /// **SECURITY WARNING**: disables certificate validation for the
    /// regulator connection.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::base_url(),
            connect_timeout_secs: defaults::connect_timeout_secs(),
            request_timeout_secs: defaults::request_timeout_secs(),
            max_retries: defaults::max_retries(),
            backoff_base_ms: defaults::backoff_base_ms(),
            clock_skew_tolerance_secs: defaults::clock_skew_tolerance_secs(),
            auth_refresh_path: defaults::auth_refresh_path(),
            accept_invalid_certs: false,
        }
    }
}

impl TransmitterConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub const fn clock_skew_tolerance(&self) -> Duration {
        Duration::from_secs(self.clock_skew_tolerance_secs)
    }

    /// Delay before in-place retry number `attempt` (0-indexed).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        exponential(self.backoff_base_ms, attempt)
    }
}

/// Settings for the [`BatchTransmitter`](crate::BatchTransmitter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "defaults::max_batch_size")]
    pub max_batch_size: usize,

    /// Batches processed at the same time; further batches wait.
    #[serde(default = "defaults::max_concurrent_batches")]
    pub max_concurrent_batches: usize,

    /// Attempts per item when the batch asks for retries.
    #[serde(default = "defaults::item_max_attempts")]
    pub item_max_attempts: u32,

    /// Base of the `base * 2^attempt` backoff between item attempts.
    #[serde(default = "defaults::backoff_base_ms")]
    pub item_backoff_base_ms: u64,

    /// Groups at or below this size run fully parallel under the optimized strategy.
    #[serde(default = "defaults::parallel_group_limit")]
    pub parallel_group_limit: usize,

    /// Finished batches kept for status queries.
    #[serde(default = "defaults::history_limit")]
    pub history_limit: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: defaults::max_batch_size(),
            max_concurrent_batches: defaults::max_concurrent_batches(),
            item_max_attempts: defaults::item_max_attempts(),
            item_backoff_base_ms: defaults::backoff_base_ms(),
            parallel_group_limit: defaults::parallel_group_limit(),
            history_limit: defaults::history_limit(),
        }
    }
}

impl BatchConfig {
    /// Delay after failed item attempt number `attempt` (0-indexed).
    #[must_use]
    pub fn item_backoff(&self, attempt: u32) -> Duration {
        exponential(self.item_backoff_base_ms, attempt)
    }
}

/// Settings for the [`RealTimeTransmitter`](crate::RealTimeTransmitter).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealTimeConfig {
    /// Transmissions allowed in flight at once, independent of queue depth.
    #[serde(default = "defaults::max_concurrent_transmissions")]
    pub max_concurrent_transmissions: usize,

    /// Capacity of the priority queue, the event queue and each connection buffer.
    #[serde(default = "defaults::stream_buffer_size")]
    pub stream_buffer_size: usize,

    #[serde(default = "defaults::heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Connections silent for longer than this are evicted.
    #[serde(default = "defaults::connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    /// Finished results kept for lookups.
    #[serde(default = "defaults::history_limit")]
    pub result_history_limit: usize,

    #[serde(default = "defaults::webhook_timeout_secs")]
    pub callback_timeout_secs: u64,

    /// How long shutdown waits for in-flight transmissions.
    #[serde(default = "defaults::drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for RealTimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transmissions: defaults::max_concurrent_transmissions(),
            stream_buffer_size: defaults::stream_buffer_size(),
            heartbeat_interval_secs: defaults::heartbeat_interval_secs(),
            connection_timeout_secs: defaults::connection_timeout_secs(),
            result_history_limit: defaults::history_limit(),
            callback_timeout_secs: defaults::webhook_timeout_secs(),
            drain_timeout_secs: defaults::drain_timeout_secs(),
        }
    }
}

impl RealTimeConfig {
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    #[must_use]
    pub const fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

/// Listen address of the live stream websocket server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "defaults::stream_listen_address")]
    pub listen_address: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            listen_address: defaults::stream_listen_address(),
        }
    }
}

/// Settings for the [`RetryHandler`](crate::RetryHandler).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryHandlerConfig {
    /// Policy used when the caller does not supply one.
    #[serde(default)]
    pub default_policy: RetryPolicy,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default = "defaults::dead_letter_capacity")]
    pub dead_letter_capacity: usize,

    #[serde(default = "defaults::cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Finished retry records older than this are dropped by the cleanup loop.
    #[serde(default = "defaults::completed_retention_secs")]
    pub completed_retention_secs: u64,
}

impl Default for RetryHandlerConfig {
    fn default() -> Self {
        Self {
            default_policy: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            dead_letter_capacity: defaults::dead_letter_capacity(),
            cleanup_interval_secs: defaults::cleanup_interval_secs(),
            completed_retention_secs: defaults::completed_retention_secs(),
        }
    }
}

impl RetryHandlerConfig {
    #[must_use]
    pub const fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    #[must_use]
    pub const fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }
}

fn exponential(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

mod defaults {
    pub fn base_url() -> String {
        "https://api.einvoice.firs.gov.ng".to_string()
    }

    pub const fn connect_timeout_secs() -> u64 {
        10
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }

    pub const fn max_retries() -> u32 {
        3
    }

    pub const fn backoff_base_ms() -> u64 {
        1000 // 2^attempt seconds
    }

    pub const fn clock_skew_tolerance_secs() -> u64 {
        300
    }

    pub fn auth_refresh_path() -> String {
        "/auth/refresh".to_string()
    }

    pub const fn max_batch_size() -> usize {
        1000
    }

    pub const fn max_concurrent_batches() -> usize {
        5
    }

    pub const fn item_max_attempts() -> u32 {
        3
    }

    pub const fn parallel_group_limit() -> usize {
        5
    }

    pub const fn history_limit() -> usize {
        1000
    }

    pub const fn max_concurrent_transmissions() -> usize {
        50
    }

    pub const fn stream_buffer_size() -> usize {
        1000
    }

    pub const fn heartbeat_interval_secs() -> u64 {
        30
    }

    pub const fn connection_timeout_secs() -> u64 {
        90
    }

    pub const fn webhook_timeout_secs() -> u64 {
        10
    }

    pub const fn drain_timeout_secs() -> u64 {
        30
    }

    pub fn stream_listen_address() -> String {
        "127.0.0.1:8765".to_string()
    }

    pub const fn dead_letter_capacity() -> usize {
        1000
    }

    pub const fn cleanup_interval_secs() -> u64 {
        300
    }

    pub const fn completed_retention_secs() -> u64 {
        3600
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transmitter_backoff_doubles() {
        let config = TransmitterConfig::default();
        assert_eq!(config.backoff(0), Duration::from_secs(1));
        assert_eq!(config.backoff(1), Duration::from_secs(2));
        assert_eq!(config.backoff(2), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_saturates() {
        let config = BatchConfig::default();
        assert_eq!(config.item_backoff(200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_partial_ron_uses_defaults() {
        let config: TransmitterConfig =
            ron::from_str(r#"(base_url: "http://localhost:9000", max_retries: 1)"#).unwrap();
        assert_eq!(config.base_url, "http://localhost:9000");
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.clock_skew_tolerance_secs, 300);
        assert_eq!(config.auth_refresh_path, "/auth/refresh");
    }
}
