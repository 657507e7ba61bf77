//! OpenTelemetry metrics for the TaxPoynt transmission subsystem
//!
//! A [`Metrics`] collector is built once at start-up and handed to each
//! component through its constructor. Every instrument has a local atomic
//! counterpart so components and tests can read a snapshot without going
//! through an exporter.
//!
//! ```text
//! TaxPoynt → OTLP/HTTP → OpenTelemetry Collector → Prometheus → Grafana
//! ```
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use taxpoynt_metrics::{Metrics, MetricsConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MetricsConfig {
//!     enabled: true,
//!     endpoint: "http://localhost:4318/v1/metrics".to_string(),
//! };
//!
//! let metrics = Arc::new(Metrics::init(&config)?);
//! metrics.transmission.record_started();
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod exporter;
mod retry;
mod tracking;
mod transmission;

use opentelemetry::metrics::MeterProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;

pub use config::MetricsConfig;
pub use error::MetricsError;
pub use retry::{RetryMetrics, RetrySnapshot};
pub use tracking::{TrackingMetrics, TrackingSnapshot};
pub use transmission::{TransmissionMetrics, TransmissionSnapshot};

/// Root metrics container
#[derive(Debug)]
pub struct Metrics {
    pub transmission: TransmissionMetrics,
    pub retry: RetryMetrics,
    pub tracking: TrackingMetrics,
    provider: SdkMeterProvider,
}

impl Metrics {
    /// Build the collector, exporting over OTLP when `config.enabled` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the OTLP exporter cannot be created.
    pub fn init(config: &MetricsConfig) -> Result<Self, MetricsError> {
        if !config.enabled {
            tracing::info!("Metrics export is disabled");
            return Ok(Self::local());
        }

        tracing::info!(
            endpoint = %config.endpoint,
            "Initializing OpenTelemetry metrics with OTLP exporter"
        );

        let provider = exporter::otlp_provider(&config.endpoint)?;
        Ok(Self::with_provider(provider))
    }

    /// A collector that counts locally but exports nothing.
    #[must_use]
    pub fn local() -> Self {
        Self::with_provider(exporter::local_provider())
    }

    fn with_provider(provider: SdkMeterProvider) -> Self {
        let meter = provider.meter("taxpoynt");

        Self {
            transmission: TransmissionMetrics::new(&meter),
            retry: RetryMetrics::new(&meter),
            tracking: TrackingMetrics::new(&meter),
            provider,
        }
    }

    /// Flush pending exports and stop the periodic reader.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider fails to shut down cleanly.
    pub fn shutdown(&self) -> Result<(), MetricsError> {
        self.provider
            .shutdown()
            .map_err(|e| MetricsError::Shutdown(e.to_string()))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_metrics_count() {
        let metrics = Metrics::local();

        metrics.transmission.record_started();
        metrics.transmission.record_finished(true, 0.25);
        metrics.transmission.record_started();
        metrics.transmission.record_finished(false, 0.5);

        let snapshot = metrics.transmission.snapshot();
        assert_eq!(snapshot.started, 2);
        assert_eq!(snapshot.delivered, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.active, 0);
    }

    #[test]
    fn test_disabled_config_builds_local_collector() {
        let metrics = Metrics::init(&MetricsConfig::default()).unwrap();
        metrics.retry.record_scheduled();
        assert_eq!(metrics.retry.snapshot().scheduled, 1);
    }
}
