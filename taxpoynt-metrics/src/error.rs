//! Error types for metrics operations

use thiserror::Error;

/// Errors that can occur during metrics operations
#[derive(Debug, Error)]
pub enum MetricsError {
    /// OpenTelemetry SDK error
    #[error("OpenTelemetry error: {0}")]
    OpenTelemetry(String),

    /// Flushing or shutting down the meter provider failed
    #[error("Meter provider shutdown failed: {0}")]
    Shutdown(String),
}
