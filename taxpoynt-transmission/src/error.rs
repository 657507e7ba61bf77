//! Typed error handling for transmission operations.
//!
//! [`TransmissionError`] separates failures into:
//! - Temporary failures (network, timeouts, 5xx, rate limiting) - retry with backoff
//! - Permanent failures (authentication, rejection, malformed responses) - don't retry
//! - System errors - local problems such as key material or configuration
//!
//! The rendered messages become `TransmissionResult::error_message`, which the
//! retry handler classifies by keyword, so each variant's text names its
//! failure class.

use thiserror::Error;

/// Top-level transmission error type.
#[derive(Debug, Error)]
pub enum TransmissionError {
    /// Temporary failure that can be retried with backoff.
    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    /// Permanent failure that should not be retried.
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// System-level error (key material, configuration, internal errors).
    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Temporary errors, typically transport problems or overloaded servers.
#[derive(Debug, Error)]
pub enum TemporaryError {
    /// Could not reach the regulator, or the connection dropped.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connect or read timeout.
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// The regulator answered with a 5xx status.
    #[error("Server error (HTTP {status}): {body}")]
    ServerError { status: u16, body: String },

    /// The regulator asked us to slow down.
    #[error("Rate limited: {0}")]
    RateLimited(String),
}

/// Permanent errors that will not succeed on retry.
#[derive(Debug, Error)]
pub enum PermanentError {
    /// Credentials were rejected, even after a session refresh.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The regulator refused the document.
    #[error("Rejected by regulator (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },

    /// The response was missing required fields or failed verification.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The request's `expires_at` deadline had already passed.
    #[error("Request expired")]
    Expired,
}

/// Local errors unrelated to the remote endpoint.
#[derive(Debug, Error)]
pub enum SystemError {
    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransmissionError {
    /// Returns `true` if this error is temporary and may be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Returns `true` if this error is permanent and should not be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Returns `true` if this is a system error.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// Transport-level failures the secure transmitter retries in place.
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Temporary(TemporaryError::ConnectionFailed(_) | TemporaryError::Timeout(_))
        )
    }

    /// HTTP 401/403, which triggers a session refresh.
    #[must_use]
    pub const fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::Permanent(PermanentError::AuthenticationFailed(_))
        )
    }

    /// Map a non-2xx regulator status to the matching error class.
    #[must_use]
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => PermanentError::AuthenticationFailed(format!("HTTP {status}: {body}")).into(),
            408 => TemporaryError::Timeout(format!("HTTP 408: {body}")).into(),
            429 => TemporaryError::RateLimited(format!("HTTP 429: {body}")).into(),
            500..=599 => TemporaryError::ServerError { status, body }.into(),
            _ => PermanentError::Rejected { status, body }.into(),
        }
    }
}

/// Convert transport errors from `reqwest`.
///
/// - **Timeouts** → Temporary timeout
/// - **Connect/request/body errors** → Temporary connection failure
/// - **Decode errors** → Permanent invalid response
/// - **Builder errors** → System configuration error
impl From<reqwest::Error> for TransmissionError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            TemporaryError::Timeout(error.to_string()).into()
        } else if error.is_decode() {
            PermanentError::InvalidResponse(error.to_string()).into()
        } else if error.is_builder() {
            SystemError::Configuration(error.to_string()).into()
        } else {
            TemporaryError::ConnectionFailed(error.to_string()).into()
        }
    }
}

/// Errors raised synchronously by the batch transmitter before any item is sent.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Batch {batch_id} has {size} items, exceeding the maximum of {max}")]
    TooLarge {
        batch_id: String,
        size: usize,
        max: usize,
    },

    #[error("Batch {batch_id} failed validation: {}", errors.join("; "))]
    Validation {
        batch_id: String,
        errors: Vec<String>,
    },

    #[error("Batch transmitter is shutting down")]
    Closed,
}

/// Errors from the real-time transmitter.
#[derive(Debug, Error)]
pub enum RealTimeError {
    #[error("Real-time queue is closed")]
    QueueClosed,

    #[error("Real-time transmitter is already running")]
    AlreadyRunning,

    #[error("Failed to build callback client: {0}")]
    Webhook(#[from] taxpoynt_common::WebhookError),
}

/// Errors from the live stream server.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Failed to bind stream server to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream server error: {0}")]
    Server(String),
}

/// Errors from the retry handler's management operations.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Dead letter entry not found: {0}")]
    DeadLetterNotFound(uuid::Uuid),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transmission_error_is_temporary() {
        let error: TransmissionError =
            TemporaryError::ConnectionFailed("Connection refused".to_string()).into();
        assert!(error.is_temporary());
        assert!(error.is_network());
        assert!(!error.is_permanent());
        assert!(!error.is_system());
    }

    #[test]
    fn test_transmission_error_is_permanent() {
        let error: TransmissionError = PermanentError::Expired.into();
        assert!(error.is_permanent());
        assert!(!error.is_temporary());
        assert!(!error.is_network());
    }

    #[test]
    fn test_server_error_is_not_network() {
        let error: TransmissionError = TemporaryError::ServerError {
            status: 503,
            body: "maintenance".to_string(),
        }
        .into();
        assert!(error.is_temporary());
        assert!(!error.is_network());
    }

    #[test]
    fn test_status_mapping() {
        assert!(TransmissionError::from_status(401, String::new()).is_unauthorized());
        assert!(TransmissionError::from_status(403, String::new()).is_unauthorized());
        assert!(TransmissionError::from_status(429, String::new()).is_temporary());
        assert!(TransmissionError::from_status(502, String::new()).is_temporary());
        assert!(TransmissionError::from_status(400, String::new()).is_permanent());
        assert!(TransmissionError::from_status(408, String::new()).is_network());
    }

    #[test]
    fn test_error_display() {
        let error: TransmissionError = TemporaryError::Timeout("read timed out".to_string()).into();
        assert_eq!(
            error.to_string(),
            "Temporary failure: Request timeout: read timed out"
        );

        let error: TransmissionError = PermanentError::Rejected {
            status: 422,
            body: "schema".to_string(),
        }
        .into();
        assert_eq!(
            error.to_string(),
            "Permanent failure: Rejected by regulator (HTTP 422): schema"
        );
    }

    #[test]
    fn test_batch_validation_display() {
        let error = BatchError::Validation {
            batch_id: "b1".to_string(),
            errors: vec!["Empty batch".to_string()],
        };
        assert_eq!(error.to_string(), "Batch b1 failed validation: Empty batch");
    }
}
