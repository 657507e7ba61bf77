//! Data exchanged between callers and the transmitters.
//!
//! A [`TransmissionRequest`] is built once by the caller and never mutated
//! afterwards; every attempt to send it produces a fresh
//! [`TransmissionResult`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Encryption strength requested for a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityLevel {
    #[default]
    Standard,
    High,
    Maximum,
}

impl SecurityLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "STANDARD",
            Self::High => "HIGH",
            Self::Maximum => "MAXIMUM",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage of the secure transmission pipeline.
///
/// ```text
/// PENDING -> ENCRYPTING -> SIGNING -> TRANSMITTING -> DELIVERED | FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransmissionStatus {
    #[default]
    Pending,
    Encrypting,
    Signing,
    Transmitting,
    Delivered,
    Failed,
}

impl TransmissionStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        match self {
            Self::Delivered | Self::Failed => true,
            Self::Pending | Self::Encrypting | Self::Signing | Self::Transmitting => false,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Encrypting => "ENCRYPTING",
            Self::Signing => "SIGNING",
            Self::Transmitting => "TRANSMITTING",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TransmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single document to deliver to the regulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmissionRequest {
    pub document_id: String,
    pub document_type: String,
    /// Opaque payload, encrypted before it leaves the process.
    pub document_data: Value,
    pub destination_endpoint: String,
    #[serde(default)]
    pub security_level: SecurityLevel,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TransmissionRequest {
    pub fn new(
        document_id: impl Into<String>,
        document_type: impl Into<String>,
        document_data: Value,
        destination_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            document_type: document_type.into(),
            document_data,
            destination_endpoint: destination_endpoint.into(),
            security_level: SecurityLevel::default(),
            priority: 0,
            metadata: Map::new(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[must_use]
    pub const fn with_security_level(mut self, security_level: SecurityLevel) -> Self {
        self.security_level = security_level;
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    #[must_use]
    pub const fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the request's deadline has passed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

/// Outcome of one transmission attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmissionResult {
    pub request_id: Uuid,
    pub document_id: String,
    pub status: TransmissionStatus,
    /// Regulator-assigned identifier, only present on success.
    pub transmission_id: Option<String>,
    pub response_data: Option<Value>,
    pub error_message: Option<String>,
    pub transmitted_at: Option<DateTime<Utc>>,
    pub verified_at: Option<DateTime<Utc>>,
}

impl TransmissionResult {
    /// A fresh `PENDING` result for `document_id`.
    pub fn pending(document_id: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            document_id: document_id.into(),
            status: TransmissionStatus::Pending,
            transmission_id: None,
            response_data: None,
            error_message: None,
            transmitted_at: None,
            verified_at: None,
        }
    }

    /// A `FAILED` result that never reached the network.
    pub fn failed(document_id: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            status: TransmissionStatus::Failed,
            error_message: Some(error_message.into()),
            ..Self::pending(document_id)
        }
    }

    #[must_use]
    pub fn is_delivered(&self) -> bool {
        self.status == TransmissionStatus::Delivered
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status == TransmissionStatus::Failed
    }
}

/// Key material and credentials shared by every transmission.
///
/// Injected once at construction and only ever read afterwards.
#[derive(Clone)]
pub struct SecurityContext {
    /// Pre-shared symmetric secret; AES keys are derived from it.
    pub encryption_key: Zeroizing<Vec<u8>>,
    /// secp256k1 private scalar used for payload signatures.
    pub signing_key: Zeroizing<Vec<u8>>,
    /// Regulator's SEC1-encoded public key, needed for `MAXIMUM` security.
    pub recipient_public_key: Option<Vec<u8>>,
    /// PEM certificates trusted in addition to the system roots.
    pub certificate_chain: Vec<String>,
    pub client_id: String,
    pub api_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("encryption_key", &"<redacted>")
            .field("signing_key", &"<redacted>")
            .field(
                "recipient_public_key",
                &self.recipient_public_key.as_ref().map(Vec::len),
            )
            .field("certificate_chain", &self.certificate_chain.len())
            .field("client_id", &self.client_id)
            .field("api_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_expiry() {
        let now = Utc::now();
        let request = TransmissionRequest::new("INV-1", "invoice", json!({"total": 10}), "/submit");
        assert!(!request.is_expired(now));

        let request = request.with_expiry(now - Duration::seconds(1));
        assert!(request.is_expired(now));
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_value(TransmissionStatus::Delivered).unwrap_or_default(),
            json!("DELIVERED")
        );
        assert_eq!(
            serde_json::from_value::<SecurityLevel>(json!("MAXIMUM")).ok(),
            Some(SecurityLevel::Maximum)
        );
    }

    #[test]
    fn test_failed_result_carries_message() {
        let result = TransmissionResult::failed("INV-9", "Request expired");
        assert!(result.is_failed());
        assert!(!result.is_delivered());
        assert_eq!(result.error_message.as_deref(), Some("Request expired"));
        assert!(result.transmission_id.is_none());
    }

    #[test]
    fn test_security_context_debug_is_redacted() {
        let context = SecurityContext {
            encryption_key: Zeroizing::new(b"secret-key".to_vec()),
            signing_key: Zeroizing::new(vec![7; 32]),
            recipient_public_key: None,
            certificate_chain: Vec::new(),
            client_id: "client".to_string(),
            api_key: "api-key-value".to_string(),
            session_token: Some("token-value".to_string()),
        };

        let debug = format!("{context:?}");
        assert!(!debug.contains("secret-key"));
        assert!(!debug.contains("api-key-value"));
        assert!(!debug.contains("token-value"));
        assert!(debug.contains("client"));
    }
}
