mod support;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use support::{invoice, mock_regulator::MockRegulator, security};
use taxpoynt_common::TransmissionStatus;
use taxpoynt_metrics::Metrics;
use taxpoynt_transmission::{SecureTransmitter, TransmitterConfig};

fn transmitter(base_url: String, max_retries: u32) -> SecureTransmitter {
    let config = TransmitterConfig {
        base_url,
        max_retries,
        backoff_base_ms: 10,
        connect_timeout_secs: 2,
        request_timeout_secs: 5,
        ..TransmitterConfig::default()
    };
    SecureTransmitter::new(config, security(), Arc::new(Metrics::local())).unwrap()
}

#[tokio::test]
async fn test_delivers_signed_and_encrypted_document() {
    let regulator = MockRegulator::start().await;
    let transmitter = transmitter(regulator.url(), 0);

    let result = transmitter.transmit(&invoice("INV-100")).await;

    assert_eq!(result.status, TransmissionStatus::Delivered);
    assert_eq!(result.transmission_id.as_deref(), Some("FIRS-1"));
    assert!(result.transmitted_at.is_some());
    assert!(result.verified_at.is_some());
    assert!(result.error_message.is_none());

    let submissions = regulator.submissions();
    assert_eq!(submissions.len(), 1);
    let submission = &submissions[0];
    assert_eq!(submission.body["document_id"], "INV-100");
    assert_eq!(submission.body["security_level"], "STANDARD");
    assert!(submission.body["encrypted_data"].as_str().is_some());
    assert!(submission.body["signature"].as_str().is_some());
    assert!(
        !submission.body["encrypted_data"]
            .as_str()
            .unwrap()
            .contains("supplier_tin")
    );
    assert_eq!(submission.api_key.as_deref(), Some("test-api-key"));
    assert_eq!(submission.authorization.as_deref(), Some("Bearer initial-token"));
    assert!(submission.signature.is_some());

    let stats = transmitter.stats();
    assert_eq!(stats.total_transmissions, 1);
    assert_eq!(stats.successful_transmissions, 1);
    assert_eq!(stats.active_transmissions, 0);
}

#[tokio::test]
async fn test_expired_request_never_reaches_network() {
    let regulator = MockRegulator::start().await;
    let transmitter = transmitter(regulator.url(), 0);
    let request = invoice("INV-101").with_expiry(Utc::now() - ChronoDuration::seconds(5));

    let result = transmitter.transmit(&request).await;

    assert_eq!(result.status, TransmissionStatus::Failed);
    assert!(result.error_message.unwrap().contains("Request expired"));
    assert!(regulator.submissions().is_empty());
}

#[tokio::test]
async fn test_unauthorized_refreshes_session_once() {
    let regulator = MockRegulator::start().await;
    regulator.respond_with(401, json!({"error": "token expired"}));
    let transmitter = transmitter(regulator.url(), 0);

    let result = transmitter.transmit(&invoice("INV-102")).await;

    assert_eq!(result.status, TransmissionStatus::Delivered);
    assert_eq!(regulator.refreshes(), 1);
    let submissions = regulator.submissions();
    assert_eq!(submissions.len(), 2);
    assert_eq!(submissions[1].authorization.as_deref(), Some("Bearer fresh-token"));
}

#[tokio::test]
async fn test_repeated_unauthorized_fails_after_one_refresh() {
    let regulator = MockRegulator::start().await;
    regulator.respond_with(401, json!({"error": "nope"}));
    regulator.respond_with(403, json!({"error": "still nope"}));
    let transmitter = transmitter(regulator.url(), 3);

    let result = transmitter.transmit(&invoice("INV-103")).await;

    assert_eq!(result.status, TransmissionStatus::Failed);
    assert!(result.error_message.unwrap().contains("Authentication failed"));
    assert_eq!(regulator.refreshes(), 1);
    assert_eq!(regulator.submissions().len(), 2);
}

#[tokio::test]
async fn test_server_error_is_not_retried_in_place() {
    let regulator = MockRegulator::start().await;
    regulator.respond_with(503, json!({"error": "maintenance"}));
    let transmitter = transmitter(regulator.url(), 3);

    let result = transmitter.transmit(&invoice("INV-104")).await;

    assert_eq!(result.status, TransmissionStatus::Failed);
    assert!(result.error_message.unwrap().contains("Server error (HTTP 503)"));
    assert_eq!(regulator.submissions().len(), 1);
}

#[tokio::test]
async fn test_stale_response_fails_verification() {
    let regulator = MockRegulator::start().await;
    regulator.respond_with(
        200,
        json!({
            "status": "accepted",
            "transmission_id": "FIRS-OLD",
            "timestamp": (Utc::now() - ChronoDuration::hours(1)).timestamp(),
        }),
    );
    let transmitter = transmitter(regulator.url(), 0);

    let result = transmitter.transmit(&invoice("INV-105")).await;

    assert_eq!(result.status, TransmissionStatus::Failed);
    assert!(result.error_message.unwrap().contains("Invalid response"));
}

#[tokio::test]
async fn test_unreachable_endpoint_yields_failed_result() {
    // Nothing listens on port 1.
    let transmitter = transmitter("http://127.0.0.1:1".to_string(), 1);

    let result = transmitter.transmit(&invoice("INV-106")).await;

    assert_eq!(result.status, TransmissionStatus::Failed);
    assert!(result.error_message.is_some());
    assert!(result.transmission_id.is_none());
    assert_eq!(transmitter.stats().failed_transmissions, 1);
    assert!(transmitter.active_transmissions().is_empty());
}
