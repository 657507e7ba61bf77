#![allow(dead_code)]

pub mod mock_regulator;
pub mod scripted;

use std::sync::Arc;

use serde_json::json;
use taxpoynt_common::{SecurityContext, TransmissionRequest};
use zeroize::Zeroizing;

pub fn security() -> Arc<SecurityContext> {
    Arc::new(SecurityContext {
        encryption_key: Zeroizing::new(b"integration-test-shared-secret".to_vec()),
        signing_key: Zeroizing::new(vec![0x2a; 32]),
        recipient_public_key: None,
        certificate_chain: Vec::new(),
        client_id: "taxpoynt-test".to_string(),
        api_key: "test-api-key".to_string(),
        session_token: Some("initial-token".to_string()),
    })
}

pub fn invoice(document_id: &str) -> TransmissionRequest {
    TransmissionRequest::new(
        document_id,
        "invoice",
        json!({"supplier_tin": "12345678-0001", "total": 1075.0}),
        "/submit",
    )
}
