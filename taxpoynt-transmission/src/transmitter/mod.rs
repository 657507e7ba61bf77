//! Secure single-document transmission.
//!
//! ```text
//! PENDING -> ENCRYPTING -> SIGNING -> TRANSMITTING -> DELIVERED | FAILED
//! ```
//!
//! Every stage failure is folded into the returned [`TransmissionResult`];
//! [`SecureTransmitter::transmit`] has no error path.

mod verify;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde_json::{Value, json};
use taxpoynt_common::{
    SecurityContext, TransmissionRequest, TransmissionResult, TransmissionStatus, incoming,
    outgoing,
};
use taxpoynt_metrics::Metrics;
use taxpoynt_tracing::traced;
use uuid::Uuid;

pub use verify::verify_response;

use crate::{
    config::TransmitterConfig,
    crypto,
    error::{PermanentError, SystemError, TransmissionError},
};

/// Anything that can turn a request into a result.
///
/// Implementations never fail: problems are reported through a `FAILED`
/// result.
#[async_trait]
pub trait DocumentTransmitter: Send + Sync {
    async fn transmit_document(&self, request: &TransmissionRequest) -> TransmissionResult;
}

/// An in-flight transmission, visible through [`SecureTransmitter::active_transmissions`].
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTransmission {
    pub request_id: Uuid,
    pub document_id: String,
    pub destination_endpoint: String,
    pub status: TransmissionStatus,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    encryption_time: Duration,
    signing_time: Duration,
    transmission_time: Duration,
    total_time: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransmitterStats {
    pub total_transmissions: u64,
    pub successful_transmissions: u64,
    pub failed_transmissions: u64,
    pub active_transmissions: usize,
    pub encryption_time: Duration,
    pub signing_time: Duration,
    pub transmission_time: Duration,
    pub average_transmission_time: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Encryption,
    Signing,
    Transmission,
}

impl Stage {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Encryption => "encryption",
            Self::Signing => "signing",
            Self::Transmission => "transmission",
        }
    }
}

/// Removes the active-map entry however the transmission ends.
struct ActiveGuard<'a> {
    active: &'a DashMap<Uuid, ActiveTransmission>,
    request_id: Uuid,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.request_id);
    }
}

pub struct SecureTransmitter {
    config: TransmitterConfig,
    security: Arc<SecurityContext>,
    client: reqwest::Client,
    session_token: parking_lot::RwLock<Option<String>>,
    active: DashMap<Uuid, ActiveTransmission>,
    counters: parking_lot::Mutex<Counters>,
    metrics: Arc<Metrics>,
}

impl SecureTransmitter {
    /// Build the transmitter and its HTTP client.
    ///
    /// PEM certificates in the security context's chain are trusted in addition
    /// to the platform roots.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a certificate cannot be parsed or the
    /// HTTP client cannot be built.
    pub fn new(
        config: TransmitterConfig,
        security: Arc<SecurityContext>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, TransmissionError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if config.accept_invalid_certs {
            tracing::warn!("TLS certificate validation is DISABLED for the regulator connection");
        }

        for pem in &security.certificate_chain {
            let certificate = reqwest::Certificate::from_pem(pem.as_bytes()).map_err(|e| {
                SystemError::Configuration(format!("Invalid certificate in chain: {e}"))
            })?;
            builder = builder.add_root_certificate(certificate);
        }

        let client = builder
            .build()
            .map_err(|e| SystemError::Configuration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            session_token: parking_lot::RwLock::new(security.session_token.clone()),
            config,
            security,
            client,
            active: DashMap::new(),
            counters: parking_lot::Mutex::new(Counters::default()),
            metrics,
        })
    }

    /// Run the full pipeline for `request`.
    #[traced(
        instrument(level = tracing::Level::DEBUG, skip_all, fields(document_id = %request.document_id)),
        timing(precision = "ms")
    )]
    pub async fn transmit(&self, request: &TransmissionRequest) -> TransmissionResult {
        let started = Instant::now();
        let mut result = TransmissionResult::pending(&request.document_id);

        self.active.insert(
            result.request_id,
            ActiveTransmission {
                request_id: result.request_id,
                document_id: request.document_id.clone(),
                destination_endpoint: request.destination_endpoint.clone(),
                status: TransmissionStatus::Pending,
                started_at: Utc::now(),
            },
        );
        let _active = ActiveGuard {
            active: &self.active,
            request_id: result.request_id,
        };
        self.metrics.transmission.record_started();

        if let Err(e) = self.run_pipeline(request, &mut result).await {
            tracing::warn!(
                document_id = %request.document_id,
                stage = %result.status,
                "Transmission failed: {e}"
            );
            result.status = TransmissionStatus::Failed;
            result.error_message = Some(e.to_string());
        }

        let elapsed = started.elapsed();
        let delivered = result.is_delivered();
        {
            let mut counters = self.counters.lock();
            counters.total += 1;
            if delivered {
                counters.successful += 1;
            } else {
                counters.failed += 1;
            }
            counters.total_time += elapsed;
        }
        self.metrics
            .transmission
            .record_finished(delivered, elapsed.as_secs_f64());

        result
    }

    fn set_status(&self, result: &mut TransmissionResult, status: TransmissionStatus) {
        result.status = status;
        if let Some(mut active) = self.active.get_mut(&result.request_id) {
            active.status = status;
        }
    }

    fn record_stage(&self, stage: Stage, elapsed: Duration) {
        {
            let mut counters = self.counters.lock();
            match stage {
                Stage::Encryption => counters.encryption_time += elapsed,
                Stage::Signing => counters.signing_time += elapsed,
                Stage::Transmission => counters.transmission_time += elapsed,
            }
        }
        self.metrics
            .transmission
            .record_stage(stage.as_str(), elapsed.as_secs_f64());
    }

    async fn run_pipeline(
        &self,
        request: &TransmissionRequest,
        result: &mut TransmissionResult,
    ) -> Result<(), TransmissionError> {
        if request.is_expired(Utc::now()) {
            return Err(PermanentError::Expired.into());
        }

        self.set_status(result, TransmissionStatus::Encrypting);
        let stage = Instant::now();
        let encrypted_data = crypto::encrypt_document(
            &request.document_data,
            request.security_level,
            &self.security,
            request.document_id.as_bytes(),
        )?;
        self.record_stage(Stage::Encryption, stage.elapsed());

        self.set_status(result, TransmissionStatus::Signing);
        let stage = Instant::now();
        let timestamp = Utc::now().timestamp();
        let signature = crypto::sign_payload(
            &encrypted_data,
            timestamp,
            &self.security,
            request.security_level,
        )?;
        self.record_stage(Stage::Signing, stage.elapsed());

        self.set_status(result, TransmissionStatus::Transmitting);
        let stage = Instant::now();
        let payload = json!({
            "document_id": request.document_id,
            "document_type": request.document_type,
            "encrypted_data": encrypted_data,
            "signature": signature,
            "security_level": request.security_level.as_str(),
            "timestamp": timestamp,
            "metadata": request.metadata,
        });
        let response = self.send(&request.destination_endpoint, &payload).await;
        self.record_stage(Stage::Transmission, stage.elapsed());
        let response = response?;
        result.transmitted_at = Some(Utc::now());

        verify_response(&response, self.config.clock_skew_tolerance(), Utc::now())?;
        result.verified_at = Some(Utc::now());
        result.transmission_id = response
            .get("transmission_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        result.response_data = Some(response);
        result.status = TransmissionStatus::Delivered;

        incoming!(
            level = INFO,
            "Document {} delivered as {}",
            request.document_id,
            result.transmission_id.as_deref().unwrap_or("<unassigned>")
        );

        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// POST with in-place retries for network failures and one session
    /// refresh on 401/403. The refresh does not count as a retry.
    async fn send(&self, endpoint: &str, payload: &Value) -> Result<Value, TransmissionError> {
        let url = self.url(endpoint);
        let body = serde_json::to_vec(payload).map_err(SystemError::from)?;
        let mut attempt = 0;
        let mut refreshed = false;

        loop {
            match self.post(&url, &body).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_unauthorized() && !refreshed => {
                    refreshed = true;
                    incoming!(level = WARN, "{url} rejected credentials, refreshing session: {e}");
                    self.refresh_session().await.map_err(|refresh| {
                        PermanentError::AuthenticationFailed(format!(
                            "session refresh failed: {refresh}"
                        ))
                    })?;
                }
                Err(e) if e.is_network() && attempt < self.config.max_retries => {
                    let delay = self.config.backoff(attempt);
                    attempt += 1;
                    tracing::warn!(
                        url,
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_secs = delay.as_secs_f64(),
                        "Network failure, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post(&self, url: &str, body: &[u8]) -> Result<Value, TransmissionError> {
        let timestamp = Utc::now().timestamp();
        let request_id = Uuid::new_v4().to_string();
        let signature =
            crypto::request_signature(&self.security.api_key, body, timestamp, &request_id)?;

        let mut builder = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header("X-API-Key", &self.security.api_key)
            .header("X-Timestamp", timestamp.to_string())
            .header("X-Request-ID", &request_id)
            .header("X-Signature", signature)
            .body(body.to_vec());

        let token = self.session_token.read().clone();
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        outgoing!(level = DEBUG, "POST {url} request_id={request_id}");
        let response = builder.send().await?;
        let status = response.status();
        incoming!(level = DEBUG, "{url} responded {status} request_id={request_id}");

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransmissionError::from_status(status.as_u16(), text));
        }

        Ok(response.json::<Value>().await?)
    }

    /// Obtain a new session token from the regulator.
    ///
    /// # Errors
    ///
    /// Fails on transport errors, a non-2xx status, or a response without a
    /// `session_token`.
    pub async fn refresh_session(&self) -> Result<(), TransmissionError> {
        let url = self.url(&self.config.auth_refresh_path);
        outgoing!(level = INFO, "Refreshing session token at {url}");

        let response = self
            .client
            .post(&url)
            .header("X-API-Key", &self.security.api_key)
            .json(&json!({ "client_id": self.security.client_id }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PermanentError::AuthenticationFailed(format!(
                "session refresh returned HTTP {status}"
            ))
            .into());
        }

        let body = response.json::<Value>().await?;
        let token = body
            .get("session_token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                PermanentError::InvalidResponse("refresh response missing session_token".into())
            })?;

        *self.session_token.write() = Some(token.to_string());
        incoming!(level = INFO, "Session token refreshed");
        Ok(())
    }

    /// Snapshot of the transmissions currently in flight.
    pub fn active_transmissions(&self) -> Vec<ActiveTransmission> {
        self.active.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn stats(&self) -> TransmitterStats {
        let counters = self.counters.lock();
        let average_transmission_time = u32::try_from(counters.total)
            .ok()
            .filter(|total| *total > 0)
            .map_or(Duration::ZERO, |total| counters.total_time / total);

        TransmitterStats {
            total_transmissions: counters.total,
            successful_transmissions: counters.successful,
            failed_transmissions: counters.failed,
            active_transmissions: self.active.len(),
            encryption_time: counters.encryption_time,
            signing_time: counters.signing_time,
            transmission_time: counters.transmission_time,
            average_transmission_time,
        }
    }
}

#[async_trait]
impl DocumentTransmitter for SecureTransmitter {
    async fn transmit_document(&self, request: &TransmissionRequest) -> TransmissionResult {
        self.transmit(request).await
    }
}
