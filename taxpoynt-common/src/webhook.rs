//! Fire-and-forget JSON webhooks.
//!
//! Callers decide what to do with a failure; the tracker and the real-time
//! transmitter both log and drop it.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Default upper bound on a single webhook POST.
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Failed to build webhook client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Webhook request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Webhook {url} responded with HTTP {status}")]
    Status { url: String, status: u16 },
}

#[derive(Debug, Clone)]
pub struct WebhookClient {
    client: reqwest::Client,
}

impl WebhookClient {
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client cannot be constructed.
    pub fn new(timeout: Duration) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(WebhookError::Client)?;

        Ok(Self { client })
    }

    /// POST `payload` as JSON to `url`.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-2xx response.
    pub async fn post(&self, url: &str, payload: &Value) -> Result<(), WebhookError> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|source| WebhookError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(WebhookError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::{Json, Router, http::StatusCode, routing::post};
    use serde_json::json;

    use super::*;

    async fn spawn_receiver(status: StatusCode) -> (String, Arc<Mutex<Vec<Value>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let router = Router::new().route(
            "/hook",
            post(move |Json(body): Json<Value>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(body);
                    status
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        (format!("http://{addr}/hook"), received)
    }

    #[tokio::test]
    async fn test_webhook_delivers_payload() {
        let (url, received) = spawn_receiver(StatusCode::OK).await;
        let client = WebhookClient::new(DEFAULT_WEBHOOK_TIMEOUT).unwrap();

        client
            .post(&url, &json!({"document_id": "INV-1", "status": "DELIVERED"}))
            .await
            .unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["document_id"], "INV-1");
    }

    #[tokio::test]
    async fn test_webhook_reports_error_status() {
        let (url, _received) = spawn_receiver(StatusCode::INTERNAL_SERVER_ERROR).await;
        let client = WebhookClient::new(DEFAULT_WEBHOOK_TIMEOUT).unwrap();

        let err = client.post(&url, &json!({})).await.unwrap_err();
        assert!(matches!(err, WebhookError::Status { status: 500, .. }));
    }
}
