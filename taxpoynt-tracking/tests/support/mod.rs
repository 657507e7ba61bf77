#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use axum::{Json, Router, routing::post};
use serde_json::Value;
use taxpoynt_metrics::Metrics;
use taxpoynt_tracking::{DeliveryTracker, TrackerConfig, TrackingStore};
use tokio::task::JoinHandle;

pub fn tracker(config: TrackerConfig, store: Arc<dyn TrackingStore>) -> Arc<DeliveryTracker> {
    Arc::new(DeliveryTracker::new(config, store, Arc::new(Metrics::local())).unwrap())
}

/// Collects webhook bodies POSTed to `/hook`.
pub struct WebhookReceiver {
    received: Arc<Mutex<Vec<Value>>>,
    url: String,
    server: JoinHandle<()>,
}

impl WebhookReceiver {
    pub async fn start() -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        let router = Router::new().route(
            "/hook",
            post(move |Json(body): Json<Value>| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(body);
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            received,
            url,
            server,
        }
    }

    pub fn url(&self) -> String {
        self.url.clone()
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until at least `count` bodies have arrived.
    pub async fn wait_for(&self, count: usize) -> Vec<Value> {
        for _ in 0..200 {
            let received = self.received();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("expected {count} webhooks, got {:?}", self.received());
    }
}

impl Drop for WebhookReceiver {
    fn drop(&mut self) {
        self.server.abort();
    }
}
