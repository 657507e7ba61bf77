//! A [`DocumentTransmitter`] that replays scripted outcomes per document.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use taxpoynt_common::{TransmissionRequest, TransmissionResult, TransmissionStatus};
use taxpoynt_transmission::DocumentTransmitter;

#[derive(Debug, Clone)]
pub enum Outcome {
    Deliver,
    /// Delivered, with `"acknowledged": true` in the response.
    DeliverAcknowledged,
    Fail(String),
    Panic,
}

#[derive(Default)]
pub struct ScriptedTransmitter {
    script: Mutex<HashMap<String, VecDeque<Outcome>>>,
    delay: Duration,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedTransmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Outcomes for `document_id`, consumed in order; once exhausted the
    /// document is delivered.
    pub fn script(&self, document_id: &str, outcomes: impl IntoIterator<Item = Outcome>) {
        self.script
            .lock()
            .unwrap()
            .entry(document_id.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Document ids in the order attempts started.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn attempts(&self, document_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| *call == document_id)
            .count()
    }

    /// Highest number of simultaneous in-flight attempts observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentTransmitter for ScriptedTransmitter {
    async fn transmit_document(&self, request: &TransmissionRequest) -> TransmissionResult {
        self.calls.lock().unwrap().push(request.document_id.clone());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.peak.fetch_max(current, Ordering::SeqCst);

        let outcome = self
            .script
            .lock()
            .unwrap()
            .get_mut(&request.document_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Outcome::Deliver);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let mut result = TransmissionResult::pending(&request.document_id);
        match outcome {
            Outcome::Deliver | Outcome::DeliverAcknowledged => {
                let acknowledged = matches!(outcome, Outcome::DeliverAcknowledged);
                result.status = TransmissionStatus::Delivered;
                result.transmission_id = Some(format!("FIRS-{}", request.document_id));
                result.transmitted_at = Some(Utc::now());
                result.verified_at = Some(Utc::now());
                result.response_data = Some(json!({
                    "status": "accepted",
                    "acknowledged": acknowledged,
                }));
            }
            Outcome::Fail(message) => {
                result.status = TransmissionStatus::Failed;
                result.error_message = Some(message);
            }
            Outcome::Panic => panic!("scripted panic for {}", request.document_id),
        }
        result
    }
}
