//! Bounded holding area for retries that ran out of attempts.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use super::RetryRequest;

/// A dead-lettered retry, with everything needed to reprocess it by hand.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub retry: RetryRequest,
    pub final_error: Option<String>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    #[must_use]
    pub const fn retry_id(&self) -> Uuid {
        self.retry.retry_id
    }
}

/// FIFO queue that evicts its oldest entry when full.
#[derive(Debug)]
pub struct DeadLetterQueue {
    entries: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl DeadLetterQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Append `retry`, returning the entry evicted to make room, if any.
    pub fn push(&self, retry: RetryRequest) -> Option<DeadLetter> {
        let entry = DeadLetter {
            final_error: retry.last_error().map(str::to_string),
            retry,
            dead_lettered_at: Utc::now(),
        };

        let mut entries = self.entries.lock();
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front()
        } else {
            None
        };

        if self.capacity > 0 {
            entries.push_back(entry);
        }
        evicted
    }

    /// Remove and return the entry for `retry_id`.
    pub fn take(&self, retry_id: Uuid) -> Option<DeadLetter> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|entry| entry.retry_id() == retry_id)?;
        entries.remove(index)
    }

    /// Oldest first.
    pub fn list(&self) -> Vec<DeadLetter> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use taxpoynt_common::{TransmissionRequest, TransmissionResult};

    use super::*;
    use crate::retry::{RetryPolicy, RetryReason};

    fn retry(document_id: &str) -> RetryRequest {
        RetryRequest::new(
            TransmissionRequest::new(document_id, "invoice", json!({"n": 1}), "/submit"),
            TransmissionResult::failed(document_id, "Connection reset"),
            RetryPolicy::default(),
            RetryReason::NetworkError,
        )
    }

    #[test]
    fn test_evicts_oldest_when_full() {
        let queue = DeadLetterQueue::new(2);
        assert!(queue.push(retry("INV-1")).is_none());
        assert!(queue.push(retry("INV-2")).is_none());

        let evicted = queue.push(retry("INV-3")).unwrap();
        assert_eq!(evicted.retry.request.document_id, "INV-1");

        let documents: Vec<String> = queue
            .list()
            .into_iter()
            .map(|entry| entry.retry.request.document_id)
            .collect();
        assert_eq!(documents, vec!["INV-2", "INV-3"]);
    }

    #[test]
    fn test_take_removes_entry() {
        let queue = DeadLetterQueue::new(4);
        let entry = retry("INV-1");
        let retry_id = entry.retry_id;
        queue.push(entry);

        let taken = queue.take(retry_id).unwrap();
        assert_eq!(taken.final_error.as_deref(), Some("Connection reset"));
        assert!(queue.is_empty());
        assert!(queue.take(retry_id).is_none());
    }
}
