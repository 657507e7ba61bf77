//! Bounded priority queue feeding the real-time consumer.
//!
//! Producers wait for space when the queue is full; nothing submitted is
//! dropped.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering},
};

use tokio::sync::{Notify, Semaphore};
use uuid::Uuid;

use super::{PriorityLevel, RealTimeRequest};
use crate::error::RealTimeError;

struct Queued {
    priority: PriorityLevel,
    sequence: u64,
    request: RealTimeRequest,
}

/// Higher priority first, then submission order.
impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

pub(crate) struct PriorityQueue {
    heap: parking_lot::Mutex<BinaryHeap<Queued>>,
    sequence: AtomicU64,
    space: Semaphore,
    available: Notify,
    closed: AtomicBool,
}

impl PriorityQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            heap: parking_lot::Mutex::new(BinaryHeap::new()),
            sequence: AtomicU64::new(0),
            space: Semaphore::new(capacity.max(1)),
            available: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue `request`, waiting for space if the queue is full.
    pub(crate) async fn push(&self, request: RealTimeRequest) -> Result<(), RealTimeError> {
        let permit = self
            .space
            .acquire()
            .await
            .map_err(|_| RealTimeError::QueueClosed)?;
        permit.forget();

        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        self.heap.lock().push(Queued {
            priority: request.priority,
            sequence,
            request,
        });
        self.available.notify_one();
        Ok(())
    }

    /// Wait for the highest-priority request. Returns `None` once closed.
    pub(crate) async fn pop(&self) -> Option<RealTimeRequest> {
        loop {
            if self.closed.load(AtomicOrdering::Acquire) {
                return None;
            }

            let next = self.heap.lock().pop();
            if let Some(queued) = next {
                self.space.add_permits(1);
                return Some(queued.request);
            }

            self.available.notified().await;
        }
    }

    /// Take a request out before it is dequeued.
    pub(crate) fn remove(&self, request_id: Uuid) -> Option<RealTimeRequest> {
        let mut removed = None;
        self.heap.lock().retain(|queued| {
            if queued.request.request_id == request_id {
                removed = Some(queued.request.clone());
                false
            } else {
                true
            }
        });

        if removed.is_some() {
            self.space.add_permits(1);
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Stop accepting and handing out requests; anything still queued stays
    /// unprocessed.
    pub(crate) fn close(&self) {
        self.closed.store(true, AtomicOrdering::Release);
        self.space.close();
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use taxpoynt_common::TransmissionRequest;

    use super::*;

    fn request(document_id: &str, priority: PriorityLevel) -> RealTimeRequest {
        RealTimeRequest::new(TransmissionRequest::new(
            document_id,
            "invoice",
            json!({"n": 1}),
            "/submit",
        ))
        .with_priority(priority)
    }

    #[tokio::test]
    async fn test_highest_priority_first_then_fifo() {
        let queue = PriorityQueue::new(10);
        queue.push(request("low", PriorityLevel::Low)).await.unwrap();
        queue.push(request("normal-1", PriorityLevel::Normal)).await.unwrap();
        queue.push(request("critical", PriorityLevel::Critical)).await.unwrap();
        queue.push(request("normal-2", PriorityLevel::Normal)).await.unwrap();

        let mut order = Vec::new();
        while queue.len() > 0 {
            order.push(queue.pop().await.unwrap().transmission.document_id);
        }
        assert_eq!(order, vec!["critical", "normal-1", "normal-2", "low"]);
    }

    #[tokio::test]
    async fn test_remove_frees_space() {
        let queue = PriorityQueue::new(1);
        let first = request("first", PriorityLevel::Normal);
        let first_id = first.request_id;
        queue.push(first).await.unwrap();

        assert!(queue.remove(first_id).is_some());
        assert!(queue.remove(first_id).is_none());

        tokio::time::timeout(
            std::time::Duration::from_secs(1),
            queue.push(request("second", PriorityLevel::Normal)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_push_waits_for_space() {
        let queue = Arc::new(PriorityQueue::new(1));
        queue.push(request("first", PriorityLevel::Normal)).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.push(request("second", PriorityLevel::Normal)).await })
        };
        tokio::task::yield_now().await;
        assert!(!producer.is_finished());

        assert_eq!(queue.pop().await.unwrap().transmission.document_id, "first");
        producer.await.unwrap().unwrap();
        assert_eq!(queue.pop().await.unwrap().transmission.document_id, "second");
    }

    #[tokio::test]
    async fn test_close_wakes_consumer() {
        let queue = Arc::new(PriorityQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };

        tokio::task::yield_now().await;
        queue.close();
        assert!(consumer.await.unwrap().is_none());
        assert!(queue.push(request("late", PriorityLevel::High)).await.is_err());
    }
}
