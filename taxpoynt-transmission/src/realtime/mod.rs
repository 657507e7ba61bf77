//! Real-time transmission.
//!
//! Requests wait in a bounded priority queue and are transmitted by up to
//! `max_concurrent_transmissions` workers. Every status change is published
//! as a [`StreamEvent`] to live subscribers through the [`StreamHub`].
//!
//! ```text
//! submit ─> QUEUED ─pop─> PROCESSING ─> STREAMING ─> transmit
//!                                                      │
//!                     delivered ─> TRANSMITTED ─ack─> ACKNOWLEDGED
//!                     failed ─> FAILED ─> retry handler
//! ```
//!
//! A request that requires acknowledgment and never receives one stays
//! `TRANSMITTED`.

mod queue;
mod server;
mod stream;
mod types;

use std::{collections::VecDeque, panic::AssertUnwindSafe, sync::Arc, time::Instant};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::{Value, json};
use taxpoynt_common::{DeliveryReporter, Signal, TransmissionResult, WebhookClient, internal};
use taxpoynt_metrics::Metrics;
use taxpoynt_tracing::traced;
use tokio::sync::{Semaphore, broadcast, mpsc, oneshot};
use uuid::Uuid;

pub use server::StreamServer;
pub use stream::{ClientMessage, ConnectionInfo, Outbound, StreamHub};
pub use types::{
    PriorityLevel, RealTimeRequest, RealTimeResult, RealTimeStats, RealTimeStatus, StreamEvent,
    StreamEventType,
};

use queue::PriorityQueue;

use crate::{
    config::RealTimeConfig, error::RealTimeError, retry::RetryHandler,
    transmitter::DocumentTransmitter,
};

const CANCELLED_MESSAGE: &str = "Request cancelled";
const PANIC_MESSAGE: &str = "Real-time processing panicked";

/// A request that has not finished yet.
struct Tracked {
    request: RealTimeRequest,
    result: RealTimeResult,
    cancelled: bool,
}

#[derive(Default)]
struct Counters {
    processed: u64,
    transmitted: u64,
    acknowledged: u64,
    acknowledgment_timeouts: u64,
    failed: u64,
    cancelled: u64,
    dropped_events: u64,
}

pub struct RealTimeTransmitter {
    config: RealTimeConfig,
    transmitter: Arc<dyn DocumentTransmitter>,
    queue: PriorityQueue,
    permits: Arc<Semaphore>,
    active: DashMap<Uuid, Tracked>,
    acks: DashMap<Uuid, oneshot::Sender<()>>,
    history: parking_lot::Mutex<VecDeque<RealTimeResult>>,
    counters: parking_lot::Mutex<Counters>,
    events: mpsc::Sender<Arc<StreamEvent>>,
    event_receiver: parking_lot::Mutex<Option<mpsc::Receiver<Arc<StreamEvent>>>>,
    hub: Arc<StreamHub>,
    webhook: WebhookClient,
    retry_handler: Option<Arc<RetryHandler>>,
    reporter: Option<Arc<dyn DeliveryReporter>>,
    metrics: Arc<Metrics>,
}

impl RealTimeTransmitter {
    /// # Errors
    ///
    /// Returns an error if the callback HTTP client cannot be built.
    pub fn new(
        config: RealTimeConfig,
        transmitter: Arc<dyn DocumentTransmitter>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, RealTimeError> {
        let buffer = config.stream_buffer_size.max(1);
        let (events, event_receiver) = mpsc::channel(buffer);
        let webhook = WebhookClient::new(std::time::Duration::from_secs(
            config.callback_timeout_secs,
        ))?;

        Ok(Self {
            queue: PriorityQueue::new(buffer),
            permits: Arc::new(Semaphore::new(config.max_concurrent_transmissions.max(1))),
            hub: Arc::new(StreamHub::new(buffer)),
            config,
            transmitter,
            active: DashMap::new(),
            acks: DashMap::new(),
            history: parking_lot::Mutex::new(VecDeque::new()),
            counters: parking_lot::Mutex::new(Counters::default()),
            events,
            event_receiver: parking_lot::Mutex::new(Some(event_receiver)),
            webhook,
            retry_handler: None,
            reporter: None,
            metrics,
        })
    }

    /// Hand failed transmissions to `retry_handler`.
    #[must_use]
    pub fn with_retry_handler(mut self, retry_handler: Arc<RetryHandler>) -> Self {
        self.retry_handler = Some(retry_handler);
        self
    }

    /// Report every transmission outcome to `reporter`.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn DeliveryReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Connection registry backing the stream server.
    pub fn hub(&self) -> Arc<StreamHub> {
        Arc::clone(&self.hub)
    }

    /// Queue `request`, waiting for space if the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`RealTimeError::QueueClosed`] once the transmitter has shut down.
    pub async fn submit(&self, request: RealTimeRequest) -> Result<Uuid, RealTimeError> {
        let request_id = request.request_id;
        let document_id = request.transmission.document_id.clone();

        self.active.insert(
            request_id,
            Tracked {
                result: RealTimeResult::queued(&request),
                request: request.clone(),
                cancelled: false,
            },
        );

        self.emit(
            StreamEventType::RequestQueued,
            request_id,
            &document_id,
            json!({ "status": RealTimeStatus::Queued, "priority": request.priority }),
        );

        if let Err(e) = self.queue.push(request).await {
            self.active.remove(&request_id);
            return Err(e);
        }
        self.metrics
            .transmission
            .set_queue_depth(self.queue.len() as u64);

        tracing::debug!(%request_id, document_id, "Real-time request queued");
        Ok(request_id)
    }

    /// Deliver an acknowledgment for a request that is waiting for one.
    ///
    /// Returns `false` if nothing is waiting for `request_id`.
    pub fn acknowledge(&self, request_id: Uuid) -> bool {
        self.acks
            .remove(&request_id)
            .is_some_and(|(_, waiter)| waiter.send(()).is_ok())
    }

    /// Cancel a request that has not started processing.
    ///
    /// Returns `false` once the request is processing or finished.
    pub fn cancel_request(&self, request_id: Uuid) -> bool {
        if self.queue.remove(request_id).is_some() {
            self.metrics
                .transmission
                .set_queue_depth(self.queue.len() as u64);
            if let Some((_, tracked)) = self.active.remove(&request_id) {
                self.finish_cancelled(tracked);
            }
            return true;
        }

        // Popped but still waiting for a worker slot.
        self.active.get_mut(&request_id).is_some_and(|mut tracked| {
            if tracked.result.status == RealTimeStatus::Queued {
                tracked.cancelled = true;
            }
            tracked.cancelled
        })
    }

    pub fn get_result(&self, request_id: Uuid) -> Option<RealTimeResult> {
        if let Some(tracked) = self.active.get(&request_id) {
            return Some(tracked.result.clone());
        }

        self.history
            .lock()
            .iter()
            .rev()
            .find(|result| result.request_id == request_id)
            .cloned()
    }

    pub fn stats(&self) -> RealTimeStats {
        let counters = self.counters.lock();
        RealTimeStats {
            queue_depth: self.queue.len(),
            active_requests: self.active.len(),
            processed: counters.processed,
            transmitted: counters.transmitted,
            acknowledged: counters.acknowledged,
            acknowledgment_timeouts: counters.acknowledgment_timeouts,
            failed: counters.failed,
            cancelled: counters.cancelled,
            dropped_events: counters.dropped_events,
            connections: self.hub.connection_count(),
        }
    }

    /// Consume the queue and publish events until shutdown.
    ///
    /// On shutdown the queue is closed, anything still queued stays
    /// unprocessed and in-flight transmissions get `drain_timeout_secs` to
    /// finish.
    ///
    /// # Errors
    ///
    /// Returns [`RealTimeError::AlreadyRunning`] if called twice.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all), timing(precision = "s"))]
    pub async fn serve(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), RealTimeError> {
        let Some(mut events) = self.event_receiver.lock().take() else {
            return Err(RealTimeError::AlreadyRunning);
        };

        internal!(level = INFO, "Real-time transmitter starting");

        let consumer = tokio::spawn(Arc::clone(&self).consume());
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.tick().await;

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    self.hub.broadcast(&event);
                }
                _ = heartbeat.tick() => {
                    let evicted = self.hub.sweep(
                        self.config.heartbeat_interval(),
                        self.config.connection_timeout(),
                    );
                    if evicted > 0 {
                        tracing::debug!(evicted, "Evicted idle stream connections");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!(level = INFO, "Real-time transmitter received shutdown signal");
                        }
                        Err(e) => {
                            tracing::error!("Real-time transmitter shutdown channel error: {e}");
                        }
                    }
                    break;
                }
            }
        }

        self.queue.close();
        consumer.abort();

        let slots = u32::try_from(self.config.max_concurrent_transmissions.max(1)).unwrap_or(u32::MAX);
        let drain = tokio::time::timeout(
            std::time::Duration::from_secs(self.config.drain_timeout_secs),
            self.permits.acquire_many(slots),
        );
        if drain.await.is_err() {
            tracing::warn!(
                in_flight = self
                    .config
                    .max_concurrent_transmissions
                    .saturating_sub(self.permits.available_permits()),
                "In-flight real-time transmissions did not finish before the drain timeout"
            );
        }

        while let Ok(event) = events.try_recv() {
            self.hub.broadcast(&event);
        }

        let remaining = self.queue.len();
        if remaining > 0 {
            tracing::warn!(remaining, "Real-time requests left unprocessed at shutdown");
        }

        internal!(level = INFO, "Real-time transmitter shutdown complete");
        Ok(())
    }

    async fn consume(self: Arc<Self>) {
        while let Some(request) = self.queue.pop().await {
            self.metrics
                .transmission
                .set_queue_depth(self.queue.len() as u64);

            if self.take_cancelled(request.request_id) {
                continue;
            }

            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                break;
            };

            if self.take_cancelled(request.request_id) {
                continue;
            }

            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                worker.guarded_process(request).await;
                drop(permit);
            });
        }
    }

    /// Finish `request_id` as cancelled if a cancellation was requested.
    fn take_cancelled(&self, request_id: Uuid) -> bool {
        match self
            .active
            .remove_if(&request_id, |_, tracked| tracked.cancelled)
        {
            Some((_, tracked)) => {
                self.finish_cancelled(tracked);
                true
            }
            None => false,
        }
    }

    async fn guarded_process(self: &Arc<Self>, request: RealTimeRequest) {
        let request_id = request.request_id;
        if AssertUnwindSafe(self.process(request))
            .catch_unwind()
            .await
            .is_err()
        {
            tracing::error!(%request_id, "{PANIC_MESSAGE}");
            self.acks.remove(&request_id);
            if let Some((_, mut tracked)) = self.active.remove(&request_id) {
                tracked.result.status = RealTimeStatus::Failed;
                tracked.result.error_message = Some(PANIC_MESSAGE.to_string());
                tracked.result.completed_at = Some(Utc::now());
                self.counters.lock().failed += 1;
                self.remember(tracked.result);
            }
        }
    }

    #[traced(
        instrument(level = tracing::Level::DEBUG, skip_all, fields(request_id = %request.request_id, document_id = %request.transmission.document_id)),
        timing(precision = "ms")
    )]
    async fn process(self: &Arc<Self>, request: RealTimeRequest) {
        let request_id = request.request_id;
        let document_id = request.transmission.document_id.as_str();
        let started = Instant::now();

        if !self.begin(request_id) {
            return;
        }
        self.emit(
            StreamEventType::ProcessingStarted,
            request_id,
            document_id,
            json!({ "status": RealTimeStatus::Processing }),
        );

        self.set_status(request_id, RealTimeStatus::Streaming);
        self.emit(
            StreamEventType::StreamingStarted,
            request_id,
            document_id,
            json!({ "status": RealTimeStatus::Streaming }),
        );

        let ack = request.requires_acknowledgment.then(|| {
            let (waiter, ack) = oneshot::channel();
            self.acks.insert(request_id, waiter);
            ack
        });

        let result = self.transmitter.transmit_document(&request.transmission).await;
        if let Some(reporter) = &self.reporter {
            reporter.report(&request.transmission, &result).await;
        }

        if result.is_delivered() {
            self.delivered(&request, &result, ack).await;
        } else {
            self.acks.remove(&request_id);
            self.failed(&request, &result);
        }

        let Some((_, mut tracked)) = self.active.remove(&request_id) else {
            return;
        };
        tracked.result.transmission_result = Some(result);
        tracked.result.processing_time = Some(started.elapsed());
        self.counters.lock().processed += 1;

        if let Some(url) = &request.callback_url {
            self.callback(url, &tracked.result).await;
        }
        self.remember(tracked.result);
    }

    /// Move a queued request to `PROCESSING` unless it was cancelled.
    fn begin(&self, request_id: Uuid) -> bool {
        {
            let Some(mut tracked) = self.active.get_mut(&request_id) else {
                return false;
            };
            if !tracked.cancelled {
                tracked.result.status = RealTimeStatus::Processing;
                tracked.result.started_at = Some(Utc::now());
                return true;
            }
        }

        self.take_cancelled(request_id);
        false
    }

    async fn delivered(
        &self,
        request: &RealTimeRequest,
        result: &TransmissionResult,
        ack: Option<oneshot::Receiver<()>>,
    ) {
        let request_id = request.request_id;
        let document_id = request.transmission.document_id.as_str();

        if let Some(mut tracked) = self.active.get_mut(&request_id) {
            tracked.result.status = RealTimeStatus::Transmitted;
            tracked.result.completed_at = Some(Utc::now());
        }
        self.counters.lock().transmitted += 1;
        self.emit(
            StreamEventType::TransmissionCompleted,
            request_id,
            document_id,
            json!({
                "status": RealTimeStatus::Transmitted,
                "transmission_id": result.transmission_id,
            }),
        );

        let Some(ack) = ack else {
            return;
        };

        let acknowledged_inline = result
            .response_data
            .as_ref()
            .and_then(|data| data.get("acknowledged"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let acknowledged = if acknowledged_inline {
            true
        } else {
            matches!(tokio::time::timeout(request.timeout, ack).await, Ok(Ok(())))
        };
        self.acks.remove(&request_id);

        if acknowledged {
            if let Some(mut tracked) = self.active.get_mut(&request_id) {
                tracked.result.status = RealTimeStatus::Acknowledged;
                tracked.result.acknowledged_at = Some(Utc::now());
            }
            self.counters.lock().acknowledged += 1;
            self.emit(
                StreamEventType::AcknowledgmentReceived,
                request_id,
                document_id,
                json!({ "status": RealTimeStatus::Acknowledged }),
            );
        } else {
            tracing::warn!(
                %request_id,
                document_id,
                timeout_secs = request.timeout.as_secs_f64(),
                "Acknowledgment not received in time"
            );
            self.counters.lock().acknowledgment_timeouts += 1;
            self.emit(
                StreamEventType::AcknowledgmentTimeout,
                request_id,
                document_id,
                json!({
                    "status": RealTimeStatus::Transmitted,
                    "timeout_secs": request.timeout.as_secs_f64(),
                }),
            );
        }
    }

    fn failed(&self, request: &RealTimeRequest, result: &TransmissionResult) {
        let request_id = request.request_id;
        let document_id = request.transmission.document_id.as_str();
        let error = result
            .error_message
            .clone()
            .unwrap_or_else(|| "Transmission failed".to_string());

        if let Some(mut tracked) = self.active.get_mut(&request_id) {
            tracked.result.status = RealTimeStatus::Failed;
            tracked.result.error_message = Some(error.clone());
            tracked.result.completed_at = Some(Utc::now());
        }
        self.counters.lock().failed += 1;

        tracing::warn!(%request_id, document_id, %error, "Real-time transmission failed");
        self.emit(
            StreamEventType::TransmissionFailed,
            request_id,
            document_id,
            json!({ "status": RealTimeStatus::Failed, "error": error }),
        );

        if let Some(retry_handler) = &self.retry_handler {
            let decision = retry_handler.handle_failed_transmission(
                request.transmission.clone(),
                result.clone(),
                None,
            );
            tracing::debug!(%request_id, decision = %decision.message(), "Handed failure to retry handler");
        }
    }

    fn finish_cancelled(&self, tracked: Tracked) {
        let Tracked {
            request,
            mut result,
            ..
        } = tracked;

        result.status = RealTimeStatus::Failed;
        result.error_message = Some(CANCELLED_MESSAGE.to_string());
        result.completed_at = Some(Utc::now());
        self.counters.lock().cancelled += 1;

        tracing::info!(request_id = %request.request_id, "{CANCELLED_MESSAGE}");
        self.emit(
            StreamEventType::RequestCancelled,
            request.request_id,
            &request.transmission.document_id,
            json!({ "status": RealTimeStatus::Failed, "error": CANCELLED_MESSAGE }),
        );
        self.remember(result);
    }

    fn set_status(&self, request_id: Uuid, status: RealTimeStatus) {
        if let Some(mut tracked) = self.active.get_mut(&request_id) {
            tracked.result.status = status;
        }
    }

    async fn callback(&self, url: &str, result: &RealTimeResult) {
        let payload = json!({
            "request_id": result.request_id,
            "document_id": result.document_id,
            "status": result.status,
            "timestamp": Utc::now(),
            "error_message": result.error_message,
        });

        if let Err(e) = self.webhook.post(url, &payload).await {
            tracing::warn!(request_id = %result.request_id, "Callback failed: {e}");
        }
    }

    fn remember(&self, result: RealTimeResult) {
        let mut history = self.history.lock();
        history.push_back(result);
        while history.len() > self.config.result_history_limit {
            history.pop_front();
        }
    }

    /// Queue an event for subscribers, dropping it if the event queue is full.
    fn emit(&self, event_type: StreamEventType, request_id: Uuid, document_id: &str, data: Value) {
        let event = Arc::new(StreamEvent::new(event_type, request_id, document_id, data));
        match self.events.try_send(event) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.lock().dropped_events += 1;
                self.metrics.transmission.record_event_dropped();
                tracing::warn!(%request_id, ?event_type, "Event queue full, dropping event");
            }
        }
    }
}
