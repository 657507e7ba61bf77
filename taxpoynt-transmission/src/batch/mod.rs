//! Batch transmission.
//!
//! ```text
//! PENDING -> VALIDATING -> PROCESSING -> COMPLETED | PARTIALLY_COMPLETED | FAILED
//! ```
//!
//! Size and validation problems are returned as errors before any item is
//! sent. Once processing starts, every item yields exactly one
//! [`BatchItemResult`], whether it was delivered, failed, panicked or ran out
//! of time.

mod types;
mod validate;

use std::{
    cmp::Reverse,
    collections::{HashMap, VecDeque},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Instant,
};

use chrono::Utc;
use dashmap::DashMap;
use futures_util::{FutureExt, future::join_all};
use taxpoynt_common::{DeliveryReporter, SecurityLevel};
use taxpoynt_metrics::Metrics;
use taxpoynt_tracing::traced;
use tokio::sync::Semaphore;

pub use types::{
    BatchItem, BatchItemResult, BatchRequest, BatchResult, BatchStats, BatchStatus,
    BatchStrategy, ValidationReport,
};
pub use validate::validate_batch;

use crate::{config::BatchConfig, error::BatchError, transmitter::DocumentTransmitter};

const TIMEOUT_MESSAGE: &str = "Batch processing timed out";
const VALIDATION_MESSAGE: &str = "Batch validation failed";

/// Results collected in completion order, tagged with the item's input index.
type Sink = parking_lot::Mutex<Vec<(usize, BatchItemResult)>>;

pub struct BatchTransmitter {
    config: BatchConfig,
    transmitter: Arc<dyn DocumentTransmitter>,
    batch_slots: Semaphore,
    active: DashMap<String, BatchStatus>,
    history: parking_lot::Mutex<VecDeque<BatchResult>>,
    stats: parking_lot::Mutex<BatchStats>,
    reporter: Option<Arc<dyn DeliveryReporter>>,
    metrics: Arc<Metrics>,
}

impl BatchTransmitter {
    #[must_use]
    pub fn new(
        config: BatchConfig,
        transmitter: Arc<dyn DocumentTransmitter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            batch_slots: Semaphore::new(config.max_concurrent_batches.max(1)),
            config,
            transmitter,
            active: DashMap::new(),
            history: parking_lot::Mutex::new(VecDeque::new()),
            stats: parking_lot::Mutex::new(BatchStats::default()),
            reporter: None,
            metrics,
        }
    }

    /// Report each item's final result to `reporter`.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn DeliveryReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Structural validation plus the configured size limit.
    #[must_use]
    pub fn validate_batch(&self, request: &BatchRequest) -> ValidationReport {
        let mut report = validate_batch(request);
        if request.items.len() > self.config.max_batch_size {
            report.valid = false;
            report.errors.insert(
                0,
                format!(
                    "Batch size {} exceeds maximum of {}",
                    request.items.len(),
                    self.config.max_batch_size
                ),
            );
        }
        report
    }

    /// Validate and process `request`.
    ///
    /// # Errors
    ///
    /// - [`BatchError::TooLarge`] if the batch exceeds `max_batch_size`
    /// - [`BatchError::Validation`] if validation fails; a `FAILED` result with
    ///   one failed entry per item is still recorded in the history
    /// - [`BatchError::Closed`] if the transmitter is shutting down
    #[traced(
        instrument(level = tracing::Level::INFO, skip_all, fields(batch_id = %request.batch_id, items = request.items.len())),
        timing(precision = "ms")
    )]
    pub async fn transmit_batch(&self, request: BatchRequest) -> Result<BatchResult, BatchError> {
        if request.items.len() > self.config.max_batch_size {
            return Err(BatchError::TooLarge {
                batch_id: request.batch_id,
                size: request.items.len(),
                max: self.config.max_batch_size,
            });
        }

        let started_at = Utc::now();
        let started = Instant::now();
        self.active.insert(request.batch_id.clone(), BatchStatus::Validating);

        let report = validate_batch(&request);
        if !report.valid {
            tracing::warn!(
                batch_id = %request.batch_id,
                errors = ?report.errors,
                "Batch failed validation"
            );
            let item_results = request
                .items
                .iter()
                .map(|item| BatchItemResult::failed(item, 0, VALIDATION_MESSAGE))
                .collect();
            let result = BatchResult::aggregate(
                &request,
                item_results,
                started_at,
                started.elapsed(),
                report.errors.clone(),
            );
            self.finish(result);
            return Err(BatchError::Validation {
                batch_id: request.batch_id,
                errors: report.errors,
            });
        }

        self.active.insert(request.batch_id.clone(), BatchStatus::Pending);
        let Ok(_slot) = self.batch_slots.acquire().await else {
            self.active.remove(&request.batch_id);
            return Err(BatchError::Closed);
        };
        self.active.insert(request.batch_id.clone(), BatchStatus::Processing);

        let sink = Sink::default();
        let mut error_messages = Vec::new();
        let work = self.process(&request, &sink);
        match request.timeout {
            Some(timeout) => {
                if tokio::time::timeout(timeout, work).await.is_err() {
                    tracing::warn!(
                        batch_id = %request.batch_id,
                        timeout_secs = timeout.as_secs_f64(),
                        "{TIMEOUT_MESSAGE}"
                    );
                    error_messages.push(TIMEOUT_MESSAGE.to_string());
                }
            }
            None => work.await,
        }

        let mut finished = sink.into_inner();
        let mut done = vec![false; request.items.len()];
        for (index, _) in &finished {
            done[*index] = true;
        }
        finished.extend(
            request
                .items
                .iter()
                .enumerate()
                .filter(|(index, _)| !done[*index])
                .map(|(index, item)| (index, BatchItemResult::failed(item, 0, TIMEOUT_MESSAGE))),
        );

        let item_results = finished.into_iter().map(|(_, result)| result).collect();
        let result = BatchResult::aggregate(
            &request,
            item_results,
            started_at,
            started.elapsed(),
            error_messages,
        );

        tracing::info!(
            batch_id = %result.batch_id,
            status = %result.status,
            successful = result.successful_items,
            failed = result.failed_items,
            "Batch finished"
        );

        self.finish(result.clone());
        Ok(result)
    }

    async fn process(&self, request: &BatchRequest, sink: &Sink) {
        let max_attempts = if request.retry_failed {
            self.config.item_max_attempts.max(1)
        } else {
            1
        };
        let items: Vec<(usize, &BatchItem)> = request.items.iter().enumerate().collect();

        match request.strategy {
            BatchStrategy::Sequential => self.run_sequential(items, max_attempts, sink).await,
            BatchStrategy::Priority => {
                let mut items = items;
                items.sort_by_key(|(_, item)| Reverse(item.priority));
                self.run_sequential(items, max_attempts, sink).await;
            }
            BatchStrategy::Parallel => {
                self.run_parallel(items, request.max_parallel, max_attempts, sink)
                    .await;
            }
            BatchStrategy::Optimized => self.run_optimized(items, max_attempts, sink).await,
        }
    }

    async fn run_sequential(&self, items: Vec<(usize, &BatchItem)>, max_attempts: u32, sink: &Sink) {
        for (index, item) in items {
            let result = self.guarded_item(item, max_attempts).await;
            sink.lock().push((index, result));
        }
    }

    async fn run_parallel(
        &self,
        items: Vec<(usize, &BatchItem)>,
        max_parallel: usize,
        max_attempts: u32,
        sink: &Sink,
    ) {
        let gate = Semaphore::new(max_parallel.max(1));
        join_all(items.into_iter().map(|(index, item)| {
            let gate = &gate;
            async move {
                let _permit = gate.acquire().await.ok();
                let result = self.guarded_item(item, max_attempts).await;
                sink.lock().push((index, result));
            }
        }))
        .await;
    }

    async fn run_optimized(&self, items: Vec<(usize, &BatchItem)>, max_attempts: u32, sink: &Sink) {
        let mut slots: HashMap<(&str, SecurityLevel), usize> = HashMap::new();
        let mut groups: Vec<Vec<(usize, &BatchItem)>> = Vec::new();

        for (index, item) in items {
            let key = (item.destination_endpoint.as_str(), item.security_level);
            let slot = *slots.entry(key).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push((index, item));
        }

        tracing::debug!(groups = groups.len(), "Optimized batch grouping");

        let limit = self.config.parallel_group_limit;
        join_all(groups.into_iter().map(|group| async move {
            if group.len() <= limit {
                let width = group.len();
                self.run_parallel(group, width, max_attempts, sink).await;
            } else {
                self.run_sequential(group, max_attempts, sink).await;
            }
        }))
        .await;
    }

    /// Process one item, turning a panic into a failed result.
    async fn guarded_item(&self, item: &BatchItem, max_attempts: u32) -> BatchItemResult {
        AssertUnwindSafe(self.process_item(item, max_attempts))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                tracing::error!(item_id = %item.item_id, "Batch item panicked");
                BatchItemResult::failed(item, 1, "Item processing panicked")
            })
    }

    async fn process_item(&self, item: &BatchItem, max_attempts: u32) -> BatchItemResult {
        let request = item.to_request();
        let started = Instant::now();
        let mut attempts = 0;

        let result = loop {
            attempts += 1;
            let result = self.transmitter.transmit_document(&request).await;
            if result.is_delivered() || attempts >= max_attempts {
                break result;
            }

            let delay = self.config.item_backoff(attempts - 1);
            tracing::debug!(
                item_id = %item.item_id,
                attempt = attempts,
                delay_secs = delay.as_secs_f64(),
                error = result.error_message.as_deref().unwrap_or_default(),
                "Batch item failed, retrying"
            );
            tokio::time::sleep(delay).await;
        };

        if let Some(reporter) = &self.reporter {
            reporter.report(&request, &result).await;
        }

        BatchItemResult::from_result(item, result, attempts, started.elapsed())
    }

    fn finish(&self, result: BatchResult) {
        self.active.remove(&result.batch_id);
        self.metrics
            .transmission
            .record_batch(result.status.as_str(), result.total_items as u64);

        {
            let mut stats = self.stats.lock();
            stats.total_batches += 1;
            match result.status {
                BatchStatus::Completed => stats.completed_batches += 1,
                BatchStatus::PartiallyCompleted => stats.partially_completed_batches += 1,
                BatchStatus::Failed => stats.failed_batches += 1,
                BatchStatus::Pending | BatchStatus::Validating | BatchStatus::Processing => {}
            }
            stats.total_items += result.total_items as u64;
            stats.successful_items += result.successful_items as u64;
            stats.failed_items += result.failed_items as u64;
        }

        let mut history = self.history.lock();
        history.push_back(result);
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }

    /// Status of an in-progress or remembered batch.
    pub fn get_batch_status(&self, batch_id: &str) -> Option<BatchStatus> {
        if let Some(status) = self.active.get(batch_id) {
            return Some(*status);
        }

        self.history
            .lock()
            .iter()
            .rev()
            .find(|result| result.batch_id == batch_id)
            .map(|result| result.status)
    }

    pub fn get_batch_result(&self, batch_id: &str) -> Option<BatchResult> {
        self.history
            .lock()
            .iter()
            .rev()
            .find(|result| result.batch_id == batch_id)
            .cloned()
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            active_batches: self.active.len(),
            ..self.stats.lock().clone()
        }
    }

    /// Refuse new batches; batches already waiting for a slot fail with
    /// [`BatchError::Closed`].
    pub fn close(&self) {
        self.batch_slots.close();
    }
}
