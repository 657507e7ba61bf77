//! Retry scheduling for failed transmissions.
//!
//! The [`RetryHandler`] receives failed results, classifies them, consults the
//! destination endpoint's circuit breaker and schedules delayed re-attempts.
//! Requests that run out of attempts land in the [`DeadLetterQueue`].
//!
//! ```text
//! failed result ─> eligible? ─no─> NotRetryable
//!                     │yes
//!                  circuit allows? ─no─> CircuitOpen
//!                     │yes
//!                  Scheduled ─sleep─> circuit open? ─yes─> wait for recovery
//!                     ^                  │no       (attempt not consumed)
//!                     │               attempt ─ok─> Succeeded
//!                     │                  │failed
//!                     └── attempts left ─┤
//!                                        └─ none left ─> DeadLettered
//! ```

mod circuit_breaker;
mod classify;
mod dead_letter;
mod policy;
mod types;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use dashmap::DashMap;
use taxpoynt_common::{
    DeliveryReporter, Signal, TransmissionRequest, TransmissionResult, internal,
};
use taxpoynt_metrics::Metrics;
use taxpoynt_tracing::traced;
use tokio::{sync::broadcast, task::JoinHandle};
use uuid::Uuid;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use classify::classify;
pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use policy::{RetryPolicy, RetryReason, RetryStrategy};
pub use types::{
    CIRCUIT_OPEN_MESSAGE, RetryAttempt, RetryDecision, RetryRequest, RetryState, RetryStats,
};

use crate::{config::RetryHandlerConfig, error::RetryError, transmitter::DocumentTransmitter};

type SharedRetry = Arc<parking_lot::Mutex<RetryRequest>>;

pub struct RetryHandler {
    config: RetryHandlerConfig,
    transmitter: Arc<dyn DocumentTransmitter>,
    breakers: CircuitBreaker,
    dead_letters: DeadLetterQueue,
    retries: DashMap<Uuid, SharedRetry>,
    tasks: DashMap<Uuid, JoinHandle<()>>,
    reporter: Option<Arc<dyn DeliveryReporter>>,
    metrics: Arc<Metrics>,
}

impl RetryHandler {
    #[must_use]
    pub fn new(
        config: RetryHandlerConfig,
        transmitter: Arc<dyn DocumentTransmitter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            breakers: CircuitBreaker::new(config.circuit_breaker.clone()),
            dead_letters: DeadLetterQueue::new(config.dead_letter_capacity),
            config,
            transmitter,
            retries: DashMap::new(),
            tasks: DashMap::new(),
            reporter: None,
            metrics,
        }
    }

    /// Report the result of every retry attempt to `reporter`.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn DeliveryReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Decide whether `result` deserves a retry and schedule it if so.
    ///
    /// `policy` overrides the configured default policy for this request.
    pub fn handle_failed_transmission(
        self: &Arc<Self>,
        request: TransmissionRequest,
        result: TransmissionResult,
        policy: Option<RetryPolicy>,
    ) -> RetryDecision {
        let policy = policy.unwrap_or_else(|| self.config.default_policy.clone());
        let reason = classify(result.error_message.as_deref());
        self.metrics.retry.record_failure(reason.as_str());

        if !policy.is_eligible(result.status, reason) {
            tracing::debug!(
                document_id = %request.document_id,
                status = %result.status,
                %reason,
                "Failure is not retryable"
            );
            return RetryDecision::NotRetryable {
                reason: format!("status {} with reason {reason}", result.status),
            };
        }

        let endpoint = request.destination_endpoint.clone();
        if self.breakers.record_failure(&endpoint) {
            self.metrics.retry.record_circuit_opened(&endpoint);
        }

        if !self.breakers.allow_request(&endpoint) {
            self.metrics.retry.record_circuit_rejection(&endpoint);
            tracing::warn!(
                document_id = %request.document_id,
                endpoint,
                "{CIRCUIT_OPEN_MESSAGE}"
            );
            return RetryDecision::CircuitOpen { endpoint };
        }

        let retry = RetryRequest::new(request, result, policy, reason);
        let retry_id = retry.retry_id;
        let shared = Arc::new(parking_lot::Mutex::new(retry));
        self.retries.insert(retry_id, Arc::clone(&shared));

        let mut state = shared.lock();
        self.advance(&mut state)
    }

    /// Schedule the next attempt, or dead-letter the request if none are left.
    ///
    /// Called with the request's lock held so the task handle is registered
    /// before the attempt can observe it.
    fn advance(self: &Arc<Self>, retry: &mut RetryRequest) -> RetryDecision {
        retry.updated_at = Utc::now();

        if retry.is_exhausted() {
            retry.state = RetryState::DeadLettered;
            self.metrics.retry.record_dead_lettered();
            tracing::warn!(
                retry_id = %retry.retry_id,
                document_id = %retry.request.document_id,
                attempts = retry.current_attempt,
                error = retry.last_error().unwrap_or_default(),
                "Retries exhausted, moving to dead-letter queue"
            );
            if let Some(evicted) = self.dead_letters.push(retry.clone()) {
                tracing::warn!(
                    retry_id = %evicted.retry_id(),
                    "Dead-letter queue full, evicted oldest entry"
                );
            }
            return RetryDecision::Exhausted {
                retry_id: retry.retry_id,
            };
        }

        let delay = retry.policy.calculate_delay(retry.current_attempt);
        retry.current_attempt += 1;
        retry.state = RetryState::Scheduled;
        retry.attempts.push(RetryAttempt {
            attempt: retry.current_attempt,
            delay,
            scheduled_at: Utc::now(),
            executed_at: None,
            result: None,
            circuit_skips: 0,
        });

        self.metrics.retry.record_scheduled();
        self.metrics.retry.record_delay(delay.as_secs_f64());
        tracing::info!(
            retry_id = %retry.retry_id,
            document_id = %retry.request.document_id,
            attempt = retry.current_attempt,
            max_attempts = retry.policy.max_attempts,
            delay_secs = delay.as_secs_f64(),
            "Retry scheduled"
        );

        let retry_id = retry.retry_id;
        self.spawn_attempt(retry_id, delay);

        RetryDecision::Scheduled {
            retry_id,
            attempt: retry.current_attempt,
            delay,
        }
    }

    fn spawn_attempt(self: &Arc<Self>, retry_id: Uuid, delay: Duration) {
        let handler = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            handler.execute(retry_id).await;
        });
        self.tasks.insert(retry_id, task);
    }

    /// Push the current attempt back until the endpoint's circuit admits a
    /// probe. The attempt number and budget are left untouched.
    fn defer_for_circuit(self: &Arc<Self>, retry: &mut RetryRequest) {
        let endpoint = retry.request.destination_endpoint.clone();
        let wait = self
            .breakers
            .stats(&endpoint)
            .and_then(|stats| stats.retry_after)
            .unwrap_or_else(|| self.config.circuit_breaker.recovery_timeout());

        retry.updated_at = Utc::now();
        if let Some(attempt) = retry.attempts.last_mut() {
            attempt.circuit_skips = attempt.circuit_skips.saturating_add(1);
        }

        tracing::warn!(
            retry_id = %retry.retry_id,
            endpoint,
            attempt = retry.current_attempt,
            wait_secs = wait.as_secs_f64(),
            "{CIRCUIT_OPEN_MESSAGE}, waiting for recovery"
        );
        self.spawn_attempt(retry.retry_id, wait);
    }

    async fn execute(self: Arc<Self>, retry_id: Uuid) {
        let Some(shared) = self.retries.get(&retry_id).map(|entry| Arc::clone(entry.value()))
        else {
            return;
        };

        let request = {
            let mut retry = shared.lock();
            self.tasks.remove(&retry_id);

            if retry.state != RetryState::Scheduled {
                return;
            }

            let endpoint = retry.request.destination_endpoint.clone();
            if !self.breakers.allow_request(&endpoint) {
                self.metrics.retry.record_circuit_rejection(&endpoint);
                self.defer_for_circuit(&mut retry);
                return;
            }

            retry.state = RetryState::Executing;
            retry.updated_at = Utc::now();
            if let Some(attempt) = retry.attempts.last_mut() {
                attempt.executed_at = Some(Utc::now());
            }
            retry.request.clone()
        };

        let result = self.transmitter.transmit_document(&request).await;
        if let Some(reporter) = &self.reporter {
            reporter.report(&request, &result).await;
        }

        let endpoint = &request.destination_endpoint;
        let mut retry = shared.lock();
        if let Some(attempt) = retry.attempts.last_mut() {
            attempt.result = Some(result.clone());
        }

        if result.is_delivered() {
            self.breakers.record_success(endpoint);
            self.metrics.retry.record_succeeded();
            tracing::info!(
                %retry_id,
                document_id = %request.document_id,
                attempt = retry.current_attempt,
                "Retry succeeded"
            );
            retry.state = RetryState::Succeeded;
            retry.final_result = Some(result);
            retry.updated_at = Utc::now();
            return;
        }

        let reason = classify(result.error_message.as_deref());
        self.metrics.retry.record_failure(reason.as_str());
        if !retry.policy.is_eligible(result.status, reason) {
            tracing::warn!(
                %retry_id,
                document_id = %request.document_id,
                %reason,
                error = result.error_message.as_deref().unwrap_or_default(),
                "Retry failed with a non-retryable error, abandoning"
            );
            retry.state = RetryState::Abandoned;
            retry.final_result = Some(result);
            retry.updated_at = Utc::now();
            return;
        }

        if self.breakers.record_failure(endpoint) {
            self.metrics.retry.record_circuit_opened(endpoint);
        }
        self.advance(&mut retry);
    }

    /// Cancel a scheduled retry. Attempts already executing run to completion.
    ///
    /// Returns `false` if the retry is unknown or not waiting on its delay.
    pub fn cancel_retry(&self, retry_id: Uuid) -> bool {
        let Some(shared) = self.retries.get(&retry_id).map(|entry| Arc::clone(entry.value()))
        else {
            return false;
        };

        let mut retry = shared.lock();
        if retry.state != RetryState::Scheduled {
            return false;
        }

        retry.state = RetryState::Cancelled;
        retry.updated_at = Utc::now();
        if let Some((_, task)) = self.tasks.remove(&retry_id) {
            task.abort();
        }
        self.metrics.retry.record_cancelled();
        tracing::info!(%retry_id, "Retry cancelled");
        true
    }

    /// Move a dead-lettered request back into scheduling with a fresh attempt
    /// budget.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::DeadLetterNotFound`] if no dead letter has this id.
    pub fn reprocess_dead_letter(self: &Arc<Self>, retry_id: Uuid) -> Result<RetryDecision, RetryError> {
        let dead_letter = self
            .dead_letters
            .take(retry_id)
            .ok_or(RetryError::DeadLetterNotFound(retry_id))?;

        let previous = dead_letter.retry;
        let retry = RetryRequest::new(
            previous.request,
            previous.original_result,
            previous.policy,
            previous.reason,
        );
        internal!(
            level = INFO,
            "Reprocessing dead letter {retry_id} as {}",
            retry.retry_id
        );

        let shared = Arc::new(parking_lot::Mutex::new(retry));
        let mut state = shared.lock();
        self.retries.insert(state.retry_id, Arc::clone(&shared));
        Ok(self.advance(&mut state))
    }

    pub fn get_retry_status(&self, retry_id: Uuid) -> Option<RetryRequest> {
        self.retries
            .get(&retry_id)
            .map(|entry| entry.value().lock().clone())
    }

    /// Whether the circuit breaker currently lets requests to `endpoint` through.
    pub fn check_circuit_breaker(&self, endpoint: &str) -> bool {
        self.breakers.allow_request(endpoint)
    }

    pub fn circuit_state(&self, endpoint: &str) -> CircuitState {
        self.breakers.state(endpoint)
    }

    pub fn circuit_stats(&self, endpoint: &str) -> Option<CircuitBreakerStats> {
        self.breakers.stats(endpoint)
    }

    /// Dead letters, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.list()
    }

    pub fn stats(&self) -> RetryStats {
        let mut stats = RetryStats {
            dead_letters: self.dead_letters.len(),
            tracked_endpoints: self.breakers.tracked_endpoints(),
            tripped_circuits: self.breakers.tripped(),
            ..RetryStats::default()
        };

        for entry in &self.retries {
            match entry.value().lock().state {
                RetryState::Scheduled => stats.scheduled += 1,
                RetryState::Executing => stats.executing += 1,
                RetryState::Succeeded => stats.succeeded += 1,
                RetryState::Abandoned => stats.abandoned += 1,
                RetryState::Cancelled => stats.cancelled += 1,
                RetryState::DeadLettered => {}
            }
        }

        stats
    }

    /// Drop finished retry records older than the configured retention.
    ///
    /// Dead letters are kept in their own queue and are unaffected.
    pub fn cleanup(&self) -> usize {
        let retention = chrono::Duration::from_std(self.config.completed_retention())
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now().checked_sub_signed(retention);

        let before = self.retries.len();
        self.retries.retain(|_, retry| {
            let retry = retry.lock();
            !(retry.state.is_finished() && cutoff.is_some_and(|cutoff| retry.updated_at <= cutoff))
        });
        self.tasks.retain(|_, task| !task.is_finished());

        before.saturating_sub(self.retries.len())
    }

    /// Run the periodic cleanup until shutdown, then abort pending retries.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all))]
    pub async fn serve(self: Arc<Self>, mut shutdown: broadcast::Receiver<Signal>) {
        internal!("Retry handler starting");

        let mut cleanup_timer = tokio::time::interval(self.config.cleanup_interval());
        cleanup_timer.tick().await;

        loop {
            tokio::select! {
                _ = cleanup_timer.tick() => {
                    let removed = self.cleanup();
                    if removed > 0 {
                        tracing::debug!(removed, "Cleaned up finished retries");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Retry handler received shutdown signal");
                        }
                        Err(e) => {
                            tracing::error!("Retry handler shutdown channel error: {e}");
                        }
                    }
                    break;
                }
            }
        }

        let pending = self.tasks.len();
        for entry in &self.tasks {
            entry.value().abort();
        }
        self.tasks.clear();
        if pending > 0 {
            tracing::warn!(pending, "Abandoned scheduled retries at shutdown");
        }

        internal!("Retry handler shutdown complete");
    }
}
