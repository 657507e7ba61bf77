use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use taxpoynt_common::{TransmissionRequest, TransmissionResult};
use uuid::Uuid;

use super::{RetryPolicy, RetryReason};

/// Message attached to retries the circuit breaker refused to run.
pub const CIRCUIT_OPEN_MESSAGE: &str = "retry skipped, circuit breaker open";

/// Lifecycle of a [`RetryRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryState {
    /// Waiting for its delay to elapse.
    Scheduled,
    /// An attempt is in flight.
    Executing,
    Succeeded,
    /// Every attempt failed; the request is in the dead-letter queue.
    DeadLettered,
    /// A retry failed with a reason the policy does not retry.
    Abandoned,
    Cancelled,
}

impl RetryState {
    #[must_use]
    pub const fn is_finished(self) -> bool {
        match self {
            Self::Succeeded | Self::DeadLettered | Self::Abandoned | Self::Cancelled => true,
            Self::Scheduled | Self::Executing => false,
        }
    }
}

/// One scheduled retry and, once run, its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    pub delay: Duration,
    pub scheduled_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub result: Option<TransmissionResult>,
    /// Times this attempt came due while the endpoint's circuit was open and
    /// was pushed back to the breaker's recovery time.
    pub circuit_skips: u32,
}

/// A failed transmission under retry.
#[derive(Debug, Clone, Serialize)]
pub struct RetryRequest {
    pub retry_id: Uuid,
    pub request: TransmissionRequest,
    pub original_result: TransmissionResult,
    pub policy: RetryPolicy,
    pub reason: RetryReason,
    pub state: RetryState,
    /// Attempts scheduled so far; never exceeds `policy.max_attempts`.
    pub current_attempt: u32,
    pub attempts: Vec<RetryAttempt>,
    pub final_result: Option<TransmissionResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetryRequest {
    pub(crate) fn new(
        request: TransmissionRequest,
        original_result: TransmissionResult,
        policy: RetryPolicy,
        reason: RetryReason,
    ) -> Self {
        let now = Utc::now();
        Self {
            retry_id: Uuid::new_v4(),
            request,
            original_result,
            policy,
            reason,
            state: RetryState::Scheduled,
            current_attempt: 0,
            attempts: Vec::new(),
            final_result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Error message of the most recent failure.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find_map(|attempt| attempt.result.as_ref())
            .unwrap_or(&self.original_result)
            .error_message
            .as_deref()
    }

    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.current_attempt >= self.policy.max_attempts
    }
}

/// Outcome of handing a failed transmission to the retry handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// The failure's status or reason is not covered by the policy.
    NotRetryable { reason: String },
    /// The endpoint's circuit is open; nothing was scheduled.
    CircuitOpen { endpoint: String },
    Scheduled {
        retry_id: Uuid,
        attempt: u32,
        delay: Duration,
    },
    /// The policy allows no attempts; the request went straight to the
    /// dead-letter queue.
    Exhausted { retry_id: Uuid },
}

impl RetryDecision {
    #[must_use]
    pub const fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled { .. })
    }

    #[must_use]
    pub const fn retry_id(&self) -> Option<Uuid> {
        match self {
            Self::Scheduled { retry_id, .. } | Self::Exhausted { retry_id } => Some(*retry_id),
            Self::NotRetryable { .. } | Self::CircuitOpen { .. } => None,
        }
    }

    /// Human-readable description of the decision.
    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::NotRetryable { reason } => format!("not retryable: {reason}"),
            Self::CircuitOpen { .. } => CIRCUIT_OPEN_MESSAGE.to_string(),
            Self::Scheduled { attempt, delay, .. } => {
                format!("retry {attempt} scheduled in {:.2}s", delay.as_secs_f64())
            }
            Self::Exhausted { .. } => "retries exhausted, moved to dead-letter queue".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    pub scheduled: usize,
    pub executing: usize,
    pub succeeded: usize,
    pub abandoned: usize,
    pub cancelled: usize,
    pub dead_letters: usize,
    pub tracked_endpoints: usize,
    pub tripped_circuits: usize,
}
