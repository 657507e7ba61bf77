use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use taxpoynt_common::{SecurityLevel, TransmissionRequest, TransmissionResult, TransmissionStatus};
use uuid::Uuid;

/// How the items of a batch are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStrategy {
    /// One item at a time, in input order.
    Sequential,
    /// All items at once, bounded by `max_parallel`.
    Parallel,
    /// Sequential, highest priority first.
    Priority,
    /// Grouped by destination and security level; small groups run in
    /// parallel, large ones sequentially, groups concurrently.
    #[default]
    Optimized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Validating,
    Processing,
    Completed,
    PartiallyCompleted,
    Failed,
}

impl BatchStatus {
    /// `Completed` iff every item was delivered, `Failed` iff none was.
    #[must_use]
    pub const fn from_counts(successful: usize, total: usize) -> Self {
        if successful == 0 {
            Self::Failed
        } else if successful == total {
            Self::Completed
        } else {
            Self::PartiallyCompleted
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Validating => "VALIDATING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::PartiallyCompleted => "PARTIALLY_COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One document within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    pub item_id: String,
    pub document_id: String,
    pub document_type: String,
    pub document_data: Value,
    pub destination_endpoint: String,
    #[serde(default)]
    pub security_level: SecurityLevel,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl BatchItem {
    pub fn new(
        document_id: impl Into<String>,
        document_type: impl Into<String>,
        document_data: Value,
        destination_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            item_id: Uuid::new_v4().to_string(),
            document_id: document_id.into(),
            document_type: document_type.into(),
            document_data,
            destination_endpoint: destination_endpoint.into(),
            security_level: SecurityLevel::default(),
            priority: 0,
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_item_id(mut self, item_id: impl Into<String>) -> Self {
        self.item_id = item_id.into();
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_security_level(mut self, security_level: SecurityLevel) -> Self {
        self.security_level = security_level;
        self
    }

    /// The transmission request for this item, tagged with its item id.
    #[must_use]
    pub fn to_request(&self) -> TransmissionRequest {
        let mut request = TransmissionRequest::new(
            self.document_id.clone(),
            self.document_type.clone(),
            self.document_data.clone(),
            self.destination_endpoint.clone(),
        )
        .with_security_level(self.security_level)
        .with_priority(self.priority);
        request.metadata.clone_from(&self.metadata);
        request
            .metadata
            .insert("batch_item_id".to_string(), Value::String(self.item_id.clone()));
        request
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub batch_id: String,
    pub items: Vec<BatchItem>,
    #[serde(default)]
    pub strategy: BatchStrategy,
    /// Concurrency bound for the parallel strategy.
    #[serde(default = "defaults::max_parallel")]
    pub max_parallel: usize,
    /// Give each item several attempts instead of one.
    #[serde(default = "defaults::retry_failed")]
    pub retry_failed: bool,
    /// Items unfinished when this elapses are failed.
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

mod defaults {
    pub const fn max_parallel() -> usize {
        10
    }

    pub const fn retry_failed() -> bool {
        true
    }
}

impl BatchRequest {
    #[must_use]
    pub fn new(items: Vec<BatchItem>) -> Self {
        Self {
            batch_id: Uuid::new_v4().to_string(),
            items,
            strategy: BatchStrategy::default(),
            max_parallel: defaults::max_parallel(),
            retry_failed: defaults::retry_failed(),
            timeout: None,
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn with_strategy(mut self, strategy: BatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub const fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    #[must_use]
    pub const fn with_retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = retry_failed;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchItemResult {
    pub item_id: String,
    pub document_id: String,
    pub status: TransmissionStatus,
    /// Transmission attempts made; zero if the item never ran.
    pub attempts: u32,
    /// Result of the final attempt.
    pub result: Option<TransmissionResult>,
    pub error_message: Option<String>,
    pub processing_time: Duration,
}

impl BatchItemResult {
    pub(crate) fn from_result(
        item: &BatchItem,
        result: TransmissionResult,
        attempts: u32,
        processing_time: Duration,
    ) -> Self {
        Self {
            item_id: item.item_id.clone(),
            document_id: item.document_id.clone(),
            status: result.status,
            attempts,
            error_message: result.error_message.clone(),
            result: Some(result),
            processing_time,
        }
    }

    /// A failure that never produced a transmission result.
    pub(crate) fn failed(item: &BatchItem, attempts: u32, error_message: impl Into<String>) -> Self {
        Self {
            item_id: item.item_id.clone(),
            document_id: item.document_id.clone(),
            status: TransmissionStatus::Failed,
            attempts,
            result: None,
            error_message: Some(error_message.into()),
            processing_time: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn is_delivered(&self) -> bool {
        self.status == TransmissionStatus::Delivered
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub status: BatchStatus,
    pub strategy: BatchStrategy,
    pub total_items: usize,
    pub successful_items: usize,
    pub failed_items: usize,
    /// One entry per input item.
    pub item_results: Vec<BatchItemResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub processing_time: Duration,
    pub error_messages: Vec<String>,
}

impl BatchResult {
    pub(crate) fn aggregate(
        request: &BatchRequest,
        item_results: Vec<BatchItemResult>,
        started_at: DateTime<Utc>,
        processing_time: Duration,
        mut error_messages: Vec<String>,
    ) -> Self {
        let total_items = item_results.len();
        let successful_items = item_results.iter().filter(|r| r.is_delivered()).count();

        error_messages.extend(item_results.iter().filter(|r| !r.is_delivered()).map(|r| {
            format!(
                "{}: {}",
                r.item_id,
                r.error_message.as_deref().unwrap_or("Transmission failed")
            )
        }));

        Self {
            batch_id: request.batch_id.clone(),
            status: BatchStatus::from_counts(successful_items, total_items),
            strategy: request.strategy,
            total_items,
            successful_items,
            failed_items: total_items - successful_items,
            item_results,
            started_at,
            completed_at: Utc::now(),
            processing_time,
            error_messages,
        }
    }

    /// Fraction of items delivered, in `[0, 1]`.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_items == 0 {
            0.0
        } else {
            self.successful_items as f64 / self.total_items as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub total_batches: u64,
    pub completed_batches: u64,
    pub partially_completed_batches: u64,
    pub failed_batches: u64,
    pub total_items: u64,
    pub successful_items: u64,
    pub failed_items: u64,
    pub active_batches: usize,
}
