use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use taxpoynt_common::{TransmissionRequest, TransmissionResult};
use uuid::Uuid;

/// Dequeue priority; higher values leave the queue first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(try_from = "u8", into = "u8")]
pub enum PriorityLevel {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Urgent = 4,
    Critical = 5,
}

impl From<PriorityLevel> for u8 {
    fn from(priority: PriorityLevel) -> Self {
        priority as Self
    }
}

impl TryFrom<u8> for PriorityLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Low),
            2 => Ok(Self::Normal),
            3 => Ok(Self::High),
            4 => Ok(Self::Urgent),
            5 => Ok(Self::Critical),
            other => Err(format!("priority must be between 1 and 5, got {other}")),
        }
    }
}

/// ```text
/// QUEUED -> PROCESSING -> STREAMING -> TRANSMITTED -> ACKNOWLEDGED
///    \           \             \
///     `-----------`-------------`--> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RealTimeStatus {
    Queued,
    Processing,
    Streaming,
    /// Delivered; stays here if an acknowledgment never arrives.
    Transmitted,
    Acknowledged,
    Failed,
}

impl RealTimeStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Streaming => "STREAMING",
            Self::Transmitted => "TRANSMITTED",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RealTimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealTimeRequest {
    pub request_id: Uuid,
    pub transmission: TransmissionRequest,
    #[serde(default)]
    pub priority: PriorityLevel,
    #[serde(default)]
    pub requires_acknowledgment: bool,
    /// Upper bound on the acknowledgment wait.
    #[serde(default = "defaults::timeout")]
    pub timeout: Duration,
    /// Receives a webhook when the request finishes.
    #[serde(default)]
    pub callback_url: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

mod defaults {
    use std::time::Duration;

    pub const fn timeout() -> Duration {
        Duration::from_secs(30)
    }
}

impl RealTimeRequest {
    #[must_use]
    pub fn new(transmission: TransmissionRequest) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            transmission,
            priority: PriorityLevel::default(),
            requires_acknowledgment: false,
            timeout: defaults::timeout(),
            callback_url: None,
            submitted_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: PriorityLevel) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_acknowledgment(mut self, timeout: Duration) -> Self {
        self.requires_acknowledgment = true;
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_callback(mut self, callback_url: impl Into<String>) -> Self {
        self.callback_url = Some(callback_url.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealTimeResult {
    pub request_id: Uuid,
    pub document_id: String,
    pub status: RealTimeStatus,
    pub transmission_result: Option<TransmissionResult>,
    pub error_message: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub processing_time: Option<Duration>,
}

impl RealTimeResult {
    pub(crate) fn queued(request: &RealTimeRequest) -> Self {
        Self {
            request_id: request.request_id,
            document_id: request.transmission.document_id.clone(),
            status: RealTimeStatus::Queued,
            transmission_result: None,
            error_message: None,
            queued_at: request.submitted_at,
            started_at: None,
            completed_at: None,
            acknowledged_at: None,
            processing_time: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    RequestQueued,
    ProcessingStarted,
    StreamingStarted,
    TransmissionCompleted,
    AcknowledgmentReceived,
    AcknowledgmentTimeout,
    TransmissionFailed,
    RequestCancelled,
}

/// Frame pushed to live stream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event_id: Uuid,
    pub event_type: StreamEventType,
    pub request_id: Uuid,
    pub document_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StreamEvent {
    #[must_use]
    pub fn new(
        event_type: StreamEventType,
        request_id: Uuid,
        document_id: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            request_id,
            document_id: document_id.into(),
            timestamp: Utc::now(),
            data,
            metadata: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RealTimeStats {
    pub queue_depth: usize,
    /// Requests queued or in flight.
    pub active_requests: usize,
    pub processed: u64,
    pub transmitted: u64,
    pub acknowledged: u64,
    pub acknowledgment_timeouts: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub dropped_events: u64,
    pub connections: usize,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_priority_wire_format() {
        assert_eq!(serde_json::to_value(PriorityLevel::Critical).unwrap(), json!(5));
        assert_eq!(
            serde_json::from_value::<PriorityLevel>(json!(1)).unwrap(),
            PriorityLevel::Low
        );
        assert!(serde_json::from_value::<PriorityLevel>(json!(9)).is_err());
        assert!(PriorityLevel::Critical > PriorityLevel::Low);
    }

    #[test]
    fn test_event_wire_format() {
        let event = StreamEvent::new(
            StreamEventType::TransmissionCompleted,
            Uuid::nil(),
            "INV-1",
            json!({"status": "TRANSMITTED"}),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "transmission_completed");
        assert_eq!(value["document_id"], "INV-1");
        assert!(value.get("event_id").is_some());
        assert!(value.get("timestamp").is_some());
    }
}
