//! Delivery records and their lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Where a tracked delivery is in its lifecycle.
///
/// ```text
/// PENDING ─> TRANSMITTED ─> DELIVERED ─> ACKNOWLEDGED ─> CONFIRMED
///                                  └──────────────────────┘
/// FAILED and EXPIRED are reachable from any non-terminal state.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Transmitted,
    Delivered,
    Acknowledged,
    Confirmed,
    Failed,
    Expired,
}

impl DeliveryStatus {
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Transmitted,
        Self::Delivered,
        Self::Acknowledged,
        Self::Confirmed,
        Self::Failed,
        Self::Expired,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Transmitted => "TRANSMITTED",
            Self::Delivered => "DELIVERED",
            Self::Acknowledged => "ACKNOWLEDGED",
            Self::Confirmed => "CONFIRMED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::Failed | Self::Expired)
    }

    /// Reached the regulator, whatever happened afterwards.
    #[must_use]
    pub const fn is_successful(self) -> bool {
        matches!(self, Self::Delivered | Self::Acknowledged | Self::Confirmed)
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }

        match next {
            Self::Failed | Self::Expired => true,
            Self::Pending => false,
            Self::Transmitted => matches!(self, Self::Pending),
            Self::Delivered => matches!(self, Self::Transmitted),
            Self::Acknowledged => matches!(self, Self::Delivered),
            Self::Confirmed => matches!(self, Self::Delivered | Self::Acknowledged),
        }
    }

    /// Statuses on the way from `self` to `target`, `target` included.
    ///
    /// Empty when `target` is not ahead of `self`.
    #[must_use]
    pub fn path_to(self, target: Self) -> Vec<Self> {
        if self.can_transition_to(target) {
            return vec![target];
        }

        let mut path = Vec::new();
        let mut current = self;
        while let Some(next) = current.next_milestone() {
            path.push(next);
            if next == target {
                return path;
            }
            current = next;
        }
        Vec::new()
    }

    const fn next_milestone(self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::Transmitted),
            Self::Transmitted => Some(Self::Delivered),
            Self::Delivered => Some(Self::Acknowledged),
            Self::Acknowledged => Some(Self::Confirmed),
            Self::Confirmed | Self::Failed | Self::Expired => None,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a record's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub event_id: Uuid,
    pub tracking_id: Uuid,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: Value,
}

/// What the caller knows about a delivery when it starts tracking it.
#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub document_id: String,
    pub document_type: String,
    pub destination_endpoint: String,
    pub transmission_request_id: Option<Uuid>,
    pub expected_delivery_time: Option<DateTime<Utc>>,
    pub callback_url: Option<String>,
    pub metadata: Map<String, Value>,
}

impl NewDelivery {
    pub fn new(
        document_id: impl Into<String>,
        document_type: impl Into<String>,
        destination_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            document_type: document_type.into(),
            destination_endpoint: destination_endpoint.into(),
            transmission_request_id: None,
            expected_delivery_time: None,
            callback_url: None,
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub const fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.transmission_request_id = Some(request_id);
        self
    }

    #[must_use]
    pub const fn with_expected_delivery(mut self, deadline: DateTime<Utc>) -> Self {
        self.expected_delivery_time = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_callback(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// The tracked state of one delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub tracking_id: Uuid,
    pub document_id: String,
    pub document_type: String,
    pub destination_endpoint: String,
    pub transmission_request_id: Option<Uuid>,
    /// Regulator-assigned id, once known.
    pub transmission_id: Option<String>,
    pub current_status: DeliveryStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub transmitted_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub expected_delivery_time: Option<DateTime<Utc>>,
    pub callback_url: Option<String>,

    /// Seconds from creation to transmission.
    pub processing_time: Option<f64>,
    /// Seconds from transmission to delivery.
    pub delivery_time: Option<f64>,
    /// Seconds from delivery to confirmation.
    pub confirmation_time: Option<f64>,

    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,

    /// Audit trail, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<TrackingEvent>,
}

impl DeliveryRecord {
    #[must_use]
    pub fn new(delivery: NewDelivery, now: DateTime<Utc>) -> Self {
        Self {
            tracking_id: Uuid::new_v4(),
            document_id: delivery.document_id,
            document_type: delivery.document_type,
            destination_endpoint: delivery.destination_endpoint,
            transmission_request_id: delivery.transmission_request_id,
            transmission_id: None,
            current_status: DeliveryStatus::Pending,
            created_at: now,
            updated_at: now,
            transmitted_at: None,
            delivered_at: None,
            acknowledged_at: None,
            confirmed_at: None,
            expected_delivery_time: delivery.expected_delivery_time,
            callback_url: delivery.callback_url,
            processing_time: None,
            delivery_time: None,
            confirmation_time: None,
            error_message: None,
            metadata: delivery.metadata,
            events: Vec::new(),
        }
    }

    /// The event recorded when tracking starts.
    #[must_use]
    pub fn initial_event(&self) -> TrackingEvent {
        TrackingEvent {
            event_id: Uuid::new_v4(),
            tracking_id: self.tracking_id,
            status: DeliveryStatus::Pending,
            timestamp: self.created_at,
            details: serde_json::json!({ "message": "Delivery tracking started" }),
        }
    }

    /// Move to `status`, stamping milestones and elapsed times.
    ///
    /// The caller checks the transition is allowed. `details` may carry
    /// `transmission_id` and `error_message`, which are copied onto the
    /// record.
    pub fn apply(
        &mut self,
        status: DeliveryStatus,
        details: Value,
        now: DateTime<Utc>,
    ) -> TrackingEvent {
        self.current_status = status;
        self.updated_at = now;

        match status {
            DeliveryStatus::Pending => {}
            DeliveryStatus::Transmitted => {
                self.transmitted_at = Some(now);
                self.processing_time = Some(seconds_between(self.created_at, now));
            }
            DeliveryStatus::Delivered => {
                self.delivered_at = Some(now);
                self.delivery_time = self.transmitted_at.map(|at| seconds_between(at, now));
            }
            DeliveryStatus::Acknowledged => {
                self.acknowledged_at = Some(now);
            }
            DeliveryStatus::Confirmed => {
                self.confirmed_at = Some(now);
                self.confirmation_time = self.delivered_at.map(|at| seconds_between(at, now));
            }
            DeliveryStatus::Failed | DeliveryStatus::Expired => {}
        }

        if let Some(transmission_id) = details.get("transmission_id").and_then(Value::as_str) {
            self.transmission_id = Some(transmission_id.to_string());
        }
        if let Some(error) = details
            .get("error_message")
            .or_else(|| details.get("reason"))
            .and_then(Value::as_str)
            && matches!(status, DeliveryStatus::Failed | DeliveryStatus::Expired)
        {
            self.error_message = Some(error.to_string());
        }

        let event = TrackingEvent {
            event_id: Uuid::new_v4(),
            tracking_id: self.tracking_id,
            status,
            timestamp: now,
            details,
        };
        self.events.push(event.clone());
        event
    }

    /// Past its expected delivery time without reaching the regulator.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.current_status,
            DeliveryStatus::Pending | DeliveryStatus::Transmitted
        ) && self.expected_delivery_time.is_some_and(|deadline| deadline < now)
    }

    /// A copy without the audit trail, as stored in the records table.
    #[must_use]
    pub fn without_events(&self) -> Self {
        Self {
            events: Vec::new(),
            ..self.clone()
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}
