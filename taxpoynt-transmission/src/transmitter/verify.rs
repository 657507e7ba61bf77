//! Regulator response verification.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::PermanentError;

fn invalid(message: impl Into<String>) -> PermanentError {
    PermanentError::InvalidResponse(message.into())
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, PermanentError> {
    let parsed = match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|secs| secs.trunc() as i64))
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|timestamp| timestamp.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                text.parse::<i64>()
                    .ok()
                    .and_then(|secs| DateTime::from_timestamp(secs, 0))
            }),
        Value::Null | Value::Bool(_) | Value::Array(_) | Value::Object(_) => None,
    };

    parsed.ok_or_else(|| invalid(format!("unreadable timestamp {value}")))
}

/// Check that `response` carries a `status` and a `timestamp` within
/// `tolerance` of `now`.
///
/// Timestamps may be unix seconds (number or numeric string) or RFC 3339.
///
/// # Errors
///
/// Returns [`PermanentError::InvalidResponse`] describing the first problem found.
pub fn verify_response(
    response: &Value,
    tolerance: Duration,
    now: DateTime<Utc>,
) -> Result<(), PermanentError> {
    let Some(fields) = response.as_object() else {
        return Err(invalid("response is not a JSON object"));
    };

    if !fields.contains_key("status") {
        return Err(invalid("response is missing status"));
    }

    let timestamp = fields
        .get("timestamp")
        .ok_or_else(|| invalid("response is missing timestamp"))
        .and_then(parse_timestamp)?;

    let skew = (now - timestamp).abs();
    let tolerance = chrono::Duration::from_std(tolerance).unwrap_or(chrono::Duration::MAX);
    if skew > tolerance {
        return Err(invalid(format!(
            "timestamp {timestamp} is {}s away from local time",
            skew.num_seconds()
        )));
    }

    Ok(())
}
