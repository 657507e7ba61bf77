//! Keyword classification of failure messages.
//!
//! Rules are checked in order and the first match wins, so the more specific
//! classes come first: "Connection timeout" is a timeout, not a network error,
//! and every temporary error's "Temporary failure:" prefix only matters when
//! nothing more precise matched.

use super::RetryReason;

const RULES: &[(RetryReason, &[&str])] = &[
    (RetryReason::Timeout, &["timeout", "timed out"]),
    (RetryReason::RateLimit, &["rate limit", "too many requests"]),
    (
        RetryReason::AuthenticationError,
        &["authentication", "unauthorized", "forbidden"],
    ),
    (
        RetryReason::ServerError,
        &[
            "server error",
            "internal server",
            "bad gateway",
            "service unavailable",
        ],
    ),
    (
        RetryReason::NetworkError,
        &["network", "connection", "dns", "unreachable", "reset"],
    ),
    (
        RetryReason::TemporaryFailure,
        &["temporary", "temporarily", "try again"],
    ),
];

/// Derive the [`RetryReason`] for a failure message.
#[must_use]
pub fn classify(error_message: Option<&str>) -> RetryReason {
    let Some(message) = error_message else {
        return RetryReason::Unknown;
    };
    let message = message.to_lowercase();

    RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|keyword| message.contains(keyword)))
        .map_or(RetryReason::Unknown, |(reason, _)| *reason)
}
