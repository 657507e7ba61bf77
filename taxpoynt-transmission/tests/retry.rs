mod support;

use std::{sync::Arc, time::Duration};

use support::{
    invoice,
    scripted::{Outcome, ScriptedTransmitter},
};
use taxpoynt_common::{Signal, TransmissionResult};
use taxpoynt_metrics::Metrics;
use taxpoynt_transmission::{
    RetryDecision, RetryError, RetryHandler, RetryHandlerConfig, RetryPolicy,
    retry::{CircuitBreakerConfig, CircuitState, RetryReason, RetryState, classify},
};
use tokio::sync::broadcast;

fn handler(scripted: &Arc<ScriptedTransmitter>, policy: RetryPolicy) -> Arc<RetryHandler> {
    let config = RetryHandlerConfig {
        default_policy: policy,
        circuit_breaker: CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            ..CircuitBreakerConfig::default()
        },
        ..RetryHandlerConfig::default()
    };
    Arc::new(RetryHandler::new(
        config,
        scripted.clone(),
        Arc::new(Metrics::local()),
    ))
}

fn timeout_failure(document_id: &str) -> TransmissionResult {
    TransmissionResult::failed(document_id, "Connection timeout")
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_scheduled_with_base_delay() {
    assert_eq!(classify(Some("Connection timeout")), RetryReason::Timeout);

    let scripted = Arc::new(ScriptedTransmitter::new());
    let handler = handler(&scripted, RetryPolicy::default());

    let decision =
        handler.handle_failed_transmission(invoice("INV-1"), timeout_failure("INV-1"), None);

    let RetryDecision::Scheduled {
        retry_id,
        attempt,
        delay,
    } = decision
    else {
        panic!("expected a scheduled retry, got {decision:?}");
    };
    assert_eq!(attempt, 1);
    assert!(delay >= Duration::from_millis(900) && delay <= Duration::from_millis(1100));

    tokio::time::sleep(Duration::from_secs(2)).await;

    let retry = handler.get_retry_status(retry_id).unwrap();
    assert_eq!(retry.state, RetryState::Succeeded);
    assert_eq!(retry.current_attempt, 1);
    assert!(retry.final_result.unwrap().is_delivered());
    assert_eq!(scripted.attempts("INV-1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_circuit_opens_after_threshold() {
    let scripted = Arc::new(ScriptedTransmitter::new());
    let handler = handler(&scripted, RetryPolicy::default());

    let mut decisions = Vec::new();
    for n in 0..5 {
        let document_id = format!("INV-{n}");
        decisions.push(handler.handle_failed_transmission(
            invoice(&document_id),
            timeout_failure(&document_id),
            None,
        ));
    }

    assert!(decisions[..4].iter().all(RetryDecision::is_scheduled));
    assert!(matches!(&decisions[4], RetryDecision::CircuitOpen { endpoint } if endpoint == "/submit"));
    assert!(!handler.check_circuit_breaker("/submit"));
    assert_eq!(handler.circuit_state("/submit"), CircuitState::Open);
    assert!(
        handler
            .circuit_stats("/submit")
            .and_then(|stats| stats.retry_after)
            .is_some_and(|wait| wait <= Duration::from_secs(60))
    );
}

#[tokio::test(start_paused = true)]
async fn test_retries_wait_out_open_circuit() {
    let scripted = Arc::new(ScriptedTransmitter::new());
    let handler = handler(&scripted, RetryPolicy::default());

    let retry_ids: Vec<_> = (0..5)
        .filter_map(|n| {
            let document_id = format!("INV-{n}");
            handler
                .handle_failed_transmission(
                    invoice(&document_id),
                    timeout_failure(&document_id),
                    None,
                )
                .retry_id()
        })
        .collect();
    assert_eq!(retry_ids.len(), 4);
    assert_eq!(handler.circuit_state("/submit"), CircuitState::Open);

    // Every first attempt comes due while the circuit is open.
    tokio::time::sleep(Duration::from_secs(20)).await;

    assert!(scripted.calls().is_empty());
    assert!(handler.dead_letters().is_empty());
    for retry_id in &retry_ids {
        let retry = handler.get_retry_status(*retry_id).unwrap();
        assert_eq!(retry.state, RetryState::Scheduled);
        assert_eq!(retry.current_attempt, 1);
        assert_eq!(retry.attempts.len(), 1);
        assert_eq!(retry.attempts[0].circuit_skips, 1);
        assert!(retry.attempts[0].executed_at.is_none());
    }

    tokio::time::sleep(Duration::from_secs(45)).await;

    assert_eq!(scripted.calls().len(), 4);
    assert!(handler.dead_letters().is_empty());
    for retry_id in &retry_ids {
        let retry = handler.get_retry_status(*retry_id).unwrap();
        assert_eq!(retry.state, RetryState::Succeeded);
        assert_eq!(retry.current_attempt, 1);
    }
    assert_eq!(handler.circuit_state("/submit"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_dead_letter_and_reprocess() {
    let scripted = Arc::new(ScriptedTransmitter::new());
    scripted.script(
        "INV-9",
        std::iter::repeat_n(Outcome::Fail("Request timeout: read".into()), 2),
    );
    let policy = RetryPolicy {
        max_attempts: 2,
        ..RetryPolicy::default()
    };
    let handler = handler(&scripted, policy);

    let decision =
        handler.handle_failed_transmission(invoice("INV-9"), timeout_failure("INV-9"), None);
    let retry_id = decision.retry_id().unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(scripted.attempts("INV-9"), 2);
    let retry = handler.get_retry_status(retry_id).unwrap();
    assert_eq!(retry.state, RetryState::DeadLettered);

    let dead_letters = handler.dead_letters();
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].retry_id(), retry_id);
    assert!(
        dead_letters[0]
            .final_error
            .as_deref()
            .is_some_and(|error| error.contains("Request timeout"))
    );
    assert_eq!(handler.stats().dead_letters, 1);

    let decision = handler.reprocess_dead_letter(retry_id).unwrap();
    let new_id = decision.retry_id().unwrap();
    assert_ne!(new_id, retry_id);
    assert!(handler.dead_letters().is_empty());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        handler.get_retry_status(new_id).unwrap().state,
        RetryState::Succeeded
    );

    assert!(matches!(
        handler.reprocess_dead_letter(retry_id),
        Err(RetryError::DeadLetterNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_retry_never_runs() {
    let scripted = Arc::new(ScriptedTransmitter::new());
    let handler = handler(&scripted, RetryPolicy::default());

    let retry_id = handler
        .handle_failed_transmission(invoice("INV-2"), timeout_failure("INV-2"), None)
        .retry_id()
        .unwrap();

    assert!(handler.cancel_retry(retry_id));
    assert!(!handler.cancel_retry(retry_id));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(scripted.calls().is_empty());
    assert_eq!(
        handler.get_retry_status(retry_id).unwrap().state,
        RetryState::Cancelled
    );
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failures_are_not_retried() {
    let scripted = Arc::new(ScriptedTransmitter::new());
    let handler = handler(&scripted, RetryPolicy::default());

    let rejected = TransmissionResult::failed("INV-3", "Rejected by regulator (HTTP 400): bad tin");
    let decision = handler.handle_failed_transmission(invoice("INV-3"), rejected, None);
    assert!(matches!(decision, RetryDecision::NotRetryable { .. }));

    let mut delivered = TransmissionResult::pending("INV-4");
    delivered.status = taxpoynt_common::TransmissionStatus::Delivered;
    let decision = handler.handle_failed_transmission(invoice("INV-4"), delivered, None);
    assert!(matches!(decision, RetryDecision::NotRetryable { .. }));

    assert_eq!(handler.stats().scheduled, 0);
    assert!(handler.circuit_stats("/submit").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_retry_failure_is_abandoned() {
    let scripted = Arc::new(ScriptedTransmitter::new());
    scripted.script(
        "INV-5",
        [Outcome::Fail("Authentication failed: HTTP 401".into())],
    );
    let handler = handler(&scripted, RetryPolicy::default());

    let retry_id = handler
        .handle_failed_transmission(invoice("INV-5"), timeout_failure("INV-5"), None)
        .retry_id()
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let retry = handler.get_retry_status(retry_id).unwrap();
    assert_eq!(retry.state, RetryState::Abandoned);
    assert!(handler.dead_letters().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_scheduled_retries() {
    let scripted = Arc::new(ScriptedTransmitter::new());
    let handler = handler(&scripted, RetryPolicy::default());
    let (shutdown, receiver) = broadcast::channel(1);
    let serving = tokio::spawn(Arc::clone(&handler).serve(receiver));

    handler.handle_failed_transmission(invoice("INV-6"), timeout_failure("INV-6"), None);
    shutdown.send(Signal::Shutdown).unwrap();
    serving.await.unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(scripted.calls().is_empty());
}
