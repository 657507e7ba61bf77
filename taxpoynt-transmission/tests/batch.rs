mod support;

use std::{collections::HashSet, sync::Arc, time::Duration};

use pretty_assertions::assert_eq;
use serde_json::json;
use support::scripted::{Outcome, ScriptedTransmitter};
use taxpoynt_metrics::Metrics;
use taxpoynt_transmission::{
    BatchConfig, BatchError, BatchRequest, BatchStrategy, BatchTransmitter,
    batch::{BatchItem, BatchStatus},
};

fn item(document_id: &str) -> BatchItem {
    BatchItem::new(document_id, "invoice", json!({"total": 10}), "/submit")
}

fn batch_transmitter(scripted: &Arc<ScriptedTransmitter>) -> BatchTransmitter {
    let config = BatchConfig {
        item_backoff_base_ms: 1,
        ..BatchConfig::default()
    };
    BatchTransmitter::new(config, scripted.clone(), Arc::new(Metrics::local()))
}

#[tokio::test]
async fn test_validation_failure_processes_nothing() {
    let scripted = Arc::new(ScriptedTransmitter::new());
    let transmitter = batch_transmitter(&scripted);
    let empty = BatchItem::new("INV-3", "invoice", json!({}), "/submit").with_item_id("item-3");
    let request = BatchRequest::new(vec![item("INV-1"), item("INV-2"), empty]);
    let batch_id = request.batch_id.clone();

    let err = transmitter.transmit_batch(request).await.unwrap_err();

    match err {
        BatchError::Validation { errors, .. } => {
            assert_eq!(errors, vec!["Empty document data: item-3".to_string()]);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(scripted.calls().is_empty());
    assert_eq!(transmitter.get_batch_status(&batch_id), Some(BatchStatus::Failed));

    let recorded = transmitter.get_batch_result(&batch_id).unwrap();
    assert_eq!(recorded.successful_items, 0);
    assert_eq!(recorded.failed_items, 3);
    assert!(recorded.item_results.iter().all(|result| result.attempts == 0));
}

#[tokio::test]
async fn test_oversized_batch_is_rejected() {
    let scripted = Arc::new(ScriptedTransmitter::new());
    let config = BatchConfig {
        max_batch_size: 2,
        ..BatchConfig::default()
    };
    let transmitter = BatchTransmitter::new(config, scripted.clone(), Arc::new(Metrics::local()));
    let request = BatchRequest::new(vec![item("INV-1"), item("INV-2"), item("INV-3")]);

    assert!(!transmitter.validate_batch(&request).valid);
    let err = transmitter.transmit_batch(request).await.unwrap_err();
    assert!(matches!(err, BatchError::TooLarge { size: 3, max: 2, .. }));
    assert!(scripted.calls().is_empty());
}

#[tokio::test]
async fn test_parallel_respects_max_parallel() {
    let scripted = Arc::new(ScriptedTransmitter::with_delay(Duration::from_millis(20)));
    let transmitter = batch_transmitter(&scripted);
    let items = (0..10).map(|n| item(&format!("INV-{n}"))).collect();
    let request = BatchRequest::new(items)
        .with_strategy(BatchStrategy::Parallel)
        .with_max_parallel(2);

    let result = transmitter.transmit_batch(request).await.unwrap();

    assert_eq!(result.status, BatchStatus::Completed);
    assert_eq!(result.item_results.len(), 10);
    assert_eq!(result.successful_items, 10);
    assert!(scripted.peak_concurrency() <= 2);
    assert_eq!(scripted.calls().len(), 10);
}

#[tokio::test]
async fn test_partial_failure_and_counts() {
    let scripted = Arc::new(ScriptedTransmitter::new());
    scripted.script(
        "INV-2",
        std::iter::repeat_n(Outcome::Fail("Rejected by regulator (HTTP 400): bad".into()), 5),
    );
    scripted.script("INV-3", [Outcome::Panic]);
    let transmitter = batch_transmitter(&scripted);
    let request = BatchRequest::new(vec![item("INV-1"), item("INV-2"), item("INV-3")])
        .with_strategy(BatchStrategy::Sequential);

    let result = transmitter.transmit_batch(request).await.unwrap();

    assert_eq!(result.status, BatchStatus::PartiallyCompleted);
    assert_eq!(result.total_items, 3);
    assert_eq!(result.successful_items + result.failed_items, result.total_items);
    assert_eq!(result.successful_items, 1);
    assert_eq!(result.item_results.len(), 3);

    let ids: HashSet<_> = result.item_results.iter().map(|r| r.document_id.as_str()).collect();
    assert_eq!(ids.len(), 3);

    // Three attempts with retry_failed, then give up.
    assert_eq!(scripted.attempts("INV-2"), 3);
    assert!((result.success_rate() - 1.0 / 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_retry_failed_disabled_makes_one_attempt() {
    let scripted = Arc::new(ScriptedTransmitter::new());
    scripted.script("INV-1", [Outcome::Fail("Connection failed: reset".into())]);
    let transmitter = batch_transmitter(&scripted);
    let request = BatchRequest::new(vec![item("INV-1")]).with_retry_failed(false);

    let result = transmitter.transmit_batch(request).await.unwrap();

    assert_eq!(result.status, BatchStatus::Failed);
    assert_eq!(scripted.attempts("INV-1"), 1);
}

#[tokio::test]
async fn test_priority_orders_items() {
    let scripted = Arc::new(ScriptedTransmitter::new());
    let transmitter = batch_transmitter(&scripted);
    let request = BatchRequest::new(vec![
        item("low").with_priority(1),
        item("high").with_priority(9),
        item("mid").with_priority(5),
        item("mid-2").with_priority(5),
    ])
    .with_strategy(BatchStrategy::Priority);

    transmitter.transmit_batch(request).await.unwrap();

    assert_eq!(scripted.calls(), vec!["high", "mid", "mid-2", "low"]);
}

#[tokio::test]
async fn test_timeout_fills_missing_items() {
    let scripted = Arc::new(ScriptedTransmitter::with_delay(Duration::from_millis(200)));
    let transmitter = batch_transmitter(&scripted);
    let request = BatchRequest::new(vec![item("INV-1"), item("INV-2"), item("INV-3")])
        .with_strategy(BatchStrategy::Sequential)
        .with_timeout(Duration::from_millis(300));

    let result = transmitter.transmit_batch(request).await.unwrap();

    assert_eq!(result.item_results.len(), 3);
    assert_eq!(result.successful_items, 1);
    assert_eq!(result.status, BatchStatus::PartiallyCompleted);
    assert!(
        result
            .item_results
            .iter()
            .filter(|r| !r.is_delivered())
            .all(|r| r.error_message.as_deref() == Some("Batch processing timed out"))
    );
    assert!(result.error_messages.contains(&"Batch processing timed out".to_string()));
}

#[tokio::test]
async fn test_optimized_groups_all_items() {
    let scripted = Arc::new(ScriptedTransmitter::new());
    let transmitter = batch_transmitter(&scripted);
    let mut items: Vec<BatchItem> = (0..8).map(|n| item(&format!("INV-{n}"))).collect();
    items.push(BatchItem::new("B2B-1", "invoice", json!({"total": 1}), "/b2b"));

    let result = transmitter
        .transmit_batch(BatchRequest::new(items))
        .await
        .unwrap();

    assert_eq!(result.status, BatchStatus::Completed);
    assert_eq!(result.item_results.len(), 9);

    let stats = transmitter.stats();
    assert_eq!(stats.total_batches, 1);
    assert_eq!(stats.completed_batches, 1);
    assert_eq!(stats.successful_items, 9);
    assert_eq!(stats.active_batches, 0);
}
