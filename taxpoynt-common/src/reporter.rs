use async_trait::async_trait;

use crate::{TransmissionRequest, TransmissionResult};

/// Receives the outcome of every transmission attempt, whichever transmitter
/// produced it.
///
/// Implementations must not fail the caller: problems are logged and dropped.
#[async_trait]
pub trait DeliveryReporter: Send + Sync {
    async fn report(&self, request: &TransmissionRequest, result: &TransmissionResult);
}
