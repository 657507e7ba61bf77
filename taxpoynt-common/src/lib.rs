pub mod logging;
pub mod reporter;
pub mod transmission;
pub mod webhook;

pub use reporter::DeliveryReporter;
pub use tracing;
pub use transmission::{
    SecurityContext, SecurityLevel, TransmissionRequest, TransmissionResult, TransmissionStatus,
};
pub use webhook::{WebhookClient, WebhookError};

/// Lifecycle broadcast shared by every long-running service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
