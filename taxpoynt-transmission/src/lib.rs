//! Reliable delivery of tax documents to the regulator.
//!
//! - [`SecureTransmitter`] encrypts, signs and posts a single document.
//! - [`BatchTransmitter`] fans a batch out under a scheduling strategy.
//! - [`RealTimeTransmitter`] serves a priority queue with live status events.
//! - [`RetryHandler`] re-attempts failures behind per-endpoint circuit breakers.
//!
//! All of them drive transmissions through the [`DocumentTransmitter`] trait and
//! report outcomes through [`taxpoynt_common::DeliveryReporter`].

pub mod batch;
pub mod config;
pub mod crypto;
pub mod error;
pub mod realtime;
pub mod retry;
pub mod transmitter;

pub use batch::{BatchRequest, BatchResult, BatchStrategy, BatchTransmitter};
pub use config::{
    BatchConfig, RealTimeConfig, RetryHandlerConfig, StreamConfig, TransmitterConfig,
};
pub use error::{
    BatchError, PermanentError, RealTimeError, RetryError, StreamError, SystemError,
    TemporaryError, TransmissionError,
};
pub use realtime::{RealTimeRequest, RealTimeTransmitter, StreamServer};
pub use retry::{RetryDecision, RetryHandler, RetryPolicy};
pub use transmitter::{DocumentTransmitter, SecureTransmitter};
