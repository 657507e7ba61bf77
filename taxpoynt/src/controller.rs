use std::sync::{Arc, LazyLock};

use serde::Deserialize;
use taxpoynt_common::{
    DeliveryReporter, Signal, internal,
    logging::{self, LoggingConfig},
    tracing,
};
use taxpoynt_metrics::{Metrics, MetricsConfig};
use taxpoynt_tracing::traced;
use taxpoynt_tracking::{DeliveryTracker, TrackerConfig};
use taxpoynt_transmission::{
    BatchConfig, BatchTransmitter, DocumentTransmitter, RealTimeConfig, RealTimeTransmitter,
    RetryHandler, RetryHandlerConfig, SecureTransmitter, StreamConfig, StreamServer,
    TransmitterConfig,
};
use tokio::{sync::broadcast, task::JoinSet};

use crate::security::SecurityConfig;

/// The whole service, as described by `taxpoynt.config.ron`.
///
/// Only `security` is required; every other section falls back to its
/// defaults. The live stream server runs only when `stream` is present.
#[derive(Debug, Default, Deserialize)]
pub struct TaxPoynt {
    #[serde(default)]
    pub transmitter: TransmitterConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(alias = "real_time", default)]
    pub realtime: RealTimeConfig,
    #[serde(default)]
    pub stream: Option<StreamConfig>,
    #[serde(default)]
    pub retry: RetryHandlerConfig,
    #[serde(alias = "tracking", default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Everything [`TaxPoynt::build`] wires together.
pub struct Services {
    pub metrics: Arc<Metrics>,
    pub transmitter: Arc<SecureTransmitter>,
    pub batch: Arc<BatchTransmitter>,
    pub realtime: Arc<RealTimeTransmitter>,
    pub retry: Arc<RetryHandler>,
    pub tracker: Arc<DeliveryTracker>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

#[traced(instrument(level = tracing::Level::TRACE))]
async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    if SHUTDOWN_BROADCAST.send(Signal::Shutdown).is_err() {
        tracing::warn!("No services left to notify of shutdown");
    }

    Ok(())
}

impl TaxPoynt {
    /// Construct every component and connect them: all transmitters share the
    /// secure transmitter and report to the tracker, and real-time failures
    /// are handed to the retry handler.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials, metrics exporter, HTTP clients or
    /// tracking database cannot be set up.
    pub async fn build(&self) -> anyhow::Result<Services> {
        let metrics = Arc::new(Metrics::init(&self.metrics)?);
        let security = Arc::new(self.security.load()?);

        let transmitter = Arc::new(SecureTransmitter::new(
            self.transmitter.clone(),
            security,
            Arc::clone(&metrics),
        )?);
        let document_transmitter: Arc<dyn DocumentTransmitter> = transmitter.clone();

        let tracker =
            Arc::new(DeliveryTracker::open(self.tracker.clone(), Arc::clone(&metrics)).await?);
        let reporter: Arc<dyn DeliveryReporter> = tracker.clone();

        let retry = Arc::new(
            RetryHandler::new(
                self.retry.clone(),
                Arc::clone(&document_transmitter),
                Arc::clone(&metrics),
            )
            .with_reporter(Arc::clone(&reporter)),
        );

        let batch = Arc::new(
            BatchTransmitter::new(
                self.batch.clone(),
                Arc::clone(&document_transmitter),
                Arc::clone(&metrics),
            )
            .with_reporter(Arc::clone(&reporter)),
        );

        let realtime = Arc::new(
            RealTimeTransmitter::new(
                self.realtime.clone(),
                document_transmitter,
                Arc::clone(&metrics),
            )?
            .with_retry_handler(Arc::clone(&retry))
            .with_reporter(reporter),
        );

        Ok(Services {
            metrics,
            transmitter,
            batch,
            realtime,
            retry,
            tracker,
        })
    }

    /// Run every service until Ctrl-C or SIGTERM, then shut them down
    /// together.
    ///
    /// # Errors
    ///
    /// Returns an error if any component fails to initialise.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, err), timing(precision = "s"))]
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init(&self.logging);
        let services = self.build().await?;

        internal!("Controller running");

        let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

        if let Some(stream) = &self.stream {
            let server = StreamServer::bind(stream, services.realtime.hub()).await?;
            let receiver = SHUTDOWN_BROADCAST.subscribe();
            tasks.spawn(async move { Ok(server.serve(receiver).await?) });
        }

        let receiver = SHUTDOWN_BROADCAST.subscribe();
        let realtime = Arc::clone(&services.realtime);
        tasks.spawn(async move { Ok(realtime.serve(receiver).await?) });

        let receiver = SHUTDOWN_BROADCAST.subscribe();
        let retry = Arc::clone(&services.retry);
        tasks.spawn(async move {
            retry.serve(receiver).await;
            Ok(())
        });

        let receiver = SHUTDOWN_BROADCAST.subscribe();
        let tracker = Arc::clone(&services.tracker);
        tasks.spawn(async move { Ok(tracker.serve(receiver).await?) });

        let mut result = tokio::select! {
            r = shutdown() => r,
            Some(exited) = tasks.join_next() => {
                tracing::error!("A service stopped unexpectedly: {exited:?}");
                let _ = SHUTDOWN_BROADCAST.send(Signal::Shutdown);
                flatten(exited)
            }
        };

        internal!("Shutting down...");

        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    let Some(joined) = joined else { break };
                    if let Err(e) = flatten(joined) {
                        tracing::error!("Service failed during shutdown: {e}");
                        result = result.and(Err(e));
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    internal!(level = WARN, "Forcing shutdown");
                    tasks.abort_all();
                    break;
                }
            }
        }

        if let Err(e) = services.metrics.shutdown() {
            tracing::warn!("Metrics shutdown failed: {e}");
        }
        let _ = SHUTDOWN_BROADCAST.send(Signal::Finalised);

        result
    }
}

fn flatten(
    joined: Result<anyhow::Result<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    joined.map_err(anyhow::Error::from)?
}
