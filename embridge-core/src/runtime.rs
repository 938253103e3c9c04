//! Runtimes driving the adapters.
//!
//! The runtimes handle:
//! - Opening and closing the adapter
//! - The read/write loop
//! - Reconnecting after fatal errors when `reconnect_on_fatal` is set
//! - Graceful shutdown through a cancellation token or Ctrl-C

use crate::lifecycle::ConnectorState;
use crate::message::Record;
use crate::sink::SinkAdapter;
use crate::source::SourceAdapter;
use crate::traits::RecordHandler;
use crate::{BridgeError, BridgeResult};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Back-off after a non-fatal read error
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Initialize tracing/logging.
///
/// `RUST_LOG` takes precedence over `log_level`. Does nothing when a global
/// subscriber is already installed.
pub fn init_tracing(log_level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                shutdown.cancel();
            }
            Err(e) => error!("Failed to listen for ctrl-c: {}", e),
        }
    });
}

/// Runtime for source connectors (broker -> pipeline)
pub struct SourceRuntime<H: RecordHandler> {
    handler: H,
    source: SourceAdapter,
    shutdown: CancellationToken,
    listen_for_signals: bool,
}

impl<H: RecordHandler> SourceRuntime<H> {
    pub fn new(handler: H, source: SourceAdapter) -> Self {
        Self {
            handler,
            source,
            shutdown: CancellationToken::new(),
            listen_for_signals: false,
        }
    }

    /// Stop on Ctrl-C
    pub fn with_ctrl_c(mut self) -> Self {
        self.listen_for_signals = true;
        self
    }

    /// Token that stops the runtime when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn source(&self) -> &SourceAdapter {
        &self.source
    }

    /// Run until shutdown or a fatal error
    pub async fn run(&mut self) -> BridgeResult<()> {
        info!(connection = %self.source.settings().connection, "Starting Source Runtime");

        if self.listen_for_signals {
            spawn_signal_handler(self.shutdown.clone());
        }

        self.handler.initialize().await?;
        self.source.open().await?;

        info!("Entering main processing loop");
        let result = self.process_loop().await;

        info!("Shutting down source");
        if let Err(e) = self.source.close().await {
            warn!("Failed to close source: {}", e);
        }
        self.handler.shutdown().await?;
        info!("Source Runtime stopped");

        result
    }

    async fn process_loop(&mut self) -> BridgeResult<()> {
        loop {
            let read = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                read = self.source.read() => read,
            };

            match read {
                Ok(record) => match self.handler.handle(record).await {
                    Ok(()) => {}
                    Err(e) if e.is_fatal() => self.recover(e).await?,
                    Err(e) if e.is_closed() => {
                        error!("Record handler is closed: {}", e);
                        return Err(e);
                    }
                    Err(e) => error!("Failed to handle record: {}", e),
                },
                Err(e) if e.is_closed() => {
                    if self.shutdown.is_cancelled()
                        || self.source.state().await == ConnectorState::Closed
                    {
                        debug!("Source closed, leaving processing loop");
                        return Ok(());
                    }
                    // consumer closed underneath an open connector
                    self.recover(e).await?;
                }
                Err(e) if e.is_fatal() => self.recover(e).await?,
                Err(e) => {
                    error!("Failed to read from source: {}", e);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
    }

    /// Reconnect when configured, otherwise hand the error back to stop the loop
    async fn recover(&self, e: BridgeError) -> BridgeResult<()> {
        if e.is_poison_message() || !self.source.settings().processing.reconnect_on_fatal {
            error!("Stopping source: {}", e);
            return Err(e);
        }

        warn!("Rebuilding source connection after: {}", e);
        self.source.reconnect().await
    }
}

/// Runtime for sink connectors (pipeline -> broker)
pub struct SinkRuntime {
    sink: SinkAdapter,
    records: mpsc::Receiver<Record>,
    shutdown: CancellationToken,
    listen_for_signals: bool,
}

impl SinkRuntime {
    pub fn new(sink: SinkAdapter, records: mpsc::Receiver<Record>) -> Self {
        Self {
            sink,
            records,
            shutdown: CancellationToken::new(),
            listen_for_signals: false,
        }
    }

    /// Stop on Ctrl-C
    pub fn with_ctrl_c(mut self) -> Self {
        self.listen_for_signals = true;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn sink(&self) -> &SinkAdapter {
        &self.sink
    }

    /// Write records until the channel closes, shutdown, or the sink becomes unusable
    pub async fn run(&mut self) -> BridgeResult<()> {
        info!(connection = %self.sink.settings().connection, "Starting Sink Runtime");

        if self.listen_for_signals {
            spawn_signal_handler(self.shutdown.clone());
        }

        self.sink.open().await?;

        info!("Entering main processing loop");
        let result = self.process_loop().await;

        info!("Shutting down sink");
        if let Err(e) = self.sink.close().await {
            warn!("Failed to close sink: {}", e);
        }
        info!("Sink Runtime stopped");

        result
    }

    async fn process_loop(&mut self) -> BridgeResult<()> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                next = self.records.recv() => next,
            };

            let Some(record) = next else {
                info!("Record channel closed");
                return Ok(());
            };

            // a completion reported the producer closed, rebuild before sending more
            if self.sink.is_unusable() {
                if let Err(e) = self.recover(BridgeError::Closed).await {
                    if let Err(fail_err) = record.fail().await {
                        error!("failed to fail record: {}", fail_err);
                    }
                    return Err(e);
                }
            }

            if let Err(e) = self.sink.write(record).await {
                self.recover(e).await?;
            }
        }
    }

    /// Reconnect when configured, otherwise hand the error back to stop the loop
    async fn recover(&self, e: BridgeError) -> BridgeResult<()> {
        if !self.sink.settings().processing.reconnect_on_fatal {
            error!("Stopping sink: {}", e);
            return Err(e);
        }

        warn!("Rebuilding sink connection after: {}", e);
        self.sink.reconnect().await
    }
}
