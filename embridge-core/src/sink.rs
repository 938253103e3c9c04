//! Sink adapter: pipeline records -> broker destination.

use crate::broker::{ConnectionFactoryProvider, MessageProducer};
use crate::config::SinkSettings;
use crate::lifecycle::{BindFn, ConnectionManager, ConnectorState};
use crate::message::Record;
use crate::metrics::BridgeMetrics;
use crate::translate;
use crate::{BridgeError, BridgeResult, BrokerError};
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

/// Publishes records to a queue or topic.
///
/// `write` returns once the message is handed to the producer. The broker's
/// send completion is awaited on a tracked task which then acks the record on
/// success or fails it otherwise. `close` waits up to `close_timeout_ms` for
/// those tasks before releasing the connection.
///
/// A completion that reports the producer closed marks the sink unusable.
/// Further writes fail with [`BridgeError::Closed`] until `open` or
/// `reconnect` succeeds.
pub struct SinkAdapter {
    settings: SinkSettings,
    manager: ConnectionManager<Box<dyn MessageProducer>>,
    metrics: Arc<BridgeMetrics>,
    in_flight: TaskTracker,
    unusable: Arc<AtomicBool>,
}

impl SinkAdapter {
    pub fn new(
        provider: Arc<dyn ConnectionFactoryProvider>,
        settings: SinkSettings,
    ) -> BridgeResult<Self> {
        settings.validate()?;

        let metrics = Arc::new(BridgeMetrics::new(
            &settings.connection.connection_name,
            &settings.connection.resolved_destination().to_string(),
        ));

        let options = settings.producer_options();
        let bind: BindFn<Box<dyn MessageProducer>> = Arc::new(move |session, destination| {
            let options = options.clone();
            async move { session.create_producer(&destination, &options).await }.boxed()
        });

        Ok(Self {
            manager: ConnectionManager::new(provider, bind, Arc::clone(&metrics)),
            settings,
            metrics,
            in_flight: TaskTracker::new(),
            unusable: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn settings(&self) -> &SinkSettings {
        &self.settings
    }

    pub async fn open(&self) -> BridgeResult<()> {
        self.manager.open(&self.settings.connection).await?;
        self.unusable.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub async fn reconnect(&self) -> BridgeResult<()> {
        self.manager.reconnect(&self.settings.connection).await?;
        self.unusable.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// True once a send completion reported the producer closed
    pub fn is_unusable(&self) -> bool {
        self.unusable.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> ConnectorState {
        self.manager.state().await
    }

    /// Number of sends whose completion has not resolved yet
    pub fn pending_completions(&self) -> usize {
        self.in_flight.len()
    }

    /// Translate the record and send it without waiting for the broker.
    ///
    /// The record is acked or failed later, when the send completes. If the
    /// sink is not open the record is failed immediately and
    /// [`BridgeError::NotConnected`] is returned. An unusable sink fails the
    /// record the same way and returns [`BridgeError::Closed`].
    pub async fn write(&self, record: Record) -> BridgeResult<()> {
        if self.is_unusable() {
            warn!(key = ?record.key, "write on an unusable sink, failing record");
            if let Err(fail_err) = record.fail().await {
                error!("failed to fail record: {}", fail_err);
            }
            return Err(BridgeError::Closed);
        }

        let binding = match self.manager.current().await {
            Ok(binding) => binding,
            Err(e) => {
                warn!(key = ?record.key, "write on a closed sink, failing record");
                if let Err(fail_err) = record.fail().await {
                    error!("failed to fail record: {}", fail_err);
                }
                return Err(e);
            }
        };

        let message = translate::to_message(&record);
        debug!(
            destination = %binding.destination(),
            key = ?record.key,
            size = record.size(),
            "sending message"
        );

        let started = Instant::now();
        let completion = binding.handle().send(message);
        let metrics = Arc::clone(&self.metrics);
        let destination = binding.destination().clone();
        let unusable = Arc::clone(&self.unusable);

        self.in_flight.spawn(async move {
            match completion.await {
                Ok(()) => {
                    metrics.record_sent(started.elapsed());
                    if let Err(e) = record.ack().await {
                        error!(%destination, "failed to ack record after send: {}", e);
                    }
                }
                Err(cause) => {
                    if cause == BrokerError::Closed {
                        unusable.store(true, Ordering::SeqCst);
                    }
                    metrics.record_send_failure();
                    warn!(%destination, "{}", BridgeError::SendFailure(cause));
                    if let Err(e) = record.fail().await {
                        error!(%destination, "failed to fail record after send error: {}", e);
                    }
                }
            }
        });

        Ok(())
    }

    /// Wait for outstanding send completions, then close the connection.
    ///
    /// Completions still pending after `close_timeout_ms` are left to resolve
    /// against the closed producer. Safe to call repeatedly.
    pub async fn close(&self) -> BridgeResult<()> {
        self.in_flight.close();
        let drained =
            tokio::time::timeout(self.settings.close_timeout(), self.in_flight.wait()).await;
        if drained.is_err() {
            warn!(
                pending = self.in_flight.len(),
                "closing with send completions still outstanding"
            );
        }
        self.in_flight.reopen();

        self.manager.close().await
    }
}
