//! Connection lifecycle management.
//!
//! [`ConnectionManager`] owns the single active connection / session / handle
//! triple of a connector. The handle (a consumer for sources, a producer for
//! sinks) is created by a [`BindFn`] supplied by the adapter.
//!
//! Lifecycle operations (`open`, `reconnect`, `close`) are serialized. The active
//! triple is published as one `Arc<Binding>` behind a lock: adapter operations
//! take a snapshot with [`ConnectionManager::current`] and never observe a
//! partially built or partially torn down binding.

use crate::broker::{AcknowledgeMode, Connection, ConnectionFactoryProvider, Session};
use crate::config::ConnectionSettings;
use crate::destination::Destination;
use crate::error::BrokerError;
use crate::metrics::BridgeMetrics;
use crate::{BridgeError, BridgeResult};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Attaches a consumer or producer to a freshly created session
pub type BindFn<H> = Arc<
    dyn Fn(Arc<dyn Session>, Destination) -> BoxFuture<'static, Result<H, BrokerError>>
        + Send
        + Sync,
>;

/// Lifecycle state of a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Closed,
    Open,
}

/// The active connection, its session, the resolved destination and the bound handle
pub struct Binding<H> {
    connection: Box<dyn Connection>,
    session: Arc<dyn Session>,
    destination: Destination,
    handle: H,
}

impl<H> Binding<H> {
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }
}

pub struct ConnectionManager<H> {
    provider: Arc<dyn ConnectionFactoryProvider>,
    bind: BindFn<H>,
    active: RwLock<Option<Arc<Binding<H>>>>,
    lifecycle: Mutex<()>,
    metrics: Arc<BridgeMetrics>,
}

impl<H: Send + Sync + 'static> ConnectionManager<H> {
    pub fn new(
        provider: Arc<dyn ConnectionFactoryProvider>,
        bind: BindFn<H>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            provider,
            bind,
            active: RwLock::new(None),
            lifecycle: Mutex::new(()),
            metrics,
        }
    }

    /// Connect, create a client-acknowledge session, bind and start delivery.
    ///
    /// No retry happens here; retrying is the provider's job. Opening an already
    /// open manager replaces the active connection like [`Self::reconnect`].
    pub async fn open(&self, settings: &ConnectionSettings) -> BridgeResult<()> {
        let _guard = self.lifecycle.lock().await;

        if self.active.read().await.is_some() {
            warn!(connection = %settings, "open called on an open connector, replacing the active connection");
        }

        let binding = self.establish(settings).await?;
        self.install(binding).await;
        info!(connection = %settings, "listening for messages");
        Ok(())
    }

    /// Rebuild the connection after an external failure signal.
    ///
    /// The new triple is fully established before it replaces the old one; the old
    /// connection is closed afterwards. If establishing fails the previous
    /// binding stays in place and the error is returned.
    pub async fn reconnect(&self, settings: &ConnectionSettings) -> BridgeResult<()> {
        let _guard = self.lifecycle.lock().await;

        info!(connection = %settings, "reconnecting");
        let binding = self.establish(settings).await?;
        self.install(binding).await;
        self.metrics.record_reconnect();
        info!(connection = %settings, "reconnected");
        Ok(())
    }

    /// Close the active connection, if any. Safe to call repeatedly.
    pub async fn close(&self) -> BridgeResult<()> {
        let _guard = self.lifecycle.lock().await;

        let Some(binding) = self.active.write().await.take() else {
            debug!("connection already closed or was never opened");
            return Ok(());
        };

        self.metrics.set_connected(false);
        debug!(destination = %binding.destination, "closing connection");
        binding
            .connection
            .close()
            .await
            .map_err(|e| BridgeError::connection_with_source("Failed to close connection", e))?;
        info!(destination = %binding.destination, "closed connection");
        Ok(())
    }

    /// Snapshot of the active binding
    pub async fn current(&self) -> BridgeResult<Arc<Binding<H>>> {
        self.active
            .read()
            .await
            .clone()
            .ok_or(BridgeError::NotConnected)
    }

    pub async fn state(&self) -> ConnectorState {
        if self.active.read().await.is_some() {
            ConnectorState::Open
        } else {
            ConnectorState::Closed
        }
    }

    async fn establish(&self, settings: &ConnectionSettings) -> BridgeResult<Binding<H>> {
        let connection = self.provider.create_connection(settings).await.map_err(|e| {
            BridgeError::connection_with_source(format!("Failed to connect {}", settings), e)
        })?;
        debug!(connection = %settings, "created connection");

        match self.bind_session(connection.as_ref(), settings).await {
            Ok((session, destination, handle)) => Ok(Binding {
                connection,
                session,
                destination,
                handle,
            }),
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    warn!(connection = %settings, "failed to close half-open connection: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn bind_session(
        &self,
        connection: &dyn Connection,
        settings: &ConnectionSettings,
    ) -> BridgeResult<(Arc<dyn Session>, Destination, H)> {
        let session = connection
            .create_session(AcknowledgeMode::Client)
            .await
            .map_err(|e| BridgeError::connection_with_source("Failed to create session", e))?;
        debug!(connection = %settings, "created session");

        let destination = settings.resolved_destination();
        let handle = (self.bind)(Arc::clone(&session), destination.clone())
            .await
            .map_err(|e| {
                BridgeError::connection_with_source(format!("Failed to bind to {}", destination), e)
            })?;

        connection
            .start()
            .await
            .map_err(|e| BridgeError::connection_with_source("Failed to start connection", e))?;

        Ok((session, destination, handle))
    }

    async fn install(&self, binding: Binding<H>) {
        let previous = self.active.write().await.replace(Arc::new(binding));
        self.metrics.set_connected(true);

        if let Some(previous) = previous {
            debug!(destination = %previous.destination, "closing replaced connection");
            if let Err(e) = previous.connection.close().await {
                warn!(destination = %previous.destination, "failed to close replaced connection: {}", e);
            }
        }
    }
}
