//! Pipeline-facing records.
//!
//! A [`Record`] is what the pipeline sees on both sides of the bridge: an optional
//! routing key, a byte payload, string properties, and an outcome that is resolved
//! exactly once through [`Record::ack`] or [`Record::fail`]. Both methods take the
//! record by value, so resolving a record twice does not compile.

use crate::broker::{MessageId, Session};
use crate::metrics::BridgeMetrics;
use crate::{BridgeError, BridgeResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// How a record was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Failed,
    /// The record was dropped without being acked or failed
    Dropped,
}

/// Resolves with the [`Outcome`] of a tracked record.
///
/// Obtained from [`Record::track`]. Await it from any task; it completes when the
/// record is acked, failed, or dropped.
#[derive(Debug)]
pub struct RecordOutcome {
    rx: oneshot::Receiver<Outcome>,
}

impl Future for RecordOutcome {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Outcome::Dropped))
    }
}

/// Broker-side effect of resolving an inbound record
pub(crate) enum Acknowledger {
    /// Outbound record created by the pipeline
    Detached,
    /// Inbound record: ack acknowledges the session up to this message, fail rolls it back
    Session {
        session: Arc<dyn Session>,
        message_id: MessageId,
        metrics: Arc<BridgeMetrics>,
    },
}

/// Unit of data exchanged with the pipeline
pub struct Record {
    /// Routing key, carried on the wire as the group id property
    pub key: Option<String>,
    /// The message payload
    pub value: Vec<u8>,
    /// Message properties
    pub properties: HashMap<String, String>,
    /// Broker message id of an inbound record
    pub message_id: Option<MessageId>,
    /// Broker timestamp of an inbound record
    pub timestamp: Option<DateTime<Utc>>,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
    pub(crate) acknowledger: Acknowledger,
    observer: Option<oneshot::Sender<Outcome>>,
}

impl Record {
    /// Create a new record with payload
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            value: value.into(),
            properties: HashMap::new(),
            message_id: None,
            timestamp: None,
            redelivered: false,
            acknowledger: Acknowledger::Detached,
            observer: None,
        }
    }

    /// Create a record from a string payload
    pub fn from_string(value: impl Into<String>) -> Self {
        Self::new(value.into().into_bytes())
    }

    /// Create a record from a JSON-serializable object
    pub fn from_json<T: Serialize>(data: &T) -> BridgeResult<Self> {
        let payload = serde_json::to_vec(data)
            .map_err(|e| BridgeError::config(format!("Failed to serialize payload: {}", e)))?;
        Ok(Self::new(payload))
    }

    /// Set the routing key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Add a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Add multiple properties
    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties.extend(properties);
        self
    }

    /// Observe how this record gets resolved.
    ///
    /// Tracking again replaces the previous observer, whose outcome then resolves
    /// as [`Outcome::Dropped`].
    pub fn track(mut self) -> (Self, RecordOutcome) {
        let (tx, rx) = oneshot::channel();
        self.observer = Some(tx);
        (self, RecordOutcome { rx })
    }

    /// Get a specific property value
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(|s| s.as_str())
    }

    /// Get the payload size in bytes
    pub fn size(&self) -> usize {
        self.value.len()
    }

    /// Get the payload as a string slice (if valid UTF-8)
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    /// Whether resolving this record acknowledges or rolls back a broker session
    pub fn is_inbound(&self) -> bool {
        matches!(self.acknowledger, Acknowledger::Session { .. })
    }

    /// Resolve the record successfully.
    ///
    /// For an inbound record this acknowledges the message on its session, which
    /// also acknowledges every earlier unacknowledged message of that session. A
    /// failed acknowledge (including one attempted after the session was closed)
    /// returns [`BridgeError::AcknowledgeFailure`]; the connector must then be
    /// considered unusable and rebuilt.
    pub async fn ack(mut self) -> BridgeResult<()> {
        let observer = self.observer.take();
        let acknowledger = std::mem::replace(&mut self.acknowledger, Acknowledger::Detached);

        let result = match acknowledger {
            Acknowledger::Detached => Ok(()),
            Acknowledger::Session {
                session,
                message_id,
                metrics,
            } => match session.acknowledge(&message_id).await {
                Ok(()) => {
                    metrics.record_acked();
                    Ok(())
                }
                Err(source) => Err(BridgeError::AcknowledgeFailure {
                    message_id: message_id.to_string(),
                    source,
                }),
            },
        };

        notify(
            observer,
            if result.is_ok() {
                Outcome::Acked
            } else {
                Outcome::Failed
            },
        );
        result
    }

    /// Resolve the record as failed.
    ///
    /// For an inbound record this rolls back the session: every unacknowledged
    /// message of the session, not only this one, becomes eligible for
    /// redelivery. A failed rollback returns [`BridgeError::RollbackFailure`].
    pub async fn fail(mut self) -> BridgeResult<()> {
        let observer = self.observer.take();
        let acknowledger = std::mem::replace(&mut self.acknowledger, Acknowledger::Detached);

        let result = match acknowledger {
            Acknowledger::Detached => Ok(()),
            Acknowledger::Session {
                session, metrics, ..
            } => match session.rollback().await {
                Ok(()) => {
                    metrics.record_rolled_back();
                    Ok(())
                }
                Err(source) => Err(BridgeError::RollbackFailure { source }),
            },
        };

        notify(observer, Outcome::Failed);
        result
    }
}

fn notify(observer: Option<oneshot::Sender<Outcome>>, outcome: Outcome) {
    if let Some(tx) = observer {
        // receiver may be gone, nobody is waiting then
        let _ = tx.send(outcome);
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("key", &self.key)
            .field("size", &self.value.len())
            .field("properties", &self.properties)
            .field("message_id", &self.message_id)
            .field("redelivered", &self.redelivered)
            .field("inbound", &self.is_inbound())
            .finish()
    }
}
