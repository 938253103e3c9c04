//! Error types for bridge connectors.

use thiserror::Error;

/// Result type used across the bridge.
pub type BridgeResult<T> = Result<T, BridgeError>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the lifecycle manager and the source/sink adapters.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The provider could not produce a usable connection, session or binding
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// An inbound message had a body kind the bridge cannot translate
    #[error("Unsupported message type '{kind}' (message id: {})", .message_id.as_deref().unwrap_or("<none>"))]
    UnsupportedMessageType {
        kind: String,
        message_id: Option<String>,
    },

    /// An inbound message carried no broker id, so it cannot be acknowledged on its own
    #[error("Received message without id from {destination}")]
    MissingMessageId { destination: String },

    /// The broker rejected an acknowledge; the session is no longer usable
    #[error("Failed to acknowledge message {message_id}")]
    AcknowledgeFailure {
        message_id: String,
        #[source]
        source: BrokerError,
    },

    /// The broker rejected a rollback; the session is no longer usable
    #[error("Failed to roll back session")]
    RollbackFailure {
        #[source]
        source: BrokerError,
    },

    /// An outbound send did not complete
    #[error("Send failed: {0}")]
    SendFailure(#[source] BrokerError),

    /// A receive on the bound consumer failed
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: BrokerError,
    },

    /// No connection is active (never opened or already closed)
    #[error("Connector is not connected")]
    NotConnected,

    /// The bound consumer or producer was closed while an operation was in flight
    #[error("Connector was closed")]
    Closed,

    /// I/O errors (config files)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a connection error without an underlying cause
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a connection error with an underlying cause
    pub fn connection_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Errors after which the connector must be closed and rebuilt
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedMessageType { .. }
                | Self::MissingMessageId { .. }
                | Self::AcknowledgeFailure { .. }
                | Self::RollbackFailure { .. }
        )
    }

    /// Fatal errors caused by the message itself; redelivery would fail again
    pub fn is_poison_message(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedMessageType { .. } | Self::MissingMessageId { .. }
        )
    }

    /// Check if this error means the connector has been shut down
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Closed)
    }
}

/// Errors reported by broker transport implementations.
///
/// The lifecycle manager and adapters map these onto [`BridgeError`] according to
/// the operation that failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The connection, session, consumer or producer is closed
    #[error("resource is closed")]
    Closed,

    /// The broker refused the request
    #[error("rejected by broker: {0}")]
    Rejected(String),

    /// Network or protocol failure
    #[error("transport failure: {0}")]
    Transport(String),
}

impl BrokerError {
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}
