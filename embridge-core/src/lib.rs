//! # Embridge Core
//!
//! Bidirectional bridge between enterprise message brokers (queues and topics with
//! client acknowledgement) and streaming record pipelines.
//!
//! The broker itself sits behind the traits in [`broker`]; a deployment supplies a
//! [`ConnectionFactoryProvider`] for its transport, and [`memory::InMemoryBroker`]
//! implements the same traits in process.
//!
//! ## Overview
//!
//! A connector runs in one direction:
//! - **Source**: read messages from a queue or topic and hand them to the pipeline
//!   as [`Record`]s. Acking a record acknowledges the session up to that message,
//!   failing it rolls the session back so the broker redelivers.
//! - **Sink**: publish pipeline records to a queue or topic. The record is acked
//!   once the broker confirms the send and failed if the send does not complete.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use embridge_core::memory::InMemoryBroker;
//! use embridge_core::{ConnectionSettings, SourceAdapter, SourceSettings};
//! use std::sync::Arc;
//!
//! # async fn demo() -> embridge_core::BridgeResult<()> {
//! let broker = InMemoryBroker::new();
//! let settings = SourceSettings::new(ConnectionSettings::new("orders-in", "queue:orders"));
//! let source = SourceAdapter::new(Arc::new(broker), settings)?;
//!
//! source.open().await?;
//! let record = source.read().await?;
//! println!("Got message: {:?}", record.payload_str());
//! record.ack().await?;
//! source.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Destinations**: `queue:NAME`, `topic:NAME`, or a bare name for a queue
//! - **Lifecycle**: open, reconnect and idempotent close with a single active connection
//! - **Translation**: byte and text messages, routing key carried as `JMSXGroupID`
//! - **Observability**: structured logging through `tracing`, counters through `metrics`
//! - **Configuration**: environment variables, TOML files or key/value maps

pub mod broker;
mod config;
mod destination;
mod error;
mod lifecycle;
pub mod memory;
mod message;
mod metrics;
mod runtime;
mod sink;
mod source;
mod traits;
pub mod translate;

// Re-export public API
pub use broker::{
    AcknowledgeMode, Connection, ConnectionFactoryProvider, MessageBody, MessageConsumer,
    MessageId, MessageProducer, PropertyValue, Session, WireMessage,
};
pub use config::{
    ConnectionSettings, ProcessingSettings, ServiceSettings, SinkSettings, SourceSettings,
};
pub use destination::Destination;
pub use error::{BridgeError, BridgeResult, BrokerError};
pub use lifecycle::{BindFn, Binding, ConnectionManager, ConnectorState};
pub use message::{Outcome, Record, RecordOutcome};
pub use metrics::BridgeMetrics;
pub use runtime::{init_tracing, SinkRuntime, SourceRuntime};
pub use sink::SinkAdapter;
pub use source::SourceAdapter;
pub use traits::RecordHandler;

// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
