//! Broker-side abstractions.
//!
//! The bridge never speaks a wire protocol itself. A [`ConnectionFactoryProvider`]
//! yields [`Connection`]s from validated settings; everything below the connection
//! (sessions, consumers, producers) follows the classic enterprise messaging
//! model with client-controlled acknowledgement.
//!
//! [`crate::memory::InMemoryBroker`] implements all of these traits in-process.

use crate::config::ConnectionSettings;
use crate::destination::Destination;
use crate::error::BrokerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Completion of an asynchronous send, resolved by the transport
pub type SendCompletion = BoxFuture<'static, Result<(), BrokerError>>;

/// Session acknowledgement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcknowledgeMode {
    /// Messages are acknowledged as soon as they are received
    Auto,
    /// Messages stay unacknowledged until the session acknowledges them
    Client,
}

/// Flow-control hints for consumer creation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Maximum number of unacknowledged messages delivered ahead, 0 for unlimited
    pub prefetch_count: u32,
    /// Apply the prefetch limit to the whole session instead of this consumer
    pub prefetch_global: bool,
}

/// Routing metadata for producers on brokers with exchange-style bindings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeBinding {
    pub name: String,
    pub routing_key: Option<String>,
    pub exchange_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerOptions {
    pub exchange: Option<ExchangeBinding>,
}

/// Produces connections to the broker.
///
/// Implementations own the transport retry loop; the reconnect parameters in
/// [`ConnectionSettings`] are meant for them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionFactoryProvider: Send + Sync {
    async fn create_connection(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Box<dyn Connection>, BrokerError>;
}

/// A single authenticated transport session to the broker
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_session(&self, mode: AcknowledgeMode)
        -> Result<Arc<dyn Session>, BrokerError>;

    /// Start message delivery to consumers created on this connection
    async fn start(&self) -> Result<(), BrokerError>;

    /// Close the connection together with its sessions, consumers and producers
    async fn close(&self) -> Result<(), BrokerError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Session: Send + Sync {
    async fn create_consumer(
        &self,
        destination: &Destination,
        options: &ConsumerOptions,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError>;

    async fn create_producer(
        &self,
        destination: &Destination,
        options: &ProducerOptions,
    ) -> Result<Box<dyn MessageProducer>, BrokerError>;

    /// Acknowledge `message_id` and every earlier unacknowledged message of this session
    async fn acknowledge(&self, message_id: &MessageId) -> Result<(), BrokerError>;

    /// Make every unacknowledged message of this session eligible for redelivery
    async fn rollback(&self) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait MessageConsumer: Send + Sync {
    /// Wait for the next message. Returns `Ok(None)` once the consumer is closed.
    async fn receive(&self) -> Result<Option<WireMessage>, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// Hand a message to the transport. The returned completion resolves once the
    /// broker confirms or rejects it; it may be driven on any task.
    fn send(&self, message: WireMessage) -> SendCompletion;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Broker assigned message identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Typed message property value
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Byte(v) => write!(f, "{}", v),
            Self::Short(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Long(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::String(v) => f.write_str(v),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        Self::Int(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

/// Message body variants
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Bytes(Vec<u8>),
    Text(String),
    Map(HashMap<String, PropertyValue>),
    Object(Vec<u8>),
    Stream(Vec<PropertyValue>),
    Empty,
}

impl MessageBody {
    /// Short name of the body kind, used in errors and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bytes(_) => "bytes",
            Self::Text(_) => "text",
            Self::Map(_) => "map",
            Self::Object(_) => "object",
            Self::Stream(_) => "stream",
            Self::Empty => "empty",
        }
    }
}

/// A broker message
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    /// Assigned by the broker on send; `None` for messages not yet sent
    pub message_id: Option<MessageId>,
    pub body: MessageBody,
    pub properties: HashMap<String, PropertyValue>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Set by the broker when the message is delivered again after a rollback
    pub redelivered: bool,
}

impl WireMessage {
    pub fn new(body: MessageBody) -> Self {
        Self {
            message_id: None,
            body,
            properties: HashMap::new(),
            timestamp: None,
            redelivered: false,
        }
    }

    /// Create a byte-bodied message
    pub fn bytes(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageBody::Bytes(payload.into()))
    }

    /// Create a text-bodied message
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageBody::Text(text.into()))
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }
}
