//! Source adapter: broker destination -> pipeline records.

use crate::broker::{ConnectionFactoryProvider, MessageConsumer};
use crate::config::SourceSettings;
use crate::error::BrokerError;
use crate::lifecycle::{BindFn, ConnectionManager, ConnectorState};
use crate::message::{Acknowledger, Record};
use crate::metrics::BridgeMetrics;
use crate::translate;
use crate::{BridgeError, BridgeResult};
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Reads messages from a queue or topic and hands them out as records.
///
/// Every record returned by [`SourceAdapter::read`] is bound to the session it
/// was received on: [`Record::ack`] acknowledges the session up to that message
/// and [`Record::fail`] rolls the whole session back.
///
/// One reader at a time; concurrent `read` calls on the same adapter are not
/// supported.
pub struct SourceAdapter {
    settings: SourceSettings,
    manager: ConnectionManager<Box<dyn MessageConsumer>>,
    metrics: Arc<BridgeMetrics>,
}

impl SourceAdapter {
    pub fn new(
        provider: Arc<dyn ConnectionFactoryProvider>,
        settings: SourceSettings,
    ) -> BridgeResult<Self> {
        settings.validate()?;

        let metrics = Arc::new(BridgeMetrics::new(
            &settings.connection.connection_name,
            &settings.connection.resolved_destination().to_string(),
        ));

        let options = settings.consumer_options();
        let bind: BindFn<Box<dyn MessageConsumer>> = Arc::new(move |session, destination| {
            let options = options.clone();
            async move { session.create_consumer(&destination, &options).await }.boxed()
        });

        Ok(Self {
            manager: ConnectionManager::new(provider, bind, Arc::clone(&metrics)),
            settings,
            metrics,
        })
    }

    pub fn settings(&self) -> &SourceSettings {
        &self.settings
    }

    pub async fn open(&self) -> BridgeResult<()> {
        self.manager.open(&self.settings.connection).await
    }

    pub async fn reconnect(&self) -> BridgeResult<()> {
        self.manager.reconnect(&self.settings.connection).await
    }

    /// Close the connection. A read blocked on the consumer returns [`BridgeError::Closed`].
    pub async fn close(&self) -> BridgeResult<()> {
        self.manager.close().await
    }

    pub async fn state(&self) -> ConnectorState {
        self.manager.state().await
    }

    /// Block until the next message arrives and return it as a record.
    ///
    /// Fails with [`BridgeError::NotConnected`] when the adapter is not open and
    /// with [`BridgeError::Closed`] when the consumer is closed while waiting.
    /// A message body the bridge cannot translate closes the adapter and is
    /// returned as [`BridgeError::UnsupportedMessageType`]; a message without a
    /// broker id does the same with [`BridgeError::MissingMessageId`]. Either
    /// way the message stays unacknowledged.
    pub async fn read(&self) -> BridgeResult<Record> {
        let binding = self.manager.current().await?;

        let message = match binding.handle().receive().await {
            Ok(Some(message)) => message,
            Ok(None) | Err(BrokerError::Closed) => return Err(BridgeError::Closed),
            Err(source) => {
                return Err(BridgeError::Transport {
                    message: format!("Failed to receive from {}", binding.destination()),
                    source,
                })
            }
        };

        let translated = translate::to_record(message).and_then(|record| {
            match record.message_id.clone() {
                Some(message_id) => Ok((record, message_id)),
                None => Err(BridgeError::MissingMessageId {
                    destination: binding.destination().to_string(),
                }),
            }
        });

        let (mut record, message_id) = match translated {
            Ok(translated) => translated,
            Err(e) => {
                if let BridgeError::UnsupportedMessageType { kind, .. } = &e {
                    self.metrics.record_unsupported(kind);
                }
                // a later cumulative ack would cover this message, so the source must stop
                error!(destination = %binding.destination(), "closing source: {}", e);
                drop(binding);
                if let Err(close_err) = self.close().await {
                    warn!("failed to close source after unreadable message: {}", close_err);
                }
                return Err(e);
            }
        };

        record.acknowledger = Acknowledger::Session {
            session: Arc::clone(binding.session()),
            message_id,
            metrics: Arc::clone(&self.metrics),
        };
        self.metrics.record_received();
        debug!(
            destination = %binding.destination(),
            message_id = ?record.message_id,
            size = record.size(),
            redelivered = record.redelivered,
            "received message"
        );

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{
        Connection, MessageBody, MessageId, MockConnection, MockConnectionFactoryProvider,
        MockSession, Session, WireMessage,
    };
    use crate::config::ConnectionSettings;
    use crate::memory::InMemoryBroker;
    use crate::message::Outcome;
    use crate::translate::GROUP_ID_PROPERTY;
    use std::collections::HashMap;
    use std::time::Duration;

    fn source_on(broker: &InMemoryBroker, destination: &str) -> SourceAdapter {
        let mut connection = ConnectionSettings::new("source-test", destination);
        connection.initial_reconnect_delay_ms = 0;
        connection.reconnect_delay_ms = 0;
        SourceAdapter::new(Arc::new(broker.clone()), SourceSettings::new(connection)).unwrap()
    }

    #[tokio::test]
    async fn test_read_and_ack() {
        let broker = InMemoryBroker::new();
        let id = broker.publish(
            "orders",
            WireMessage::text("hello").with_property(GROUP_ID_PROPERTY, "partA"),
        );

        let source = source_on(&broker, "orders");
        source.open().await.unwrap();

        let record = source.read().await.unwrap();
        assert_eq!(record.value, b"hello".to_vec());
        assert_eq!(record.key.as_deref(), Some("partA"));
        assert_eq!(record.message_id.as_ref(), Some(&id));
        assert!(record.is_inbound());

        let (record, outcome) = record.track();
        record.ack().await.unwrap();
        assert_eq!(outcome.await, Outcome::Acked);
        assert_eq!(broker.acknowledge_count(), 1);

        source.close().await.unwrap();
        assert_eq!(broker.pending("orders"), 0);
    }

    #[tokio::test]
    async fn test_fail_rolls_back_and_redelivers() {
        let broker = InMemoryBroker::new();
        broker.publish("orders", WireMessage::bytes(vec![1]));
        broker.publish("orders", WireMessage::bytes(vec![2]));

        let source = source_on(&broker, "queue:orders");
        source.open().await.unwrap();

        let first = source.read().await.unwrap();
        let second = source.read().await.unwrap();
        assert_eq!(second.value, vec![2]);
        drop(first);

        second.fail().await.unwrap();
        assert_eq!(broker.rollback_count(), 1);

        // rollback covers the whole session, the first message comes back too
        let again = source.read().await.unwrap();
        assert_eq!(again.value, vec![1]);
        assert!(again.redelivered);
        let again = source.read().await.unwrap();
        assert_eq!(again.value, vec![2]);
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_cumulative_ack_covers_earlier_messages() {
        let broker = InMemoryBroker::new();
        for i in 0..3u8 {
            broker.publish("orders", WireMessage::bytes(vec![i]));
        }

        let source = source_on(&broker, "orders");
        source.open().await.unwrap();

        let _first = source.read().await.unwrap();
        let _second = source.read().await.unwrap();
        let third = source.read().await.unwrap();
        third.ack().await.unwrap();

        source.close().await.unwrap();
        assert_eq!(broker.pending("orders"), 0);
    }

    #[tokio::test]
    async fn test_unsupported_message_closes_source() {
        let broker = InMemoryBroker::new();
        broker.publish("orders", WireMessage::new(MessageBody::Map(HashMap::new())));

        let source = source_on(&broker, "orders");
        source.open().await.unwrap();

        let err = source.read().await.unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedMessageType { ref kind, .. } if kind == "map"));
        assert!(err.is_fatal());
        assert_eq!(source.state().await, ConnectorState::Closed);

        // the offending message was never acknowledged
        assert_eq!(broker.pending("orders"), 1);
        assert!(matches!(source.read().await, Err(BridgeError::NotConnected)));
    }

    #[tokio::test]
    async fn test_close_interrupts_read() {
        let broker = InMemoryBroker::new();
        let source = Arc::new(source_on(&broker, "orders"));
        source.open().await.unwrap();

        let reader = {
            let source = Arc::clone(&source);
            tokio::spawn(async move { source.read().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        source.close().await.unwrap();
        source.close().await.unwrap();

        let result = reader.await.unwrap();
        assert!(matches!(result, Err(BridgeError::Closed)));
    }

    #[tokio::test]
    async fn test_ack_after_close_is_fatal() {
        let broker = InMemoryBroker::new();
        broker.publish("orders", WireMessage::text("late"));

        let source = source_on(&broker, "orders");
        source.open().await.unwrap();
        let record = source.read().await.unwrap();
        source.close().await.unwrap();

        let err = record.ack().await.unwrap_err();
        assert!(matches!(err, BridgeError::AcknowledgeFailure { .. }));
        assert_eq!(broker.pending("orders"), 1);
    }

    #[tokio::test]
    async fn test_reconnect_redelivers_unacked() {
        let broker = InMemoryBroker::new();
        broker.publish("orders", WireMessage::text("once"));

        let source = source_on(&broker, "orders");
        source.open().await.unwrap();
        let stale = source.read().await.unwrap();

        source.reconnect().await.unwrap();
        assert_eq!(broker.connections_opened(), 2);

        let fresh = source.read().await.unwrap();
        assert_eq!(fresh.message_id, stale.message_id);
        assert!(fresh.redelivered);
        fresh.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_before_open() {
        let broker = InMemoryBroker::new();
        let source = source_on(&broker, "orders");
        assert!(matches!(source.read().await, Err(BridgeError::NotConnected)));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let broker = InMemoryBroker::new();
        let settings = SourceSettings::new(ConnectionSettings::new("", "orders"));
        assert!(SourceAdapter::new(Arc::new(broker), settings).is_err());
    }

    #[tokio::test]
    async fn test_prefetch_reaches_consumer() {
        let broker = InMemoryBroker::new();
        let mut settings = SourceSettings::new(ConnectionSettings::new("prefetch", "orders"));
        settings.prefetch_count = 10;
        settings.prefetch_global = true;

        let source = SourceAdapter::new(Arc::new(broker.clone()), settings).unwrap();
        source.open().await.unwrap();

        let options = broker.last_consumer_options().unwrap();
        assert_eq!(options.prefetch_count, 10);
        assert!(options.prefetch_global);
    }

    /// Replays a fixed list of messages, then reports the consumer closed
    struct ScriptedConsumer {
        messages: std::sync::Mutex<std::collections::VecDeque<WireMessage>>,
    }

    #[async_trait::async_trait]
    impl MessageConsumer for ScriptedConsumer {
        async fn receive(&self) -> Result<Option<WireMessage>, BrokerError> {
            Ok(self.messages.lock().unwrap().pop_front())
        }

        async fn close(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    fn scripted_provider(messages: Vec<WireMessage>) -> MockConnectionFactoryProvider {
        let mut session = MockSession::new();
        session.expect_create_consumer().return_once(move |_, _| {
            Ok(Box::new(ScriptedConsumer {
                messages: std::sync::Mutex::new(messages.into()),
            }) as Box<dyn MessageConsumer>)
        });
        session.expect_acknowledge().never();
        let session: Arc<dyn Session> = Arc::new(session);

        let mut connection = MockConnection::new();
        connection
            .expect_create_session()
            .return_once(move |_| Ok(session));
        connection.expect_start().returning(|| Ok(()));
        connection.expect_close().times(1).returning(|| Ok(()));

        let mut provider = MockConnectionFactoryProvider::new();
        provider
            .expect_create_connection()
            .return_once(move |_| Ok(Box::new(connection) as Box<dyn Connection>));
        provider
    }

    #[tokio::test]
    async fn test_message_without_id_closes_source() {
        let mut with_id = WireMessage::text("second");
        with_id.message_id = Some(MessageId::new("ID:2"));
        let provider = scripted_provider(vec![WireMessage::text("first"), with_id]);

        let settings = SourceSettings::new(ConnectionSettings::new("no-id", "orders"));
        let source = SourceAdapter::new(Arc::new(provider), settings).unwrap();
        source.open().await.unwrap();

        let err = source.read().await.unwrap_err();
        assert!(matches!(err, BridgeError::MissingMessageId { .. }));
        assert!(err.is_fatal());
        assert_eq!(source.state().await, ConnectorState::Closed);

        // the message after it is never handed out, so no ack can cover the first one
        assert!(matches!(source.read().await, Err(BridgeError::NotConnected)));
    }
}
