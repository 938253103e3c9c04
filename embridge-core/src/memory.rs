//! In-process broker.
//!
//! [`InMemoryBroker`] implements every broker trait without any network. Queues
//! hand each message to one consumer; topics copy each message to every consumer
//! subscribed at publish time. Sessions keep client-acknowledge bookkeeping:
//! acknowledging is cumulative, rollback and session close put unacknowledged
//! messages back at the head of their queue with the redelivered flag set.
//! Acknowledging a message already covered by a later acknowledge is a no-op.
//!
//! Failures can be injected for connects, sends, acknowledges and rollbacks, and
//! all live connections can be severed to simulate a broker outage.

use crate::broker::{
    AcknowledgeMode, Connection, ConnectionFactoryProvider, ConsumerOptions, MessageConsumer,
    MessageId, MessageProducer, ProducerOptions, SendCompletion, Session, WireMessage,
};
use crate::config::ConnectionSettings;
use crate::destination::Destination;
use crate::error::BrokerError;
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy)]
enum FailurePoint {
    Connect,
    Send,
    Acknowledge,
    Rollback,
}

#[derive(Debug, Default)]
struct FailurePlan {
    connects: usize,
    sends: usize,
    acknowledges: usize,
    rollbacks: usize,
}

impl FailurePlan {
    fn counter(&mut self, point: FailurePoint) -> &mut usize {
        match point {
            FailurePoint::Connect => &mut self.connects,
            FailurePoint::Send => &mut self.sends,
            FailurePoint::Acknowledge => &mut self.acknowledges,
            FailurePoint::Rollback => &mut self.rollbacks,
        }
    }
}

#[derive(Default)]
struct MessageQueue {
    messages: Mutex<VecDeque<WireMessage>>,
    notify: Notify,
}

impl MessageQueue {
    fn push(&self, message: WireMessage) {
        lock(&self.messages).push_back(message);
        self.notify.notify_waiters();
    }

    fn push_front(&self, message: WireMessage) {
        lock(&self.messages).push_front(message);
        self.notify.notify_waiters();
    }

    fn pop(&self) -> Option<WireMessage> {
        lock(&self.messages).pop_front()
    }

    fn len(&self) -> usize {
        lock(&self.messages).len()
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Arc<MessageQueue>>,
    subscribers: HashMap<String, Vec<Weak<MessageQueue>>>,
    journal: Vec<(Destination, WireMessage)>,
    connections: Vec<Weak<ConnectionShared>>,
    consumer_options: Vec<ConsumerOptions>,
    producer_options: Vec<ProducerOptions>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    failures: Mutex<FailurePlan>,
    send_latency: Mutex<Option<Duration>>,
    connections_opened: AtomicUsize,
    acknowledges: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl BrokerInner {
    fn take_failure(&self, point: FailurePoint) -> bool {
        let mut plan = lock(&self.failures);
        let remaining = plan.counter(point);
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }

    /// Queue a consumer on `destination` reads from
    fn subscribe(&self, destination: &Destination) -> Arc<MessageQueue> {
        let mut state = lock(&self.state);
        match destination {
            Destination::Queue(name) => Arc::clone(state.queues.entry(name.clone()).or_default()),
            Destination::Topic(name) => {
                let queue = Arc::new(MessageQueue::default());
                state
                    .subscribers
                    .entry(name.clone())
                    .or_default()
                    .push(Arc::downgrade(&queue));
                queue
            }
        }
    }

    fn route(&self, destination: &Destination, message: WireMessage) {
        let mut state = lock(&self.state);
        state.journal.push((destination.clone(), message.clone()));

        match destination {
            Destination::Queue(name) => {
                state.queues.entry(name.clone()).or_default().push(message);
            }
            Destination::Topic(name) => {
                let subscribers = state.subscribers.entry(name.clone()).or_default();
                subscribers.retain(|queue| queue.strong_count() > 0);
                for queue in subscribers.iter().filter_map(Weak::upgrade) {
                    queue.push(message.clone());
                }
            }
        }
    }

    fn stamp(message: &mut WireMessage) -> MessageId {
        let id = message
            .message_id
            .get_or_insert_with(|| MessageId::new(format!("ID:{}", Uuid::new_v4())))
            .clone();
        message.timestamp.get_or_insert_with(Utc::now);
        id
    }
}

/// An in-process broker implementing [`ConnectionFactoryProvider`]
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a message as an external producer would. Returns the assigned id.
    pub fn publish(&self, destination: &str, mut message: WireMessage) -> MessageId {
        let id = BrokerInner::stamp(&mut message);
        self.inner.route(&Destination::resolve(destination), message);
        id
    }

    /// Every message routed to `destination` so far, in send order
    pub fn published(&self, destination: &str) -> Vec<WireMessage> {
        let destination = Destination::resolve(destination);
        lock(&self.inner.state)
            .journal
            .iter()
            .filter(|(target, _)| *target == destination)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Number of messages waiting for delivery on `destination`
    pub fn pending(&self, destination: &str) -> usize {
        let state = lock(&self.inner.state);
        match Destination::resolve(destination) {
            Destination::Queue(name) => state.queues.get(&name).map_or(0, |q| q.len()),
            Destination::Topic(name) => state.subscribers.get(&name).map_or(0, |subs| {
                subs.iter()
                    .filter_map(Weak::upgrade)
                    .map(|q| q.len())
                    .sum()
            }),
        }
    }

    pub fn fail_next_connects(&self, count: usize) {
        lock(&self.inner.failures).connects = count;
    }

    pub fn fail_next_sends(&self, count: usize) {
        lock(&self.inner.failures).sends = count;
    }

    pub fn fail_next_acknowledges(&self, count: usize) {
        lock(&self.inner.failures).acknowledges = count;
    }

    pub fn fail_next_rollbacks(&self, count: usize) {
        lock(&self.inner.failures).rollbacks = count;
    }

    /// Delay send completions; messages are routed when the completion resolves
    pub fn set_send_latency(&self, latency: Option<Duration>) {
        *lock(&self.inner.send_latency) = latency;
    }

    /// Drop every live connection as a broker outage would
    pub fn sever_connections(&self) {
        let connections: Vec<Arc<ConnectionShared>> = lock(&self.inner.state)
            .connections
            .drain(..)
            .filter_map(|c| c.upgrade())
            .collect();
        warn!(count = connections.len(), "severing broker connections");
        for connection in connections {
            connection.shutdown();
        }
    }

    pub fn connections_opened(&self) -> usize {
        self.inner.connections_opened.load(Ordering::SeqCst)
    }

    pub fn acknowledge_count(&self) -> usize {
        self.inner.acknowledges.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> usize {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }

    pub fn last_consumer_options(&self) -> Option<ConsumerOptions> {
        lock(&self.inner.state).consumer_options.last().cloned()
    }

    pub fn last_producer_options(&self) -> Option<ProducerOptions> {
        lock(&self.inner.state).producer_options.last().cloned()
    }
}

#[async_trait]
impl ConnectionFactoryProvider for InMemoryBroker {
    async fn create_connection(
        &self,
        settings: &ConnectionSettings,
    ) -> Result<Box<dyn Connection>, BrokerError> {
        let mut failures = 0u32;
        while self.inner.take_failure(FailurePoint::Connect) {
            failures += 1;
            let exhausted = !settings.unlimited_reconnects()
                && failures > settings.max_reconnect_attempts as u32;
            if exhausted {
                return Err(BrokerError::transport(format!(
                    "connection refused after {} attempt(s)",
                    failures
                )));
            }

            let delay = if failures == 1 {
                settings.initial_reconnect_delay()
            } else {
                settings.reconnect_delay()
            };
            warn!(connection = %settings, attempt = failures, "connect failed, retrying in {:?}", delay);
            tokio::time::sleep(delay).await;
        }

        let shared = Arc::new(ConnectionShared {
            token: CancellationToken::new(),
            sessions: Mutex::new(Vec::new()),
        });
        lock(&self.inner.state)
            .connections
            .push(Arc::downgrade(&shared));
        self.inner.connections_opened.fetch_add(1, Ordering::SeqCst);
        debug!(connection = %settings, "in-memory connection opened");

        let (started, _) = watch::channel(false);
        Ok(Box::new(MemoryConnection {
            broker: Arc::clone(&self.inner),
            shared,
            started,
        }))
    }
}

struct ConnectionShared {
    token: CancellationToken,
    sessions: Mutex<Vec<Arc<SessionState>>>,
}

impl ConnectionShared {
    fn shutdown(&self) {
        self.token.cancel();
        let sessions: Vec<Arc<SessionState>> = lock(&self.sessions).drain(..).collect();
        for session in sessions {
            session.release();
        }
    }
}

struct MemoryConnection {
    broker: Arc<BrokerInner>,
    shared: Arc<ConnectionShared>,
    started: watch::Sender<bool>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_session(
        &self,
        mode: AcknowledgeMode,
    ) -> Result<Arc<dyn Session>, BrokerError> {
        if self.shared.token.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        let state = Arc::new(SessionState {
            broker: Arc::clone(&self.broker),
            token: self.shared.token.child_token(),
            mode,
            unacked: Mutex::new(Vec::new()),
            started: self.started.subscribe(),
        });
        lock(&self.shared.sessions).push(Arc::clone(&state));
        Ok(Arc::new(MemorySession { state }))
    }

    async fn start(&self) -> Result<(), BrokerError> {
        if self.shared.token.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        self.started.send_replace(true);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.shared.shutdown();
        Ok(())
    }
}

struct Delivery {
    queue: Arc<MessageQueue>,
    message: WireMessage,
}

struct SessionState {
    broker: Arc<BrokerInner>,
    token: CancellationToken,
    mode: AcknowledgeMode,
    unacked: Mutex<Vec<Delivery>>,
    started: watch::Receiver<bool>,
}

impl SessionState {
    /// Close the session and hand unacknowledged messages back for redelivery
    fn release(&self) {
        self.token.cancel();
        self.requeue();
    }

    fn requeue(&self) {
        let deliveries = std::mem::take(&mut *lock(&self.unacked));
        for delivery in deliveries.into_iter().rev() {
            let mut message = delivery.message;
            message.redelivered = true;
            delivery.queue.push_front(message);
        }
    }
}

struct MemorySession {
    state: Arc<SessionState>,
}

#[async_trait]
impl Session for MemorySession {
    async fn create_consumer(
        &self,
        destination: &Destination,
        options: &ConsumerOptions,
    ) -> Result<Box<dyn MessageConsumer>, BrokerError> {
        if self.state.token.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        lock(&self.state.broker.state)
            .consumer_options
            .push(options.clone());
        let queue = self.state.broker.subscribe(destination);
        debug!(%destination, prefetch = options.prefetch_count, "in-memory consumer created");

        Ok(Box::new(MemoryConsumer {
            session: Arc::clone(&self.state),
            queue,
            token: self.state.token.child_token(),
        }))
    }

    async fn create_producer(
        &self,
        destination: &Destination,
        options: &ProducerOptions,
    ) -> Result<Box<dyn MessageProducer>, BrokerError> {
        if self.state.token.is_cancelled() {
            return Err(BrokerError::Closed);
        }

        lock(&self.state.broker.state)
            .producer_options
            .push(options.clone());
        debug!(%destination, "in-memory producer created");

        Ok(Box::new(MemoryProducer {
            broker: Arc::clone(&self.state.broker),
            destination: destination.clone(),
            token: self.state.token.child_token(),
        }))
    }

    async fn acknowledge(&self, message_id: &MessageId) -> Result<(), BrokerError> {
        if self.state.token.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        if self.state.broker.take_failure(FailurePoint::Acknowledge) {
            return Err(BrokerError::rejected("acknowledge refused"));
        }
        if self.state.mode == AcknowledgeMode::Auto {
            return Ok(());
        }

        let mut unacked = lock(&self.state.unacked);
        match unacked
            .iter()
            .position(|d| d.message.message_id.as_ref() == Some(message_id))
        {
            Some(position) => {
                unacked.drain(..=position);
            }
            // covered by an earlier cumulative acknowledge
            None => debug!(%message_id, "message already acknowledged"),
        }
        self.state.broker.acknowledges.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), BrokerError> {
        if self.state.token.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        if self.state.broker.take_failure(FailurePoint::Rollback) {
            return Err(BrokerError::rejected("rollback refused"));
        }

        self.state.requeue();
        self.state.broker.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.state.release();
        Ok(())
    }
}

struct MemoryConsumer {
    session: Arc<SessionState>,
    queue: Arc<MessageQueue>,
    token: CancellationToken,
}

#[async_trait]
impl MessageConsumer for MemoryConsumer {
    async fn receive(&self) -> Result<Option<WireMessage>, BrokerError> {
        let mut started = self.session.started.clone();

        loop {
            if self.token.is_cancelled() {
                return Ok(None);
            }

            if *started.borrow_and_update() {
                let notified = self.queue.notify.notified();
                if let Some(message) = self.queue.pop() {
                    if self.session.mode == AcknowledgeMode::Client {
                        lock(&self.session.unacked).push(Delivery {
                            queue: Arc::clone(&self.queue),
                            message: message.clone(),
                        });
                    }
                    return Ok(Some(message));
                }

                tokio::select! {
                    _ = notified => {}
                    _ = self.token.cancelled() => return Ok(None),
                }
            } else {
                tokio::select! {
                    changed = started.changed() => {
                        if changed.is_err() {
                            return Ok(None);
                        }
                    }
                    _ = self.token.cancelled() => return Ok(None),
                }
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.token.cancel();
        Ok(())
    }
}

#[derive(Clone)]
struct MemoryProducer {
    broker: Arc<BrokerInner>,
    destination: Destination,
    token: CancellationToken,
}

impl MemoryProducer {
    fn deliver(&self, mut message: WireMessage) -> Result<(), BrokerError> {
        if self.token.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        if self.broker.take_failure(FailurePoint::Send) {
            return Err(BrokerError::transport("send rejected"));
        }

        BrokerInner::stamp(&mut message);
        self.broker.route(&self.destination, message);
        Ok(())
    }
}

#[async_trait]
impl MessageProducer for MemoryProducer {
    fn send(&self, message: WireMessage) -> SendCompletion {
        let latency = *lock(&self.broker.send_latency);
        match latency {
            None => futures::future::ready(self.deliver(message)).boxed(),
            Some(latency) => {
                let producer = self.clone();
                async move {
                    tokio::time::sleep(latency).await;
                    producer.deliver(message)
                }
                .boxed()
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.token.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MessageBody;

    fn fast_settings(destination: &str) -> ConnectionSettings {
        let mut settings = ConnectionSettings::new("memory-test", destination);
        settings.initial_reconnect_delay_ms = 0;
        settings.reconnect_delay_ms = 0;
        settings
    }

    async fn consumer_on(
        broker: &InMemoryBroker,
        destination: &str,
        mode: AcknowledgeMode,
    ) -> (Box<dyn Connection>, Arc<dyn Session>, Box<dyn MessageConsumer>) {
        let connection = broker
            .create_connection(&fast_settings(destination))
            .await
            .unwrap();
        let session = connection.create_session(mode).await.unwrap();
        let consumer = session
            .create_consumer(&Destination::resolve(destination), &ConsumerOptions::default())
            .await
            .unwrap();
        connection.start().await.unwrap();
        (connection, session, consumer)
    }

    #[tokio::test]
    async fn test_queue_delivery_and_cumulative_ack() {
        let broker = InMemoryBroker::new();
        broker.publish("orders", WireMessage::text("one"));
        broker.publish("orders", WireMessage::text("two"));
        broker.publish("orders", WireMessage::text("three"));

        let (connection, session, consumer) =
            consumer_on(&broker, "orders", AcknowledgeMode::Client).await;

        let _first = consumer.receive().await.unwrap().unwrap();
        let second = consumer.receive().await.unwrap().unwrap();
        session
            .acknowledge(second.message_id.as_ref().unwrap())
            .await
            .unwrap();

        // only the third message remains unacknowledged and comes back after close
        connection.close().await.unwrap();
        assert_eq!(broker.pending("orders"), 1);
        assert_eq!(broker.acknowledge_count(), 1);
    }

    #[tokio::test]
    async fn test_ack_out_of_order_is_noop() {
        let broker = InMemoryBroker::new();
        broker.publish("orders", WireMessage::text("one"));
        broker.publish("orders", WireMessage::text("two"));

        let (connection, session, consumer) =
            consumer_on(&broker, "orders", AcknowledgeMode::Client).await;
        let first = consumer.receive().await.unwrap().unwrap();
        let second = consumer.receive().await.unwrap().unwrap();

        session
            .acknowledge(second.message_id.as_ref().unwrap())
            .await
            .unwrap();
        session
            .acknowledge(first.message_id.as_ref().unwrap())
            .await
            .unwrap();

        connection.close().await.unwrap();
        assert_eq!(broker.pending("orders"), 0);
    }

    #[tokio::test]
    async fn test_rollback_redelivers_in_order() {
        let broker = InMemoryBroker::new();
        broker.publish("orders", WireMessage::text("one"));
        broker.publish("orders", WireMessage::text("two"));

        let (_connection, session, consumer) =
            consumer_on(&broker, "queue:orders", AcknowledgeMode::Client).await;

        let first = consumer.receive().await.unwrap().unwrap();
        let _second = consumer.receive().await.unwrap().unwrap();
        session.rollback().await.unwrap();

        let again = consumer.receive().await.unwrap().unwrap();
        assert_eq!(again.message_id, first.message_id);
        assert_eq!(again.body, MessageBody::Text("one".to_string()));
        assert!(again.redelivered);
        assert_eq!(broker.rollback_count(), 1);
    }

    #[tokio::test]
    async fn test_topic_fans_out_to_subscribers() {
        let broker = InMemoryBroker::new();
        let (_c1, _s1, first) = consumer_on(&broker, "topic:prices", AcknowledgeMode::Auto).await;
        let (_c2, _s2, second) = consumer_on(&broker, "topic:prices", AcknowledgeMode::Auto).await;

        broker.publish("topic:prices", WireMessage::bytes(vec![1, 2]));

        assert_eq!(
            first.receive().await.unwrap().unwrap().body,
            MessageBody::Bytes(vec![1, 2])
        );
        assert_eq!(
            second.receive().await.unwrap().unwrap().body,
            MessageBody::Bytes(vec![1, 2])
        );
        assert_eq!(broker.published("topic:prices").len(), 1);
    }

    #[tokio::test]
    async fn test_close_unblocks_receive() {
        let broker = InMemoryBroker::new();
        let (connection, _session, consumer) =
            consumer_on(&broker, "orders", AcknowledgeMode::Client).await;

        let pending = tokio::spawn(async move { consumer.receive().await });
        tokio::task::yield_now().await;
        connection.close().await.unwrap();

        let received = pending.await.unwrap().unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_delivery_waits_for_start() {
        let broker = InMemoryBroker::new();
        let connection = broker
            .create_connection(&fast_settings("orders"))
            .await
            .unwrap();
        let session = connection
            .create_session(AcknowledgeMode::Client)
            .await
            .unwrap();
        let consumer = session
            .create_consumer(&Destination::resolve("orders"), &ConsumerOptions::default())
            .await
            .unwrap();
        broker.publish("orders", WireMessage::text("early"));

        let not_started =
            tokio::time::timeout(Duration::from_millis(50), consumer.receive()).await;
        assert!(not_started.is_err());

        connection.start().await.unwrap();
        let message = consumer.receive().await.unwrap().unwrap();
        assert_eq!(message.body, MessageBody::Text("early".to_string()));
    }

    #[tokio::test]
    async fn test_connect_retries_within_budget() {
        let broker = InMemoryBroker::new();
        let mut settings = fast_settings("orders");
        settings.max_reconnect_attempts = 2;

        broker.fail_next_connects(2);
        assert!(broker.create_connection(&settings).await.is_ok());

        broker.fail_next_connects(3);
        let err = broker.create_connection(&settings).await.err().unwrap();
        assert!(matches!(err, BrokerError::Transport(_)));
        assert_eq!(broker.connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_acknowledge_after_close_fails() {
        let broker = InMemoryBroker::new();
        broker.publish("orders", WireMessage::text("one"));
        let (connection, session, consumer) =
            consumer_on(&broker, "orders", AcknowledgeMode::Client).await;

        let message = consumer.receive().await.unwrap().unwrap();
        connection.close().await.unwrap();

        let err = session
            .acknowledge(message.message_id.as_ref().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::Closed);
        assert_eq!(broker.pending("orders"), 1);
    }

    #[tokio::test]
    async fn test_send_latency_defers_routing() {
        let broker = InMemoryBroker::new();
        broker.set_send_latency(Some(Duration::from_millis(20)));

        let connection = broker
            .create_connection(&fast_settings("out"))
            .await
            .unwrap();
        let session = connection
            .create_session(AcknowledgeMode::Client)
            .await
            .unwrap();
        let producer = session
            .create_producer(&Destination::resolve("out"), &ProducerOptions::default())
            .await
            .unwrap();

        let completion = producer.send(WireMessage::bytes(vec![9]));
        assert!(broker.published("out").is_empty());
        completion.await.unwrap();

        let published = broker.published("out");
        assert_eq!(published.len(), 1);
        assert!(published[0].message_id.is_some());
        assert!(published[0].timestamp.is_some());
    }
}
