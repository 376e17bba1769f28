//! In-memory MQTT broker and client for testing
//!
//! Routes publishes between clients within the same process, with wildcard
//! matching, simulated connection loss and subscribe-failure injection.
//! Perfect for exercising the request-response engine without a real broker.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use canopy_mqtt::{
    ClientEvent, ConnectionEvent, IncomingPublish, MqttClient, MqttError, QoS, Result, TopicFilter,
    topic::validate_topic_name,
};
use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use tracing::debug;

/// An in-process broker routing messages between [`MemoryClient`]s.
///
/// The broker is caller-owned; create one per test (or per process) and
/// hand out clients with [`MemoryBroker::client`]. Dropping the broker
/// handle does not disturb clients already created from it.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<DashMap<String, ClientState>>,
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clients: Vec<String> = self.inner.iter().map(|e| e.key().clone()).collect();
        f.debug_struct("MemoryBroker")
            .field("clients", &clients)
            .finish()
    }
}

struct ClientState {
    connected: Mutex<bool>,
    subscriptions: Mutex<HashSet<TopicFilter>>,
    event_tx: flume::Sender<ClientEvent>,
    fail_subscribes: Mutex<usize>,
    fail_publishes: Mutex<usize>,
    subscribe_calls: Mutex<HashMap<String, usize>>,
    unsubscribe_calls: Mutex<HashMap<String, usize>>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new client session on this broker. The client starts
    /// connected; its event stream carries connection events only for
    /// subsequent [`drop_connection`](Self::drop_connection) /
    /// [`restore_connection`](Self::restore_connection) cycles.
    ///
    /// # Panics
    ///
    /// Panics if a client with the same id already exists.
    #[must_use]
    pub fn client(&self, client_id: &str) -> MemoryClient {
        let (event_tx, event_rx) = flume::unbounded();

        let state = ClientState {
            connected: Mutex::new(true),
            subscriptions: Mutex::new(HashSet::new()),
            event_tx,
            fail_subscribes: Mutex::new(0),
            fail_publishes: Mutex::new(0),
            subscribe_calls: Mutex::new(HashMap::new()),
            unsubscribe_calls: Mutex::new(HashMap::new()),
        };

        assert!(
            self.inner.insert(client_id.to_string(), state).is_none(),
            "client id '{client_id}' already registered"
        );

        MemoryClient {
            client_id: client_id.to_string(),
            broker: Arc::clone(&self.inner),
            event_rx,
        }
    }

    /// Severs a client's connection: it goes offline, its subscriptions are
    /// dropped (clean-session semantics) and it observes a
    /// [`ConnectionEvent::Disconnected`] event.
    pub fn drop_connection(&self, client_id: &str) {
        if let Some(state) = self.inner.get(client_id) {
            *state.connected.lock() = false;
            state.subscriptions.lock().clear();
            let _ = state
                .event_tx
                .send(ClientEvent::Connection(ConnectionEvent::Disconnected {
                    reason: Some("connection dropped".to_string()),
                }));
            debug!(client_id, "dropped connection");
        }
    }

    /// Restores a previously dropped connection. The client observes
    /// `AttemptingConnect` followed by `ConnectionSuccess` without session
    /// resumption, so subscriptions must be re-established.
    pub fn restore_connection(&self, client_id: &str) {
        if let Some(state) = self.inner.get(client_id) {
            *state.connected.lock() = true;
            let _ = state
                .event_tx
                .send(ClientEvent::Connection(ConnectionEvent::AttemptingConnect));
            let _ = state
                .event_tx
                .send(ClientEvent::Connection(ConnectionEvent::ConnectionSuccess {
                    session_present: false,
                }));
            debug!(client_id, "restored connection");
        }
    }

    /// Makes the next `count` subscribe calls from the given client fail
    /// with a SUBACK failure.
    pub fn fail_next_subscribes(&self, client_id: &str, count: usize) {
        if let Some(state) = self.inner.get(client_id) {
            *state.fail_subscribes.lock() = count;
        }
    }

    /// Makes the next `count` publish calls from the given client fail
    /// with a broker rejection.
    pub fn fail_next_publishes(&self, client_id: &str, count: usize) {
        if let Some(state) = self.inner.get(client_id) {
            *state.fail_publishes.lock() = count;
        }
    }

    /// Number of subscribe calls the broker has seen from this client for
    /// the given filter (successful or rejected).
    #[must_use]
    pub fn subscribe_count(&self, client_id: &str, filter: &str) -> usize {
        self.inner
            .get(client_id)
            .map_or(0, |state| {
                state.subscribe_calls.lock().get(filter).copied().unwrap_or(0)
            })
    }

    /// Number of unsubscribe calls the broker has seen from this client for
    /// the given filter.
    #[must_use]
    pub fn unsubscribe_count(&self, client_id: &str, filter: &str) -> usize {
        self.inner
            .get(client_id)
            .map_or(0, |state| {
                state
                    .unsubscribe_calls
                    .lock()
                    .get(filter)
                    .copied()
                    .unwrap_or(0)
            })
    }

    /// The filters this client currently holds subscriptions for.
    #[must_use]
    pub fn active_subscriptions(&self, client_id: &str) -> Vec<TopicFilter> {
        self.inner.get(client_id).map_or_else(Vec::new, |state| {
            state.subscriptions.lock().iter().cloned().collect()
        })
    }

    /// Publishes a message as the broker itself (no client involved).
    /// Useful for injecting broker-side traffic in tests.
    pub fn inject_publish(&self, topic: &str, payload: Bytes) {
        Self::route(&self.inner, topic, payload);
    }

    fn route(clients: &DashMap<String, ClientState>, topic: &str, payload: Bytes) {
        for entry in clients.iter() {
            let state = entry.value();
            if !*state.connected.lock() {
                continue;
            }
            let matched = state
                .subscriptions
                .lock()
                .iter()
                .any(|filter| filter.matches(topic));
            if matched {
                debug!(client_id = %entry.key(), topic, "routing publish");
                let _ = state.event_tx.send(ClientEvent::Publish(IncomingPublish {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                }));
            }
        }
    }
}

/// A client session on a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryClient {
    client_id: String,
    broker: Arc<DashMap<String, ClientState>>,
    event_rx: flume::Receiver<ClientEvent>,
}

impl fmt::Debug for MemoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryClient")
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl MemoryClient {
    /// The id this client registered with.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn with_state<T>(&self, f: impl FnOnce(&ClientState) -> Result<T>) -> Result<T> {
        let state = self
            .broker
            .get(&self.client_id)
            .ok_or(MqttError::Stopped)?;
        f(state.value())
    }
}

#[async_trait]
impl MqttClient for MemoryClient {
    async fn publish(&self, topic: &str, payload: Bytes, _qos: QoS) -> Result<()> {
        validate_topic_name(topic)
            .map_err(|e| MqttError::PublishRejected {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        self.with_state(|state| {
            if !*state.connected.lock() {
                return Err(MqttError::Offline);
            }
            let mut failures = state.fail_publishes.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(MqttError::PublishRejected {
                    topic: topic.to_string(),
                    reason: "injected failure".to_string(),
                });
            }
            Ok(())
        })?;
        MemoryBroker::route(&self.broker, topic, payload);
        Ok(())
    }

    async fn subscribe(&self, filter: &TopicFilter, _qos: QoS) -> Result<()> {
        self.with_state(|state| {
            if !*state.connected.lock() {
                return Err(MqttError::Offline);
            }
            *state
                .subscribe_calls
                .lock()
                .entry(filter.as_str().to_string())
                .or_insert(0) += 1;

            let mut failures = state.fail_subscribes.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(MqttError::SubscribeRejected {
                    filter: filter.as_str().to_string(),
                    reason: "injected failure".to_string(),
                });
            }
            drop(failures);

            state.subscriptions.lock().insert(filter.clone());
            Ok(())
        })
    }

    async fn unsubscribe(&self, filter: &TopicFilter) -> Result<()> {
        self.with_state(|state| {
            if !*state.connected.lock() {
                return Err(MqttError::Offline);
            }
            *state
                .unsubscribe_calls
                .lock()
                .entry(filter.as_str().to_string())
                .or_insert(0) += 1;
            state.subscriptions.lock().remove(filter);
            Ok(())
        })
    }

    fn events(&self) -> Pin<Box<dyn Stream<Item = ClientEvent> + Send>> {
        let rx = self.event_rx.clone();
        Box::pin(futures::stream::unfold(rx, |rx| async move {
            rx.recv_async().await.ok().map(|event| (event, rx))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::StreamExt;

    fn filter(s: &str) -> TopicFilter {
        TopicFilter::new(s).unwrap()
    }

    async fn next_publish(
        events: &mut Pin<Box<dyn Stream<Item = ClientEvent> + Send>>,
    ) -> IncomingPublish {
        loop {
            match events.next().await.expect("event stream ended") {
                ClientEvent::Publish(publish) => return publish,
                ClientEvent::Connection(_) => {}
            }
        }
    }

    #[tokio::test]
    async fn routes_publish_to_matching_subscriber() {
        let _ = tracing_subscriber::fmt::try_init();

        let broker = MemoryBroker::new();
        let publisher = broker.client("publisher");
        let subscriber = broker.client("subscriber");

        subscriber
            .subscribe(&filter("sensors/+/temp"), QoS::AtLeastOnce)
            .await
            .unwrap();

        let mut events = subscriber.events();
        publisher
            .publish("sensors/room1/temp", Bytes::from("21.5"), QoS::AtLeastOnce)
            .await
            .unwrap();

        let publish = next_publish(&mut events).await;
        assert_eq!(publish.topic, "sensors/room1/temp");
        assert_eq!(publish.payload, Bytes::from("21.5"));
    }

    #[tokio::test]
    async fn overlapping_filters_deliver_once() {
        let broker = MemoryBroker::new();
        let publisher = broker.client("publisher");
        let subscriber = broker.client("subscriber");

        subscriber
            .subscribe(&filter("a/b"), QoS::AtLeastOnce)
            .await
            .unwrap();
        subscriber
            .subscribe(&filter("a/+"), QoS::AtLeastOnce)
            .await
            .unwrap();

        let mut events = subscriber.events();
        publisher
            .publish("a/b", Bytes::from("x"), QoS::AtLeastOnce)
            .await
            .unwrap();
        publisher
            .publish("a/c", Bytes::from("y"), QoS::AtLeastOnce)
            .await
            .unwrap();

        assert_eq!(next_publish(&mut events).await.topic, "a/b");
        // A second delivery of a/b would arrive before a/c.
        assert_eq!(next_publish(&mut events).await.topic, "a/c");
    }

    #[tokio::test]
    async fn dropped_connection_goes_offline_and_loses_subscriptions() {
        let broker = MemoryBroker::new();
        let client = broker.client("device");

        client
            .subscribe(&filter("things/device/#"), QoS::AtLeastOnce)
            .await
            .unwrap();
        broker.drop_connection("device");

        assert!(matches!(
            client
                .publish("things/device/state", Bytes::new(), QoS::AtLeastOnce)
                .await,
            Err(MqttError::Offline)
        ));
        assert!(broker.active_subscriptions("device").is_empty());

        broker.restore_connection("device");
        client
            .publish("things/device/state", Bytes::new(), QoS::AtLeastOnce)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn injected_subscribe_failures_are_consumed() {
        let broker = MemoryBroker::new();
        let client = broker.client("device");
        broker.fail_next_subscribes("device", 1);

        let f = filter("jobs/+/notify");
        assert!(matches!(
            client.subscribe(&f, QoS::AtLeastOnce).await,
            Err(MqttError::SubscribeRejected { .. })
        ));
        client.subscribe(&f, QoS::AtLeastOnce).await.unwrap();
        assert_eq!(broker.subscribe_count("device", "jobs/+/notify"), 2);
    }

    #[tokio::test]
    async fn wildcard_publish_is_rejected() {
        let broker = MemoryBroker::new();
        let client = broker.client("device");
        assert!(matches!(
            client
                .publish("sensors/+", Bytes::new(), QoS::AtLeastOnce)
                .await,
            Err(MqttError::PublishRejected { .. })
        ));
    }
}
