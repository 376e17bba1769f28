//! MQTT5 client capability consumed by the request-response engine.
//!
//! This crate defines a transport-agnostic interface over an MQTT5 client:
//! publish, subscribe and unsubscribe calls plus a stream of connection and
//! message events. Concrete clients (an in-memory broker for tests, a real
//! wire client) are provided in separate crates.
//!
//! The interface deliberately stops at the packet boundary: connection
//! establishment, TLS, credentials, QoS retry and wire encoding are the
//! implementation's concern. Consumers only see acknowledged operations and
//! the event stream.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod topic;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

pub use error::{MqttError, Result};
pub use topic::{FilterError, TopicFilter};

/// MQTT quality-of-service level for publishes and subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce,
    /// Acknowledged delivery, possible duplicates.
    #[default]
    AtLeastOnce,
    /// Exactly-once delivery.
    ExactlyOnce,
}

/// A PUBLISH packet delivered by the broker on a subscribed topic.
#[derive(Debug, Clone)]
pub struct IncomingPublish {
    /// The topic the message was published to.
    pub topic: String,
    /// The message payload, opaque to this layer.
    pub payload: Bytes,
}

/// A change in the client's connection to the broker.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The client has started a connection attempt.
    AttemptingConnect,
    /// A CONNACK with a success code was received.
    ConnectionSuccess {
        /// Whether the broker resumed an existing session. When `false`,
        /// all previous subscriptions are gone and must be re-established.
        session_present: bool,
    },
    /// A connection attempt failed before the session was established.
    ConnectionFailure {
        /// Implementation-reported failure detail.
        reason: String,
    },
    /// An established connection was interrupted.
    Disconnected {
        /// Implementation-reported disconnect detail, if any.
        reason: Option<String>,
    },
    /// The client was stopped and will make no further attempts.
    Stopped,
}

/// An event emitted by an MQTT client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A connection lifecycle change.
    Connection(ConnectionEvent),
    /// An incoming publish on a subscribed topic.
    Publish(IncomingPublish),
}

/// An asynchronous MQTT5 client.
///
/// Implementations own the wire protocol entirely; the contract here is in
/// terms of acknowledged outcomes. `subscribe` resolves once the broker has
/// accepted (or rejected) the subscription, `publish` once the message is
/// acknowledged at the requested QoS, `unsubscribe` once the filter is
/// released. Transport-level retries happen below this interface.
#[async_trait]
pub trait MqttClient: Send + Sync + 'static {
    /// Publish a payload to a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is offline or the broker rejects the
    /// publish.
    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> Result<()>;

    /// Subscribe to a topic filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is offline or the broker returns a
    /// failure code in the SUBACK.
    async fn subscribe(&self, filter: &TopicFilter, qos: QoS) -> Result<()>;

    /// Unsubscribe from a topic filter.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is offline or the broker returns a
    /// failure code in the UNSUBACK.
    async fn unsubscribe(&self, filter: &TopicFilter) -> Result<()>;

    /// Get a stream of connection and message events.
    ///
    /// Events are delivered in the order the client observed them; in
    /// particular a publish received after a reconnect is never yielded
    /// before the corresponding [`ConnectionEvent::ConnectionSuccess`].
    fn events(&self) -> Pin<Box<dyn Stream<Item = ClientEvent> + Send>>;
}
