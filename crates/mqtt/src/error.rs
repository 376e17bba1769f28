//! Error types for MQTT client implementations.

use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, MqttError>;

/// Errors reported by an MQTT client implementation.
#[derive(Debug, Clone, Error)]
pub enum MqttError {
    /// The client has no connection to the broker.
    #[error("Client is offline")]
    Offline,

    /// The broker rejected a publish.
    #[error("Publish to '{topic}' rejected: {reason}")]
    PublishRejected {
        /// Topic of the rejected publish.
        topic: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// The broker returned a failure code in a SUBACK.
    #[error("Subscribe to '{filter}' rejected: {reason}")]
    SubscribeRejected {
        /// The rejected topic filter.
        filter: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// The broker returned a failure code in an UNSUBACK.
    #[error("Unsubscribe from '{filter}' rejected: {reason}")]
    UnsubscribeRejected {
        /// The rejected topic filter.
        filter: String,
        /// Broker-reported reason.
        reason: String,
    },

    /// The client was stopped and accepts no further operations.
    #[error("Client is stopped")]
    Stopped,

    /// Implementation-specific failure.
    #[error("Client error: {0}")]
    Other(String),
}
