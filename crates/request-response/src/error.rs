//! Error types for the request-response engine.

use std::time::Duration;

use canopy_mqtt::MqttError;
use thiserror::Error;

use crate::subscriptions::SubscriptionCategory;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for engine operations.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Admitting another distinct topic filter would exceed the configured
    /// ceiling for its category. Nothing was subscribed or registered.
    #[error("Subscription capacity exceeded: {in_use}/{max} {category} filters in use")]
    CapacityExceeded {
        /// The category whose ceiling was hit.
        category: SubscriptionCategory,
        /// Distinct filters currently admitted in that category.
        in_use: usize,
        /// The configured ceiling.
        max: usize,
    },

    /// A request with the same correlation token is already in flight.
    /// The registration was rejected before anything was published.
    #[error("A request with correlation token '{0}' is already in flight")]
    DuplicateCorrelation(String),

    /// The transport rejected the request's publish. The pending request
    /// was removed.
    #[error("Publish failed: {0}")]
    PublishFailed(#[source] MqttError),

    /// The transport rejected a subscribe for the given filter.
    #[error("Subscribe to '{filter}' failed: {reason}")]
    SubscribeFailed {
        /// The filter that could not be subscribed.
        filter: String,
        /// Transport-reported detail.
        reason: String,
    },

    /// No matching response arrived before the deadline. The pending
    /// request was removed.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The transport connection was lost while the operation was in
    /// flight (reported only under [`DisconnectPolicy::FailFast`]).
    ///
    /// [`DisconnectPolicy::FailFast`]: crate::client::DisconnectPolicy::FailFast
    #[error("Transport disconnected")]
    TransportDisconnected,

    /// The supplied options failed admission-time validation.
    #[error("Invalid operation options: {0}")]
    InvalidOptions(String),

    /// The streaming operation is not in a state that permits the call.
    #[error("Streaming operation is {0}")]
    InvalidStreamState(&'static str),

    /// The engine is shutting down and accepts no new operations.
    #[error("Client is shutting down")]
    ShuttingDown,

    /// An internal completion channel closed unexpectedly.
    #[error("Channel closed")]
    ChannelClosed,
}
