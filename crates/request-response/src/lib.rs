//! MQTT request-response and streaming correlation engine.
//!
//! MQTT is an asymmetric publish/subscribe transport; IoT service
//! protocols built on it (device shadow, jobs, fleet provisioning) are
//! request/response and event-stream shaped. This crate bridges the two:
//! one-shot requests with correlation tokens and hard deadlines, and
//! long-lived reconnection-resilient event streams, multiplexed over a
//! bounded pool of shared topic subscriptions.
//!
//! # Features
//!
//! - **Request/response**: publish a request, suspend until the correlated
//!   response arrives or the deadline passes
//! - **Streaming**: long-lived subscriptions delivering every matching
//!   publish to a handler, re-established automatically after reconnects
//! - **Subscription multiplexing**: operations needing the same topic
//!   filter share one transport subscription, admitted against
//!   per-category ceilings
//! - **Transport-agnostic**: anything implementing
//!   [`canopy_mqtt::MqttClient`] works, including the in-memory broker
//!   from `canopy-mqtt-memory`
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use canopy_mqtt::TopicFilter;
//! use canopy_mqtt_memory::MemoryBroker;
//! use canopy_request_response::{RequestOptions, RequestResponseClient, ResponsePath};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = MemoryBroker::new();
//!     let client = RequestResponseClient::builder()
//!         .operation_timeout(Duration::from_secs(5))
//!         .build(Arc::new(broker.client("device-1")));
//!
//!     let mut options = RequestOptions::new(
//!         "things/device-1/shadow/get",
//!         r#"{"clientToken":"get-1"}"#.into(),
//!     );
//!     options.subscription_topic_filters =
//!         vec![TopicFilter::new("things/device-1/shadow/get/+")?];
//!     options.response_paths = vec![
//!         ResponsePath::with_correlation_token_path(
//!             TopicFilter::new("things/device-1/shadow/get/accepted")?,
//!             "/clientToken",
//!         ),
//!         ResponsePath::with_correlation_token_path(
//!             TopicFilter::new("things/device-1/shadow/get/rejected")?,
//!             "/clientToken",
//!         ),
//!     ];
//!     options.correlation_token = Some("get-1".to_string());
//!
//!     let response = client.submit_request(options).await?;
//!     println!("shadow document: {:?}", response.payload);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod correlation;
pub mod error;
pub mod streaming;
pub mod subscriptions;

// Re-export commonly used types
pub use client::{
    ClientBuilder, ClientConfig, DisconnectPolicy, RequestOptions, RequestResponseClient,
};
pub use correlation::{Response, ResponsePath};
pub use error::{Error, Result};
pub use streaming::{
    StreamHandler, StreamState, StreamingOperation, SubscriptionStatusEvent,
    SubscriptionStatusEventKind,
};
pub use subscriptions::SubscriptionCategory;

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
pub use canopy_mqtt::{
    ClientEvent, ConnectionEvent, IncomingPublish, MqttClient, QoS, TopicFilter,
};
