//! The request-response client facade.
//!
//! Composes the subscription manager, correlation table and streaming
//! registry over a caller-supplied MQTT client. One dispatch task per
//! engine instance consumes the transport's event stream; reconnect
//! handling completes before any later event is processed, which is what
//! guarantees that resubscription finishes before post-reconnect events
//! reach any operation.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use canopy_mqtt::topic::validate_topic_name;
use canopy_mqtt::{ClientEvent, ConnectionEvent, MqttClient, QoS, TopicFilter};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, instrument};

use crate::correlation::{CorrelationTable, PendingRequest, Response, ResponsePath};
use crate::error::{Error, Result};
use crate::streaming::{StreamHandler, StreamingOperation, StreamingRegistry};
use crate::subscriptions::{SubscriptionCategory, SubscriptionLimits, SubscriptionManager};

/// How often the dispatch task sweeps for requests past their deadline.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// How in-flight requests behave when the transport disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectPolicy {
    /// Keep waiting; the broker may still deliver the response after a
    /// reconnect. Requests fail when their own deadline passes.
    #[default]
    WaitForTimeout,
    /// Fail every in-flight request immediately with
    /// [`Error::TransportDisconnected`].
    FailFast,
}

/// Configuration for the request-response client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Ceiling on distinct topic filters subscribed for request-response
    /// exchanges.
    pub max_request_response_subscriptions: usize,
    /// Ceiling on distinct topic filters subscribed for streaming
    /// operations.
    pub max_streaming_subscriptions: usize,
    /// Default deadline for a request, measured from submission.
    pub operation_timeout: Duration,
    /// Behavior of in-flight requests on transport disconnect.
    pub disconnect_policy: DisconnectPolicy,
    /// Bound of each streaming operation's event queue. A slow handler
    /// fills its own queue only; publishes arriving on a full queue are
    /// dropped.
    pub stream_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_request_response_subscriptions: 10,
            max_streaming_subscriptions: 10,
            operation_timeout: Duration::from_secs(60),
            disconnect_policy: DisconnectPolicy::default(),
            stream_queue_capacity: 256,
        }
    }
}

/// Builder for creating request-response clients.
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request-response subscription ceiling.
    #[must_use]
    pub const fn max_request_response_subscriptions(mut self, max: usize) -> Self {
        self.config.max_request_response_subscriptions = max;
        self
    }

    /// Set the streaming subscription ceiling.
    #[must_use]
    pub const fn max_streaming_subscriptions(mut self, max: usize) -> Self {
        self.config.max_streaming_subscriptions = max;
        self
    }

    /// Set the default request deadline.
    #[must_use]
    pub const fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    /// Set the disconnect policy for in-flight requests.
    #[must_use]
    pub const fn disconnect_policy(mut self, policy: DisconnectPolicy) -> Self {
        self.config.disconnect_policy = policy;
        self
    }

    /// Set the per-stream event queue bound.
    #[must_use]
    pub const fn stream_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.stream_queue_capacity = capacity;
        self
    }

    /// Build the client over the given MQTT transport and spawn its
    /// dispatch task.
    #[must_use]
    pub fn build(self, mqtt: Arc<dyn MqttClient>) -> RequestResponseClient {
        let config = self.config;
        let subscriptions = SubscriptionManager::new(
            Arc::clone(&mqtt),
            SubscriptionLimits {
                max_request_response: config.max_request_response_subscriptions,
                max_streaming: config.max_streaming_subscriptions,
            },
            QoS::AtLeastOnce,
        );
        let correlation = Arc::new(CorrelationTable::new());
        let streaming = StreamingRegistry::new(
            Arc::clone(&subscriptions),
            config.stream_queue_capacity,
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let shutting_down = Arc::new(AtomicBool::new(false));
        tokio::spawn(dispatch_loop(
            mqtt.events(),
            Arc::clone(&subscriptions),
            Arc::clone(&correlation),
            Arc::clone(&streaming),
            config.disconnect_policy,
            Arc::clone(&shutting_down),
            shutdown_rx,
        ));

        RequestResponseClient {
            mqtt,
            config,
            subscriptions,
            correlation,
            streaming,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutting_down,
        }
    }
}

/// Options for a single request-response exchange.
///
/// A request publishes `payload` to `publish_topic`, subscribes to
/// `subscription_topic_filters` beforehand, and completes when a publish
/// arrives on one of `response_paths` carrying `correlation_token` (or on
/// the path's topic alone for token-less requests).
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Filters to subscribe before publishing; they must cover the
    /// response paths.
    pub subscription_topic_filters: Vec<TopicFilter>,
    /// Where the response may arrive and how to extract its token.
    pub response_paths: Vec<ResponsePath>,
    /// The topic the request is published to.
    pub publish_topic: String,
    /// The request payload, opaque to the engine.
    pub payload: Bytes,
    /// Token expected in the response payload. `None` for request types
    /// whose responses carry no token (matched by topic instead).
    pub correlation_token: Option<String>,
    /// Per-request deadline override; the client's `operation_timeout`
    /// applies when `None`.
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    /// Options publishing `payload` to `publish_topic`, with all other
    /// fields empty.
    pub fn new<S>(publish_topic: S, payload: Bytes) -> Self
    where
        S: Into<String>,
    {
        Self {
            subscription_topic_filters: Vec::new(),
            response_paths: Vec::new(),
            publish_topic: publish_topic.into(),
            payload,
            correlation_token: None,
            timeout: None,
        }
    }
}

/// An MQTT request-response and streaming client.
///
/// Engine instances are caller-owned and independent; there is no
/// process-wide state. Dropping the client shuts it down: remaining
/// pending requests fail with [`Error::ShuttingDown`] and open streams are
/// closed.
pub struct RequestResponseClient {
    mqtt: Arc<dyn MqttClient>,
    config: ClientConfig,
    subscriptions: Arc<SubscriptionManager>,
    correlation: Arc<CorrelationTable>,
    streaming: Arc<StreamingRegistry>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    shutting_down: Arc<AtomicBool>,
}

impl RequestResponseClient {
    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Submit a request and suspend until its response, failure or
    /// timeout.
    ///
    /// On any failure the pending registration and every subscription
    /// reference newly acquired for this call are released; a failed
    /// request leaks nothing.
    ///
    /// # Errors
    ///
    /// [`Error::CapacityExceeded`] and [`Error::InvalidOptions`] before
    /// any side effect, [`Error::DuplicateCorrelation`] before the
    /// publish, [`Error::PublishFailed`] if the transport rejects the
    /// publish, [`Error::Timeout`] when the deadline passes, and
    /// [`Error::TransportDisconnected`] under
    /// [`DisconnectPolicy::FailFast`].
    #[instrument(skip(self, options), fields(topic = %options.publish_topic))]
    pub async fn submit_request(&self, options: RequestOptions) -> Result<Response> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        Self::validate(&options)?;

        let RequestOptions {
            subscription_topic_filters,
            response_paths,
            publish_topic,
            payload,
            correlation_token,
            timeout,
        } = options;
        let timeout = timeout.unwrap_or(self.config.operation_timeout);

        // Acquire subscriptions first so the response cannot race past us.
        // Handles release on drop, so every early return below cleans up.
        let mut handles = Vec::with_capacity(subscription_topic_filters.len());
        let mut seen: Vec<&TopicFilter> = Vec::new();
        for filter in &subscription_topic_filters {
            if seen.contains(&filter) {
                continue;
            }
            seen.push(filter);
            handles.push(
                self.subscriptions
                    .acquire(filter, SubscriptionCategory::RequestResponse)
                    .await?,
            );
        }

        let (completion, response_rx) = oneshot::channel();
        let created_at = Instant::now();
        let id = self.correlation.register(PendingRequest {
            token: correlation_token,
            response_paths,
            timeout,
            created_at,
            deadline: created_at + timeout,
            completion,
        })?;

        if let Err(e) = self
            .mqtt
            .publish(&publish_topic, payload, QoS::AtLeastOnce)
            .await
        {
            self.correlation.remove(id);
            return Err(Error::PublishFailed(e));
        }
        debug!(topic = %publish_topic, "request published");

        let result = response_rx.await.map_err(|_| Error::ChannelClosed)?;
        drop(handles);
        result
    }

    /// Create a streaming operation for `topic_filter`.
    ///
    /// The operation starts in [`Created`](crate::streaming::StreamState::Created);
    /// call [`StreamingOperation::open`] to subscribe. Capacity against
    /// the streaming ceiling is checked at open time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] if the client is shutting down.
    #[instrument(skip(self, handler), fields(filter = %topic_filter))]
    pub fn create_stream(
        &self,
        topic_filter: TopicFilter,
        handler: Arc<dyn StreamHandler>,
    ) -> Result<StreamingOperation> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        Ok(self.streaming.create(topic_filter, handler))
    }

    /// Number of requests currently awaiting a response.
    #[must_use]
    pub fn pending_request_count(&self) -> usize {
        self.correlation.pending_count()
    }

    /// Number of distinct filters currently subscribed in `category`.
    #[must_use]
    pub fn subscriptions_in_use(&self, category: SubscriptionCategory) -> usize {
        self.subscriptions.in_use(category)
    }

    /// Shut the client down: stop the dispatch task, fail remaining
    /// pending requests with [`Error::ShuttingDown`] and close every open
    /// stream. Idempotent.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("shutting down request-response client");
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
        self.correlation.fail_all(|| Error::ShuttingDown);
        self.streaming.close_all();
    }

    fn validate(options: &RequestOptions) -> Result<()> {
        validate_topic_name(&options.publish_topic)
            .map_err(|e| Error::InvalidOptions(e.to_string()))?;
        if options.subscription_topic_filters.is_empty() {
            return Err(Error::InvalidOptions(
                "at least one subscription topic filter is required".to_string(),
            ));
        }
        if options.response_paths.is_empty() {
            return Err(Error::InvalidOptions(
                "at least one response path is required".to_string(),
            ));
        }
        if options.correlation_token.is_some()
            && !options
                .response_paths
                .iter()
                .any(|p| p.correlation_token_path.is_some())
        {
            return Err(Error::InvalidOptions(
                "a correlation token was provided but no response path extracts one".to_string(),
            ));
        }
        for path in &options.response_paths {
            // Concrete response topics must be covered by a subscription
            // filter; wildcard paths are the caller's responsibility.
            if !path.filter.has_wildcards()
                && !options
                    .subscription_topic_filters
                    .iter()
                    .any(|f| f.matches(path.filter.as_str()))
            {
                return Err(Error::InvalidOptions(format!(
                    "response path '{}' is not covered by any subscription topic filter",
                    path.filter
                )));
            }
        }
        Ok(())
    }
}

impl Drop for RequestResponseClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RequestResponseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestResponseClient")
            .field("config", &self.config)
            .field("pending_requests", &self.correlation.pending_count())
            .finish_non_exhaustive()
    }
}

/// The engine's single consumer of the transport event stream.
///
/// Reconnect handling is awaited inline, so no later event can be
/// processed until every re-established subscription is acknowledged.
async fn dispatch_loop(
    mut events: Pin<Box<dyn Stream<Item = ClientEvent> + Send>>,
    subscriptions: Arc<SubscriptionManager>,
    correlation: Arc<CorrelationTable>,
    streaming: Arc<StreamingRegistry>,
    policy: DisconnectPolicy,
    shutting_down: Arc<AtomicBool>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut sweep = interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!("dispatch task stopping");
                break;
            }
            _ = sweep.tick() => {
                correlation.expire(Instant::now());
            }
            event = events.next() => {
                let Some(event) = event else {
                    // Without a live event stream no response can ever
                    // arrive; refuse new operations too.
                    debug!("transport event stream ended");
                    shutting_down.store(true, Ordering::SeqCst);
                    correlation.fail_all(|| Error::TransportDisconnected);
                    streaming.on_connection_lost(Some("transport stopped"));
                    break;
                };
                handle_event(event, &subscriptions, &correlation, &streaming, policy).await;
            }
        }
    }
}

async fn handle_event(
    event: ClientEvent,
    subscriptions: &SubscriptionManager,
    correlation: &CorrelationTable,
    streaming: &StreamingRegistry,
    policy: DisconnectPolicy,
) {
    match event {
        ClientEvent::Publish(publish) => {
            correlation.on_incoming_publish(&publish.topic, &publish.payload);
            streaming.dispatch_publish(&publish);
        }
        ClientEvent::Connection(ConnectionEvent::ConnectionSuccess { session_present }) => {
            debug!(session_present, "transport connected");
            streaming.begin_resubscribing();
            if session_present {
                // The broker kept our subscriptions; nothing to re-issue.
                streaming.restore_all();
            } else {
                for (filter, result) in subscriptions.resubscribe_all().await {
                    streaming.complete_resubscribe(&filter, &result);
                }
            }
        }
        ClientEvent::Connection(ConnectionEvent::Disconnected { reason }) => {
            debug!(?reason, "transport disconnected");
            streaming.on_connection_lost(reason.as_deref());
            if policy == DisconnectPolicy::FailFast {
                correlation.fail_all(|| Error::TransportDisconnected);
            }
        }
        ClientEvent::Connection(ConnectionEvent::Stopped) => {
            debug!("transport stopped");
            correlation.fail_all(|| Error::TransportDisconnected);
            streaming.on_connection_lost(Some("transport stopped"));
        }
        ClientEvent::Connection(ConnectionEvent::ConnectionFailure { reason }) => {
            debug!(%reason, "connection attempt failed");
        }
        ClientEvent::Connection(ConnectionEvent::AttemptingConnect) => {}
    }
}
