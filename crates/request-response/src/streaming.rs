//! Long-lived streaming operations and their lifecycle.
//!
//! A streaming operation is a subscription whose matching publishes are
//! delivered to a caller-supplied handler for the operation's entire open
//! lifetime. The registry drives each operation's state machine from
//! subscription outcomes and transport reconnects, and decouples handler
//! invocation from the transport's delivery path with a bounded
//! per-operation queue drained by a worker task.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use canopy_mqtt::{IncomingPublish, TopicFilter};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::subscriptions::{SubscriptionCategory, SubscriptionHandle, SubscriptionManager};

/// The kind of change to a streaming operation's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatusEventKind {
    /// The operation is successfully subscribed to its topic filter.
    Established,
    /// The operation temporarily lost its subscription; the engine will
    /// re-establish it on reconnect.
    Lost,
    /// The operation gave up on its subscription. Terminal; the caller
    /// must close the operation and may retry with a new one.
    Halted,
}

/// A change in subscription status for a streaming operation.
#[derive(Debug, Clone)]
pub struct SubscriptionStatusEvent {
    /// The kind of the event.
    pub kind: SubscriptionStatusEventKind,
    /// Detail for `Lost` and `Halted` events, when available.
    pub error: Option<String>,
}

/// Lifecycle state of a streaming operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Created but not yet opened.
    Created,
    /// A transport subscribe is in flight.
    Subscribing,
    /// Subscribed; matching publishes are delivered to the handler.
    Established,
    /// The transport connection dropped; nothing is delivered.
    Lost,
    /// Reconnected; the subscription is being re-established.
    Resubscribing,
    /// The subscription failed terminally.
    Halted,
    /// Closed by the caller. Irreversible.
    Closed,
}

/// Caller-supplied callbacks for a streaming operation.
///
/// Payload deserialization belongs to the handler, not the engine:
/// `on_event` returns an error when the payload cannot be decoded, which
/// routes the publish to `on_deserialization_failure` and drops it. A
/// malformed payload never affects the operation or its neighbours.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    /// Called for every publish matching the operation's filter while the
    /// operation is established.
    ///
    /// # Errors
    ///
    /// Return the deserialization error when the payload cannot be
    /// decoded; the engine reroutes the event to
    /// [`on_deserialization_failure`](Self::on_deserialization_failure).
    async fn on_event(
        &self,
        event: IncomingPublish,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Called on every subscription status transition.
    async fn on_subscription_status(&self, _event: SubscriptionStatusEvent) {}

    /// Called with publishes whose payload the handler could not decode.
    async fn on_deserialization_failure(
        &self,
        _event: IncomingPublish,
        _error: Box<dyn std::error::Error + Send + Sync>,
    ) {
    }
}

enum WorkerItem {
    Publish(IncomingPublish),
    Status(SubscriptionStatusEvent),
}

struct StreamEntry {
    filter: TopicFilter,
    state: StreamState,
    worker_tx: mpsc::Sender<WorkerItem>,
    subscription: Option<SubscriptionHandle>,
}

/// Tracks open streaming operations and routes publishes and lifecycle
/// transitions to their handlers.
pub(crate) struct StreamingRegistry {
    subscriptions: Arc<SubscriptionManager>,
    queue_capacity: usize,
    streams: Mutex<HashMap<Uuid, StreamEntry>>,
}

impl StreamingRegistry {
    pub fn new(subscriptions: Arc<SubscriptionManager>, queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subscriptions,
            queue_capacity,
            streams: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a new operation in the `Created` state and spawns its
    /// worker. The subscription is not acquired until `open`.
    pub fn create(
        self: &Arc<Self>,
        filter: TopicFilter,
        handler: Arc<dyn StreamHandler>,
    ) -> StreamingOperation {
        let id = Uuid::new_v4();
        let (worker_tx, worker_rx) = mpsc::channel(self.queue_capacity);
        tokio::spawn(run_worker(handler, worker_rx));

        self.streams.lock().insert(
            id,
            StreamEntry {
                filter,
                state: StreamState::Created,
                worker_tx,
                subscription: None,
            },
        );
        debug!(%id, "created streaming operation");

        StreamingOperation {
            id,
            registry: Arc::clone(self),
        }
    }

    /// Opens an operation: acquires its subscription (streaming category)
    /// and transitions `Created` → `Subscribing` → `Established`, or to
    /// the terminal `Halted` state on subscribe failure.
    pub async fn open(&self, id: Uuid) -> Result<()> {
        let filter = {
            let mut streams = self.streams.lock();
            let entry = streams
                .get_mut(&id)
                .ok_or(Error::InvalidStreamState("closed"))?;
            match entry.state {
                StreamState::Created => entry.state = StreamState::Subscribing,
                _ => return Err(Error::InvalidStreamState("already opened")),
            }
            entry.filter.clone()
        };

        match self
            .subscriptions
            .acquire(&filter, SubscriptionCategory::Streaming)
            .await
        {
            Ok(handle) => {
                let mut streams = self.streams.lock();
                match streams.get_mut(&id) {
                    Some(entry) if entry.state == StreamState::Subscribing => {
                        entry.state = StreamState::Established;
                        entry.subscription = Some(handle);
                        Self::send_status(
                            entry,
                            SubscriptionStatusEvent {
                                kind: SubscriptionStatusEventKind::Established,
                                error: None,
                            },
                        );
                        Ok(())
                    }
                    _ => {
                        // Closed while the subscribe was in flight.
                        drop(streams);
                        handle.release();
                        Err(Error::InvalidStreamState("closed"))
                    }
                }
            }
            Err(e) => {
                let mut streams = self.streams.lock();
                if let Some(entry) = streams.get_mut(&id) {
                    if entry.state == StreamState::Subscribing {
                        entry.state = StreamState::Halted;
                        Self::send_status(
                            entry,
                            SubscriptionStatusEvent {
                                kind: SubscriptionStatusEventKind::Halted,
                                error: Some(e.to_string()),
                            },
                        );
                    }
                }
                Err(e)
            }
        }
    }

    /// Closes an operation: releases its subscription reference and ends
    /// its worker. Idempotent; closing an unknown or already-closed
    /// operation is a no-op.
    pub fn close(&self, id: Uuid) {
        let removed = self.streams.lock().remove(&id);
        if let Some(entry) = removed {
            debug!(%id, "closed streaming operation");
            // Dropping the entry drops the worker sender (the worker
            // drains and exits) and the subscription reference.
            drop(entry);
        }
    }

    /// Current state of an operation; `Closed` once it is gone.
    pub fn state(&self, id: Uuid) -> StreamState {
        self.streams
            .lock()
            .get(&id)
            .map_or(StreamState::Closed, |entry| entry.state)
    }

    /// Delivers a publish to every established operation whose filter
    /// matches the topic.
    pub fn dispatch_publish(&self, publish: &IncomingPublish) {
        let streams = self.streams.lock();
        for (id, entry) in streams.iter() {
            if entry.state != StreamState::Established || !entry.filter.matches(&publish.topic) {
                continue;
            }
            match entry
                .worker_tx
                .try_send(WorkerItem::Publish(publish.clone()))
            {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%id, topic = %publish.topic, "stream queue full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Transitions every established operation to `Lost` on transport
    /// disconnect.
    pub fn on_connection_lost(&self, reason: Option<&str>) {
        let mut streams = self.streams.lock();
        for entry in streams.values_mut() {
            if entry.state == StreamState::Established {
                entry.state = StreamState::Lost;
                Self::send_status(
                    entry,
                    SubscriptionStatusEvent {
                        kind: SubscriptionStatusEventKind::Lost,
                        error: reason.map(ToString::to_string),
                    },
                );
            }
        }
    }

    /// Marks every lost operation as resubscribing ahead of the
    /// post-reconnect resubscribe pass.
    pub fn begin_resubscribing(&self) {
        let mut streams = self.streams.lock();
        for entry in streams.values_mut() {
            if entry.state == StreamState::Lost {
                entry.state = StreamState::Resubscribing;
            }
        }
    }

    /// Applies the outcome of the resubscribe pass for one filter to every
    /// operation waiting on it.
    pub fn complete_resubscribe(&self, filter: &TopicFilter, result: &Result<()>) {
        let mut streams = self.streams.lock();
        for entry in streams.values_mut() {
            if entry.state != StreamState::Resubscribing || entry.filter != *filter {
                continue;
            }
            match result {
                Ok(()) => {
                    entry.state = StreamState::Established;
                    Self::send_status(
                        entry,
                        SubscriptionStatusEvent {
                            kind: SubscriptionStatusEventKind::Established,
                            error: None,
                        },
                    );
                }
                Err(e) => {
                    entry.state = StreamState::Halted;
                    Self::send_status(
                        entry,
                        SubscriptionStatusEvent {
                            kind: SubscriptionStatusEventKind::Halted,
                            error: Some(e.to_string()),
                        },
                    );
                }
            }
        }
    }

    /// Re-establishes every resubscribing operation without a transport
    /// round trip, for reconnects that resumed the previous session.
    pub fn restore_all(&self) {
        let mut streams = self.streams.lock();
        for entry in streams.values_mut() {
            if entry.state == StreamState::Resubscribing {
                entry.state = StreamState::Established;
                Self::send_status(
                    entry,
                    SubscriptionStatusEvent {
                        kind: SubscriptionStatusEventKind::Established,
                        error: None,
                    },
                );
            }
        }
    }

    /// Closes every operation (engine shutdown).
    pub fn close_all(&self) {
        let drained: Vec<StreamEntry> = {
            let mut streams = self.streams.lock();
            streams.drain().map(|(_, entry)| entry).collect()
        };
        drop(drained);
    }

    /// Status events are lossless: when the queue is momentarily full the
    /// send is completed from a task instead of being dropped.
    fn send_status(entry: &StreamEntry, event: SubscriptionStatusEvent) {
        match entry.worker_tx.try_send(WorkerItem::Status(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(item)) => {
                let tx = entry.worker_tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(item).await;
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

impl fmt::Debug for StreamingRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingRegistry")
            .field("queue_capacity", &self.queue_capacity)
            .finish_non_exhaustive()
    }
}

async fn run_worker(handler: Arc<dyn StreamHandler>, mut rx: mpsc::Receiver<WorkerItem>) {
    while let Some(item) = rx.recv().await {
        match item {
            WorkerItem::Publish(event) => {
                if let Err(error) = handler.on_event(event.clone()).await {
                    handler.on_deserialization_failure(event, error).await;
                }
            }
            WorkerItem::Status(event) => handler.on_subscription_status(event).await,
        }
    }
}

/// A caller-owned handle to a long-lived streaming operation.
///
/// Created by
/// [`RequestResponseClient::create_stream`](crate::client::RequestResponseClient::create_stream)
/// in the `Created` state; nothing is subscribed until [`open`](Self::open)
/// is called. Dropping the handle closes the operation and releases its
/// subscription.
pub struct StreamingOperation {
    id: Uuid,
    registry: Arc<StreamingRegistry>,
}

impl StreamingOperation {
    /// Unique id of this operation.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Opens the operation by subscribing to its topic filter. The handler
    /// observes an `Established` status event on success and a terminal
    /// `Halted` event on failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CapacityExceeded`] if admitting the filter would
    /// exceed the streaming ceiling, [`Error::SubscribeFailed`] if the
    /// transport rejects the subscription, and
    /// [`Error::InvalidStreamState`] if the operation was already opened
    /// or closed.
    pub async fn open(&self) -> Result<()> {
        self.registry.open(self.id).await
    }

    /// Closes the operation and releases its subscription reference.
    /// Idempotent and callable from any task at any time.
    pub fn close(&self) {
        self.registry.close(self.id);
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.registry.state(self.id)
    }
}

impl Drop for StreamingOperation {
    fn drop(&mut self) {
        self.registry.close(self.id);
    }
}

impl fmt::Debug for StreamingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingOperation")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
