//! Reference-counted multiplexing of logical operations onto transport
//! subscriptions.
//!
//! Many concurrent operations may need the same topic filter; the manager
//! keeps one physical subscription per distinct filter and a reference
//! count of the operations using it. Distinct filters are admitted against
//! a per-category ceiling, and a filter is unsubscribed eagerly once its
//! last reference is released so the slot frees up for other operations.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use canopy_mqtt::{MqttClient, QoS, TopicFilter};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Which ceiling a subscription is admitted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionCategory {
    /// Subscriptions backing one-shot request/response exchanges.
    RequestResponse,
    /// Subscriptions backing long-lived streaming operations.
    Streaming,
}

impl fmt::Display for SubscriptionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestResponse => f.write_str("request-response"),
            Self::Streaming => f.write_str("streaming"),
        }
    }
}

/// Per-category admission ceilings.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SubscriptionLimits {
    pub max_request_response: usize,
    pub max_streaming: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriptionState {
    Subscribing,
    Subscribed,
    Unsubscribing,
}

/// Broadcast to everyone awaiting the outcome of a physical subscribe.
#[derive(Debug, Clone)]
enum SubscribeOutcome {
    Pending,
    Active,
    Failed(String),
    /// The record was fully unsubscribed and removed; retry from scratch.
    Released,
}

struct SubscriptionRecord {
    state: SubscriptionState,
    ref_count: usize,
    category: SubscriptionCategory,
    last_error: Option<String>,
    outcome_tx: watch::Sender<SubscribeOutcome>,
}

/// A counted reference to a shared subscription.
///
/// Dropping the handle releases the reference; when the last reference for
/// a filter goes away the manager unsubscribes on the transport.
pub(crate) struct SubscriptionHandle {
    filter: TopicFilter,
    manager: Arc<SubscriptionManager>,
}

impl SubscriptionHandle {
    /// Releases this reference. Equivalent to dropping the handle; the
    /// explicit form documents intent at call sites.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.manager.release_filter(&self.filter);
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("filter", &self.filter)
            .finish()
    }
}

/// Owns the set of active topic-filter subscriptions on the transport.
pub(crate) struct SubscriptionManager {
    client: Arc<dyn MqttClient>,
    limits: SubscriptionLimits,
    qos: QoS,
    records: Mutex<HashMap<TopicFilter, SubscriptionRecord>>,
}

/// Removes the record if the owning `acquire` is cancelled mid-subscribe,
/// so waiters are unblocked and the possibly-sent SUBSCRIBE is reverted.
struct SubscribeGuard<'a> {
    manager: &'a Arc<SubscriptionManager>,
    filter: &'a TopicFilter,
    armed: bool,
}

impl Drop for SubscribeGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let removed = self.manager.records.lock().remove(self.filter);
        if let Some(record) = removed {
            let _ = record
                .outcome_tx
                .send(SubscribeOutcome::Failed("subscribe cancelled".to_string()));
            self.manager.spawn_unsubscribe(self.filter.clone());
        }
    }
}

impl SubscriptionManager {
    pub fn new(client: Arc<dyn MqttClient>, limits: SubscriptionLimits, qos: QoS) -> Arc<Self> {
        Arc::new(Self {
            client,
            limits,
            qos,
            records: Mutex::new(HashMap::new()),
        })
    }

    /// Acquires a reference to a subscription on `filter`, issuing a
    /// transport subscribe if the filter has no active record. Returns once
    /// the subscription is established on the transport.
    ///
    /// Admitting a new distinct filter checks the ceiling for `category`
    /// before any state is created; a rejected acquire has no side effects.
    pub async fn acquire(
        self: &Arc<Self>,
        filter: &TopicFilter,
        category: SubscriptionCategory,
    ) -> Result<SubscriptionHandle> {
        loop {
            enum Plan {
                Owner,
                Wait(watch::Receiver<SubscribeOutcome>),
            }

            let plan = {
                let mut records = self.records.lock();
                match records.get_mut(filter) {
                    Some(record) if record.state == SubscriptionState::Subscribed => {
                        record.ref_count += 1;
                        return Ok(self.handle(filter));
                    }
                    Some(record) => Plan::Wait(record.outcome_tx.subscribe()),
                    None => {
                        let in_use = records
                            .values()
                            .filter(|r| r.category == category)
                            .count();
                        let max = self.limit(category);
                        if in_use >= max {
                            return Err(Error::CapacityExceeded {
                                category,
                                in_use,
                                max,
                            });
                        }
                        let (outcome_tx, _) = watch::channel(SubscribeOutcome::Pending);
                        records.insert(
                            filter.clone(),
                            SubscriptionRecord {
                                state: SubscriptionState::Subscribing,
                                ref_count: 1,
                                category,
                                last_error: None,
                                outcome_tx,
                            },
                        );
                        Plan::Owner
                    }
                }
            };

            match plan {
                Plan::Owner => return self.subscribe_as_owner(filter).await,
                Plan::Wait(rx) => {
                    if let Some(handle) = self.wait_for_outcome(filter, rx).await? {
                        return Ok(handle);
                    }
                    // Record was released or superseded; retry from scratch.
                }
            }
        }
    }

    /// Re-issues a transport subscribe for every established record, for
    /// use after a reconnect without session resumption. Returns the
    /// per-filter outcomes in no particular order.
    pub async fn resubscribe_all(&self) -> Vec<(TopicFilter, Result<()>)> {
        let filters: Vec<TopicFilter> = {
            let records = self.records.lock();
            records
                .iter()
                .filter(|(_, r)| r.state == SubscriptionState::Subscribed)
                .map(|(f, _)| f.clone())
                .collect()
        };

        let mut results = Vec::with_capacity(filters.len());
        for filter in filters {
            let result = self.client.subscribe(&filter, self.qos).await;
            if let Err(e) = &result {
                warn!(filter = %filter, error = %e, "resubscribe failed");
                if let Some(record) = self.records.lock().get_mut(&filter) {
                    record.last_error = Some(e.to_string());
                }
            } else {
                debug!(filter = %filter, "resubscribed");
            }
            results.push((
                filter.clone(),
                result.map_err(|e| Error::SubscribeFailed {
                    filter: filter.as_str().to_string(),
                    reason: e.to_string(),
                }),
            ));
        }
        results
    }

    /// Number of distinct filters currently admitted in `category`.
    pub fn in_use(&self, category: SubscriptionCategory) -> usize {
        self.records
            .lock()
            .values()
            .filter(|r| r.category == category)
            .count()
    }

    fn limit(&self, category: SubscriptionCategory) -> usize {
        match category {
            SubscriptionCategory::RequestResponse => self.limits.max_request_response,
            SubscriptionCategory::Streaming => self.limits.max_streaming,
        }
    }

    fn handle(self: &Arc<Self>, filter: &TopicFilter) -> SubscriptionHandle {
        SubscriptionHandle {
            filter: filter.clone(),
            manager: Arc::clone(self),
        }
    }

    async fn subscribe_as_owner(self: &Arc<Self>, filter: &TopicFilter) -> Result<SubscriptionHandle> {
        let mut guard = SubscribeGuard {
            manager: self,
            filter,
            armed: true,
        };
        let result = self.client.subscribe(filter, self.qos).await;
        guard.armed = false;

        let mut records = self.records.lock();
        match result {
            Ok(()) => {
                if let Some(record) = records.get_mut(filter) {
                    record.state = SubscriptionState::Subscribed;
                    let _ = record.outcome_tx.send(SubscribeOutcome::Active);
                }
                drop(records);
                debug!(filter = %filter, "subscription established");
                Ok(self.handle(filter))
            }
            Err(e) => {
                if let Some(record) = records.remove(filter) {
                    let _ = record
                        .outcome_tx
                        .send(SubscribeOutcome::Failed(e.to_string()));
                }
                drop(records);
                warn!(filter = %filter, error = %e, "subscribe failed");
                Err(Error::SubscribeFailed {
                    filter: filter.as_str().to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Waits for the owning subscribe (or a draining unsubscribe) on this
    /// filter to reach a terminal outcome. `Ok(Some(handle))` means the
    /// subscription is active and our reference is counted; `Ok(None)`
    /// means the record went away and the caller should retry.
    async fn wait_for_outcome(
        self: &Arc<Self>,
        filter: &TopicFilter,
        mut rx: watch::Receiver<SubscribeOutcome>,
    ) -> Result<Option<SubscriptionHandle>> {
        loop {
            let outcome = rx.borrow_and_update().clone();
            match outcome {
                SubscribeOutcome::Active => {
                    {
                        let mut records = self.records.lock();
                        if let Some(record) = records.get_mut(filter) {
                            if record.state == SubscriptionState::Subscribed {
                                record.ref_count += 1;
                                return Ok(Some(self.handle(filter)));
                            }
                        }
                    }
                    // The subscription is draining; wait for it to finish
                    // before retrying from scratch.
                    if rx.changed().await.is_err() {
                        return Ok(None);
                    }
                }
                SubscribeOutcome::Failed(reason) => {
                    return Err(Error::SubscribeFailed {
                        filter: filter.as_str().to_string(),
                        reason,
                    });
                }
                SubscribeOutcome::Released => return Ok(None),
                SubscribeOutcome::Pending => {
                    if rx.changed().await.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn release_filter(self: &Arc<Self>, filter: &TopicFilter) {
        let should_unsubscribe = {
            let mut records = self.records.lock();
            let Some(record) = records.get_mut(filter) else {
                return;
            };
            if record.ref_count == 0 {
                // Already draining; never issue a second unsubscribe.
                return;
            }
            record.ref_count -= 1;
            if record.ref_count == 0 && record.state == SubscriptionState::Subscribed {
                record.state = SubscriptionState::Unsubscribing;
                true
            } else {
                false
            }
        };
        if should_unsubscribe {
            debug!(filter = %filter, "last reference released, unsubscribing");
            self.spawn_unsubscribe(filter.clone());
        }
    }

    fn spawn_unsubscribe(self: &Arc<Self>, filter: TopicFilter) {
        let manager = Arc::clone(self);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            if let Err(e) = manager.client.unsubscribe(&filter).await {
                warn!(filter = %filter, error = %e, "unsubscribe failed");
            }
            let mut records = manager.records.lock();
            let drained = records
                .get(&filter)
                .is_some_and(|r| r.state == SubscriptionState::Unsubscribing && r.ref_count == 0);
            if drained {
                if let Some(record) = records.remove(&filter) {
                    let _ = record.outcome_tx.send(SubscribeOutcome::Released);
                }
            }
        });
    }
}

impl fmt::Debug for SubscriptionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let records = self.records.lock();
        let mut map = f.debug_map();
        for (filter, record) in records.iter() {
            map.entry(
                &filter.as_str(),
                &(record.state, record.ref_count, &record.last_error),
            );
        }
        map.finish()
    }
}
