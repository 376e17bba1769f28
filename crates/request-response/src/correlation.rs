//! Matching of incoming publishes to pending request completions.
//!
//! Every in-flight request is keyed by its correlation token; an incoming
//! publish resolves the pending entry whose token it carries. Topic
//! equality alone is never sufficient because concurrent requests may share
//! a response topic (shadow get and update both answer on `accepted`
//! topics), so token equality is the sole match criterion for
//! token-bearing requests.
//!
//! Requests without a correlation token (fleet provisioning has request
//! types whose responses carry no token field) are matched by response
//! topic only, oldest first, and are excluded from duplicate detection.

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use canopy_mqtt::TopicFilter;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Where a response to a request may arrive and how to pull its
/// correlation token out of the payload.
#[derive(Debug, Clone)]
pub struct ResponsePath {
    /// Topic filter the response arrives on (usually a concrete topic such
    /// as `svc/get/accepted`).
    pub filter: TopicFilter,
    /// JSON pointer (RFC 6901, e.g. `/clientToken`) locating the
    /// correlation token inside the response payload. `None` for response
    /// paths whose payloads carry no token.
    pub correlation_token_path: Option<String>,
}

impl ResponsePath {
    /// A response path whose payloads carry no correlation token.
    #[must_use]
    pub fn new(filter: TopicFilter) -> Self {
        Self {
            filter,
            correlation_token_path: None,
        }
    }

    /// A response path extracting the correlation token at `pointer`.
    #[must_use]
    pub fn with_correlation_token_path<S>(filter: TopicFilter, pointer: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            filter,
            correlation_token_path: Some(pointer.into()),
        }
    }
}

/// A response to a request: the publish that resolved it, verbatim.
#[derive(Debug, Clone)]
pub struct Response {
    /// The topic the response was published on.
    pub topic: String,
    /// The response payload, opaque to the engine.
    pub payload: Bytes,
}

pub(crate) struct PendingRequest {
    pub token: Option<String>,
    pub response_paths: Vec<ResponsePath>,
    pub timeout: std::time::Duration,
    pub created_at: Instant,
    pub deadline: Instant,
    pub completion: oneshot::Sender<Result<Response>>,
}

#[derive(Default)]
struct TableInner {
    next_id: u64,
    /// Entries in registration order (ids are monotonic).
    entries: BTreeMap<u64, PendingRequest>,
    by_token: HashMap<String, u64>,
}

/// The table of in-flight requests awaiting a correlated response.
#[derive(Default)]
pub(crate) struct CorrelationTable {
    inner: Mutex<TableInner>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending request. Fails with
    /// [`Error::DuplicateCorrelation`] if a request with the same token is
    /// already in flight; nothing is modified in that case.
    pub fn register(&self, request: PendingRequest) -> Result<u64> {
        let mut inner = self.inner.lock();
        if let Some(token) = &request.token {
            if inner.by_token.contains_key(token) {
                return Err(Error::DuplicateCorrelation(token.clone()));
            }
        }
        let id = inner.next_id;
        inner.next_id += 1;
        if let Some(token) = &request.token {
            inner.by_token.insert(token.clone(), id);
        }
        trace!(id, token = ?request.token, "registered pending request");
        inner.entries.insert(id, request);
        Ok(id)
    }

    /// Removes a pending request without resolving it (cleanup after a
    /// failed publish; the caller reports the error synchronously).
    pub fn remove(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(request) = inner.entries.remove(&id) {
            if let Some(token) = &request.token {
                inner.by_token.remove(token);
            }
        }
    }

    /// Routes an incoming publish to at most one pending request.
    ///
    /// Token-bearing requests are consulted first: the token is extracted
    /// from the payload via the response paths registered for the topic
    /// and looked up by equality. If no token matches, the oldest
    /// token-less request whose response path matches the topic is
    /// resolved. Publishes matching neither are ignored (they belong to
    /// streaming operations or are unsolicited).
    pub fn on_incoming_publish(&self, topic: &str, payload: &Bytes) {
        let resolved = {
            let mut inner = self.inner.lock();
            Self::take_match(&mut inner, topic, payload)
        };
        if let Some(request) = resolved {
            debug!(
                topic,
                token = ?request.token,
                elapsed = ?request.created_at.elapsed(),
                "resolving pending request"
            );
            let _ = request.completion.send(Ok(Response {
                topic: topic.to_string(),
                payload: payload.clone(),
            }));
        }
    }

    /// Resolves every pending request past its deadline with
    /// [`Error::Timeout`]. Sweep granularity may deliver the timeout after
    /// the deadline, never before.
    pub fn expire(&self, now: Instant) {
        let expired: Vec<PendingRequest> = {
            let mut inner = self.inner.lock();
            let ids: Vec<u64> = inner
                .entries
                .iter()
                .filter(|(_, r)| r.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    let request = inner.entries.remove(&id);
                    if let Some(request) = &request {
                        if let Some(token) = &request.token {
                            inner.by_token.remove(token);
                        }
                    }
                    request
                })
                .collect()
        };
        for request in expired {
            debug!(token = ?request.token, "pending request timed out");
            let timeout = request.timeout;
            let _ = request.completion.send(Err(Error::Timeout(timeout)));
        }
    }

    /// Resolves every pending request with the error produced by `make`.
    pub fn fail_all<F>(&self, make: F)
    where
        F: Fn() -> Error,
    {
        let drained: Vec<PendingRequest> = {
            let mut inner = self.inner.lock();
            inner.by_token.clear();
            let entries = std::mem::take(&mut inner.entries);
            entries.into_values().collect()
        };
        for request in drained {
            let _ = request.completion.send(Err(make()));
        }
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn take_match(inner: &mut TableInner, topic: &str, payload: &Bytes) -> Option<PendingRequest> {
        // Distinct token pointers registered for this topic across all
        // token-bearing requests.
        let mut pointers: Vec<&str> = Vec::new();
        for request in inner.entries.values().filter(|r| r.token.is_some()) {
            for path in &request.response_paths {
                if path.filter.matches(topic) {
                    if let Some(pointer) = path.correlation_token_path.as_deref() {
                        if !pointers.contains(&pointer) {
                            pointers.push(pointer);
                        }
                    }
                }
            }
        }

        if !pointers.is_empty() {
            // Parse the payload once; an unparseable payload simply cannot
            // correlate by token.
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(payload) {
                let mut matched = None;
                for pointer in pointers {
                    let token = value.pointer(pointer).and_then(|v| v.as_str());
                    if let Some(token) = token {
                        if let Some(id) = inner.by_token.get(token).copied() {
                            matched = Some((id, token.to_string()));
                            break;
                        }
                    }
                }
                if let Some((id, token)) = matched {
                    // The token is authoritative, but the resolved request
                    // must actually be listening on this topic.
                    let listens = inner
                        .entries
                        .get(&id)
                        .is_some_and(|r| r.response_paths.iter().any(|p| p.filter.matches(topic)));
                    if listens {
                        inner.by_token.remove(&token);
                        return inner.entries.remove(&id);
                    }
                }
            }
        }

        // Oldest token-less request listening on this topic.
        let id = inner
            .entries
            .iter()
            .find(|(_, r)| {
                r.token.is_none() && r.response_paths.iter().any(|p| p.filter.matches(topic))
            })
            .map(|(id, _)| *id)?;
        inner.entries.remove(&id)
    }
}
