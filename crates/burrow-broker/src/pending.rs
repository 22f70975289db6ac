//! Pending-response table.
//!
//! The ingress router registers a single-slot sink before forwarding a
//! request over the tunnel, then awaits the correlated `response` frame. An
//! entry lives only between register and unregister; session teardown closes
//! whatever is still registered so no waiter hangs on a dead link.

use burrow_proto::Frame;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Single-slot response sinks keyed by request id.
#[derive(Default)]
pub struct PendingResponses {
    sinks: DashMap<String, oneshot::Sender<Frame>>,
}

impl PendingResponses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink for `request_id` and return the receiving half.
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        self.sinks.insert(request_id.to_string(), tx);
        debug!(request_id, "response sink registered");
        rx
    }

    /// Deliver a response to the matching sink.
    ///
    /// Returns false when no sink is registered for the id or the waiter is
    /// already gone; the caller counts those as drops.
    pub fn fulfill(&self, request_id: &str, frame: Frame) -> bool {
        match self.sinks.remove(request_id) {
            Some((_, tx)) => {
                if tx.send(frame).is_err() {
                    warn!(request_id, "response sink waiter already dropped");
                    return false;
                }
                true
            }
            None => false,
        }
    }

    /// Remove and close the sink for `request_id`. Safe to call for an id
    /// that was already fulfilled or never registered.
    pub fn unregister(&self, request_id: &str) {
        if self.sinks.remove(request_id).is_some() {
            debug!(request_id, "response sink unregistered");
        }
    }

    /// Close every registered sink. Waiters observe a closed channel, which
    /// the router surfaces as a lost tunnel.
    pub fn close_all(&self) {
        let count = self.sinks.len();
        self.sinks.clear();
        if count > 0 {
            warn!(closed_sinks = count, "closed pending response sinks");
        }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}
