//! Pending-call records and the registry that tracks them.
//!
//! # Lifecycle
//!
//! 1. **Created**: at the start of a call, together with the receiver the
//!    caller waits on
//! 2. **Pending**: stored in [`PendingCalls`] under its call id
//! 3. **Completed**: by a response, or by connection teardown
//! 4. **Removed**: unconditionally when the call returns
//!
//! Completion goes through a one-shot gate: the sender is taken out of the
//! record on first use, so later attempts are no-ops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::CallId;

/// How a pending call was resolved from the connection side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Completion {
    /// The peer answered. `error` is set when it reported a failure.
    Reply {
        payload: Vec<u8>,
        error: Option<Vec<u8>>,
    },
    /// The connection closed before a reply arrived.
    ConnectionClosed,
}

/// State for one in-flight call.
pub(crate) struct PendingCall {
    id: CallId,
    method: String,
    started: Instant,
    /// `None` once the gate has fired.
    sender: Mutex<Option<oneshot::Sender<Completion>>>,
}

impl PendingCall {
    /// Create a record plus the receiver its caller waits on.
    pub(crate) fn new(id: CallId, method: &str) -> (Arc<Self>, oneshot::Receiver<Completion>) {
        let (tx, rx) = oneshot::channel();
        let record = Arc::new(Self {
            id,
            method: method.to_string(),
            started: Instant::now(),
            sender: Mutex::new(Some(tx)),
        });
        (record, rx)
    }

    pub(crate) fn id(&self) -> CallId {
        self.id
    }

    pub(crate) fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    #[cfg(test)]
    pub(crate) fn is_completed(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Deliver a completion. Returns false if the gate already fired.
    pub(crate) fn complete(&self, completion: Completion) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return false;
        };

        if sender.send(completion).is_err() {
            tracing::debug!(call_id = self.id, "Completion dropped: caller already gone");
        }
        true
    }

    /// Force-resolve because the connection went away.
    pub(crate) fn on_connection_closed(&self) -> bool {
        self.complete(Completion::ConnectionClosed)
    }

    /// Fire the gate without delivering anything. Used on every call exit path.
    pub(crate) fn release(&self) {
        self.sender.lock().take();
    }
}

/// Concurrency-safe map from call id to pending record.
#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<CallId, Arc<PendingCall>>>,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a record. Returns false (and leaves the map untouched) if the
    /// id is already present.
    pub(crate) fn insert(&self, record: Arc<PendingCall>) -> bool {
        let mut calls = self.calls.lock();
        if calls.contains_key(&record.id) {
            return false;
        }
        calls.insert(record.id, record);
        true
    }

    pub(crate) fn lookup(&self, id: CallId) -> Option<Arc<PendingCall>> {
        self.calls.lock().get(&id).cloned()
    }

    /// Remove a record. Removing an absent id is a no-op.
    pub(crate) fn remove(&self, id: CallId) -> Option<Arc<PendingCall>> {
        self.calls.lock().remove(&id)
    }

    /// Swap the registry for an empty one and return every record it held.
    pub(crate) fn drain_all(&self) -> Vec<Arc<PendingCall>> {
        let calls = std::mem::take(&mut *self.calls.lock());
        calls.into_values().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn reply(payload: &[u8]) -> Completion {
        Completion::Reply {
            payload: payload.to_vec(),
            error: None,
        }
    }

    #[test]
    fn test_complete_delivers_once() {
        let (record, mut rx) = PendingCall::new(1, "echo");
        assert!(!record.is_completed());

        assert!(record.complete(reply(b"first")));
        assert!(record.is_completed());

        // First completion wins
        assert!(!record.complete(reply(b"second")));
        assert!(!record.on_connection_closed());

        assert_eq!(rx.try_recv().unwrap(), reply(b"first"));
    }

    #[test]
    fn test_connection_closed_completion() {
        let (record, mut rx) = PendingCall::new(2, "echo");
        assert!(record.on_connection_closed());
        assert_eq!(rx.try_recv().unwrap(), Completion::ConnectionClosed);
    }

    #[test]
    fn test_release_blocks_later_completion() {
        let (record, mut rx) = PendingCall::new(3, "echo");
        record.release();

        assert!(record.is_completed());
        assert!(!record.complete(reply(b"late")));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_complete_after_receiver_dropped() {
        let (record, rx) = PendingCall::new(4, "echo");
        drop(rx);
        // Gate still fires even though nobody is listening.
        assert!(record.complete(reply(b"orphan")));
        assert!(record.is_completed());
    }

    #[test]
    fn test_record_metadata() {
        let (record, _rx) = PendingCall::new(5, "jobs.list");
        assert_eq!(record.id(), 5);
        assert_eq!(record.method(), "jobs.list");
        assert!(record.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_insert_lookup_remove() {
        let pending = PendingCalls::new();
        let (a, _rx_a) = PendingCall::new(10, "a");
        let (b, _rx_b) = PendingCall::new(11, "b");

        assert!(pending.insert(a));
        assert!(pending.insert(b));
        assert_eq!(pending.len(), 2);
        assert_eq!(pending.lookup(10).unwrap().method(), "a");
        assert!(pending.lookup(99).is_none());

        assert!(pending.remove(10).is_some());
        assert!(pending.remove(10).is_none());
        assert!(pending.lookup(10).is_none());
        assert!(pending.lookup(11).is_some());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let pending = PendingCalls::new();
        let (first, _rx1) = PendingCall::new(20, "first");
        let (second, _rx2) = PendingCall::new(20, "second");

        assert!(pending.insert(first));
        assert!(!pending.insert(second));
        assert_eq!(pending.lookup(20).unwrap().method(), "first");
    }

    #[test]
    fn test_drain_all_empties_registry() {
        let pending = PendingCalls::new();
        let mut receivers = Vec::new();
        for id in 30..35 {
            let (record, rx) = PendingCall::new(id, "m");
            pending.insert(record);
            receivers.push(rx);
        }

        let drained = pending.drain_all();
        assert_eq!(drained.len(), 5);
        assert_eq!(pending.len(), 0);

        for record in drained {
            assert!(record.on_connection_closed());
        }
        for mut rx in receivers {
            assert_eq!(rx.try_recv().unwrap(), Completion::ConnectionClosed);
        }

        assert!(pending.drain_all().is_empty());
    }

    #[test]
    fn test_concurrent_insert_and_remove() {
        let pending = Arc::new(PendingCalls::new());

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let pending = Arc::clone(&pending);
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        let id = t * 1000 + i;
                        let (record, _rx) = PendingCall::new(id, "m");
                        assert!(pending.insert(record));
                        if i % 2 == 0 {
                            assert!(pending.remove(id).is_some());
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(pending.len(), 4 * 250);
    }
}
