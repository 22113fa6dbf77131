use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

/// Live request: the caller-chosen id plus the token its work watches.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    id: String,
    seq: u64,
    token: CancellationToken,
}

impl RequestHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Maps request ids to cancellation tokens. At most one live entry per id.
#[derive(Default)]
pub struct RequestTracker {
    next_seq: AtomicU64,
    live: Mutex<HashMap<String, (u64, CancellationToken)>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request. An existing live request with the same id is
    /// cancelled first.
    ///
    /// The old request's batcher checks its token right before each delivery.
    /// On a multi-threaded runtime a batch already inside `deliver` when the
    /// cancel lands can still reach its consumer.
    pub fn create_request(&self, id: &str) -> RequestHandle {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let previous = {
            let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
            live.insert(id.to_string(), (seq, token.clone()))
        };
        if let Some((_, old)) = previous {
            tracing::debug!(request_id = id, "superseding live request");
            old.cancel();
        }
        RequestHandle {
            id: id.to_string(),
            seq,
            token,
        }
    }

    /// Cancel one request. Returns false if the id is unknown or already gone.
    pub fn abort_request(&self, id: &str) -> bool {
        let removed = {
            let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
            live.remove(id)
        };
        match removed {
            Some((_, token)) => {
                tracing::debug!(request_id = id, "request aborted");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn abort_all(&self) {
        let drained: Vec<_> = {
            let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
            live.drain().collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), "aborting all requests");
        }
        for (_, (_, token)) in drained {
            token.cancel();
        }
    }

    /// Drop the entry for a finished request. A newer request that reused the
    /// id is left alone.
    pub fn complete(&self, handle: &RequestHandle) {
        let mut live = self.live.lock().unwrap_or_else(|p| p.into_inner());
        if live.get(&handle.id).is_some_and(|(seq, _)| *seq == handle.seq) {
            live.remove(&handle.id);
        }
    }

    pub fn is_live(&self, id: &str) -> bool {
        let live = self.live.lock().unwrap_or_else(|p| p.into_inner());
        live.contains_key(id)
    }

    pub fn len(&self) -> usize {
        let live = self.live.lock().unwrap_or_else(|p| p.into_inner());
        live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_twice_returns_false_second_time() {
        let tracker = RequestTracker::new();
        let handle = tracker.create_request("r1");
        assert!(tracker.abort_request("r1"));
        assert!(handle.is_cancelled());
        assert!(!tracker.abort_request("r1"));
        assert!(!tracker.abort_request("never-created"));
    }

    #[test]
    fn same_id_cancels_previous() {
        let tracker = RequestTracker::new();
        let first = tracker.create_request("chat");
        let second = tracker.create_request("chat");
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn stale_complete_keeps_newer_entry() {
        let tracker = RequestTracker::new();
        let first = tracker.create_request("chat");
        let second = tracker.create_request("chat");
        tracker.complete(&first);
        assert!(tracker.is_live("chat"));
        tracker.complete(&second);
        assert!(!tracker.is_live("chat"));
        assert!(!second.is_cancelled(), "completion is not cancellation");
    }

    #[test]
    fn abort_all_cancels_everything() {
        let tracker = RequestTracker::new();
        let a = tracker.create_request("a");
        let b = tracker.create_request("b");
        tracker.abort_all();
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(tracker.is_empty());
    }
}
