//! In-flight invocation tracking.
//!
//! An invocation is pending from [`InvocationTracker::begin`] until the
//! first of: its completion, its timeout, or its connection closing. Each
//! invocation carries a host-unique sequence number, so a late completion
//! of an old invocation can never complete a newer one that reused the
//! same correlation id.

use std::collections::HashMap;
use std::time::Instant;

use host_protocol::{ConnectionId, CorrelationId, HandlerResult, Response};
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub correlation_id: CorrelationId,
    pub connection: ConnectionId,
    pub sequence: u64,
    pub started_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("Correlation id {correlation_id} is already pending on {connection}")]
    DuplicateCorrelationId {
        correlation_id: CorrelationId,
        connection: ConnectionId,
    },

    /// The invocation was already completed, timed out or abandoned.
    #[error("Invocation #{0} is no longer pending")]
    AlreadyCompleted(u64),
}

#[derive(Default)]
struct TrackerInner {
    next_sequence: u64,
    pending: HashMap<(ConnectionId, CorrelationId), Invocation>,
}

#[derive(Default)]
pub struct InvocationTracker {
    inner: Mutex<TrackerInner>,
}

impl InvocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(
        &self,
        correlation_id: CorrelationId,
        connection: ConnectionId,
    ) -> Result<Invocation, TrackerError> {
        let mut inner = self.inner.lock();
        let key = (connection, correlation_id);
        if inner.pending.contains_key(&key) {
            return Err(TrackerError::DuplicateCorrelationId {
                correlation_id: key.1,
                connection,
            });
        }

        inner.next_sequence += 1;
        let invocation = Invocation {
            correlation_id: key.1.clone(),
            connection,
            sequence: inner.next_sequence,
            started_at: Instant::now(),
        };
        inner.pending.insert(key, invocation.clone());
        Ok(invocation)
    }

    /// Complete `invocation`. Only the first call for a pending invocation
    /// yields the Response to send.
    pub fn complete(
        &self,
        invocation: &Invocation,
        outcome: HandlerResult,
    ) -> Result<Response, TrackerError> {
        let key = (invocation.connection, invocation.correlation_id.clone());
        {
            let mut inner = self.inner.lock();
            match inner.pending.get(&key) {
                Some(current) if current.sequence == invocation.sequence => {
                    inner.pending.remove(&key);
                }
                _ => return Err(TrackerError::AlreadyCompleted(invocation.sequence)),
            }
        }
        Ok(Response::from_outcome(key.1, outcome))
    }

    /// Abandon everything pending on `connection`. Abandoned invocations
    /// never produce a Response.
    pub fn abandon_all_for(&self, connection: ConnectionId) -> Vec<Invocation> {
        let mut inner = self.inner.lock();
        let keys: Vec<_> = inner
            .pending
            .keys()
            .filter(|(conn, _)| *conn == connection)
            .cloned()
            .collect();
        keys.into_iter()
            .filter_map(|key| inner.pending.remove(&key))
            .collect()
    }

    pub fn is_pending(&self, invocation: &Invocation) -> bool {
        let key = (invocation.connection, invocation.correlation_id.clone());
        self.inner
            .lock()
            .pending
            .get(&key)
            .is_some_and(|current| current.sequence == invocation.sequence)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn pending_for(&self, connection: ConnectionId) -> usize {
        self.inner
            .lock()
            .pending
            .keys()
            .filter(|(conn, _)| *conn == connection)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use host_protocol::HostError;
    use serde_json::json;
    use std::sync::Arc;

    const CONN: ConnectionId = ConnectionId(1);

    #[test]
    fn begin_rejects_pending_duplicate() {
        let tracker = InvocationTracker::new();
        tracker.begin(CorrelationId::Number(1), CONN).unwrap();

        let err = tracker.begin(CorrelationId::Number(1), CONN).unwrap_err();
        assert!(matches!(err, TrackerError::DuplicateCorrelationId { .. }));

        // Same id on another connection is independent
        tracker.begin(CorrelationId::Number(1), ConnectionId(2)).unwrap();
        assert_eq!(tracker.pending_count(), 2);
    }

    #[test]
    fn first_completion_wins() {
        let tracker = InvocationTracker::new();
        let inv = tracker.begin(CorrelationId::from("a"), CONN).unwrap();

        let response = tracker.complete(&inv, Ok(json!(1))).unwrap();
        assert_eq!(response.correlation_id, Some(CorrelationId::from("a")));
        assert_eq!(response.result, Some(json!(1)));

        let second = tracker.complete(&inv, Err(HostError::handler("late")));
        assert_eq!(second.unwrap_err(), TrackerError::AlreadyCompleted(inv.sequence));
        assert_eq!(tracker.pending_count(), 0);
    }

    #[test]
    fn id_can_be_reused_after_completion() {
        let tracker = InvocationTracker::new();
        let old = tracker.begin(CorrelationId::Number(7), CONN).unwrap();
        tracker.complete(&old, Ok(json!(null))).unwrap();

        let new = tracker.begin(CorrelationId::Number(7), CONN).unwrap();
        assert!(new.sequence > old.sequence);

        // A stale completion of the old invocation must not complete the new one
        assert!(tracker.complete(&old, Ok(json!("stale"))).is_err());
        assert!(tracker.is_pending(&new));
        assert!(tracker.complete(&new, Ok(json!("fresh"))).is_ok());
    }

    #[test]
    fn abandon_removes_only_that_connection() {
        let tracker = InvocationTracker::new();
        let a = tracker.begin(CorrelationId::Number(1), CONN).unwrap();
        tracker.begin(CorrelationId::Number(2), CONN).unwrap();
        tracker.begin(CorrelationId::Number(1), ConnectionId(2)).unwrap();

        let abandoned = tracker.abandon_all_for(CONN);
        assert_eq!(abandoned.len(), 2);
        assert_eq!(tracker.pending_for(CONN), 0);
        assert_eq!(tracker.pending_for(ConnectionId(2)), 1);

        assert!(tracker.complete(&a, Ok(json!(1))).is_err());
    }

    #[test]
    fn concurrent_completions_yield_one_response() {
        let tracker = Arc::new(InvocationTracker::new());
        let inv = tracker.begin(CorrelationId::Number(1), CONN).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tracker = tracker.clone();
                let inv = inv.clone();
                std::thread::spawn(move || tracker.complete(&inv, Ok(json!(i))).is_ok())
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(successes, 1);
    }
}
