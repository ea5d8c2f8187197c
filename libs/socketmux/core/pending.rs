//! Correlation of outbound requests with their inbound answers
//!
//! Every registered request holds a matcher and a one-shot completion. A
//! request completes exactly once, through exactly one of:
//!
//! - an inbound message its matcher accepts (`offer`)
//! - its own timeout firing in the waiting task (`wait`)
//! - lazy pruning of an expired entry during a later `offer`
//! - `fail_all` when the connection goes away
//!
//! All of these remove the entry under the same lock before completing it,
//! so two paths can never complete the same request.

use crate::error::{Result, SocketError};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

/// Decides whether an inbound message is the one being waited for
pub type MessageMatcher = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

struct PendingRequest {
    id: u64,
    matcher: MessageMatcher,
    timeout: Duration,
    deadline: Instant,
    completion: oneshot::Sender<Result<Value>>,
}

/// Waiting side of a registered request
pub struct PendingTicket {
    id: u64,
    timeout: Duration,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingTicket {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Counters of how pending requests ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingStats {
    pub matched: u64,
    pub timed_out: u64,
    pub failed: u64,
}

#[derive(Default)]
pub struct PendingRequestTracker {
    entries: Mutex<Vec<PendingRequest>>,
    next_id: AtomicU64,
    matched: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
}

impl PendingRequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request before its payload is sent
    pub fn register(&self, matcher: MessageMatcher, timeout: Duration) -> PendingTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();

        self.entries.lock().push(PendingRequest {
            id,
            matcher,
            timeout,
            deadline: Instant::now() + timeout,
            completion: tx,
        });

        PendingTicket { id, timeout, rx }
    }

    /// Wait for the answer or the ticket's own timeout
    pub async fn wait(&self, ticket: PendingTicket) -> Result<Value> {
        let PendingTicket { id, timeout, mut rx } = ticket;

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SocketError::ConnectionClosed(
                "pending request dropped".into(),
            )),
            Err(_) => {
                if self.remove(id) {
                    self.timed_out.fetch_add(1, Ordering::Relaxed);
                    debug!("Pending request {} timed out after {:?}", id, timeout);
                    return Err(SocketError::Timeout(timeout));
                }
                // Completed by another path while the timer fired
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(SocketError::Timeout(timeout)),
                }
            }
        }
    }

    /// Present an inbound message to the registered requests.
    ///
    /// Expired entries are pruned first. The first remaining entry whose
    /// matcher accepts the message is completed and removed; the rest stay.
    /// Matchers run under the tracker lock and must not call back into it.
    pub fn offer(&self, message: &Value) -> bool {
        let mut entries = self.entries.lock();
        self.prune_expired(&mut entries);

        let Some(index) = entries.iter().position(|entry| (entry.matcher)(message)) else {
            return false;
        };

        let entry = entries.remove(index);
        drop(entries);

        self.matched.fetch_add(1, Ordering::Relaxed);
        let _ = entry.completion.send(Ok(message.clone()));
        true
    }

    /// Remove without completing; `false` if already completed
    pub fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|entry| entry.id == id) {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<PendingRequest> = std::mem::take(&mut *self.entries.lock());
        if drained.is_empty() {
            return;
        }

        debug!("Failing {} pending requests: {}", drained.len(), reason);
        self.failed.fetch_add(drained.len() as u64, Ordering::Relaxed);
        for entry in drained {
            let _ = entry
                .completion
                .send(Err(SocketError::ConnectionClosed(reason.to_string())));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PendingStats {
        PendingStats {
            matched: self.matched.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn prune_expired(&self, entries: &mut Vec<PendingRequest>) {
        let now = Instant::now();
        let mut index = 0;
        while index < entries.len() {
            if now >= entries[index].deadline {
                let entry = entries.remove(index);
                self.timed_out.fetch_add(1, Ordering::Relaxed);
                let _ = entry
                    .completion
                    .send(Err(SocketError::Timeout(entry.timeout)));
            } else {
                index += 1;
            }
        }
    }
}

/// Matcher accepting messages whose `field` equals `value`
pub fn field_equals(field: &'static str, value: Value) -> MessageMatcher {
    Arc::new(move |message: &Value| message.get(field) == Some(&value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_match_completes_waiter() {
        let tracker = Arc::new(PendingRequestTracker::new());
        let ticket = tracker.register(field_equals("id", json!(7)), Duration::from_secs(1));

        let waiter = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.wait(ticket).await })
        };

        assert!(!tracker.offer(&json!({"id": 8})));
        assert!(tracker.offer(&json!({"id": 7, "result": "ok"})));

        let answer = waiter.await.unwrap().unwrap();
        assert_eq!(answer["result"], "ok");
        assert!(tracker.is_empty());
        assert_eq!(tracker.stats().matched, 1);
    }

    #[tokio::test]
    async fn test_first_match_wins_others_remain() {
        let tracker = PendingRequestTracker::new();
        let any: MessageMatcher = Arc::new(|_: &Value| true);
        let first = tracker.register(Arc::clone(&any), Duration::from_secs(1));
        let _second = tracker.register(any, Duration::from_secs(1));

        assert!(tracker.offer(&json!({"n": 1})));
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.wait(first).await.unwrap()["n"], 1);
    }

    #[tokio::test]
    async fn test_timeout_without_traffic() {
        let tracker = PendingRequestTracker::new();
        let ticket = tracker.register(field_equals("id", json!(1)), Duration::from_millis(20));

        let result = tracker.wait(ticket).await;
        assert!(matches!(result, Err(SocketError::Timeout(_))));
        assert!(tracker.is_empty());

        // A late answer no longer matches anything
        assert!(!tracker.offer(&json!({"id": 1})));
        assert_eq!(
            tracker.stats(),
            PendingStats {
                matched: 0,
                timed_out: 1,
                failed: 0
            }
        );
    }

    #[tokio::test]
    async fn test_expired_entries_pruned_lazily() {
        let tracker = PendingRequestTracker::new();
        let _abandoned = tracker.register(field_equals("id", json!(1)), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!tracker.offer(&json!({"id": 1})));
        assert!(tracker.is_empty());
        assert_eq!(tracker.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_fail_all() {
        let tracker = PendingRequestTracker::new();
        let ticket = tracker.register(Arc::new(|_: &Value| false), Duration::from_secs(5));

        tracker.fail_all("connection lost");
        let result = tracker.wait(ticket).await;
        assert!(matches!(result, Err(SocketError::ConnectionClosed(_))));
        assert_eq!(tracker.stats().failed, 1);
    }
}
