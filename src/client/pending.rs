//! Correlation table.
//!
//! Maps the correlation id of every in-flight request to a single-assignment
//! result slot (a `oneshot` sender). Every way a request can end goes through
//! the same operation: remove the slot under the table lock, then send the
//! outcome through it. Whoever removes the slot first decides the outcome, so
//! a reply racing a timeout, a cancellation or a disconnect can never settle
//! a request twice.
//!
//! Each registration arms a timer task that expires the entry at its
//! deadline, whether or not anyone is waiting on it. Settling by any other
//! route aborts the timer.
//!
//! ```text
//! Pending ──resolve/reject──▶ Resolved
//!    │────expire────────────▶ TimedOut
//!    │────fail_all──────────▶ Lost
//!    └────cancel/drop───────▶ Cancelled
//! ```

use bytes::Bytes;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::{lock_ignore_poison, log_debug, CorrelationId, Result, RpcError};

/// Stand-in deadline for timeouts too large to represent (about 30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

struct Slot {
    tx: oneshot::Sender<Result<Bytes>>,
    timer: Option<AbortHandle>,
}

impl Slot {
    fn settle(self, outcome: Result<Bytes>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The waiter may already be gone; the entry is removed either way.
        let _ = self.tx.send(outcome);
    }
}

/// Outstanding requests keyed by correlation id.
#[derive(Default)]
pub struct CorrelationTable {
    // ---
    slots: Mutex<HashMap<CorrelationId, Slot>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending request that expires after `timeout`.
    ///
    /// The returned [`PendingRequest`] owns the receiving half of the slot.
    /// Must be called from within a tokio runtime.
    pub fn register(self: &Arc<Self>, timeout: Duration) -> PendingRequest {
        // ---
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);

        let (tx, rx) = oneshot::channel();
        let mut slots = lock_ignore_poison(&self.slots);

        // A v4 collision is astronomically unlikely; never let one alias a slot.
        let id = loop {
            let candidate = CorrelationId::generate();
            if let Entry::Vacant(entry) = slots.entry(candidate.clone()) {
                entry.insert(Slot { tx, timer: None });
                break candidate;
            }
        };
        if let Some(slot) = slots.get_mut(&id) {
            slot.timer = Some(Self::arm_timer(Arc::downgrade(self), id.clone(), deadline));
        }
        drop(slots);

        PendingRequest {
            id,
            deadline,
            rx,
            table: Arc::clone(self),
            settled: false,
        }
    }

    fn arm_timer(table: Weak<Self>, id: CorrelationId, deadline: Instant) -> AbortHandle {
        // ---
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(table) = table.upgrade() {
                table.expire(&id);
            }
        });
        task.abort_handle()
    }

    /// Fulfil the request with a reply payload.
    ///
    /// Returns `false` when the id is unknown or already settled: a late or
    /// duplicate reply, which is logged and ignored.
    pub fn resolve(&self, id: &CorrelationId, payload: Bytes) -> bool {
        self.settle(id, Ok(payload), "resolve")
    }

    /// Fail the request with a handler error carried by a failure-marked reply.
    pub fn reject(&self, id: &CorrelationId, reason: &str) -> bool {
        self.settle(id, Err(RpcError::Handler(reason.to_string())), "reject")
    }

    /// Fail the request with [`RpcError::Timeout`] and remove it.
    pub fn expire(&self, id: &CorrelationId) -> bool {
        self.settle(id, Err(RpcError::Timeout), "expire")
    }

    /// Remove the request without a reply; its waiter sees
    /// [`RpcError::Cancelled`].
    pub fn cancel(&self, id: &CorrelationId) -> bool {
        self.settle(id, Err(RpcError::Cancelled), "cancel")
    }

    /// Fail every pending request with [`RpcError::ConnectionLost`].
    ///
    /// Returns the number of requests failed.
    pub fn fail_all(&self) -> usize {
        // ---
        let drained: Vec<(CorrelationId, Slot)> = lock_ignore_poison(&self.slots).drain().collect();
        let count = drained.len();

        for (_, slot) in drained {
            slot.settle(Err(RpcError::ConnectionLost));
        }

        if count > 0 {
            log_debug!("failed {count} pending request(s) with ConnectionLost");
        }
        count
    }

    /// Cancel every pending request. Used on shutdown.
    pub fn cancel_all(&self) -> usize {
        // ---
        let drained: Vec<(CorrelationId, Slot)> = lock_ignore_poison(&self.slots).drain().collect();
        let count = drained.len();
        for (_, slot) in drained {
            slot.settle(Err(RpcError::Cancelled));
        }
        count
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        lock_ignore_poison(&self.slots).contains_key(id)
    }

    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn settle(&self, id: &CorrelationId, outcome: Result<Bytes>, op: &str) -> bool {
        // ---
        let slot = lock_ignore_poison(&self.slots).remove(id);
        match slot {
            Some(slot) => {
                slot.settle(outcome);
                true
            }
            None => {
                log_debug!("{op}: no pending request for correlation id {id}");
                false
            }
        }
    }
}

/// Handle for one in-flight request.
///
/// Await [`wait`](Self::wait) for the outcome. Dropping the handle before it
/// settles cancels the request and removes it from the table.
pub struct PendingRequest {
    id: CorrelationId,
    deadline: Instant,
    rx: oneshot::Receiver<Result<Bytes>>,
    table: Arc<CorrelationTable>,
    settled: bool,
}

impl PendingRequest {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Suspend until the request settles. The deadline timer armed at
    /// registration turns an unanswered request into [`RpcError::Timeout`].
    pub async fn wait(mut self) -> Result<Bytes> {
        // ---
        let outcome = (&mut self.rx).await;
        self.settled = true;

        outcome.unwrap_or(Err(RpcError::Cancelled))
    }

    /// Cancel the request. A no-op if it already settled.
    pub fn cancel(mut self) -> bool {
        self.settled = true;
        self.table.cancel(&self.id)
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        if !self.settled {
            self.table.cancel(&self.id);
        }
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::collections::HashSet;

    fn table() -> Arc<CorrelationTable> {
        Arc::new(CorrelationTable::new())
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        // ---
        let table = table();
        let pending = table.register(Duration::from_secs(5));
        let id = pending.id().clone();
        assert_eq!(table.len(), 1);

        assert!(table.resolve(&id, Bytes::from("ok")));
        assert!(table.is_empty());

        assert_eq!(pending.wait().await.unwrap(), Bytes::from("ok"));
    }

    #[tokio::test]
    async fn test_second_resolve_is_ignored() {
        // ---
        let table = table();
        let pending = table.register(Duration::from_secs(5));
        let id = pending.id().clone();

        assert!(table.resolve(&id, Bytes::from("first")));
        assert!(!table.resolve(&id, Bytes::from("second")));
        assert!(!table.reject(&id, "third"));

        assert_eq!(pending.wait().await.unwrap(), Bytes::from("first"));
    }

    #[tokio::test]
    async fn test_reject_surfaces_handler_error() {
        // ---
        let table = table();
        let pending = table.register(Duration::from_secs(5));
        table.reject(&pending.id().clone(), "bad payload");

        match pending.wait().await {
            Err(RpcError::Handler(reason)) => assert_eq!(reason, "bad payload"),
            other => panic!("expected handler error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_and_removes_entry() {
        // ---
        let table = table();
        let pending = table.register(Duration::from_millis(250));
        let id = pending.id().clone();
        let start = Instant::now();

        let result = pending.wait().await;

        assert!(matches!(result, Err(RpcError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert!(start.elapsed() < Duration::from_millis(300));
        assert!(!table.contains(&id));
        assert!(!table.resolve(&id, Bytes::from("late")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_enforced_without_waiter() {
        // ---
        let table = table();
        let pending = table.register(Duration::from_millis(100));
        let id = pending.id().clone();

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(!table.contains(&id));
        assert!(!table.resolve(&id, Bytes::from("too late")));
        assert!(matches!(pending.wait().await, Err(RpcError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_before_deadline_disarms_timer() {
        // ---
        let table = table();
        let pending = table.register(Duration::from_millis(100));
        let id = pending.id().clone();

        assert!(table.resolve(&id, Bytes::from("in time")));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(pending.wait().await.unwrap(), Bytes::from("in time"));
    }

    #[tokio::test]
    async fn test_unbounded_timeout_does_not_overflow() {
        // ---
        let table = table();
        let pending = table.register(Duration::MAX);
        let id = pending.id().clone();

        assert!(pending.deadline() > Instant::now() + Duration::from_secs(86_400 * 365));
        assert!(table.resolve(&id, Bytes::from("ok")));
        assert_eq!(pending.wait().await.unwrap(), Bytes::from("ok"));
    }

    #[tokio::test]
    async fn test_expire_before_wait() {
        // ---
        let table = table();
        let pending = table.register(Duration::from_secs(5));
        let id = pending.id().clone();

        assert!(table.expire(&id));
        assert!(!table.expire(&id));
        assert!(matches!(pending.wait().await, Err(RpcError::Timeout)));
    }

    #[tokio::test]
    async fn test_fail_all_marks_every_request_lost() {
        // ---
        let table = table();
        let pendings: Vec<_> = (0..5).map(|_| table.register(Duration::from_secs(5))).collect();
        let ids: Vec<_> = pendings.iter().map(|p| p.id().clone()).collect();

        assert_eq!(table.fail_all(), 5);
        assert!(table.is_empty());

        for pending in pendings {
            assert!(matches!(pending.wait().await, Err(RpcError::ConnectionLost)));
        }
        for id in &ids {
            assert!(!table.resolve(id, Bytes::from("stale")));
        }
    }

    #[tokio::test]
    async fn test_cancel_then_resolve_is_noop() {
        // ---
        let table = table();
        let pending = table.register(Duration::from_secs(5));
        let id = pending.id().clone();

        assert!(pending.cancel());
        assert!(!table.contains(&id));
        assert!(!table.resolve(&id, Bytes::from("late")));
    }

    #[tokio::test]
    async fn test_resolve_then_cancel_keeps_result() {
        // ---
        let table = table();
        let pending = table.register(Duration::from_secs(5));
        let id = pending.id().clone();

        assert!(table.resolve(&id, Bytes::from("done")));
        assert!(!table.cancel(&id));
        assert_eq!(pending.wait().await.unwrap(), Bytes::from("done"));
    }

    #[tokio::test]
    async fn test_drop_removes_entry() {
        // ---
        let table = table();
        let pending = table.register(Duration::from_secs(5));
        let id = pending.id().clone();

        drop(pending);
        assert!(!table.contains(&id));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ids_are_distinct() {
        // ---
        let table = table();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let table = table.clone();
            tasks.push(tokio::spawn(async move {
                (0..100)
                    .map(|_| table.register(Duration::from_secs(5)))
                    .collect::<Vec<_>>()
            }));
        }

        let mut pendings = Vec::new();
        for task in tasks {
            pendings.extend(task.await.unwrap());
        }

        let ids: HashSet<_> = pendings.iter().map(|p| p.id().clone()).collect();
        assert_eq!(ids.len(), 1_600);
        assert_eq!(table.len(), 1_600);
    }
}
