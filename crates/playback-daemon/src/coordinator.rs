//! Exclusive access to the remote browse cursor.
//!
//! The remote browse API is a stateful "pop to root, then descend" protocol
//! over a single cursor.  Two descents interleaved on that cursor corrupt each
//! other (a second caller's reset-to-root silently invalidates the first
//! caller's half-finished descent), so every navigation goes through
//! `BrowseSessionCoordinator::with_exclusive_access`.
//!
//! Waiters are queued on a `tokio::sync::Mutex`, which hands the lock out in
//! strict FIFO order of `lock()` calls.  The guard is dropped when the
//! operation's future completes, errors or is cancelled, so a failing caller
//! never wedges the queue.
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::remote::BrowseApi;

/// One instance per remote browse session.
pub struct BrowseSessionCoordinator {
    api: Arc<dyn BrowseApi>,
    lock: Mutex<()>,
    queued: AtomicUsize,
    next_ticket: AtomicU64,
}

impl BrowseSessionCoordinator {
    pub fn new(api: Arc<dyn BrowseApi>) -> Self {
        Self {
            api,
            lock: Mutex::new(()),
            queued: AtomicUsize::new(0),
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Operations submitted but not yet finished, including the running one.
    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Run `op` with sole ownership of the browse cursor.
    ///
    /// Operations run one at a time in submission order.  The result (or
    /// error) of `op` goes back to this caller only; queued callers are
    /// unaffected by it.
    pub async fn with_exclusive_access<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce(Arc<dyn BrowseApi>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let _depth = QueueSlot::enter(&self.queued);
        debug!(
            "browse session: ticket {} queued (depth {})",
            ticket,
            self.queue_depth()
        );

        let _guard = self.lock.lock().await;
        debug!("browse session: ticket {} acquired cursor", ticket);

        let result = op(self.api.clone()).await;
        debug!(
            "browse session: ticket {} released cursor (ok={})",
            ticket,
            result.is_ok()
        );
        result
    }
}

/// Keeps `queued` accurate even when the waiting future is dropped.
struct QueueSlot<'a>(&'a AtomicUsize);

impl<'a> QueueSlot<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
