//! Sessions: one top-level query's execution context.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::tracer::{NoopWorkunits, Workunits};

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

struct SessionInner {
    id: u64,
    cancelled: AtomicBool,
    workunits: Arc<dyn Workunits>,
    roots: Mutex<Vec<String>>,
}

/// One top-level query's execution context: the requested roots, a
/// cooperative cancellation flag, and the workunit trace sink.
///
/// Cheap to clone; created per query and discarded after delivery or
/// cancellation. Cancelling a session does not affect others: completed
/// nodes are immutable, and cancelled in-flight nodes simply stop being
/// polled.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Session::with_workunits(Arc::new(NoopWorkunits))
    }

    /// A session whose workunit events flow to the given sink.
    pub fn with_workunits(workunits: Arc<dyn Workunits>) -> Self {
        Session {
            inner: Arc::new(SessionInner {
                id: SESSION_COUNTER.fetch_add(1, Ordering::Relaxed),
                cancelled: AtomicBool::new(false),
                workunits,
                roots: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Request cooperative cancellation: in-flight nodes observe the flag
    /// when they resume from suspension and unwind without corrupting the
    /// node graph.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn workunits(&self) -> &Arc<dyn Workunits> {
        &self.inner.workunits
    }

    /// The roots requested through this session, in request order.
    pub fn roots(&self) -> Vec<String> {
        self.inner.roots.lock().clone()
    }

    pub(crate) fn record_root(&self, root: String) {
        self.inner.roots.lock().push(root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_per_session() {
        let a = Session::new();
        let b = Session::new();
        a.cancel();
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
    }

    #[test]
    fn clones_share_the_flag() {
        let a = Session::new();
        let b = a.clone();
        b.cancel();
        assert!(a.is_cancelled());
        assert_eq!(a.id(), b.id());
    }
}
