//! The node graph: the process-wide memoization cache and the single shared
//! mutable structure in the engine.
//!
//! Each entry is vacant, in-flight (Waiting/Running, with subscribed
//! dependents), or completed-immutable. The mutex around the inner graph
//! gives the vacant/in-flight -> completed transition a single writer, so
//! concurrent first-time requesters of one key converge on one execution.
//! Completed results are retained for the process lifetime, subject to lazy
//! invalidation: stale entries are dirtied in place and re-executed the next
//! time their key is requested.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::node::{NodeKey, NodeOutcome};
use crate::watcher::ReadSet;

/// How a completed or interrupted execution is announced to subscribers.
#[derive(Clone, Debug)]
pub(crate) enum NodeSignal {
    Completed(NodeOutcome),
    /// The execution was discarded (cancellation or mid-flight
    /// invalidation); subscribers should re-request the key.
    Interrupted,
}

/// The result of requesting a key: either a cached outcome, a subscription
/// to an in-flight execution, or permission to run it (single-flight: at
/// most one requester receives `Run` per execution).
pub(crate) enum Claim {
    Cached(NodeOutcome),
    Await(watch::Receiver<Option<NodeSignal>>),
    Run {
        rx: watch::Receiver<Option<NodeSignal>>,
        reads: Arc<Mutex<ReadSet>>,
    },
}

enum EntryState {
    Vacant,
    Waiting {
        tx: watch::Sender<Option<NodeSignal>>,
        reads: Arc<Mutex<ReadSet>>,
        invalidated: bool,
    },
    Running {
        tx: watch::Sender<Option<NodeSignal>>,
        reads: Arc<Mutex<ReadSet>>,
        invalidated: bool,
    },
    Completed {
        outcome: NodeOutcome,
        reads: ReadSet,
        epoch: u64,
        dirty: bool,
    },
}

struct Entry {
    key: NodeKey,
    state: EntryState,
}

/// Counts of entries touched by one invalidation pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InvalidationStats {
    /// Entries whose results were cleared for re-execution.
    pub cleared: usize,
    /// Transitive dependents marked stale.
    pub dirtied: usize,
}

struct Inner {
    pg: DiGraph<Entry, ()>,
    index: FxHashMap<NodeKey, NodeIndex>,
}

impl Inner {
    fn ensure_entry(&mut self, key: &NodeKey) -> NodeIndex {
        if let Some(&idx) = self.index.get(key) {
            return idx;
        }
        let idx = self.pg.add_node(Entry {
            key: key.clone(),
            state: EntryState::Vacant,
        });
        self.index.insert(key.clone(), idx);
        idx
    }

    fn clear_outgoing(&mut self, idx: NodeIndex) {
        while let Some(edge) = self.pg.edges(idx).map(|e| e.id()).next() {
            self.pg.remove_edge(edge);
        }
    }
}

/// The memoization cache: a DAG of entries keyed by [`NodeKey`], plus the
/// invalidation epoch counter.
pub struct NodeGraph {
    inner: Mutex<Inner>,
    epoch: AtomicU64,
}

impl Default for NodeGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeGraph {
    pub fn new() -> Self {
        NodeGraph {
            inner: Mutex::new(Inner {
                pg: DiGraph::new(),
                index: FxHashMap::default(),
            }),
            epoch: AtomicU64::new(0),
        }
    }

    /// The current invalidation epoch. Bumped by every invalidation pass
    /// that touches at least one entry; the at-most-one-execution guarantee
    /// is scoped to an epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// The number of entries ever created.
    pub fn len(&self) -> usize {
        self.inner.lock().pg.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Request a key on behalf of `parent` (recording the dependency edge).
    pub(crate) fn claim(&self, parent: Option<&NodeKey>, key: &NodeKey) -> Claim {
        let mut inner = self.inner.lock();
        let idx = inner.ensure_entry(key);
        if let Some(parent) = parent {
            let parent_idx = inner.ensure_entry(parent);
            inner.pg.update_edge(parent_idx, idx, ());
        }

        enum Action {
            Cached(NodeOutcome),
            Await(watch::Receiver<Option<NodeSignal>>),
            Start,
        }

        let action = match &inner.pg[idx].state {
            EntryState::Completed {
                outcome,
                dirty: false,
                ..
            } => Action::Cached(outcome.clone()),
            EntryState::Waiting { tx, .. } | EntryState::Running { tx, .. } => {
                Action::Await(tx.subscribe())
            }
            EntryState::Vacant | EntryState::Completed { dirty: true, .. } => Action::Start,
        };

        match action {
            Action::Cached(outcome) => Claim::Cached(outcome),
            Action::Await(rx) => Claim::Await(rx),
            Action::Start => {
                // Stale dependency edges from a previous run are dropped;
                // the re-execution rebuilds them.
                inner.clear_outgoing(idx);
                let (tx, rx) = watch::channel(None);
                let reads = Arc::new(Mutex::new(ReadSet::default()));
                inner.pg[idx].state = EntryState::Waiting {
                    tx,
                    reads: reads.clone(),
                    invalidated: false,
                };
                Claim::Run { rx, reads }
            }
        }
    }

    /// Record that a claimed entry's body has been picked up by a worker.
    pub(crate) fn mark_running(&self, key: &NodeKey) {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.index.get(key) else {
            return;
        };
        let state = std::mem::replace(&mut inner.pg[idx].state, EntryState::Vacant);
        inner.pg[idx].state = match state {
            EntryState::Waiting {
                tx,
                reads,
                invalidated,
            } => EntryState::Running {
                tx,
                reads,
                invalidated,
            },
            other => other,
        };
    }

    /// Commit an execution result.
    ///
    /// Returns `false` when the entry was invalidated mid-flight: the result
    /// is discarded, the entry reverts to vacant, and subscribers are told
    /// to re-request.
    pub(crate) fn complete(&self, key: &NodeKey, outcome: NodeOutcome) -> bool {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.index.get(key) else {
            return false;
        };
        let state = std::mem::replace(&mut inner.pg[idx].state, EntryState::Vacant);
        match state {
            EntryState::Waiting {
                tx,
                reads,
                invalidated,
            }
            | EntryState::Running {
                tx,
                reads,
                invalidated,
            } => {
                if invalidated {
                    debug!(node = ?inner.pg[idx].key, "discarding result invalidated mid-flight");
                    inner.clear_outgoing(idx);
                    tx.send_replace(Some(NodeSignal::Interrupted));
                    false
                } else {
                    let reads = reads.lock().clone();
                    inner.pg[idx].state = EntryState::Completed {
                        outcome: outcome.clone(),
                        reads,
                        epoch: self.epoch(),
                        dirty: false,
                    };
                    tx.send_replace(Some(NodeSignal::Completed(outcome)));
                    true
                }
            }
            other => {
                inner.pg[idx].state = other;
                false
            }
        }
    }

    /// Discard an in-flight execution (cooperative cancellation unwind).
    /// The entry reverts to vacant; the completed portion of the graph is
    /// untouched.
    pub(crate) fn abandon(&self, key: &NodeKey) {
        let mut inner = self.inner.lock();
        let Some(&idx) = inner.index.get(key) else {
            return;
        };
        let state = std::mem::replace(&mut inner.pg[idx].state, EntryState::Vacant);
        match state {
            EntryState::Waiting { tx, .. } | EntryState::Running { tx, .. } => {
                inner.clear_outgoing(idx);
                tx.send_replace(Some(NodeSignal::Interrupted));
            }
            other => {
                inner.pg[idx].state = other;
            }
        }
    }

    /// Mark stale every node whose execution read `path`, and its
    /// transitive dependents.
    pub fn invalidate_path(&self, path: &Path) -> InvalidationStats {
        self.invalidate_where(|reads| reads.matches(path))
    }

    /// Mark every node stale, regardless of read-set. Used when the watcher
    /// reports a gap it cannot attribute to specific paths.
    pub fn invalidate_all(&self) -> InvalidationStats {
        self.invalidate_where(|_| true)
    }

    fn invalidate_where(&self, pred: impl Fn(&ReadSet) -> bool) -> InvalidationStats {
        let mut inner = self.inner.lock();

        // Invalidation roots: completed entries whose read-set matches are
        // cleared; in-flight entries whose reads-so-far match will discard
        // their result at completion.
        let mut cleared: Vec<NodeIndex> = Vec::new();
        let mut flagged: Vec<NodeIndex> = Vec::new();
        for idx in inner.pg.node_indices() {
            match &inner.pg[idx].state {
                EntryState::Completed { reads, .. } => {
                    if pred(reads) {
                        cleared.push(idx);
                    }
                }
                EntryState::Waiting { reads, .. } | EntryState::Running { reads, .. } => {
                    if pred(&reads.lock()) {
                        flagged.push(idx);
                    }
                }
                EntryState::Vacant => {}
            }
        }

        // Their transitive dependents are dirtied (completed) or flagged
        // (in-flight), but keep their edges: re-execution is lazy.
        let mut seen: FxHashSet<NodeIndex> = cleared.iter().chain(flagged.iter()).copied().collect();
        let mut queue: VecDeque<NodeIndex> = seen.iter().copied().collect();
        let mut dependents: Vec<NodeIndex> = Vec::new();
        while let Some(idx) = queue.pop_front() {
            let incoming: Vec<NodeIndex> = inner
                .pg
                .neighbors_directed(idx, Direction::Incoming)
                .collect();
            for dep_idx in incoming {
                if seen.insert(dep_idx) {
                    dependents.push(dep_idx);
                    queue.push_back(dep_idx);
                }
            }
        }

        let stats = InvalidationStats {
            cleared: cleared.len() + flagged.len(),
            dirtied: dependents.len(),
        };
        if stats == InvalidationStats::default() {
            return stats;
        }

        for &idx in &cleared {
            debug!(node = ?inner.pg[idx].key, "clearing invalidated node");
            inner.pg[idx].state = EntryState::Vacant;
        }
        let cleared_set: FxHashSet<NodeIndex> = cleared.iter().copied().collect();
        inner.pg.retain_edges(|pg, edge| {
            pg.edge_endpoints(edge)
                .map(|(src, _)| !cleared_set.contains(&src))
                .unwrap_or(true)
        });

        for &idx in flagged.iter().chain(dependents.iter()) {
            let state = &mut inner.pg[idx].state;
            match state {
                EntryState::Completed { dirty, .. } => *dirty = true,
                EntryState::Waiting { invalidated, .. }
                | EntryState::Running { invalidated, .. } => *invalidated = true,
                EntryState::Vacant => {}
            }
        }

        self.epoch.fetch_add(1, Ordering::AcqRel);
        debug!(
            cleared = stats.cleared,
            dirtied = stats.dirtied,
            epoch = self.epoch(),
            "invalidated nodes"
        );
        stats
    }
}
