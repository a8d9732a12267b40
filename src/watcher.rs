//! Filesystem invalidation: read-sets and the watcher-facing event surface.
//!
//! The engine does not watch the filesystem itself; an external watcher
//! feeds `(path, event-kind)` notifications into [`InvalidationWatcher`],
//! which maps them through recorded read-sets to the node keys that must be
//! re-executed. Invalidation is lazy: stale nodes are dirtied, not deleted,
//! and recompute only when next requested.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use glob::Pattern;
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::graph::{InvalidationStats, NodeGraph};

/// The paths and glob patterns one node's execution read.
#[derive(Clone, Debug, Default)]
pub struct ReadSet {
    paths: FxHashSet<PathBuf>,
    globs: Vec<Pattern>,
}

impl ReadSet {
    pub fn insert_path(&mut self, path: impl Into<PathBuf>) {
        self.paths.insert(path.into());
    }

    pub fn insert_glob(&mut self, pattern: Pattern) {
        self.globs.push(pattern);
    }

    /// Whether a changed path falls inside this read-set.
    pub fn matches(&self, path: &Path) -> bool {
        self.paths.contains(path) || self.globs.iter().any(|g| g.matches_path(path))
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.globs.is_empty()
    }
}

/// What the external watcher observed happen to a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    /// The watcher detected a gap in its own event stream (e.g. a kernel
    /// queue overflow). The associated path is meaningless; the whole graph
    /// must be assumed stale.
    Overflow,
}

/// One notification from the external filesystem watcher.
#[derive(Clone, Debug)]
pub struct PathEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl PathEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        PathEvent {
            path: path.into(),
            kind,
        }
    }
}

/// Marks graph entries stale in response to filesystem change events.
///
/// On a detected gap ([`ChangeKind::Overflow`]) it fails loudly — the whole
/// graph is invalidated — rather than silently under-reporting.
#[derive(Clone)]
pub struct InvalidationWatcher {
    graph: Arc<NodeGraph>,
}

impl InvalidationWatcher {
    pub fn new(graph: Arc<NodeGraph>) -> Self {
        InvalidationWatcher { graph }
    }

    /// Apply one filesystem event to the graph.
    pub fn handle_event(&self, event: &PathEvent) -> InvalidationStats {
        match event.kind {
            ChangeKind::Overflow => {
                warn!("filesystem watch overflow: invalidating all nodes");
                self.graph.invalidate_all()
            }
            ChangeKind::Created | ChangeKind::Modified | ChangeKind::Removed => {
                let stats = self.graph.invalidate_path(&event.path);
                debug!(
                    path = %event.path.display(),
                    kind = ?event.kind,
                    cleared = stats.cleared,
                    dirtied = stats.dirtied,
                    "handled filesystem event"
                );
                stats
            }
        }
    }

    /// Apply a batch of events, summing the per-event stats.
    pub fn handle_events<'a>(
        &self,
        events: impl IntoIterator<Item = &'a PathEvent>,
    ) -> InvalidationStats {
        let mut total = InvalidationStats::default();
        for event in events {
            let stats = self.handle_event(event);
            total.cleared += stats.cleared;
            total.dirtied += stats.dirtied;
        }
        total
    }
}
