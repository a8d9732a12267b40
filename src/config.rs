//! Engine configuration.

use serde::{Deserialize, Serialize};

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(8)
}

fn default_sequential_get_warning() -> usize {
    8
}

/// Tunables for a [`Scheduler`](crate::Scheduler).
///
/// Deserializable so an outer configuration loader can hand one in; the
/// [`SchedulerBuilder`](crate::SchedulerBuilder) covers the programmatic
/// path.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bound on concurrently-executing rule bodies. Suspended bodies do not
    /// occupy a slot.
    pub worker_count: usize,
    /// Number of consecutive solo Gets in one rule body before a warning is
    /// logged (sequential Gets in a loop serialize otherwise-parallel
    /// work; `get_many` is the sanctioned fan-out). Zero disables the
    /// warning.
    pub sequential_get_warning: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            worker_count: default_worker_count(),
            sequential_get_warning: default_sequential_get_warning(),
        }
    }
}
