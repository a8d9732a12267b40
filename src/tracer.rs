//! Workunit tracing: the observability hook exposed to external reporting
//! subsystems.
//!
//! Every node execution is reported as one workunit with a start and an end
//! callback. All methods have default empty implementations, so a sink only
//! overrides the events it cares about; the default [`NoopWorkunits`] is
//! zero-cost.
//!
//! # Example
//!
//! ```ignore
//! struct LogSink;
//!
//! impl Workunits for LogSink {
//!     fn started(&self, workunit: &Workunit) {
//!         println!("-> {}", workunit.desc);
//!     }
//! }
//!
//! let session = Session::with_workunits(Arc::new(LogSink));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for one workunit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(pub u64);

static SPAN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// One traced node execution.
#[derive(Debug, Clone)]
pub struct Workunit {
    pub span_id: SpanId,
    /// The executing rule's id.
    pub rule: String,
    /// Debug rendering of the node (rule + params).
    pub desc: String,
}

impl Workunit {
    pub(crate) fn new(rule: String, desc: String) -> Self {
        Workunit {
            span_id: SpanId(SPAN_COUNTER.fetch_add(1, Ordering::Relaxed)),
            rule,
            desc,
        }
    }
}

/// How a workunit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkunitResult {
    /// The node produced a value.
    Returned,
    /// The node failed with a throw.
    Threw,
    /// The node completed with a noop (no applicable rule).
    Nooped,
    /// The execution was discarded: cancellation or mid-flight
    /// invalidation. The node may run again later.
    Interrupted,
}

/// Callbacks for workunit start/end, implemented by an external reporting
/// subsystem and attached to a [`Session`](crate::Session).
///
/// Implementations must be `Send + Sync`; callbacks may fire from any
/// worker.
pub trait Workunits: Send + Sync + 'static {
    /// A node execution started.
    fn started(&self, _workunit: &Workunit) {}

    /// A node execution ended.
    fn completed(&self, _workunit: &Workunit, _result: WorkunitResult) {}
}

/// Discards all workunit events.
pub struct NoopWorkunits;

impl Workunits for NoopWorkunits {}
