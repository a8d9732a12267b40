//! The scheduler: drives concurrent execution of nodes against the node
//! graph.
//!
//! Execution is demand-driven: starting from root node keys, dependencies
//! are discovered lazily by running a node's body until it suspends or
//! completes. A bounded semaphore of worker permits gates rule-body
//! execution; a body releases its permit at every Get/MultiGet suspension,
//! so the bound applies to actively-polling bodies only and dependent nodes
//! re-queue exactly when their dependencies complete.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::EngineConfig;
use crate::context::Context;
use crate::error::{
    ExecutionError, GraphError, Noop, RegistrationError, RootFailure, Throw,
};
use crate::graph::{Claim, NodeGraph, NodeSignal};
use crate::node::{AncestorChain, NodeKey, NodeOutcome};
use crate::params::{Params, TypeKey, Value};
use crate::rule_graph::{EntryRef, RuleGraph};
use crate::rules::{DependencyKey, ParamTypes};
use crate::session::Session;
use crate::tracer::{Workunit, WorkunitResult};
use crate::watcher::{InvalidationWatcher, ReadSet};

pub(crate) struct SchedulerCore {
    pub(crate) graph: Arc<NodeGraph>,
    pub(crate) rule_graph: RuleGraph,
    pub(crate) config: EngineConfig,
    pub(crate) permits: Arc<Semaphore>,
}

/// One resolved root of an [`ExecutionRequest`].
#[derive(Debug, Clone)]
pub(crate) struct Root {
    product: TypeKey,
    subject: Params,
    entry: EntryRef,
}

impl Root {
    fn describe(&self) -> String {
        format!("{} for {:?}", self.product, self.subject)
    }
}

/// A set of resolved roots ready to execute.
#[derive(Debug)]
pub struct ExecutionRequest {
    pub(crate) roots: Vec<Root>,
}

impl ExecutionRequest {
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Builder for [`Scheduler`], covering the programmatic configuration path.
pub struct SchedulerBuilder {
    config: EngineConfig,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        SchedulerBuilder {
            config: EngineConfig::default(),
        }
    }

    /// Start from a deserialized [`EngineConfig`].
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Bound on concurrently-executing rule bodies.
    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.config.worker_count = worker_count;
        self
    }

    /// Consecutive solo Gets before the sequential-get warning fires.
    pub fn sequential_get_warning(mut self, threshold: usize) -> Self {
        self.config.sequential_get_warning = threshold;
        self
    }

    pub fn build(self, rule_graph: RuleGraph) -> Scheduler {
        let worker_count = self.config.worker_count.max(1);
        Scheduler {
            core: Arc::new(SchedulerCore {
                graph: Arc::new(NodeGraph::new()),
                rule_graph,
                config: self.config,
                permits: Arc::new(Semaphore::new(worker_count)),
            }),
        }
    }
}

/// Owns the node graph and the compiled rule graph, and executes sessions
/// against them. Cheap to clone; construct once per process.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<SchedulerCore>,
}

impl Scheduler {
    pub fn new(rule_graph: RuleGraph) -> Self {
        Scheduler::builder().build(rule_graph)
    }

    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    /// The process-wide memoization cache.
    pub fn node_graph(&self) -> &Arc<NodeGraph> {
        &self.core.graph
    }

    /// The compiled rule graph this scheduler executes.
    pub fn rule_graph(&self) -> &RuleGraph {
        &self.core.rule_graph
    }

    /// An invalidation watcher bound to this scheduler's node graph.
    pub fn watcher(&self) -> InvalidationWatcher {
        InvalidationWatcher::new(self.core.graph.clone())
    }

    /// Resolve `(product, subject)` pairs against the declared roots.
    ///
    /// # Errors
    ///
    /// [`RegistrationError::NoRoot`] / [`RegistrationError::AmbiguousRoot`]
    /// when a pair does not match exactly one declared root — the compiler's
    /// root allow-list is enforced here, before anything executes.
    pub fn execution_request(
        &self,
        roots: impl IntoIterator<Item = (TypeKey, Params)>,
    ) -> Result<ExecutionRequest, RegistrationError> {
        let mut resolved = Vec::new();
        for (product, subject) in roots {
            let (_, edges) = self
                .core
                .rule_graph
                .find_root_edges(product, subject.type_keys().collect())?;
            let entry = edges
                .entry_for(&DependencyKey::Select(product))
                .cloned()
                .expect("compiled root entries always carry their Select edge");
            resolved.push(Root {
                product,
                subject,
                entry,
            });
        }
        Ok(ExecutionRequest { roots: resolved })
    }

    /// Execute every root of the request under the session, returning one
    /// result per root in request order. Independent roots run
    /// concurrently.
    pub async fn execute(
        &self,
        request: &ExecutionRequest,
        session: &Session,
    ) -> Vec<Result<Value, GraphError>> {
        let mut handles = Vec::with_capacity(request.roots.len());
        for root in &request.roots {
            session.record_root(root.describe());
            let core = self.core.clone();
            let session = session.clone();
            let root = root.clone();
            handles.push(tokio::spawn(async move {
                execute_root(&core, &session, root).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(handle.await.unwrap_or_else(|_| {
                Err(GraphError::Throw(Throw::msg("root task failed")))
            }));
        }
        results
    }

    /// The primary query surface: compute `product` for each subject,
    /// failing with an aggregated error if any root fails.
    pub async fn product_request(
        &self,
        session: &Session,
        product: TypeKey,
        subjects: impl IntoIterator<Item = Params>,
    ) -> Result<Vec<Value>, ExecutionError> {
        let request = self
            .execution_request(subjects.into_iter().map(|subject| (product, subject)))
            .map_err(|error| ExecutionError {
                failures: vec![RootFailure {
                    root: product.to_string(),
                    error: error.into(),
                }],
            })?;

        let results = self.execute(&request, session).await;
        let mut values = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        for (root, result) in request.roots.iter().zip(results) {
            match result {
                Ok(value) => values.push(value),
                Err(error) => failures.push(RootFailure {
                    root: root.describe(),
                    error,
                }),
            }
        }
        if failures.is_empty() {
            Ok(values)
        } else {
            Err(ExecutionError { failures })
        }
    }

    /// Like [`product_request`](Scheduler::product_request) for a single
    /// subject, treating `Noop` as "no value" rather than a failure.
    pub async fn optional_product(
        &self,
        session: &Session,
        product: TypeKey,
        subject: Params,
    ) -> Result<Option<Value>, ExecutionError> {
        match self.product_request(session, product, [subject]).await {
            Ok(mut values) => Ok(values.pop()),
            Err(error)
                if error.failures.len() == 1
                    && error.failures[0].error.as_noop().is_some() =>
            {
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }
}

async fn execute_root(
    core: &Arc<SchedulerCore>,
    session: &Session,
    root: Root,
) -> Result<Value, GraphError> {
    match root.entry {
        EntryRef::Param(type_key) => root
            .subject
            .find(type_key)
            .map(|param| param.to_value())
            .ok_or_else(|| {
                GraphError::Throw(Throw::msg(format!(
                    "subject does not carry a {type_key} param"
                )))
            }),
        EntryRef::Rule { rule, params } => {
            let key = NodeKey::new(rule, root.subject.restricted(params.iter()));
            let outcome =
                request_node(core, session, &AncestorChain::empty(), None, key).await?;
            outcome_to_value(outcome)
        }
        EntryRef::Nothing { product } => Err(GraphError::Noop(Noop::no_rule(
            product,
            format!("{:?}", root.subject),
        ))),
        EntryRef::Pending { product, .. } => Err(GraphError::Throw(Throw::msg(format!(
            "unresolved compiled entry for {product}"
        )))),
    }
}

/// Translate a terminal outcome into the requester's view of it.
pub(crate) fn outcome_to_value(outcome: NodeOutcome) -> Result<Value, GraphError> {
    match outcome {
        NodeOutcome::Return(value) => Ok(value),
        NodeOutcome::Throw(throw) => Err(GraphError::Throw(throw)),
        NodeOutcome::Noop(noop) => Err(GraphError::Noop(noop)),
    }
}

/// Request a node on behalf of `parent`, converging on the single in-flight
/// or cached execution for its key. An `Interrupted` signal (cancellation
/// or mid-flight invalidation of the previous runner) loops back to
/// re-request, unless this requester's own session has been cancelled.
pub(crate) async fn request_node(
    core: &Arc<SchedulerCore>,
    session: &Session,
    chain: &AncestorChain,
    parent: Option<&NodeKey>,
    key: NodeKey,
) -> Result<NodeOutcome, GraphError> {
    if chain.contains(&key) {
        return Err(GraphError::Cycle {
            path: chain.path_to(&key),
        });
    }
    loop {
        if session.is_cancelled() {
            return Err(GraphError::Cancelled);
        }
        let mut rx = match core.graph.claim(parent, &key) {
            Claim::Cached(outcome) => return Ok(outcome),
            Claim::Run { rx, reads } => {
                spawn_execution(
                    core.clone(),
                    session.clone(),
                    chain.pushed(key.clone()),
                    key.clone(),
                    reads,
                );
                rx
            }
            Claim::Await(rx) => rx,
        };

        let signal = match rx.wait_for(|signal| signal.is_some()).await {
            Ok(signal) => signal.clone().expect("guarded by wait_for"),
            // The runner vanished without signalling; only happens during
            // runtime teardown.
            Err(_) => return Err(GraphError::Cancelled),
        };
        match signal {
            NodeSignal::Completed(outcome) => return Ok(outcome),
            NodeSignal::Interrupted => continue,
        }
    }
}

/// Ensures a claimed entry always signals, even if the body panics: the
/// panic is committed as a `Throw` so waiters are not stranded.
struct CompletionGuard {
    graph: Arc<NodeGraph>,
    key: Option<NodeKey>,
}

impl CompletionGuard {
    fn defuse(mut self) {
        self.key = None;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            let throw = Throw::msg("rule body panicked")
                .with_rule(key.rule().id().clone())
                .pushed(format!("{key:?}"));
            self.graph.complete(&key, NodeOutcome::Throw(throw));
        }
    }
}

/// Run one claimed node to completion on the worker pool.
fn spawn_execution(
    core: Arc<SchedulerCore>,
    session: Session,
    chain: AncestorChain,
    key: NodeKey,
    reads: Arc<Mutex<ReadSet>>,
) {
    tokio::spawn(async move {
        let Ok(permit) = core.permits.clone().acquire_owned().await else {
            core.graph.abandon(&key);
            return;
        };
        core.graph.mark_running(&key);
        debug!(node = ?key, session = session.id(), "running node");

        let workunit = Workunit::new(key.rule().id().to_string(), format!("{key:?}"));
        session.workunits().started(&workunit);

        let entry_params: ParamTypes = key.params().type_keys().collect();
        let result = match core.rule_graph.edges_for_rule(key.rule().id(), &entry_params) {
            Some(edges) => {
                let guard = CompletionGuard {
                    graph: core.graph.clone(),
                    key: Some(key.clone()),
                };
                let ctx = Context::new(
                    core.clone(),
                    session.clone(),
                    key.clone(),
                    edges.clone(),
                    chain,
                    reads,
                    permit,
                );
                let result = key.rule().imp().clone().run(ctx).await;
                guard.defuse();
                result
            }
            None => Err(GraphError::Throw(Throw::msg(format!(
                "no compiled entry for rule `{}`",
                key.rule().id()
            )))),
        };

        let workunit_result = match result {
            Ok(value) => {
                let outcome = if value.type_key() == key.rule().output() {
                    NodeOutcome::Return(value)
                } else {
                    NodeOutcome::Throw(
                        Throw::msg(format!(
                            "rule `{}` returned {} but declares {}",
                            key.rule().id(),
                            value.type_key(),
                            key.rule().output()
                        ))
                        .with_rule(key.rule().id().clone()),
                    )
                };
                let kind = match &outcome {
                    NodeOutcome::Return(_) => WorkunitResult::Returned,
                    _ => WorkunitResult::Threw,
                };
                if core.graph.complete(&key, outcome) {
                    kind
                } else {
                    WorkunitResult::Interrupted
                }
            }
            Err(GraphError::Throw(throw)) => {
                let throw = throw
                    .with_rule(key.rule().id().clone())
                    .pushed(format!("{key:?}"));
                if core.graph.complete(&key, NodeOutcome::Throw(throw)) {
                    WorkunitResult::Threw
                } else {
                    WorkunitResult::Interrupted
                }
            }
            Err(GraphError::Noop(noop)) => {
                if core.graph.complete(&key, NodeOutcome::Noop(noop)) {
                    WorkunitResult::Nooped
                } else {
                    WorkunitResult::Interrupted
                }
            }
            Err(GraphError::Cycle { path }) => {
                let throw = Throw::msg(format!(
                    "dependency cycle detected: {}",
                    path.join(" -> ")
                ))
                .with_rule(key.rule().id().clone())
                .pushed(format!("{key:?}"));
                if core.graph.complete(&key, NodeOutcome::Throw(throw)) {
                    WorkunitResult::Threw
                } else {
                    WorkunitResult::Interrupted
                }
            }
            Err(GraphError::Cancelled) => {
                // Cooperative unwind: revert the entry so other sessions
                // (or a retry) re-execute cleanly.
                core.graph.abandon(&key);
                WorkunitResult::Interrupted
            }
        };

        session.workunits().completed(&workunit, workunit_result);
    });
}
