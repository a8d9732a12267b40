//! The execution context handed to a rule body: the only way a body obtains
//! its inputs, and the only place it may suspend.
//!
//! `get`/`get_many` are the Get/MultiGet of the selector protocol: each
//! registers a dependency edge from the current node and awaits the
//! producer, releasing the worker permit for the duration so a suspended
//! body never occupies a slot. `select` reads a product derivable from the
//! node's own params per the compiled edges. No other blocking is permitted
//! inside a rule body; I/O belongs in its own rule, recorded through
//! `record_read` so the invalidation watcher can see it.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use glob::Pattern;
use parking_lot::Mutex;
use tokio::sync::OwnedSemaphorePermit;
use tracing::warn;

use crate::error::{GraphError, Noop, Throw};
use crate::node::{AncestorChain, NodeKey};
use crate::params::{Param, Params, TypeKey, Value};
use crate::rule_graph::{EntryRef, RuleEdges};
use crate::rules::DependencyKey;
use crate::scheduler::{outcome_to_value, request_node, SchedulerCore};
use crate::session::Session;
use crate::watcher::ReadSet;

/// Execution context for one node: passed by value to the rule body.
pub struct Context {
    core: Arc<SchedulerCore>,
    session: Session,
    node: NodeKey,
    edges: RuleEdges,
    /// The call chain from a root down to (and including) this node.
    chain: AncestorChain,
    reads: Arc<Mutex<ReadSet>>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    solo_gets: AtomicUsize,
}

impl Context {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        core: Arc<SchedulerCore>,
        session: Session,
        node: NodeKey,
        edges: RuleEdges,
        chain: AncestorChain,
        reads: Arc<Mutex<ReadSet>>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Context {
            core,
            session,
            node,
            edges,
            chain,
            reads,
            permit: Mutex::new(Some(permit)),
            solo_gets: AtomicUsize::new(0),
        }
    }

    /// The params this node is bound to.
    pub fn params(&self) -> &Params {
        self.node.params()
    }

    /// The session this execution is running under.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Select a product derivable from the current params, downcast to its
    /// concrete type.
    pub async fn select<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, GraphError> {
        let value = self.select_value(TypeKey::of::<T>()).await?;
        downcast_value(value)
    }

    /// Select a product derivable from the current params.
    pub async fn select_value(&self, product: TypeKey) -> Result<Value, GraphError> {
        let dep = DependencyKey::Select(product);
        let Some(entry) = self.edges.entry_for(&dep).cloned() else {
            return Err(self.undeclared(&dep));
        };
        self.resolve_entry(entry, self.node.params().clone()).await
    }

    /// Compute `T` for one explicit input value (a Get): registers the
    /// dependency edge and suspends until the producer completes.
    pub async fn get<T: Send + Sync + 'static>(&self, input: Param) -> Result<Arc<T>, GraphError> {
        let value = self.get_value(TypeKey::of::<T>(), input).await?;
        downcast_value(value)
    }

    /// Untyped form of [`get`](Context::get).
    pub async fn get_value(&self, output: TypeKey, input: Param) -> Result<Value, GraphError> {
        self.note_solo_get();
        let entry = self.get_entry(output, &input)?;
        self.resolve_entry(entry, Params::single(input)).await
    }

    /// A Get whose absence is expected: `Noop` becomes `None` instead of
    /// propagating as a failure.
    pub async fn get_optional<T: Send + Sync + 'static>(
        &self,
        input: Param,
    ) -> Result<Option<Arc<T>>, GraphError> {
        match self.get(input).await {
            Ok(value) => Ok(Some(value)),
            Err(GraphError::Noop(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }

    /// Compute `T` for many inputs in parallel (a MultiGet): the sanctioned
    /// fan-out mechanism. Internal completion order is unspecified; results
    /// are delivered in request order; the batch fails as a unit on the
    /// first error (in request order).
    pub async fn get_many<T: Send + Sync + 'static>(
        &self,
        inputs: impl IntoIterator<Item = Param>,
    ) -> Result<Vec<Arc<T>>, GraphError> {
        let values = self
            .get_many_values(TypeKey::of::<T>(), inputs.into_iter().collect())
            .await?;
        values.into_iter().map(downcast_value).collect()
    }

    /// Untyped form of [`get_many`](Context::get_many).
    pub async fn get_many_values(
        &self,
        output: TypeKey,
        inputs: Vec<Param>,
    ) -> Result<Vec<Value>, GraphError> {
        self.solo_gets.store(0, Ordering::Relaxed);

        enum Pending {
            Ready(Result<Value, GraphError>),
            Task(tokio::task::JoinHandle<Result<Value, GraphError>>),
        }

        // Resolve every entry before suspending so the whole batch is
        // dispatched at once.
        let mut entries = Vec::with_capacity(inputs.len());
        for input in inputs {
            entries.push((self.get_entry(output, &input), input));
        }

        let released = self.release_permit();
        let mut pending = Vec::with_capacity(entries.len());
        for (entry, input) in entries {
            match entry {
                Err(error) => pending.push(Pending::Ready(Err(error))),
                Ok(EntryRef::Param(_)) => pending.push(Pending::Ready(Ok(input.to_value()))),
                Ok(EntryRef::Nothing { product }) => pending.push(Pending::Ready(Err(
                    GraphError::Noop(Noop::no_rule(product, format!("{input:?}"))),
                ))),
                Ok(EntryRef::Rule { rule, params }) => {
                    let key = NodeKey::new(rule, Params::single(input).restricted(params.iter()));
                    let core = self.core.clone();
                    let session = self.session.clone();
                    let chain = self.chain.clone();
                    let parent = self.node.clone();
                    pending.push(Pending::Task(tokio::spawn(async move {
                        let outcome =
                            request_node(&core, &session, &chain, Some(&parent), key).await?;
                        outcome_to_value(outcome)
                    })));
                }
                Ok(EntryRef::Pending { product, .. }) => {
                    pending.push(Pending::Ready(Err(self.internal(format!(
                        "unresolved compiled entry for {product}"
                    )))));
                }
            }
        }

        // The batch fails as a unit: the first error in request order wins,
        // but every member is still driven to completion in the cache.
        let mut values = Vec::with_capacity(pending.len());
        let mut first_error: Option<GraphError> = None;
        for item in pending {
            let value = match item {
                Pending::Ready(result) => result,
                Pending::Task(handle) => match handle.await {
                    Ok(result) => result,
                    Err(_) => Err(self.internal("batched get task failed")),
                },
            };
            match value {
                Ok(value) => values.push(value),
                Err(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        self.resume(released).await?;
        match first_error {
            None => Ok(values),
            Some(error) => Err(error),
        }
    }

    /// Record a filesystem path this node's execution read; a later change
    /// to the path invalidates this node and its transitive dependents.
    pub fn record_read(&self, path: impl Into<PathBuf>) {
        self.reads.lock().insert_path(path);
    }

    /// Record a glob over paths this node's execution read.
    pub fn record_read_glob(&self, pattern: &str) -> Result<(), GraphError> {
        let pattern = Pattern::new(pattern)?;
        self.reads.lock().insert_glob(pattern);
        Ok(())
    }

    fn get_entry(&self, output: TypeKey, input: &Param) -> Result<EntryRef, GraphError> {
        let dep = DependencyKey::Get {
            output,
            input: input.type_key(),
        };
        self.edges
            .entry_for(&dep)
            .cloned()
            .ok_or_else(|| self.undeclared(&dep))
    }

    async fn resolve_entry(&self, entry: EntryRef, scope: Params) -> Result<Value, GraphError> {
        match entry {
            EntryRef::Param(type_key) => scope
                .find(type_key)
                .map(Param::to_value)
                .ok_or_else(|| self.internal(format!("param {type_key} missing from scope"))),
            EntryRef::Rule { rule, params } => {
                let key = NodeKey::new(rule, scope.restricted(params.iter()));
                let outcome = self.await_node(key).await?;
                outcome_to_value(outcome)
            }
            EntryRef::Nothing { product } => Err(GraphError::Noop(Noop::no_rule(
                product,
                format!("{scope:?}"),
            ))),
            EntryRef::Pending { product, .. } => {
                Err(self.internal(format!("unresolved compiled entry for {product}")))
            }
        }
    }

    /// Suspend on a dependency node. The worker permit is released while
    /// suspended and re-acquired on resume; cancellation is observed at the
    /// resume point.
    async fn await_node(&self, key: NodeKey) -> Result<crate::node::NodeOutcome, GraphError> {
        let released = self.release_permit();
        let result = request_node(&self.core, &self.session, &self.chain, Some(&self.node), key).await;
        self.resume(released).await?;
        result
    }

    fn release_permit(&self) -> bool {
        self.permit.lock().take().is_some()
    }

    async fn resume(&self, reacquire: bool) -> Result<(), GraphError> {
        if self.session.is_cancelled() {
            return Err(GraphError::Cancelled);
        }
        if reacquire {
            match self.core.permits.clone().acquire_owned().await {
                Ok(permit) => *self.permit.lock() = Some(permit),
                Err(_) => return Err(GraphError::Cancelled),
            }
        }
        Ok(())
    }

    fn note_solo_get(&self) {
        let count = self.solo_gets.fetch_add(1, Ordering::Relaxed) + 1;
        let warn_at = self.core.config.sequential_get_warning;
        if warn_at > 0 && count == warn_at {
            warn!(
                rule = %self.node.rule().id(),
                count,
                "consecutive sequential Gets serialize parallel work; batch them with get_many"
            );
        }
    }

    fn undeclared(&self, dep: &DependencyKey) -> GraphError {
        GraphError::Throw(
            Throw::msg(format!(
                "rule `{}` did not declare {dep:?}",
                self.node.rule().id()
            ))
            .with_rule(self.node.rule().id().clone()),
        )
    }

    fn internal(&self, message: impl std::fmt::Display) -> GraphError {
        GraphError::Throw(Throw::msg(message).with_rule(self.node.rule().id().clone()))
    }
}

fn downcast_value<T: Send + Sync + 'static>(value: Value) -> Result<Arc<T>, GraphError> {
    let type_key = value.type_key();
    value.downcast::<T>().ok_or_else(|| {
        GraphError::Throw(Throw::msg(format!(
            "produced {type_key} where {} was requested",
            TypeKey::of::<T>()
        )))
    })
}
