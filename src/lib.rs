//! Rule-Flow: an asynchronous, memoizing rule-graph execution engine.
//!
//! The substrate of a multi-language build orchestrator: given a pluggable
//! set of declarative computation rules — each consuming typed inputs and
//! producing one typed output — the engine executes exactly the rules needed
//! to answer a top-level query, reuses prior results, runs independent
//! sub-computations concurrently, and re-executes only what filesystem
//! changes invalidated.
//!
//! # Key Features
//!
//! - **Closed-world compilation**: every reachable `(output type, available
//!   params)` combination resolves to exactly one rule before any query
//!   runs; ambiguity and unsatisfiable chains fail at startup, never at
//!   query time.
//! - **At-most-one execution**: node results are memoized per
//!   `(rule, params)` for the process lifetime; concurrent requesters of
//!   one key converge on a single execution (single-flight).
//! - **Cooperative suspension**: rule bodies are async routines that
//!   suspend only at their [`Context`] Get/MultiGet points; suspended
//!   bodies release their worker slot.
//! - **Lazy invalidation**: filesystem change events mark the nodes that
//!   read the changed paths — and their transitive dependents — stale;
//!   re-execution happens on next request.
//!
//! # Example
//!
//! ```ignore
//! use rule_flow::{
//!     rule_fn, Param, Params, Registry, RootQuery, Rule, RuleGraph, Scheduler, Session,
//!     TypeKey, Value,
//! };
//!
//! let mut registry = Registry::new();
//! registry.register(Rule::new(
//!     "render_greeting",
//!     TypeKey::of::<Greeting>(),
//!     vec![DependencyKey::Select(TypeKey::of::<Name>())],
//!     rule_fn(|ctx| Box::pin(async move {
//!         let name = ctx.select::<Name>().await?;
//!         Ok(Value::new(Greeting(format!("hello, {}", name.0))))
//!     })),
//! ))?;
//!
//! let graph = RuleGraph::compile(
//!     &registry,
//!     vec![RootQuery::new(TypeKey::of::<Greeting>(), [TypeKey::of::<Name>()])],
//! )?;
//! let scheduler = Scheduler::new(graph);
//! let session = Session::new();
//! let values = scheduler
//!     .product_request(&session, TypeKey::of::<Greeting>(), [Params::single(Param::new(Name("world".into())))])
//!     .await?;
//! ```

mod config;
mod context;
mod error;
mod graph;
mod node;
mod params;
mod rule_graph;
mod rules;
mod scheduler;
mod session;
pub mod tracer;
mod watcher;

pub use config::EngineConfig;
pub use context::Context;
pub use error::{ExecutionError, GraphError, Noop, RegistrationError, RootFailure, Throw};
pub use graph::{InvalidationStats, NodeGraph};
pub use node::{NodeKey, NodeOutcome};
pub use params::{DynEq, Param, ParamPayload, Params, TypeKey, Value};
pub use rule_graph::{RootQuery, RuleEdges, RuleGraph};
pub use rules::{
    rule_fn, DependencyKey, ParamTypes, Registry, Rule, RuleFuture, RuleId, RuleImpl,
};
pub use scheduler::{ExecutionRequest, Scheduler, SchedulerBuilder};
pub use session::Session;
pub use tracer::{NoopWorkunits, SpanId, Workunit, WorkunitResult, Workunits};
pub use watcher::{ChangeKind, InvalidationWatcher, PathEvent, ReadSet};
