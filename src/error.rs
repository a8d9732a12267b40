//! Error types for rule registration, graph compilation, and execution.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::params::TypeKey;
use crate::rules::RuleId;

/// Errors raised while registering rules or compiling the rule graph.
///
/// All of these are fatal: they indicate a malformed rule set and are
/// reported before any query runs.
#[derive(Debug, Clone, Error)]
pub enum RegistrationError {
    /// A rule id was registered twice.
    #[error("rule `{id}` is already registered")]
    DuplicateRule {
        /// The conflicting rule id.
        id: RuleId,
    },

    /// Two rules claim the same output type with an identical input
    /// signature. There is no tie-break: registration fails immediately.
    #[error("rules `{existing}` and `{incoming}` both produce {output} from an identical input signature")]
    EquallySpecific {
        /// The contested output type.
        output: TypeKey,
        /// The rule registered first.
        existing: RuleId,
        /// The rule whose registration failed.
        incoming: RuleId,
    },

    /// More than one registered rule can satisfy a single selector for the
    /// same set of available params.
    #[error("more than one rule can compute {product} for {params}:\n  {}", .candidates.join("\n  "))]
    Ambiguous {
        /// The contested product type.
        product: TypeKey,
        /// Display form of the params in scope.
        params: String,
        /// Display form of every equally-satisfiable candidate.
        candidates: Vec<String>,
    },

    /// A selector cannot be satisfied by any registered rule or in-scope
    /// param.
    #[error("unsatisfiable dependency: no rule can produce {missing} for {params}, required by {required_by}")]
    Unsatisfiable {
        /// The type nothing can produce.
        missing: TypeKey,
        /// Display form of the params in scope.
        params: String,
        /// The rule or query that needed the missing type.
        required_by: String,
    },

    /// No declared root query matches the requested product and subject.
    #[error("no installed root can compute {product} for {params}{}", .suggestion)]
    NoRoot {
        product: TypeKey,
        params: String,
        /// Rendered hint listing roots that produce the product, if any.
        suggestion: String,
    },

    /// More than one declared root query matches the requested product and
    /// subject.
    #[error("more than one root can compute {product} for {params}:\n  {}", .roots.join("\n  "))]
    AmbiguousRoot {
        product: TypeKey,
        params: String,
        roots: Vec<String>,
    },

    /// Rules that are not reachable from any declared root.
    #[error("rules are not reachable from any root: {}", .rules.join(", "))]
    UnreachableRules { rules: Vec<String> },
}

/// A rule body raised during execution.
///
/// The underlying error is shared behind `Arc` so a single failure can be
/// observed by every transitive dependent without cloning the error itself;
/// the top-level caller sees the original `anyhow::Error` unmodified.
#[derive(Clone)]
pub struct Throw {
    rule: Option<RuleId>,
    error: Arc<anyhow::Error>,
    /// Node display names the failure propagated through, innermost first.
    chain: Vec<String>,
}

impl Throw {
    /// Wrap an error with no originating rule yet; the engine attaches the
    /// rule identity when the failure is recorded against a node.
    pub fn new(error: anyhow::Error) -> Self {
        Throw {
            rule: None,
            error: Arc::new(error),
            chain: Vec::new(),
        }
    }

    /// Shorthand for a message-only throw.
    pub fn msg(message: impl fmt::Display) -> Self {
        Throw::new(anyhow::anyhow!("{message}"))
    }

    /// The rule that raised, if the failure has been attributed.
    pub fn rule(&self) -> Option<&RuleId> {
        self.rule.as_ref()
    }

    /// The underlying error, exactly as the rule body raised it.
    pub fn error(&self) -> &Arc<anyhow::Error> {
        &self.error
    }

    /// Attempt to downcast the underlying error.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.error.downcast_ref::<E>()
    }

    /// The chain of node names this failure propagated through, innermost
    /// (the raising node) first.
    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    pub(crate) fn with_rule(mut self, rule: RuleId) -> Self {
        if self.rule.is_none() {
            self.rule = Some(rule);
        }
        self
    }

    pub(crate) fn pushed(mut self, node: String) -> Self {
        self.chain.push(node);
        self
    }
}

impl fmt::Display for Throw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        if let Some(rule) = &self.rule {
            write!(f, " (raised by `{rule}`)")?;
        }
        if !self.chain.is_empty() {
            write!(f, "\n  in {}", self.chain.join("\n  in "))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Throw {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Throw")
            .field("rule", &self.rule)
            .field("error", &self.error)
            .field("chain", &self.chain)
            .finish()
    }
}

/// A Get found no applicable rule.
///
/// Distinct from [`Throw`]: some callers treat absence as "no value" rather
/// than an error (see `Context::get_optional`).
#[derive(Clone, Debug)]
pub struct Noop {
    product: TypeKey,
    scope: String,
}

impl Noop {
    pub(crate) fn no_rule(product: TypeKey, scope: String) -> Self {
        Noop { product, scope }
    }

    /// The product type nothing could compute.
    pub fn product(&self) -> TypeKey {
        self.product
    }
}

impl fmt::Display for Noop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no rule was available to compute {} for {}",
            self.product, self.scope
        )
    }
}

/// Runtime failure of a single node, as observed by its requesters.
///
/// `Throw` and `Noop` propagate to every transitive dependent unless a
/// dependent branches on them explicitly. Any `Into<anyhow::Error>` converts
/// into the `Throw` variant, so rule bodies can use `?` on their own fallible
/// calls.
#[derive(Clone, Debug)]
pub enum GraphError {
    /// A rule body raised during execution.
    Throw(Throw),
    /// A Get found no applicable rule.
    Noop(Noop),
    /// A node awaited a NodeKey already its own ancestor in the current call
    /// chain.
    Cycle {
        /// Display form of the nodes forming the cycle, outermost first.
        path: Vec<String>,
    },
    /// The session was cancelled while this node was suspended.
    Cancelled,
}

impl GraphError {
    /// Returns the inner [`Noop`] if this is an absence, not a failure.
    pub fn as_noop(&self) -> Option<&Noop> {
        match self {
            GraphError::Noop(noop) => Some(noop),
            _ => None,
        }
    }

    /// Returns the inner [`Throw`] if a rule body raised.
    pub fn as_throw(&self) -> Option<&Throw> {
        match self {
            GraphError::Throw(throw) => Some(throw),
            _ => None,
        }
    }
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::Throw(throw) => write!(f, "{throw}"),
            GraphError::Noop(noop) => write!(f, "{noop}"),
            GraphError::Cycle { path } => {
                write!(f, "dependency cycle detected: {}", path.join(" -> "))
            }
            GraphError::Cancelled => write!(f, "session cancelled"),
        }
    }
}

impl<E: Into<anyhow::Error>> From<E> for GraphError {
    fn from(error: E) -> Self {
        GraphError::Throw(Throw::new(error.into()))
    }
}

/// Per-root failure inside an [`ExecutionError`].
#[derive(Clone, Debug)]
pub struct RootFailure {
    /// Display form of the failing root.
    pub root: String,
    /// The failure, carrying the chain of failing nodes.
    pub error: GraphError,
}

/// Aggregated failure of a whole execution: one entry per failed root,
/// each carrying enough trace to reconstruct the failing node chain.
#[derive(Debug)]
pub struct ExecutionError {
    /// Every failed root, in request order.
    pub failures: Vec<RootFailure>,
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} root(s) failed:", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  {}: {}", failure.root, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ExecutionError {}
