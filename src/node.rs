//! Node identity and outcomes.

use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{Noop, Throw};
use crate::params::{Params, Value};
use crate::rules::Rule;

/// The memoization identity of a scheduled unit of work: a rule bound to
/// concrete params. Identical keys always share one result.
#[derive(Clone)]
pub struct NodeKey {
    rule: Rule,
    params: Params,
}

impl NodeKey {
    pub(crate) fn new(rule: Rule, params: Params) -> Self {
        NodeKey { rule, params }
    }

    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    pub fn params(&self) -> &Params {
        &self.params
    }
}

impl Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.rule.id(), self.params)
    }
}

impl PartialEq for NodeKey {
    fn eq(&self, other: &Self) -> bool {
        self.rule == other.rule && self.params == other.params
    }
}

impl Eq for NodeKey {}

impl Hash for NodeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rule.hash(state);
        self.params.hash(state);
    }
}

/// The three terminal outcomes of a node's execution.
///
/// A closed sum so that dependents must handle all three, rather than
/// intercepting exceptions: `Throw` and `Noop` propagate to every transitive
/// dependent unless a dependent branches on them explicitly.
#[derive(Clone, Debug)]
pub enum NodeOutcome {
    /// The rule produced its output.
    Return(Value),
    /// The rule (or one of its dependencies) raised.
    Throw(Throw),
    /// A Get found no applicable rule; some callers treat this as "no
    /// value" rather than an error.
    Noop(Noop),
}

impl NodeOutcome {
    /// Short label for tracing.
    pub fn kind(&self) -> &'static str {
        match self {
            NodeOutcome::Return(_) => "return",
            NodeOutcome::Throw(_) => "throw",
            NodeOutcome::Noop(_) => "noop",
        }
    }
}

/// The chain of node keys from a root to the currently-executing node: a
/// cheap persistent list, extended per dependency hop. A node that would
/// await a key already present in its own chain fails with a cycle error
/// instead of deadlocking.
#[derive(Clone, Default)]
pub(crate) struct AncestorChain(Option<Arc<ChainLink>>);

struct ChainLink {
    key: NodeKey,
    prev: Option<Arc<ChainLink>>,
}

impl AncestorChain {
    pub fn empty() -> Self {
        AncestorChain(None)
    }

    pub fn pushed(&self, key: NodeKey) -> Self {
        AncestorChain(Some(Arc::new(ChainLink {
            key,
            prev: self.0.clone(),
        })))
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        let mut link = self.0.as_deref();
        while let Some(l) = link {
            if &l.key == key {
                return true;
            }
            link = l.prev.as_deref();
        }
        false
    }

    /// The chain rendered root-first, with `last` appended.
    pub fn path_to(&self, last: &NodeKey) -> Vec<String> {
        let mut path = Vec::new();
        let mut link = self.0.as_deref();
        while let Some(l) = link {
            path.push(format!("{:?}", l.key));
            link = l.prev.as_deref();
        }
        path.reverse();
        path.push(format!("{last:?}"));
        path
    }
}
