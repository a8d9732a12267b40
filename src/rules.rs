//! Rule declarations and the registry they are collected into.

use std::collections::BTreeSet;
use std::fmt::{self, Debug};
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::context::Context;
use crate::error::{GraphError, RegistrationError};
use crate::params::{TypeKey, Value};

/// Unique name of a registered rule.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(Arc<str>);

impl RuleId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        RuleId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RuleId {
    fn from(id: &str) -> Self {
        RuleId::new(id)
    }
}

/// The set of param types in scope for a rule-graph entry, canonically
/// ordered.
pub type ParamTypes = BTreeSet<TypeKey>;

/// Render a param-type set for diagnostics.
pub(crate) fn param_types_str(params: &ParamTypes) -> String {
    let names: Vec<&str> = params.iter().map(|t| t.short_name()).collect();
    format!("Params({})", names.join(", "))
}

/// A declared input of a rule: the vocabulary a rule body uses to request
/// products.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependencyKey {
    /// "Give me a product derivable from the params currently in scope."
    Select(TypeKey),
    /// "Compute `output` for one explicit `input` value." The callee's scope
    /// is exactly the input type; batched Gets (`Context::get_many`) declare
    /// the same key once.
    Get {
        /// The product to compute.
        output: TypeKey,
        /// The type of the explicitly-provided input value.
        input: TypeKey,
    },
}

impl DependencyKey {
    /// The product this dependency yields.
    pub fn product(&self) -> TypeKey {
        match self {
            DependencyKey::Select(product) => *product,
            DependencyKey::Get { output, .. } => *output,
        }
    }
}

impl Debug for DependencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyKey::Select(product) => write!(f, "Select({product})"),
            DependencyKey::Get { output, input } => write!(f, "Get({output}, {input})"),
        }
    }
}

/// The implementation of a rule: a cooperative async routine that may
/// suspend only at its `Context` Get/MultiGet points.
#[async_trait]
pub trait RuleImpl: Send + Sync + 'static {
    /// Execute the rule against the node's params, producing the rule's
    /// declared output type as a [`Value`].
    async fn run(&self, ctx: Context) -> Result<Value, GraphError>;
}

/// Boxed future type produced by [`rule_fn`] closures.
pub type RuleFuture = Pin<Box<dyn Future<Output = Result<Value, GraphError>> + Send>>;

struct FnRule<F>(F);

#[async_trait]
impl<F> RuleImpl for FnRule<F>
where
    F: Fn(Context) -> RuleFuture + Send + Sync + 'static,
{
    async fn run(&self, ctx: Context) -> Result<Value, GraphError> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a rule implementation.
///
/// # Example
///
/// ```ignore
/// let imp = rule_fn(|ctx| {
///     Box::pin(async move {
///         let target = ctx.select::<Target>().await?;
///         Ok(Value::new(Binary::from(&*target)))
///     })
/// });
/// ```
pub fn rule_fn<F>(f: F) -> Arc<dyn RuleImpl>
where
    F: Fn(Context) -> RuleFuture + Send + Sync + 'static,
{
    Arc::new(FnRule(f))
}

/// A registered, typed computation step: one output type, an ordered list of
/// input selectors, and an implementation. Immutable post-registration.
#[derive(Clone)]
pub struct Rule {
    id: RuleId,
    output: TypeKey,
    deps: Arc<[DependencyKey]>,
    imp: Arc<dyn RuleImpl>,
}

impl Rule {
    pub fn new(
        id: impl Into<RuleId>,
        output: TypeKey,
        deps: impl Into<Vec<DependencyKey>>,
        imp: Arc<dyn RuleImpl>,
    ) -> Self {
        Rule {
            id: id.into(),
            output,
            deps: deps.into().into(),
            imp,
        }
    }

    pub fn id(&self) -> &RuleId {
        &self.id
    }

    pub fn output(&self) -> TypeKey {
        self.output
    }

    pub fn deps(&self) -> &[DependencyKey] {
        &self.deps
    }

    pub(crate) fn imp(&self) -> &Arc<dyn RuleImpl> {
        &self.imp
    }

    /// The rule's input signature as a canonical multiset, used for the
    /// equal-specificity check at registration time.
    fn signature(&self) -> Vec<DependencyKey> {
        let mut sig: Vec<DependencyKey> = self.deps.to_vec();
        sig.sort();
        sig
    }
}

// Rule identity is its id; the registry enforces id uniqueness.
impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Rule {}

impl Hash for Rule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?}) -> {}", self.id, self.deps, self.output)
    }
}

/// Static metadata for every declared rule, collected at startup.
///
/// Registration fails fast on ambiguity: a second rule claiming an output
/// type already produced from an identical input signature is rejected
/// rather than tie-broken.
#[derive(Default)]
pub struct Registry {
    rules: IndexMap<RuleId, Rule>,
    by_output: FxHashMap<TypeKey, Vec<RuleId>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Register a rule.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::DuplicateRule`] if the id is taken.
    /// - [`RegistrationError::EquallySpecific`] if another rule already
    ///   produces the same output type from an identical input signature.
    pub fn register(&mut self, rule: Rule) -> Result<(), RegistrationError> {
        if self.rules.contains_key(rule.id()) {
            return Err(RegistrationError::DuplicateRule {
                id: rule.id().clone(),
            });
        }

        if let Some(existing_ids) = self.by_output.get(&rule.output()) {
            let signature = rule.signature();
            for existing_id in existing_ids {
                let existing = &self.rules[existing_id];
                if existing.signature() == signature {
                    return Err(RegistrationError::EquallySpecific {
                        output: rule.output(),
                        existing: existing_id.clone(),
                        incoming: rule.id().clone(),
                    });
                }
            }
        }

        self.by_output
            .entry(rule.output())
            .or_default()
            .push(rule.id().clone());
        self.rules.insert(rule.id().clone(), rule);
        Ok(())
    }

    /// All rules producing the given output type, in registration order.
    pub fn rules_for(&self, output: TypeKey) -> impl Iterator<Item = &Rule> {
        self.by_output
            .get(&output)
            .into_iter()
            .flatten()
            .map(|id| &self.rules[id])
    }

    /// All registered rules, in registration order.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Out(&'static str);
    #[derive(Debug)]
    struct In;

    fn noop_impl() -> Arc<dyn RuleImpl> {
        rule_fn(|_ctx| Box::pin(async { Ok(Value::new(Out("x"))) }))
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut registry = Registry::new();
        registry
            .register(Rule::new("a", TypeKey::of::<Out>(), vec![], noop_impl()))
            .unwrap();
        let err = registry
            .register(Rule::new("a", TypeKey::of::<In>(), vec![], noop_impl()))
            .unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicateRule { .. }));
    }

    #[test]
    fn equally_specific_signature_rejected_before_any_query() {
        let mut registry = Registry::new();
        let deps = vec![DependencyKey::Select(TypeKey::of::<In>())];
        registry
            .register(Rule::new("a", TypeKey::of::<Out>(), deps.clone(), noop_impl()))
            .unwrap();
        let err = registry
            .register(Rule::new("b", TypeKey::of::<Out>(), deps, noop_impl()))
            .unwrap_err();
        match err {
            RegistrationError::EquallySpecific { existing, incoming, .. } => {
                assert_eq!(existing.as_str(), "a");
                assert_eq!(incoming.as_str(), "b");
            }
            other => panic!("expected EquallySpecific, got {other:?}"),
        }
    }

    #[test]
    fn distinct_signatures_coexist() {
        let mut registry = Registry::new();
        registry
            .register(Rule::new(
                "a",
                TypeKey::of::<Out>(),
                vec![DependencyKey::Select(TypeKey::of::<In>())],
                noop_impl(),
            ))
            .unwrap();
        registry
            .register(Rule::new("b", TypeKey::of::<Out>(), vec![], noop_impl()))
            .unwrap();
        assert_eq!(registry.rules_for(TypeKey::of::<Out>()).count(), 2);
    }

    #[test]
    fn signature_ignores_declaration_order() {
        let a = Rule::new(
            "a",
            TypeKey::of::<Out>(),
            vec![
                DependencyKey::Select(TypeKey::of::<In>()),
                DependencyKey::Select(TypeKey::of::<Out>()),
            ],
            noop_impl(),
        );
        let b = Rule::new(
            "b",
            TypeKey::of::<Out>(),
            vec![
                DependencyKey::Select(TypeKey::of::<Out>()),
                DependencyKey::Select(TypeKey::of::<In>()),
            ],
            noop_impl(),
        );
        assert_eq!(a.signature(), b.signature());
    }
}
