//! Closed-world rule graph compilation.
//!
//! Ahead of any query, the compiler resolves which rule satisfies each
//! reachable `(output type, available params)` combination. Ambiguity and
//! unsatisfiable `Select`s abort compilation immediately; queries never
//! discover a missing rule at runtime. An unproducible `Get`, by contrast,
//! compiles to a [`Noop`](crate::Noop) edge: absence of a value is an
//! outcome some callers branch on, not a malformed rule set.

use std::fmt::{self, Debug};
use std::io;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::RegistrationError;
use crate::params::TypeKey;
use crate::rules::{param_types_str, DependencyKey, ParamTypes, Registry, Rule, RuleId};

/// A declared root: a product type that may originate a query, together
/// with the param types permitted as its subject.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RootQuery {
    pub product: TypeKey,
    pub params: ParamTypes,
}

impl RootQuery {
    pub fn new(product: TypeKey, params: impl IntoIterator<Item = TypeKey>) -> Self {
        RootQuery {
            product,
            params: params.into_iter().collect(),
        }
    }
}

impl fmt::Display for RootQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Query({} for {})", self.product, param_types_str(&self.params))
    }
}

impl Debug for RootQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// The producer chosen for one dependency of one entry.
#[derive(Clone, PartialEq)]
pub(crate) enum EntryRef {
    /// The selected type is in scope as a param; use it directly.
    Param(TypeKey),
    /// The unique satisfiable rule, monomorphized to its pruned param types.
    Rule { rule: Rule, params: ParamTypes },
    /// Nothing can produce the product: the Get completes with `Noop`.
    Nothing { product: TypeKey },
    /// Back-reference to an entry still being resolved; replaced by the
    /// patch pass before compilation returns.
    Pending { product: TypeKey, params: ParamTypes },
}

impl Debug for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryRef::Param(t) => write!(f, "Param({t})"),
            EntryRef::Rule { rule, params } => {
                write!(f, "{} for {}", rule.id(), param_types_str(params))
            }
            EntryRef::Nothing { product } => write!(f, "Nothing({product})"),
            EntryRef::Pending { product, params } => {
                write!(f, "Pending({} for {})", product, param_types_str(params))
            }
        }
    }
}

/// Identity of a compiled entry in the rule graph.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) enum EntryKey {
    Root(RootQuery),
    Rule { rule: RuleId, params: ParamTypes },
}

/// The resolved producer for each declared dependency of one entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleEdges {
    deps: FxHashMap<DependencyKey, EntryRef>,
}

impl RuleEdges {
    pub(crate) fn entry_for(&self, dep: &DependencyKey) -> Option<&EntryRef> {
        self.deps.get(dep)
    }

    pub(crate) fn insert(&mut self, dep: DependencyKey, entry: EntryRef) {
        self.deps.insert(dep, entry);
    }

    pub(crate) fn all_dependencies(&self) -> impl Iterator<Item = (&DependencyKey, &EntryRef)> {
        self.deps.iter()
    }
}

/// The read-only result of closed-world compilation: a directed graph from
/// `(type, available params)` to producing rule, built once per process.
#[derive(Debug)]
pub struct RuleGraph {
    queries: Vec<RootQuery>,
    edges: FxHashMap<EntryKey, RuleEdges>,
    unreachable: Vec<RuleId>,
}

impl RuleGraph {
    /// Compile the registered rules against the declared roots.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::Unsatisfiable`] when a `Select` chain cannot
    ///   be completed, naming the missing type.
    /// - [`RegistrationError::Ambiguous`] when more than one rule is
    ///   equally satisfiable for one selector.
    pub fn compile(
        registry: &Registry,
        queries: impl IntoIterator<Item = RootQuery>,
    ) -> Result<RuleGraph, RegistrationError> {
        Builder::new(registry, queries.into_iter().collect()).build()
    }

    /// The declared root queries.
    pub fn queries(&self) -> &[RootQuery] {
        &self.queries
    }

    /// Find the compiled root entry for the given product and subject
    /// types: an exact root match, or the unique root whose params are a
    /// subset of the subject.
    pub(crate) fn find_root_edges(
        &self,
        product: TypeKey,
        param_types: ParamTypes,
    ) -> Result<(RootQuery, RuleEdges), RegistrationError> {
        let exact = RootQuery {
            product,
            params: param_types.clone(),
        };
        if let Some(edges) = self.edges.get(&EntryKey::Root(exact.clone())) {
            return Ok((exact, edges.clone()));
        }

        let subset_matches: Vec<&RootQuery> = self
            .queries
            .iter()
            .filter(|q| q.product == product && q.params.is_subset(&param_types))
            .collect();

        match subset_matches.len() {
            1 => {
                let query = subset_matches[0].clone();
                let edges = self.edges[&EntryKey::Root(query.clone())].clone();
                Ok((query, edges))
            }
            0 => {
                let mut suggestions: Vec<String> = self
                    .queries
                    .iter()
                    .filter(|q| q.product == product)
                    .map(|q| param_types_str(&q.params))
                    .collect();
                suggestions.sort();
                let suggestion = if suggestions.is_empty() {
                    String::new()
                } else {
                    format!("; it can be produced for:\n  {}", suggestions.join("\n  "))
                };
                Err(RegistrationError::NoRoot {
                    product,
                    params: param_types_str(&param_types),
                    suggestion,
                })
            }
            _ => Err(RegistrationError::AmbiguousRoot {
                product,
                params: param_types_str(&param_types),
                roots: subset_matches.iter().map(|q| q.to_string()).collect(),
            }),
        }
    }

    /// The compiled edges for a rule entry, keyed by its pruned param types
    /// (a node's params are exactly its entry's pruned types).
    pub(crate) fn edges_for_rule(&self, rule: &RuleId, params: &ParamTypes) -> Option<&RuleEdges> {
        self.edges.get(&EntryKey::Rule {
            rule: rule.clone(),
            params: params.clone(),
        })
    }

    /// Report rules that no declared root can reach.
    pub fn validate_reachability(&self) -> Result<(), RegistrationError> {
        if self.unreachable.is_empty() {
            return Ok(());
        }
        Err(RegistrationError::UnreachableRules {
            rules: self.unreachable.iter().map(|id| id.to_string()).collect(),
        })
    }

    /// Write the compiled graph in graphviz dot format.
    pub fn visualize(&self, f: &mut dyn io::Write) -> io::Result<()> {
        writeln!(f, "digraph {{")?;
        writeln!(f, "  // root entries")?;
        let mut lines: Vec<String> = self
            .edges
            .iter()
            .filter_map(|(key, edges)| match key {
                EntryKey::Root(query) => Some(render_entry(&query.to_string(), edges)),
                EntryKey::Rule { .. } => None,
            })
            .collect();
        lines.sort();
        for line in &lines {
            writeln!(f, "{line}")?;
        }
        writeln!(f, "  // internal entries")?;
        let mut lines: Vec<String> = self
            .edges
            .iter()
            .filter_map(|(key, edges)| match key {
                EntryKey::Rule { rule, params } => Some(render_entry(
                    &format!("{} for {}", rule, param_types_str(params)),
                    edges,
                )),
                EntryKey::Root(_) => None,
            })
            .collect();
        lines.sort();
        for line in &lines {
            writeln!(f, "{line}")?;
        }
        writeln!(f, "}}")
    }
}

fn render_entry(entry: &str, edges: &RuleEdges) -> String {
    let mut deps: Vec<String> = edges
        .all_dependencies()
        .map(|(_, entry)| format!("\"{entry:?}\""))
        .collect();
    deps.sort();
    format!("    \"{}\" -> {{{}}}", entry, deps.join(" "))
}

enum Memo {
    Visiting,
    Chosen(EntryRef),
}

struct Builder<'r> {
    registry: &'r Registry,
    queries: Vec<RootQuery>,
    memo: FxHashMap<(TypeKey, ParamTypes), Memo>,
    edges: FxHashMap<EntryKey, RuleEdges>,
    reached: FxHashSet<RuleId>,
}

impl<'r> Builder<'r> {
    fn new(registry: &'r Registry, queries: Vec<RootQuery>) -> Self {
        Builder {
            registry,
            queries,
            memo: FxHashMap::default(),
            edges: FxHashMap::default(),
            reached: FxHashSet::default(),
        }
    }

    fn build(mut self) -> Result<RuleGraph, RegistrationError> {
        let queries = self.queries.clone();
        for query in &queries {
            let chosen = self.resolve(query.product, &query.params)?;
            if let EntryRef::Nothing { product } = chosen {
                return Err(RegistrationError::Unsatisfiable {
                    missing: product,
                    params: param_types_str(&query.params),
                    required_by: query.to_string(),
                });
            }
            let mut edges = RuleEdges::default();
            edges.insert(DependencyKey::Select(query.product), chosen);
            self.edges.insert(EntryKey::Root(query.clone()), edges);
        }

        self.patch_pending()?;

        let unreachable: Vec<RuleId> = self
            .registry
            .rules()
            .filter(|rule| !self.reached.contains(rule.id()))
            .map(|rule| rule.id().clone())
            .collect();

        Ok(RuleGraph {
            queries,
            edges: self.edges,
            unreachable,
        })
    }

    /// Choose the producer for `product` given `params` in scope.
    ///
    /// Returns `Nothing` when no producer exists — the caller decides
    /// whether that is fatal (Select, root) or a Noop edge (Get).
    fn resolve(
        &mut self,
        product: TypeKey,
        params: &ParamTypes,
    ) -> Result<EntryRef, RegistrationError> {
        let memo_key = (product, params.clone());
        match self.memo.get(&memo_key) {
            Some(Memo::Chosen(entry)) => return Ok(entry.clone()),
            Some(Memo::Visiting) => {
                return Ok(EntryRef::Pending {
                    product,
                    params: params.clone(),
                })
            }
            None => {}
        }

        // A param in scope satisfies the selection directly; rules are not
        // consulted for it.
        if params.contains(&product) {
            let entry = EntryRef::Param(product);
            self.memo.insert(memo_key, Memo::Chosen(entry.clone()));
            return Ok(entry);
        }

        self.memo.insert(memo_key.clone(), Memo::Visiting);

        let mut candidates: Vec<Rule> = self
            .registry
            .rules_for(product)
            .filter(|rule| self.candidate_satisfiable(rule, params))
            .cloned()
            .collect();

        let entry = match candidates.len() {
            0 => EntryRef::Nothing { product },
            1 => {
                let rule = candidates.pop().expect("len checked");
                self.record_entry(&rule, params)?
            }
            _ => {
                return Err(RegistrationError::Ambiguous {
                    product,
                    params: param_types_str(params),
                    candidates: candidates.iter().map(|r| format!("{r:?}")).collect(),
                })
            }
        };

        self.memo.insert(memo_key, Memo::Chosen(entry.clone()));
        Ok(entry)
    }

    /// Resolve every dependency of the chosen rule and record its entry,
    /// monomorphized to the params it actually consumes.
    fn record_entry(
        &mut self,
        rule: &Rule,
        available: &ParamTypes,
    ) -> Result<EntryRef, RegistrationError> {
        self.reached.insert(rule.id().clone());

        let mut edges = RuleEdges::default();
        let mut entry_params = ParamTypes::new();
        for dep in rule.deps() {
            let dep_ref = match dep {
                DependencyKey::Select(t) => {
                    let chosen = self.resolve(*t, available)?;
                    if let EntryRef::Nothing { product } = chosen {
                        return Err(RegistrationError::Unsatisfiable {
                            missing: product,
                            params: param_types_str(available),
                            required_by: format!("rule `{}`", rule.id()),
                        });
                    }
                    // A Select consumes params; a Get resets the scope to
                    // its explicit input.
                    match &chosen {
                        EntryRef::Param(t) => {
                            entry_params.insert(*t);
                        }
                        EntryRef::Rule { params, .. } => {
                            entry_params.extend(params.iter().copied());
                        }
                        EntryRef::Nothing { .. } | EntryRef::Pending { .. } => {}
                    }
                    chosen
                }
                DependencyKey::Get { output, input } => {
                    let scope: ParamTypes = [*input].into_iter().collect();
                    self.resolve(*output, &scope)?
                }
            };
            edges.insert(*dep, dep_ref);
        }

        let key = EntryKey::Rule {
            rule: rule.id().clone(),
            params: entry_params.clone(),
        };
        if let Some(existing) = self.edges.get(&key) {
            if *existing != edges {
                return Err(RegistrationError::Ambiguous {
                    product: rule.output(),
                    params: param_types_str(&entry_params),
                    candidates: vec![
                        format!("{rule:?} (conflicting resolutions of its inputs)"),
                    ],
                });
            }
        }
        self.edges.insert(key, edges);

        Ok(EntryRef::Rule {
            rule: rule.clone(),
            params: entry_params,
        })
    }

    /// Optimistic satisfiability used to filter candidates before choosing:
    /// in-progress entries are assumed satisfiable (value-level recursion is
    /// legal and caught at runtime by cycle detection), and Gets always
    /// pass (an unproducible Get is a Noop edge, not unsatisfiability).
    fn candidate_satisfiable(&self, rule: &Rule, params: &ParamTypes) -> bool {
        let mut visiting = FxHashSet::default();
        rule.deps().iter().all(|dep| match dep {
            DependencyKey::Select(t) => self.select_satisfiable(*t, params, &mut visiting),
            DependencyKey::Get { .. } => true,
        })
    }

    fn select_satisfiable(
        &self,
        product: TypeKey,
        params: &ParamTypes,
        visiting: &mut FxHashSet<(TypeKey, ParamTypes)>,
    ) -> bool {
        if params.contains(&product) {
            return true;
        }
        match self.memo.get(&(product, params.clone())) {
            Some(Memo::Chosen(entry)) => {
                return !matches!(entry, EntryRef::Nothing { .. });
            }
            Some(Memo::Visiting) => return true,
            None => {}
        }
        let key = (product, params.clone());
        if !visiting.insert(key.clone()) {
            return true;
        }
        let satisfiable = self.registry.rules_for(product).any(|rule| {
            rule.deps().iter().all(|dep| match dep {
                DependencyKey::Select(t) => self.select_satisfiable(*t, params, visiting),
                DependencyKey::Get { .. } => true,
            })
        });
        visiting.remove(&key);
        satisfiable
    }

    /// Replace `Pending` back-references with the entries they resolved to.
    fn patch_pending(&mut self) -> Result<(), RegistrationError> {
        let mut patches: Vec<(EntryKey, DependencyKey, EntryRef)> = Vec::new();
        for (key, edges) in &self.edges {
            for (dep, entry) in edges.all_dependencies() {
                if let EntryRef::Pending { product, params } = entry {
                    let chosen = match self.memo.get(&(*product, params.clone())) {
                        Some(Memo::Chosen(chosen)) => chosen.clone(),
                        _ => {
                            return Err(RegistrationError::Unsatisfiable {
                                missing: *product,
                                params: param_types_str(params),
                                required_by: format!("{key:?}"),
                            })
                        }
                    };
                    patches.push((key.clone(), *dep, chosen));
                }
            }
        }
        for (key, dep, chosen) in patches {
            if let Some(edges) = self.edges.get_mut(&key) {
                edges.insert(dep, chosen);
            }
        }
        Ok(())
    }
}
