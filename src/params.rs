//! Value and identity types: typed, immutable, hashable values and the
//! `Params` sets that form the subject of a query.

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dyn_hash::DynHash;

/// Interned identity of a product or param type.
///
/// Ordered by type name (then `TypeId`) so that `Params` sets and param-type
/// sets have a canonical, deterministic order.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// The key for a concrete Rust type.
    pub fn of<T: 'static>() -> Self {
        TypeKey {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The full type name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The last path segment of the type name, used in diagnostics.
    pub fn short_name(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

impl Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for TypeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TypeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(other.name).then_with(|| self.id.cmp(&other.id))
    }
}

/// Object-safe equality comparison.
///
/// Enables comparing two trait objects for equality by downcasting to the
/// concrete type.
pub trait DynEq: Any {
    /// Returns `true` if `other` is the same concrete type and equal to
    /// `self`.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// The payload contract for a [`Param`]: object-safe hashing, equality, and
/// debug formatting. Automatically implemented for every
/// `Hash + Eq + Debug + Send + Sync + 'static` type.
pub trait ParamPayload: DynHash + DynEq + Debug + Send + Sync {
    /// The payload as `Any`, for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> ParamPayload for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

dyn_hash::hash_trait_object!(ParamPayload);

fn debug_any<T: Debug + Send + Sync + 'static>(any: &(dyn Any + Send + Sync)) -> String {
    match any.downcast_ref::<T>() {
        Some(value) => format!("{value:?}"),
        None => "<opaque>".to_string(),
    }
}

/// An immutable, type-erased value tagged with its [`TypeKey`].
///
/// Rule outputs and param payloads are both `Value`s; cloning is cheap (the
/// payload is behind `Arc`).
#[derive(Clone)]
pub struct Value {
    type_key: TypeKey,
    payload: Arc<dyn Any + Send + Sync>,
    debug: fn(&(dyn Any + Send + Sync)) -> String,
}

impl Value {
    /// Wrap a concrete value.
    pub fn new<T: Debug + Send + Sync + 'static>(value: T) -> Self {
        Value::from_arc(Arc::new(value))
    }

    /// Wrap an already-shared concrete value.
    pub fn from_arc<T: Debug + Send + Sync + 'static>(payload: Arc<T>) -> Self {
        Value {
            type_key: TypeKey::of::<T>(),
            payload,
            debug: debug_any::<T>,
        }
    }

    /// The type this value carries.
    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    /// Downcast to the concrete type.
    ///
    /// Returns `None` if the type does not match.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::downcast::<T>(self.payload.clone()).ok()
    }

    /// Debug rendering of the payload.
    pub fn debug_repr(&self) -> String {
        (self.debug)(self.payload.as_ref())
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.debug_repr())
    }
}

/// An immutable, typed, hashable value; uniquely identified by its type
/// within a [`Params`] set.
#[derive(Clone)]
pub struct Param {
    value: Value,
    key: Arc<dyn ParamPayload>,
}

impl Param {
    /// Wrap a concrete param value.
    pub fn new<T: Hash + Eq + Debug + Send + Sync + 'static>(value: T) -> Self {
        let payload = Arc::new(value);
        Param {
            value: Value::from_arc(payload.clone()),
            key: payload,
        }
    }

    /// The param's type.
    pub fn type_key(&self) -> TypeKey {
        self.value.type_key()
    }

    /// The param as a plain [`Value`].
    pub fn to_value(&self) -> Value {
        self.value.clone()
    }

    /// Downcast to the concrete type.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.value.downcast()
    }

    /// Debug rendering of the payload.
    pub fn debug_repr(&self) -> String {
        self.value.debug_repr()
    }
}

impl Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value.debug_repr())
    }
}

impl Hash for Param {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_key().hash(state);
        self.key.hash(state);
    }
}

impl PartialEq for Param {
    fn eq(&self, other: &Self) -> bool {
        self.type_key() == other.type_key() && self.key.dyn_eq(other.key.as_any())
    }
}

impl Eq for Param {}

/// A set of [`Param`]s keyed by type: the subject of a query and one half of
/// a node's memoization identity.
///
/// Held sorted by [`TypeKey`] so equal sets hash identically. Inserting a
/// param whose type is already present replaces the existing entry.
#[derive(Clone, Default)]
pub struct Params(Arc<Vec<Param>>);

impl Params {
    /// Build a set from params; later entries replace earlier ones of the
    /// same type.
    pub fn new(params: impl IntoIterator<Item = Param>) -> Self {
        let mut entries: Vec<Param> = Vec::new();
        for param in params {
            match entries.binary_search_by(|p| p.type_key().cmp(&param.type_key())) {
                Ok(i) => entries[i] = param,
                Err(i) => entries.insert(i, param),
            }
        }
        Params(Arc::new(entries))
    }

    /// A set holding exactly one param.
    pub fn single(param: Param) -> Self {
        Params(Arc::new(vec![param]))
    }

    /// A copy of this set with `param` inserted (replacing any existing
    /// param of the same type).
    pub fn with(&self, param: Param) -> Self {
        let mut entries = Vec::clone(&self.0);
        match entries.binary_search_by(|p| p.type_key().cmp(&param.type_key())) {
            Ok(i) => entries[i] = param,
            Err(i) => entries.insert(i, param),
        }
        Params(Arc::new(entries))
    }

    /// The param of the given type, if present.
    pub fn find(&self, type_key: TypeKey) -> Option<&Param> {
        self.0
            .binary_search_by(|p| p.type_key().cmp(&type_key))
            .ok()
            .map(|i| &self.0[i])
    }

    /// Whether a param of the given type is present.
    pub fn contains(&self, type_key: TypeKey) -> bool {
        self.find(type_key).is_some()
    }

    /// A copy restricted to the given types, in canonical order.
    pub fn restricted<'a>(&self, keep: impl IntoIterator<Item = &'a TypeKey>) -> Self {
        let keep: Vec<TypeKey> = keep.into_iter().copied().collect();
        Params(Arc::new(
            self.0
                .iter()
                .filter(|p| keep.contains(&p.type_key()))
                .cloned()
                .collect(),
        ))
    }

    /// The types present in this set, in canonical order.
    pub fn type_keys(&self) -> impl Iterator<Item = TypeKey> + '_ {
        self.0.iter().map(|p| p.type_key())
    }

    /// Iterate over the params in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Params(")?;
        for (i, param) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param.debug_repr())?;
        }
        write!(f, ")")
    }
}

impl Hash for Params {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for param in self.0.iter() {
            param.hash(state);
        }
    }
}

impl PartialEq for Params {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.0.iter().zip(other.0.iter()).all(|(a, b)| a == b)
    }
}

impl Eq for Params {}

impl FromIterator<Param> for Params {
    fn from_iter<I: IntoIterator<Item = Param>>(iter: I) -> Self {
        Params::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Hash, PartialEq, Eq)]
    struct Target(String);

    #[derive(Debug, Hash, PartialEq, Eq)]
    struct Platform(&'static str);

    #[test]
    fn param_equality_is_typed() {
        assert_eq!(Param::new(Target("a".into())), Param::new(Target("a".into())));
        assert_ne!(Param::new(Target("a".into())), Param::new(Target("b".into())));
        // Same debug repr, different types.
        assert_ne!(Param::new(1u32), Param::new(1u64));
    }

    #[test]
    fn params_replace_by_type() {
        let params = Params::new([Param::new(Platform("linux")), Param::new(Platform("macos"))]);
        assert_eq!(params.len(), 1);
        let platform = params
            .find(TypeKey::of::<Platform>())
            .unwrap()
            .downcast::<Platform>()
            .unwrap();
        assert_eq!(platform.0, "macos");
    }

    #[test]
    fn params_order_is_canonical() {
        let a = Params::new([Param::new(Target("t".into())), Param::new(Platform("linux"))]);
        let b = Params::new([Param::new(Platform("linux")), Param::new(Target("t".into()))]);
        assert_eq!(a, b);
        use std::collections::hash_map::DefaultHasher;
        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }

    #[test]
    fn value_downcast_round_trip() {
        let value = Value::new(Target("out".into()));
        assert_eq!(value.type_key(), TypeKey::of::<Target>());
        assert_eq!(value.downcast::<Target>().unwrap().0, "out");
        assert!(value.downcast::<Platform>().is_none());
    }

    #[test]
    fn restricted_keeps_only_named_types() {
        let params = Params::new([Param::new(Target("t".into())), Param::new(Platform("linux"))]);
        let only = params.restricted([&TypeKey::of::<Platform>()]);
        assert_eq!(only.len(), 1);
        assert!(only.contains(TypeKey::of::<Platform>()));
    }
}
