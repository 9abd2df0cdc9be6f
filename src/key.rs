//! Key types: query identities, slot identities and the bounds on cache keys.

use std::fmt::{self, Debug};
use std::hash::Hash;

/// Trait for types that can serve as query arguments.
///
/// Automatically implemented for every `Hash + Eq + Clone + Debug + Send + Sync + 'static` type.
pub trait CacheKey: Hash + Eq + Clone + Debug + Send + Sync + 'static {}
impl<T: Hash + Eq + Clone + Debug + Send + Sync + 'static> CacheKey for T {}

/// Convenience trait for cached value types.
///
/// Values are handed out as clones, so prefer `Arc<T>` for large results to
/// make the clone a reference-count bump.
pub trait QueryValue: Clone + Send + Sync + 'static {}
impl<T: Clone + Send + Sync + 'static> QueryValue for T {}

/// Identity of a query (or input): selects one [`QueryCache`](crate::QueryCache)
/// inside the system.
///
/// # Examples
///
/// ```
/// # use revquery::QueryId;
/// const PARSE: QueryId = QueryId::new("parse");
/// assert_eq!(PARSE.as_str(), "parse");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryId(&'static str);

impl QueryId {
    /// Create a query identity from a stable name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Identity derived from a type name, used by the [`Query`](crate::Query)
    /// and [`Input`](crate::Input) traits by default.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self(std::any::type_name::<T>())
    }

    /// The name of this query.
    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Stable identity of one cache slot inside a system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub(crate) usize);

impl SlotId {
    /// Raw index of this slot in the system registry.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Whether a slot holds an input or a derived value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    /// Value set directly by the caller.
    Input,
    /// Value computed by a recompute function.
    Derived,
}

/// Diagnostic description of a slot, kept in the system registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    /// Owning query.
    pub query: QueryId,
    /// Debug representation of the argument key.
    pub key: String,
    /// Input or derived.
    pub kind: SlotKind,
}

impl SlotInfo {
    pub(crate) fn new<K: Debug>(query: QueryId, key: &K, kind: SlotKind) -> Self {
        Self {
            query,
            key: format!("{:?}", key),
            kind,
        }
    }
}

impl fmt::Display for SlotInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.query, self.key)
    }
}
