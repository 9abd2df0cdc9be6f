//! Typed registration surface: the [`Query`] and [`Input`] traits.

use std::sync::Arc;

use async_trait::async_trait;

use crate::derived::{recompute_fn, RecomputeFn};
use crate::{CacheKey, QueryContext, QueryId, QueryResult, QueryValue};

/// A derived query declared as a type.
///
/// The type itself is only a name: it is never instantiated. Its [`id`](Query::id)
/// selects the cache, `Key` is the argument and `Value` the cached result.
///
/// # Equality
///
/// `value_eq` decides whether a recomputed value is unchanged, which stops
/// change propagation to dependents. Helpers for common cases live in
/// [`output_eq`](crate::output_eq).
///
/// # Example
///
/// ```ignore
/// struct LineCount;
///
/// #[async_trait]
/// impl Query for LineCount {
///     type Key = String;
///     type Value = usize;
///
///     async fn recompute(ctx: QueryContext<'_>, path: String) -> QueryResult<usize> {
///         let text = ctx.input_of::<SourceText>(path)?;
///         Ok(text.lines().count())
///     }
///
///     fn value_eq(old: &usize, new: &usize) -> bool {
///         old == new
///     }
/// }
///
/// let lines = system.get::<LineCount>("main.calc".into(), &cancel).await?;
/// ```
#[async_trait]
pub trait Query: Send + Sync + 'static {
    /// Argument type.
    type Key: CacheKey;

    /// Result type. Cached and handed out as clones.
    type Value: QueryValue;

    /// Identity of this query. Defaults to the type name.
    fn id() -> QueryId {
        QueryId::of::<Self>()
    }

    /// Compute the value for `key`.
    ///
    /// Everything read through `ctx` becomes a dependency. Must be
    /// deterministic given the same key and dependency values.
    async fn recompute(ctx: QueryContext<'_>, key: Self::Key) -> QueryResult<Self::Value>;

    /// Returns true if `new` counts as unchanged compared to `old`.
    fn value_eq(old: &Self::Value, new: &Self::Value) -> bool;
}

/// An input declared as a type.
///
/// # Example
///
/// ```ignore
/// struct SourceText;
///
/// impl Input for SourceText {
///     type Key = String;
///     type Value = Arc<str>;
/// }
///
/// system.set::<SourceText>("main.calc".into(), Arc::from("1 + 2"))?;
/// ```
pub trait Input: Send + Sync + 'static {
    /// Argument type.
    type Key: CacheKey;

    /// Stored value type.
    type Value: QueryValue;

    /// Identity of this input. Defaults to the type name.
    fn id() -> QueryId {
        QueryId::of::<Self>()
    }
}

pub(crate) fn query_recompute<Q: Query>() -> Arc<RecomputeFn<Q::Key, Q::Value>> {
    recompute_fn(|ctx, key| Q::recompute(ctx, key))
}
