//! The dependency system and the context handed to running computations.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::executor::block_on;
use futures::future::BoxFuture;
use futures::lock::{Mutex as EntryLock, MutexGuard as EntryGuard};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::cache::{ErasedCache, SlotRegistry};
use crate::derived::{recompute_fn, sync_recompute_fn, EqFn, RecomputeFn};
use crate::frame::{ActiveGuard, Frame};
use crate::query::query_recompute;
use crate::revision::RevisionCounter;
use crate::{
    CacheKey, CancellationToken, DerivedValue, Input, NoopTracer, Query, QueryCache, QueryError,
    QueryId, QueryResult, QueryValue, Revision, SlotId, SlotInfo, Tracer,
};

// ============================================================================
// DependencySystem
// ============================================================================

/// Owns the revision counter, one [`QueryCache`] per query and the stack of
/// active computations.
///
/// A system is an explicit value; share it with `Arc` if several owners need
/// it. Top-level entry points (`set_input`, `query`, `query_async`, `get`, ...)
/// are serialized by an internal entry lock, so only one top-level request is
/// in flight at a time. Nested queries issued through a [`QueryContext`] do
/// not take that lock.
///
/// Async entry points wait for the lock. Blocking entry points wait for other
/// blocking callers, but fail with `QueryError::Busy` while an async request
/// holds the lock: that request may be parked on the very thread that would
/// block. Use the `*_async` variants from async code.
///
/// Entry points must not be called from inside a computation: use the
/// [`QueryContext`] instead.
pub struct DependencySystem {
    revisions: RevisionCounter,
    caches: Mutex<HashMap<QueryId, Arc<dyn ErasedCache>, ahash::RandomState>>,
    slots: Arc<SlotRegistry>,
    active: Mutex<Vec<SlotId>>,
    entry: EntryLock<()>,
    async_entry: AtomicBool,
    memoize: bool,
    tracer: Arc<dyn Tracer>,
}

impl Default for DependencySystem {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<DependencySystem>();
    assert_sync::<DependencySystem>();
    assert_send::<QueryContext<'static>>();
}

impl fmt::Debug for DependencySystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencySystem")
            .field("revision", &self.current_revision())
            .field("slots", &self.slot_count())
            .field("memoize", &self.memoize)
            .finish_non_exhaustive()
    }
}

impl DependencySystem {
    /// Create a system with memoization enabled and no tracer.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for customizing the system.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let system = DependencySystem::builder()
    ///     .memoization(false)
    ///     .build();
    /// ```
    pub fn builder() -> DependencySystemBuilder {
        DependencySystemBuilder::new()
    }

    /// The latest issued revision.
    pub fn current_revision(&self) -> Revision {
        self.revisions.current()
    }

    /// Issue a new revision. Only input writes advance the counter.
    pub(crate) fn next_revision(&self) -> Revision {
        self.revisions.increment()
    }

    /// Returns false if the system was built with memoization disabled.
    pub fn memoization_enabled(&self) -> bool {
        self.memoize
    }

    pub(crate) fn tracer(&self) -> &dyn Tracer {
        &*self.tracer
    }

    /// Typed cache for `query`, created on first access.
    ///
    /// # Errors
    ///
    /// `QueryError::KindMismatch` if `query` was first used with other
    /// key/value types.
    pub fn cache<K: CacheKey, V: QueryValue>(
        &self,
        query: QueryId,
    ) -> QueryResult<Arc<QueryCache<K, V>>> {
        let erased = self
            .caches
            .lock()
            .entry(query)
            .or_insert_with(|| {
                trace!(%query, "new query cache");
                Arc::new(QueryCache::<K, V>::new(query, self.slots.clone())) as Arc<dyn ErasedCache>
            })
            .clone();
        erased
            .into_any()
            .downcast::<QueryCache<K, V>>()
            .map_err(|_| QueryError::KindMismatch {
                query: query.as_str(),
            })
    }

    // ------------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------------

    /// Write an input and return the revision issued for the write.
    ///
    /// Every write issues a new revision, even when `value` equals the stored
    /// one; skip needless writes on the caller side to avoid churn.
    ///
    /// # Errors
    ///
    /// `QueryError::Busy` if an async request is in flight; see
    /// [`set_input_async`](Self::set_input_async).
    pub fn set_input<K: CacheKey, V: QueryValue>(
        &self,
        query: QueryId,
        key: K,
        value: V,
    ) -> QueryResult<Revision> {
        let _entry = self.lock_entry_blocking()?;
        self.write_input(query, key, value)
    }

    /// Write an input, waiting for any request in flight to finish first.
    pub async fn set_input_async<K: CacheKey, V: QueryValue>(
        &self,
        query: QueryId,
        key: K,
        value: V,
    ) -> QueryResult<Revision> {
        let _entry = self.lock_entry().await;
        self.write_input(query, key, value)
    }

    /// Typed variant of [`set_input`](Self::set_input).
    pub fn set<I: Input>(&self, key: I::Key, value: I::Value) -> QueryResult<Revision> {
        self.set_input(I::id(), key, value)
    }

    /// Typed variant of [`set_input_async`](Self::set_input_async).
    pub async fn set_async<I: Input>(
        &self,
        key: I::Key,
        value: I::Value,
    ) -> QueryResult<Revision> {
        self.set_input_async(I::id(), key, value).await
    }

    fn write_input<K: CacheKey, V: QueryValue>(
        &self,
        query: QueryId,
        key: K,
        value: V,
    ) -> QueryResult<Revision> {
        let input = self.cache::<K, V>(query)?.get_or_create_input(key)?;
        Ok(input.set(self, value))
    }

    /// Read an input without recording a dependency.
    ///
    /// # Errors
    ///
    /// `QueryError::UnsetInput` if the input was never written.
    pub fn input_value<K: CacheKey, V: QueryValue>(
        &self,
        query: QueryId,
        key: &K,
    ) -> QueryResult<V> {
        let cache = self.cache::<K, V>(query)?;
        match cache.input(key) {
            Some(input) => input.get(),
            None if cache.derived(key).is_some() => Err(QueryError::KindMismatch {
                query: query.as_str(),
            }),
            None => Err(QueryError::UnsetInput {
                query: query.as_str(),
                key: format!("{:?}", key),
            }),
        }
    }

    /// Typed variant of [`input_value`](Self::input_value).
    pub fn input<I: Input>(&self, key: &I::Key) -> QueryResult<I::Value> {
        self.input_value(I::id(), key)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Evaluate a derived query with a synchronous recompute function.
    ///
    /// The slot for `(query, key)` is created on first use and keeps the
    /// first recompute function it was created with. Early termination uses
    /// `PartialEq`. Returns `QueryError::Busy` while an async request is in
    /// flight.
    ///
    /// # Example
    ///
    /// ```ignore
    /// const X: QueryId = QueryId::new("x");
    /// const SUM: QueryId = QueryId::new("sum");
    ///
    /// system.set_input(X, (), 5i64)?;
    /// let sum = system.query(SUM, (), |ctx, ()| Ok(ctx.input::<(), i64>(X, ())? * 2), &cancel)?;
    /// assert_eq!(sum, 10);
    /// ```
    pub fn query<K, V, F>(
        &self,
        query: QueryId,
        key: K,
        recompute: F,
        cancel: &CancellationToken,
    ) -> QueryResult<V>
    where
        K: CacheKey,
        V: QueryValue + PartialEq,
        F: Fn(&QueryContext<'_>, K) -> QueryResult<V> + Send + Sync + 'static,
    {
        let _entry = self.lock_entry_blocking()?;
        block_on(self.run(
            query,
            key,
            sync_recompute_fn(recompute),
            <V as PartialEq>::eq,
            cancel,
        ))
    }

    /// Evaluate a derived query whose recompute function is asynchronous.
    ///
    /// The function returns a boxed future borrowing the context:
    ///
    /// ```ignore
    /// system
    ///     .query_async(LEN, path, |ctx, path| {
    ///         async move {
    ///             let text: Arc<str> = ctx.input(SOURCE, path)?;
    ///             tokio::task::yield_now().await;
    ///             Ok(text.len())
    ///         }
    ///         .boxed()
    ///     }, &cancel)
    ///     .await?;
    /// ```
    pub async fn query_async<K, V, F>(
        &self,
        query: QueryId,
        key: K,
        recompute: F,
        cancel: &CancellationToken,
    ) -> QueryResult<V>
    where
        K: CacheKey,
        V: QueryValue + PartialEq,
        F: for<'a> Fn(QueryContext<'a>, K) -> BoxFuture<'a, QueryResult<V>>
            + Send
            + Sync
            + 'static,
    {
        let _entry = self.lock_entry().await;
        self.run(
            query,
            key,
            recompute_fn(recompute),
            <V as PartialEq>::eq,
            cancel,
        )
        .await
    }

    /// Evaluate a [`Query`].
    pub async fn get<Q: Query>(
        &self,
        key: Q::Key,
        cancel: &CancellationToken,
    ) -> QueryResult<Q::Value> {
        let _entry = self.lock_entry().await;
        self.run(Q::id(), key, query_recompute::<Q>(), Q::value_eq, cancel)
            .await
    }

    /// Evaluate a [`Query`], blocking the current thread until it completes.
    ///
    /// Returns `QueryError::Busy` while an async request is in flight.
    pub fn get_sync<Q: Query>(
        &self,
        key: Q::Key,
        cancel: &CancellationToken,
    ) -> QueryResult<Q::Value> {
        let _entry = self.lock_entry_blocking()?;
        block_on(self.run(Q::id(), key, query_recompute::<Q>(), Q::value_eq, cancel))
    }

    /// Runs a top-level request. The caller holds the entry lock.
    async fn run<K: CacheKey, V: QueryValue>(
        &self,
        query: QueryId,
        key: K,
        recompute: Arc<RecomputeFn<K, V>>,
        eq: EqFn<V>,
        cancel: &CancellationToken,
    ) -> QueryResult<V> {
        let derived = self
            .cache::<K, V>(query)?
            .get_or_create_derived(key, recompute, eq)?;
        derived.get_value(self, cancel).await
    }

    async fn lock_entry(&self) -> Entry<'_> {
        let lock = self.entry.lock().await;
        self.async_entry.store(true, Ordering::Release);
        Entry {
            system: self,
            is_async: true,
            _lock: lock,
        }
    }

    fn lock_entry_blocking(&self) -> QueryResult<Entry<'_>> {
        let lock = match self.entry.try_lock() {
            Some(lock) => lock,
            None if self.async_entry.load(Ordering::Acquire) => {
                debug!("blocking entry refused: async request in flight");
                return Err(QueryError::Busy);
            }
            // Held by another blocking caller, which never parks.
            None => block_on(self.entry.lock()),
        };
        Ok(Entry {
            system: self,
            is_async: false,
            _lock: lock,
        })
    }

    // ------------------------------------------------------------------------
    // Active stack
    // ------------------------------------------------------------------------

    /// Push `slot` on the active-computation stack.
    ///
    /// The returned guard pops it again when dropped.
    ///
    /// # Errors
    ///
    /// `QueryError::Cycle` if `slot` is already on the stack. The path lists
    /// the stack followed by `slot`.
    pub fn enter(&self, slot: SlotId) -> QueryResult<ActiveGuard<'_>> {
        let cycle = {
            let mut stack = self.active.lock();
            if stack.contains(&slot) {
                Some(stack.clone())
            } else {
                stack.push(slot);
                trace!(slot = slot.index(), depth = stack.len(), "enter");
                None
            }
        };

        match cycle {
            None => Ok(ActiveGuard::new(self, slot)),
            Some(stack) => {
                let path: Vec<String> = stack
                    .iter()
                    .chain(std::iter::once(&slot))
                    .map(|s| self.describe_or_index(*s))
                    .collect();
                debug!(path = %path.join(" -> "), "cycle detected");
                self.tracer.on_cycle_detected(&path);
                Err(QueryError::Cycle { path })
            }
        }
    }

    /// Remove the innermost occurrence of `slot` from the stack.
    pub(crate) fn leave(&self, slot: SlotId) {
        let mut stack = self.active.lock();
        if let Some(pos) = stack.iter().rposition(|s| *s == slot) {
            stack.remove(pos);
            trace!(slot = slot.index(), depth = stack.len(), "leave");
        }
    }

    /// Snapshot of the active-computation stack, outermost first.
    pub fn active_stack(&self) -> Vec<SlotId> {
        self.active.lock().clone()
    }

    // ------------------------------------------------------------------------
    // Introspection and eviction
    // ------------------------------------------------------------------------

    /// Diagnostic description of a slot.
    pub fn describe(&self, slot: SlotId) -> Option<SlotInfo> {
        self.slots.describe(slot)
    }

    fn describe_or_index(&self, slot: SlotId) -> String {
        match self.describe(slot) {
            Some(info) => info.to_string(),
            None => format!("#{}", slot.index()),
        }
    }

    /// Number of slots created so far, over all queries.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// `changed_at` of the slot for `(query, key)`, if it exists.
    pub fn changed_at<K: CacheKey>(&self, query: QueryId, key: &K) -> Option<Revision> {
        self.revisions_of(query, key).map(|(changed_at, _)| changed_at)
    }

    /// `verified_at` of the slot for `(query, key)`, if it exists.
    pub fn verified_at<K: CacheKey>(&self, query: QueryId, key: &K) -> Option<Revision> {
        self.revisions_of(query, key)
            .map(|(_, verified_at)| verified_at)
    }

    fn revisions_of<K: CacheKey>(&self, query: QueryId, key: &K) -> Option<(Revision, Revision)> {
        let cache = self.caches.lock().get(&query).cloned()?;
        cache.revisions(key)
    }

    /// Drop every derived value last verified before `before`.
    ///
    /// Inputs are kept. Returns the number of values dropped.
    ///
    /// # Errors
    ///
    /// `QueryError::Busy` if an async request is in flight; see
    /// [`clear_async`](Self::clear_async).
    pub fn clear(&self, before: Revision) -> QueryResult<usize> {
        let _entry = self.lock_entry_blocking()?;
        Ok(self.clear_caches(before))
    }

    /// Like [`clear`](Self::clear), waiting for any request in flight.
    pub async fn clear_async(&self, before: Revision) -> usize {
        let _entry = self.lock_entry().await;
        self.clear_caches(before)
    }

    fn clear_caches(&self, before: Revision) -> usize {
        let caches: Vec<_> = self.caches.lock().values().cloned().collect();
        let cleared = caches.iter().map(|cache| cache.clear(before)).sum();
        debug!(%before, cleared, "clear");
        cleared
    }
}

/// Entry lock held by a top-level request.
struct Entry<'a> {
    system: &'a DependencySystem,
    is_async: bool,
    _lock: EntryGuard<'a, ()>,
}

impl Drop for Entry<'_> {
    fn drop(&mut self) {
        // Runs before the lock field is released.
        if self.is_async {
            self.system.async_entry.store(false, Ordering::Release);
        }
    }
}

// ============================================================================
// QueryContext
// ============================================================================

/// Handle given to a running computation.
///
/// Every input or query read through the context is recorded as a dependency
/// of the computation. Nested queries must be awaited one after the other.
#[derive(Clone)]
pub struct QueryContext<'a> {
    system: &'a DependencySystem,
    cancel: CancellationToken,
    frame: Frame,
}

impl<'a> QueryContext<'a> {
    pub(crate) fn new(system: &'a DependencySystem, cancel: CancellationToken, frame: Frame) -> Self {
        Self {
            system,
            cancel,
            frame,
        }
    }

    /// Read an input and record it as a dependency.
    pub fn input<K: CacheKey, V: QueryValue>(&self, query: QueryId, key: K) -> QueryResult<V> {
        let input = self.system.cache::<K, V>(query)?.get_or_create_input(key)?;
        self.frame.record(input.clone());
        let value = input.get()?;
        self.cancel.check()?;
        Ok(value)
    }

    /// Typed variant of [`input`](Self::input).
    pub fn input_of<I: Input>(&self, key: I::Key) -> QueryResult<I::Value> {
        self.input(I::id(), key)
    }

    /// Evaluate a nested query with a synchronous recompute function.
    ///
    /// # Errors
    ///
    /// Besides the errors of the nested computation,
    /// `QueryError::Suspended` if the nested query has to wait on
    /// asynchronous work; use [`query_async`](Self::query_async) for those.
    pub fn query<K, V, F>(&self, query: QueryId, key: K, recompute: F) -> QueryResult<V>
    where
        K: CacheKey,
        V: QueryValue + PartialEq,
        F: Fn(&QueryContext<'_>, K) -> QueryResult<V> + Send + Sync + 'static,
    {
        let derived = self.derived(
            query,
            key,
            sync_recompute_fn(recompute),
            <V as PartialEq>::eq,
        )?;
        self.resolve_now(&derived)
    }

    /// Evaluate a nested query with an asynchronous recompute function.
    pub async fn query_async<K, V, F>(&self, query: QueryId, key: K, recompute: F) -> QueryResult<V>
    where
        K: CacheKey,
        V: QueryValue + PartialEq,
        F: for<'b> Fn(QueryContext<'b>, K) -> BoxFuture<'b, QueryResult<V>>
            + Send
            + Sync
            + 'static,
    {
        let derived = self.derived(query, key, recompute_fn(recompute), <V as PartialEq>::eq)?;
        self.resolve(&derived).await
    }

    /// Evaluate a nested [`Query`].
    pub async fn get<Q: Query>(&self, key: Q::Key) -> QueryResult<Q::Value> {
        let derived = self.derived(Q::id(), key, query_recompute::<Q>(), Q::value_eq)?;
        self.resolve(&derived).await
    }

    /// Evaluate a nested [`Query`] from synchronous code.
    ///
    /// # Errors
    ///
    /// `QueryError::Suspended` if the query has to wait on asynchronous work.
    pub fn get_sync<Q: Query>(&self, key: Q::Key) -> QueryResult<Q::Value> {
        let derived = self.derived(Q::id(), key, query_recompute::<Q>(), Q::value_eq)?;
        self.resolve_now(&derived)
    }

    /// Returns `Err(QueryError::Cancelled)` if the request was cancelled.
    pub fn check_cancelled(&self) -> QueryResult<()> {
        self.cancel.check()
    }

    /// The cancellation token of the current request.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The revision this computation observes.
    pub fn revision(&self) -> Revision {
        self.frame.started_at()
    }

    fn derived<K: CacheKey, V: QueryValue>(
        &self,
        query: QueryId,
        key: K,
        recompute: Arc<RecomputeFn<K, V>>,
        eq: EqFn<V>,
    ) -> QueryResult<Arc<DerivedValue<K, V>>> {
        let derived = self
            .system
            .cache::<K, V>(query)?
            .get_or_create_derived(key, recompute, eq)?;
        self.frame.record(derived.clone());
        Ok(derived)
    }

    async fn resolve<K: CacheKey, V: QueryValue>(
        &self,
        derived: &DerivedValue<K, V>,
    ) -> QueryResult<V> {
        let value = derived.get_value(self.system, &self.cancel).await?;
        self.cancel.check()?;
        Ok(value)
    }

    fn resolve_now<K: CacheKey, V: QueryValue>(
        &self,
        derived: &DerivedValue<K, V>,
    ) -> QueryResult<V> {
        let value = derived
            .get_value(self.system, &self.cancel)
            .now_or_never()
            .ok_or_else(|| QueryError::Suspended {
                query: derived.info().to_string(),
            })??;
        self.cancel.check()?;
        Ok(value)
    }
}

impl fmt::Debug for QueryContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("slot", &self.frame.slot())
            .field("revision", &self.frame.started_at())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`DependencySystem`] with customizable settings.
///
/// # Example
///
/// ```ignore
/// let collector = Arc::new(EventCollector::new());
/// let system = DependencySystem::builder()
///     .memoization(true)
///     .tracer(collector.clone())
///     .build();
/// ```
pub struct DependencySystemBuilder {
    memoization: bool,
    tracer: Arc<dyn Tracer>,
}

impl Default for DependencySystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencySystemBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            memoization: true,
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Enable or disable memoization.
    ///
    /// With memoization disabled nothing is cached: every `get_value` runs
    /// the recompute function. Cycle detection and cancellation still apply.
    pub fn memoization(mut self, enabled: bool) -> Self {
        self.memoization = enabled;
        self
    }

    /// Set the tracer receiving execution events.
    pub fn tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Build the system.
    pub fn build(self) -> DependencySystem {
        DependencySystem {
            revisions: RevisionCounter::default(),
            caches: Mutex::new(HashMap::default()),
            slots: Arc::new(SlotRegistry::default()),
            active: Mutex::new(Vec::new()),
            entry: EntryLock::new(()),
            async_entry: AtomicBool::new(false),
            memoize: self.memoization,
            tracer: self.tracer,
        }
    }
}
