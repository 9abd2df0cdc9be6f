//! Derived values: memoized computations with red-green revalidation.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::frame::Frame;
use crate::tracer::ExecutionResult;
use crate::{
    CacheKey, CancellationToken, Dependencies, DependencySystem, DependencyValue, QueryContext,
    QueryError, QueryResult, QueryValue, Revision, SlotId, SlotInfo,
};

/// Type-erased recompute function of a derived query.
///
/// It receives the tracking context of the running computation and the
/// argument key, and returns a boxed future borrowing the context.
pub type RecomputeFn<K, V> =
    dyn for<'a> Fn(QueryContext<'a>, K) -> BoxFuture<'a, QueryResult<V>> + Send + Sync;

/// Equality used for early termination: returns true if the newly computed
/// value is the same as the cached one.
pub type EqFn<V> = fn(old: &V, new: &V) -> bool;

/// A memoized computation keyed by one argument.
pub struct DerivedValue<K, V> {
    slot: SlotId,
    info: SlotInfo,
    key: K,
    recompute: Arc<RecomputeFn<K, V>>,
    eq: EqFn<V>,
    state: Mutex<DerivedState<V>>,
}

struct DerivedState<V> {
    cached: Option<V>,
    changed_at: Revision,
    verified_at: Revision,
    deps: Dependencies,
}

impl<V> Default for DerivedState<V> {
    fn default() -> Self {
        Self {
            cached: None,
            changed_at: Revision::NONE,
            verified_at: Revision::NONE,
            deps: Dependencies::default(),
        }
    }
}

/// Erase an async recompute closure into a [`RecomputeFn`].
///
/// The higher-ranked bound lets closures of the form
/// `|ctx, key| async move { .. }.boxed()` borrow the context they are given.
pub fn recompute_fn<K, V, F>(f: F) -> Arc<RecomputeFn<K, V>>
where
    F: for<'a> Fn(QueryContext<'a>, K) -> BoxFuture<'a, QueryResult<V>> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Erase a synchronous recompute closure into a [`RecomputeFn`].
///
/// The closure runs when the function is invoked; the returned future is
/// already complete.
pub fn sync_recompute_fn<K, V, F>(f: F) -> Arc<RecomputeFn<K, V>>
where
    K: CacheKey,
    V: QueryValue,
    F: Fn(&QueryContext<'_>, K) -> QueryResult<V> + Send + Sync + 'static,
{
    recompute_fn(move |ctx, key| future::ready(f(&ctx, key)).boxed())
}

/// Snapshot of the state taken under the lock, so no guard lives across an await.
enum Observed<V> {
    Unset,
    Fresh { value: V, changed_at: Revision },
    Stale { verified_at: Revision, deps: Dependencies },
}

impl<K: CacheKey, V: QueryValue> DerivedValue<K, V> {
    pub(crate) fn new(
        slot: SlotId,
        info: SlotInfo,
        key: K,
        recompute: Arc<RecomputeFn<K, V>>,
        eq: EqFn<V>,
    ) -> Self {
        Self {
            slot,
            info,
            key,
            recompute,
            eq,
            state: Mutex::new(DerivedState::default()),
        }
    }

    /// The argument this value is computed for.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Diagnostic description of this slot.
    pub fn info(&self) -> &SlotInfo {
        &self.info
    }

    /// Returns a clone of the cached value without validating it.
    pub fn peek(&self) -> Option<V> {
        self.state.lock().cached.clone()
    }

    /// Dependencies recorded by the last successful computation.
    pub fn dependencies(&self) -> Dependencies {
        self.state.lock().deps.clone()
    }

    /// Returns the value, valid at the system's current revision.
    ///
    /// A value verified at the current revision is returned as is. Otherwise
    /// its recorded dependencies are brought up to date in order; if none of
    /// them changed after the last verification the cached value is reused,
    /// else the recompute function runs again.
    ///
    /// # Errors
    ///
    /// Cycles, cancellation, unset inputs and domain failures are returned
    /// without touching the cached state.
    pub async fn get_value(
        &self,
        system: &DependencySystem,
        cancel: &CancellationToken,
    ) -> QueryResult<V> {
        self.fetch(system, cancel).await.map(|(value, _)| value)
    }

    /// Drop the cached value if it was last verified before `before`.
    ///
    /// Returns true if a value was dropped.
    pub fn clear(&self, before: Revision) -> bool {
        let mut state = self.state.lock();
        if state.cached.is_some() && state.verified_at < before {
            *state = DerivedState::default();
            true
        } else {
            false
        }
    }

    async fn fetch(
        &self,
        system: &DependencySystem,
        cancel: &CancellationToken,
    ) -> QueryResult<(V, Revision)> {
        if !system.memoization_enabled() {
            return self.execute_uncached(system, cancel).await;
        }

        let revision = system.current_revision();
        let stale = match self.observe(revision) {
            Observed::Fresh { value, changed_at } => {
                trace!(slot = %self.info, %revision, "cache hit");
                system
                    .tracer()
                    .on_query_end(&self.info, &ExecutionResult::CacheHit);
                return Ok((value, changed_at));
            }
            Observed::Stale { verified_at, deps } => Some((verified_at, deps)),
            Observed::Unset => None,
        };

        let _guard = system.enter(self.slot)?;
        system.tracer().on_query_start(&self.info, revision);

        if let Some((verified_at, deps)) = stale {
            let unchanged = self
                .deps_unchanged(system, cancel, verified_at, &deps)
                .await
                .map_err(|err| self.report_error(system, err))?;
            if unchanged {
                if let Some(hit) = self.mark_verified(revision) {
                    debug!(slot = %self.info, %revision, "revalidated");
                    system
                        .tracer()
                        .on_query_end(&self.info, &ExecutionResult::Revalidated);
                    return Ok(hit);
                }
            }
        }

        self.execute(system, cancel, revision)
            .await
            .map_err(|err| self.report_error(system, err))
    }

    fn observe(&self, revision: Revision) -> Observed<V> {
        let state = self.state.lock();
        match &state.cached {
            None => Observed::Unset,
            Some(value) if state.verified_at == revision => Observed::Fresh {
                value: value.clone(),
                changed_at: state.changed_at,
            },
            Some(_) => Observed::Stale {
                verified_at: state.verified_at,
                deps: state.deps.clone(),
            },
        }
    }

    /// Walk the recorded dependencies in order, stopping at the first one that
    /// changed after `verified_at`.
    async fn deps_unchanged(
        &self,
        system: &DependencySystem,
        cancel: &CancellationToken,
        verified_at: Revision,
        deps: &Dependencies,
    ) -> QueryResult<bool> {
        for dep in deps.iter() {
            let changed_at = dep.touch(system, cancel).await?;
            cancel.check()?;
            if changed_at > verified_at {
                trace!(
                    slot = %self.info,
                    dep = dep.slot().index(),
                    %changed_at,
                    %verified_at,
                    "dependency changed"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn mark_verified(&self, revision: Revision) -> Option<(V, Revision)> {
        let mut state = self.state.lock();
        let value = state.cached.clone()?;
        state.verified_at = revision;
        Some((value, state.changed_at))
    }

    async fn execute(
        &self,
        system: &DependencySystem,
        cancel: &CancellationToken,
        revision: Revision,
    ) -> QueryResult<(V, Revision)> {
        cancel.check()?;
        debug!(slot = %self.info, %revision, "recompute");

        let frame = Frame::new(self.slot, revision);
        let ctx = QueryContext::new(system, cancel.clone(), frame.clone());
        let value = (self.recompute)(ctx, self.key.clone()).await?;
        let deps = frame.take_deps();

        // A cancelled computation may have observed partial work.
        cancel.check()?;

        let (changed_at, changed) = self.commit(value.clone(), revision, deps);
        let result = if changed {
            ExecutionResult::Changed
        } else {
            debug!(slot = %self.info, %changed_at, "early cutoff");
            ExecutionResult::Unchanged
        };
        system.tracer().on_query_end(&self.info, &result);
        Ok((value, changed_at))
    }

    fn commit(&self, value: V, revision: Revision, deps: Dependencies) -> (Revision, bool) {
        let mut state = self.state.lock();
        let unchanged = state
            .cached
            .as_ref()
            .is_some_and(|old| (self.eq)(old, &value));
        if !unchanged {
            state.changed_at = revision;
        }
        state.cached = Some(value);
        state.verified_at = revision;
        state.deps = deps;
        (state.changed_at, !unchanged)
    }

    async fn execute_uncached(
        &self,
        system: &DependencySystem,
        cancel: &CancellationToken,
    ) -> QueryResult<(V, Revision)> {
        let revision = system.current_revision();
        let _guard = system.enter(self.slot)?;
        cancel.check()?;
        trace!(slot = %self.info, %revision, "compute without memoization");

        let frame = Frame::new(self.slot, revision);
        let ctx = QueryContext::new(system, cancel.clone(), frame);
        let value = (self.recompute)(ctx, self.key.clone())
            .await
            .map_err(|err| self.report_error(system, err))?;
        cancel.check()?;
        system
            .tracer()
            .on_query_end(&self.info, &ExecutionResult::Changed);
        Ok((value, revision))
    }

    fn report_error(&self, system: &DependencySystem, err: QueryError) -> QueryError {
        debug!(slot = %self.info, error = %err, "query failed");
        system
            .tracer()
            .on_query_end(&self.info, &ExecutionResult::from_error(&err));
        err
    }
}

#[async_trait]
impl<K: CacheKey, V: QueryValue> DependencyValue for DerivedValue<K, V> {
    fn slot(&self) -> SlotId {
        self.slot
    }

    fn changed_at(&self) -> Revision {
        self.state.lock().changed_at
    }

    fn verified_at(&self) -> Revision {
        self.state.lock().verified_at
    }

    async fn touch(
        &self,
        system: &DependencySystem,
        cancel: &CancellationToken,
    ) -> QueryResult<Revision> {
        self.fetch(system, cancel)
            .await
            .map(|(_, changed_at)| changed_at)
    }
}
