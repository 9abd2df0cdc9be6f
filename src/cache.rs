//! Per-query caches and the slot registry.

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use ahash::RandomState;
use parking_lot::Mutex;
use slab::Slab;
use tracing::trace;

use crate::derived::{EqFn, RecomputeFn};
use crate::{
    CacheKey, DependencyValue, DerivedValue, InputValue, QueryError, QueryId, QueryResult,
    QueryValue, Revision, SlotId, SlotInfo, SlotKind,
};

/// Assigns a [`SlotId`] to every slot created in a system and keeps its
/// diagnostic description.
#[derive(Default)]
pub(crate) struct SlotRegistry {
    slots: Mutex<Slab<SlotInfo>>,
}

impl SlotRegistry {
    pub(crate) fn register(&self, info: SlotInfo) -> SlotId {
        SlotId(self.slots.lock().insert(info))
    }

    pub(crate) fn describe(&self, slot: SlotId) -> Option<SlotInfo> {
        self.slots.lock().get(slot.0).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

enum CacheEntry<K, V> {
    Input(Arc<InputValue<V>>),
    Derived(Arc<DerivedValue<K, V>>),
}

/// All slots of one query, keyed by argument.
///
/// Each key maps to exactly one slot, created on first use. A key is either an
/// input or a derived value, never both.
pub struct QueryCache<K, V> {
    query: QueryId,
    slots: Arc<SlotRegistry>,
    entries: Mutex<HashMap<K, CacheEntry<K, V>, RandomState>>,
}

impl<K: CacheKey, V: QueryValue> QueryCache<K, V> {
    pub(crate) fn new(query: QueryId, slots: Arc<SlotRegistry>) -> Self {
        Self {
            query,
            slots,
            entries: Mutex::new(HashMap::default()),
        }
    }

    /// Identity of the query this cache belongs to.
    pub fn query(&self) -> QueryId {
        self.query
    }

    /// Returns the input slot for `key`, creating an unset one if needed.
    ///
    /// # Errors
    ///
    /// `QueryError::KindMismatch` if `key` already holds a derived value.
    pub fn get_or_create_input(&self, key: K) -> QueryResult<Arc<InputValue<V>>> {
        match self.entries.lock().entry(key) {
            Entry::Occupied(entry) => match entry.get() {
                CacheEntry::Input(input) => Ok(input.clone()),
                CacheEntry::Derived(_) => Err(self.mismatch()),
            },
            Entry::Vacant(entry) => {
                let info = SlotInfo::new(self.query, entry.key(), SlotKind::Input);
                let slot = self.slots.register(info.clone());
                trace!(slot = slot.index(), %info, "new input slot");
                let input = Arc::new(InputValue::new(slot, info));
                entry.insert(CacheEntry::Input(input.clone()));
                Ok(input)
            }
        }
    }

    /// Returns the derived slot for `key`, creating it with `recompute` and
    /// `eq` if needed.
    ///
    /// An existing slot keeps the functions it was created with.
    ///
    /// # Errors
    ///
    /// `QueryError::KindMismatch` if `key` already holds an input.
    pub fn get_or_create_derived(
        &self,
        key: K,
        recompute: Arc<RecomputeFn<K, V>>,
        eq: EqFn<V>,
    ) -> QueryResult<Arc<DerivedValue<K, V>>> {
        match self.entries.lock().entry(key) {
            Entry::Occupied(entry) => match entry.get() {
                CacheEntry::Derived(derived) => Ok(derived.clone()),
                CacheEntry::Input(_) => Err(self.mismatch()),
            },
            Entry::Vacant(entry) => {
                let info = SlotInfo::new(self.query, entry.key(), SlotKind::Derived);
                let slot = self.slots.register(info.clone());
                trace!(slot = slot.index(), %info, "new derived slot");
                let derived = Arc::new(DerivedValue::new(
                    slot,
                    info,
                    entry.key().clone(),
                    recompute,
                    eq,
                ));
                entry.insert(CacheEntry::Derived(derived.clone()));
                Ok(derived)
            }
        }
    }

    /// Existing input slot for `key`, if any.
    pub fn input(&self, key: &K) -> Option<Arc<InputValue<V>>> {
        match self.entries.lock().get(key)? {
            CacheEntry::Input(input) => Some(input.clone()),
            CacheEntry::Derived(_) => None,
        }
    }

    /// Existing derived slot for `key`, if any.
    pub fn derived(&self, key: &K) -> Option<Arc<DerivedValue<K, V>>> {
        match self.entries.lock().get(key)? {
            CacheEntry::Derived(derived) => Some(derived.clone()),
            CacheEntry::Input(_) => None,
        }
    }

    /// Number of slots in this cache.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if no slot was created yet.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop derived values last verified before `before`; inputs are kept.
    ///
    /// Returns the number of values dropped.
    pub fn clear(&self, before: Revision) -> usize {
        let derived: Vec<_> = self
            .entries
            .lock()
            .values()
            .filter_map(|entry| match entry {
                CacheEntry::Derived(derived) => Some(derived.clone()),
                CacheEntry::Input(_) => None,
            })
            .collect();
        derived.iter().filter(|d| d.clear(before)).count()
    }

    fn mismatch(&self) -> QueryError {
        QueryError::KindMismatch {
            query: self.query.as_str(),
        }
    }
}

/// Type-erased view of a [`QueryCache`] held by the system.
pub(crate) trait ErasedCache: Send + Sync {
    fn clear(&self, before: Revision) -> usize;

    /// `(changed_at, verified_at)` of the slot for `key`, if it exists and
    /// `key` has this cache's key type.
    fn revisions(&self, key: &dyn Any) -> Option<(Revision, Revision)>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<K: CacheKey, V: QueryValue> ErasedCache for QueryCache<K, V> {
    fn clear(&self, before: Revision) -> usize {
        QueryCache::clear(self, before)
    }

    fn revisions(&self, key: &dyn Any) -> Option<(Revision, Revision)> {
        let key = key.downcast_ref::<K>()?;
        let entries = self.entries.lock();
        let value: &dyn DependencyValue = match entries.get(key)? {
            CacheEntry::Input(input) => &**input,
            CacheEntry::Derived(derived) => &**derived,
        };
        Some((value.changed_at(), value.verified_at()))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
