use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{CancellationToken, DependencySystem, QueryResult, Revision, SlotId};

/// Contract shared by every cached slot, input or derived.
///
/// The typed value is obtained through the concrete types
/// ([`InputValue::get`](crate::InputValue::get),
/// [`DerivedValue::get_value`](crate::DerivedValue::get_value)); this trait is
/// the type-erased view a derived value keeps of the slots it read, which is
/// all the revalidation algorithm needs.
#[async_trait]
pub trait DependencyValue: Send + Sync {
    /// Identity of this slot in the owning system.
    fn slot(&self) -> SlotId;

    /// Revision at which the stored value last actually changed.
    fn changed_at(&self) -> Revision;

    /// Revision up to which the stored value is known to be valid.
    fn verified_at(&self) -> Revision;

    /// Bring the value up to date at the system's current revision and return
    /// its (possibly unchanged) `changed_at`.
    ///
    /// For a derived value this runs the full revalidation algorithm,
    /// recomputing if needed.
    async fn touch(
        &self,
        system: &DependencySystem,
        cancel: &CancellationToken,
    ) -> QueryResult<Revision>;
}

/// Ordered list of the values a derived value read during its last successful
/// computation.
///
/// Clone is cheap as the list is wrapped by `Arc`.
#[derive(Clone, Default)]
pub struct Dependencies(Arc<Vec<Arc<dyn DependencyValue>>>);

impl Dependencies {
    /// New dependencies from a list of handles.
    pub fn new(values: Vec<Arc<dyn DependencyValue>>) -> Self {
        Dependencies(Arc::new(values))
    }

    /// Returns true if there are no dependencies.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the number of dependencies.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate over the dependencies in read order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DependencyValue>> + '_ {
        self.0.iter()
    }

    /// Slot identities of the dependencies, in read order.
    pub fn slots(&self) -> Vec<SlotId> {
        self.0.iter().map(|d| d.slot()).collect()
    }
}

impl FromIterator<Arc<dyn DependencyValue>> for Dependencies {
    fn from_iter<T: IntoIterator<Item = Arc<dyn DependencyValue>>>(iter: T) -> Self {
        Dependencies(Arc::new(iter.into_iter().collect()))
    }
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter().map(|d| d.slot())).finish()
    }
}
