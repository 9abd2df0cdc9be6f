//! Computation frames: dependency recording and the active-stack guard.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::{Dependencies, DependencySystem, DependencyValue, Revision, SlotId};

/// A cheap, clonable handle for one running computation.
///
/// Every value read through the computation's [`QueryContext`](crate::QueryContext)
/// is recorded here, in read order.
#[derive(Clone)]
pub(crate) struct Frame(Arc<FrameInner>);

struct FrameInner {
    slot: SlotId,
    started_at: Revision,
    deps: Mutex<Recorded>,
}

#[derive(Default)]
struct Recorded {
    order: Vec<Arc<dyn DependencyValue>>,
    seen: HashSet<SlotId, ahash::RandomState>,
}

impl Frame {
    pub(crate) fn new(slot: SlotId, started_at: Revision) -> Self {
        Self(Arc::new(FrameInner {
            slot,
            started_at,
            deps: Mutex::new(Recorded::default()),
        }))
    }

    /// The slot being computed.
    pub(crate) fn slot(&self) -> SlotId {
        self.0.slot
    }

    /// The revision at which the computation started.
    pub(crate) fn started_at(&self) -> Revision {
        self.0.started_at
    }

    /// Record a dependency; repeated reads of the same slot are kept once.
    pub(crate) fn record(&self, dep: Arc<dyn DependencyValue>) {
        let mut deps = self.0.deps.lock();
        let slot = dep.slot();
        if deps.seen.insert(slot) {
            trace!(frame = self.0.slot.0, dep = slot.0, "record dep");
            deps.order.push(dep);
        }
    }

    /// Drain the recorded dependency list.
    pub(crate) fn take_deps(&self) -> Dependencies {
        let recorded = std::mem::take(&mut *self.0.deps.lock());
        Dependencies::new(recorded.order)
    }
}

/// Guard that leaves the active stack when dropped.
///
/// Returned by [`DependencySystem::enter`]. Dropping the guard is the only
/// way to leave, so the stack stays balanced on error, cancellation and when
/// a query future is dropped mid-computation.
#[must_use = "dropping the guard immediately leaves the active stack"]
pub struct ActiveGuard<'a> {
    system: &'a DependencySystem,
    slot: SlotId,
}

impl<'a> ActiveGuard<'a> {
    pub(crate) fn new(system: &'a DependencySystem, slot: SlotId) -> Self {
        Self { system, slot }
    }

    /// The slot this guard keeps on the stack.
    pub fn slot(&self) -> SlotId {
        self.slot
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.system.leave(self.slot);
    }
}
