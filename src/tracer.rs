//! Tracer trait for observing engine execution.
//!
//! The engine logs through `tracing` unconditionally; a [`Tracer`] is the
//! programmatic hook on top of that, for tests and custom tooling. The default
//! [`NoopTracer`] discards everything.
//!
//! # Example
//!
//! ```ignore
//! use revquery::{DependencySystem, EventCollector, TraceEvent};
//! use std::sync::Arc;
//!
//! let collector = Arc::new(EventCollector::new());
//! let system = DependencySystem::builder().tracer(collector.clone()).build();
//! // ... run queries ...
//! for event in collector.events() {
//!     println!("{:?}", event);
//! }
//! ```

use parking_lot::Mutex;

use crate::{QueryError, Revision, SlotInfo};

/// How a `get_value` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The value was recomputed and differs from the previous one.
    Changed,
    /// The value was recomputed but equals the previous one (early cutoff).
    Unchanged,
    /// The value was already verified at the current revision.
    CacheHit,
    /// The dependencies were unchanged; the cached value was reused.
    Revalidated,
    /// The computation was part of a dependency cycle.
    CycleDetected,
    /// The computation observed a cancellation request.
    Cancelled,
    /// The computation failed.
    Error {
        /// Rendered error.
        message: String,
    },
}

impl ExecutionResult {
    pub(crate) fn from_error(err: &QueryError) -> Self {
        match err {
            QueryError::Cycle { .. } => ExecutionResult::CycleDetected,
            QueryError::Cancelled => ExecutionResult::Cancelled,
            other => ExecutionResult::Error {
                message: other.to_string(),
            },
        }
    }
}

/// Observer of engine execution.
///
/// All methods have empty default implementations.
pub trait Tracer: Send + Sync + 'static {
    /// Called after an input was written.
    #[inline]
    fn on_input_set(&self, _slot: &SlotInfo, _revision: Revision) {}

    /// Called when a derived value starts revalidating or recomputing.
    #[inline]
    fn on_query_start(&self, _slot: &SlotInfo, _revision: Revision) {}

    /// Called when a `get_value` call on a derived value ends.
    #[inline]
    fn on_query_end(&self, _slot: &SlotInfo, _result: &ExecutionResult) {}

    /// Called when entering a value would close a dependency cycle.
    #[inline]
    fn on_cycle_detected(&self, _path: &[String]) {}
}

/// Tracer that discards all events.
///
/// This is the default tracer for [`DependencySystem`](crate::DependencySystem).
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// An event recorded by [`EventCollector`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// An input was written.
    InputSet {
        /// `query(key)` of the input.
        slot: String,
        /// Revision issued for the write.
        revision: Revision,
    },
    /// A derived value started revalidating or recomputing.
    QueryStart {
        /// `query(key)` of the value.
        slot: String,
        /// Current revision.
        revision: Revision,
    },
    /// A derived value finished.
    QueryEnd {
        /// `query(key)` of the value.
        slot: String,
        /// Outcome.
        result: ExecutionResult,
    },
    /// A cycle was detected.
    CycleDetected {
        /// Active stack followed by the re-entered value.
        path: Vec<String>,
    },
}

/// Tracer that records every event in memory.
#[derive(Default)]
pub struct EventCollector {
    events: Mutex<Vec<TraceEvent>>,
}

impl EventCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events recorded so far.
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// Remove and return the recorded events.
    pub fn take(&self) -> Vec<TraceEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Outcomes recorded for one slot, rendered as `query(key)`.
    pub fn results_for(&self, slot: &str) -> Vec<ExecutionResult> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                TraceEvent::QueryEnd { slot: s, result } if s == slot => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}

impl Tracer for EventCollector {
    fn on_input_set(&self, slot: &SlotInfo, revision: Revision) {
        self.push(TraceEvent::InputSet {
            slot: slot.to_string(),
            revision,
        });
    }

    fn on_query_start(&self, slot: &SlotInfo, revision: Revision) {
        self.push(TraceEvent::QueryStart {
            slot: slot.to_string(),
            revision,
        });
    }

    fn on_query_end(&self, slot: &SlotInfo, result: &ExecutionResult) {
        self.push(TraceEvent::QueryEnd {
            slot: slot.to_string(),
            result: result.clone(),
        });
    }

    fn on_cycle_detected(&self, path: &[String]) {
        self.push(TraceEvent::CycleDetected {
            path: path.to_vec(),
        });
    }
}
