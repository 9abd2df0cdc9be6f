#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod cache;
mod cancel;
mod derived;
mod error;
mod frame;
mod input;
mod key;
mod node;
pub mod output_eq;
mod query;
mod revision;
mod runtime;
mod tracer;

pub use cache::QueryCache;
pub use cancel::CancellationToken;
pub use derived::{recompute_fn, sync_recompute_fn, DerivedValue, EqFn, RecomputeFn};
pub use error::{QueryError, QueryResult};
pub use frame::ActiveGuard;
pub use input::InputValue;
pub use key::{CacheKey, QueryId, QueryValue, SlotId, SlotInfo, SlotKind};
pub use node::{Dependencies, DependencyValue};
pub use query::{Input, Query};
pub use revision::Revision;
pub use runtime::{DependencySystem, DependencySystemBuilder, QueryContext};
pub use tracer::{EventCollector, ExecutionResult, NoopTracer, TraceEvent, Tracer};

/// Re-exported so recompute functions can box their futures without a direct
/// dependency on `futures`.
pub use futures::future::{BoxFuture, FutureExt};

/// Re-exported for implementing [`Query`].
pub use async_trait::async_trait;
