//! Error types for query execution.

use std::sync::Arc;

/// Result type returned by every fallible engine operation.
pub type QueryResult<T> = Result<T, QueryError>;

/// Errors surfaced by the dependency system.
///
/// System errors (cycles, cancellation, unset inputs) and domain failures
/// raised by recompute functions share this type so that computations can
/// propagate any of them with `?`. None of them is ever memoized: a failing
/// `get_value` leaves the cached state exactly as it was.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    /// An input value was read before it was ever written.
    #[error("input {query}({key}) was read before it was set")]
    UnsetInput {
        /// Query identity of the input.
        query: &'static str,
        /// Debug representation of the input key.
        key: String,
    },

    /// Dependency cycle detected.
    ///
    /// The `path` contains the active computation stack at the time of
    /// detection followed by the value that was entered again.
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    Cycle {
        /// Debug representation of the values forming the cycle.
        path: Vec<String>,
    },

    /// Query execution was cancelled.
    #[error("query cancelled")]
    Cancelled,

    /// A synchronous caller reached a computation that has to wait.
    ///
    /// Use the `*_async` entry points for queries that await external work.
    #[error("query {query} suspended: it must be awaited through the async API")]
    Suspended {
        /// Debug representation of the query that could not complete.
        query: String,
    },

    /// A blocking entry point was called while an async request holds the
    /// system.
    #[error("dependency system is busy with an async request; use the async entry points")]
    Busy,

    /// The same query identity was used with different key/value types, or
    /// both as an input and as a derived query.
    #[error("query {query} was accessed with a different kind or type than it was created with")]
    KindMismatch {
        /// Query identity.
        query: &'static str,
    },

    /// A recompute function failed with a domain error.
    ///
    /// Any `anyhow::Error` converts into this variant, so computations can
    /// use `?` together with `anyhow::Context`.
    #[error("computation failed: {0}")]
    ComputationFailed(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for QueryError {
    fn from(err: anyhow::Error) -> Self {
        QueryError::ComputationFailed(Arc::new(err))
    }
}

impl QueryError {
    /// Wrap any error type as a domain failure.
    pub fn failed<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        QueryError::ComputationFailed(Arc::new(anyhow::Error::new(err)))
    }

    /// Returns a reference to the domain failure if this is `ComputationFailed`.
    pub fn failure(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            QueryError::ComputationFailed(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the domain failure to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.failure().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if this is a domain failure containing an error of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }

    /// Returns `true` for [`QueryError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled)
    }

    /// Returns `true` for [`QueryError::Cycle`].
    pub fn is_cycle(&self) -> bool {
        matches!(self, QueryError::Cycle { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("bad token at {0}")]
    struct BadToken(usize);

    #[test]
    fn test_anyhow_conversion() {
        let err: QueryError = anyhow::anyhow!("something went wrong").into();
        assert!(matches!(err, QueryError::ComputationFailed(_)));
        assert!(err.to_string().contains("something went wrong"));
    }

    #[test]
    fn test_downcast() {
        let err = QueryError::failed(BadToken(3));
        assert!(err.is::<BadToken>());
        assert_eq!(err.downcast_ref::<BadToken>().map(|e| e.0), Some(3));
        assert!(!QueryError::Cancelled.is::<BadToken>());
    }

    #[test]
    fn test_cycle_display() {
        let err = QueryError::Cycle {
            path: vec!["a(1)".into(), "b(1)".into(), "a(1)".into()],
        };
        assert!(err.is_cycle());
        assert_eq!(err.to_string(), "dependency cycle detected: a(1) -> b(1) -> a(1)");
    }
}
