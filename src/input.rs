//! Input values: leaves of the dependency graph, written directly by callers.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    CancellationToken, DependencySystem, DependencyValue, QueryError, QueryResult, QueryValue,
    Revision, SlotId, SlotInfo,
};

/// A leaf value set by the caller rather than computed.
///
/// `verified_at` is always equal to `changed_at`: an input is only verified by
/// being (re)set, and every set issues a new revision, even when the new
/// content equals the old one.
pub struct InputValue<V> {
    slot: SlotId,
    info: SlotInfo,
    state: Mutex<InputState<V>>,
}

struct InputState<V> {
    value: Option<V>,
    changed_at: Revision,
}

impl<V: QueryValue> InputValue<V> {
    pub(crate) fn new(slot: SlotId, info: SlotInfo) -> Self {
        Self {
            slot,
            info,
            state: Mutex::new(InputState {
                value: None,
                changed_at: Revision::NONE,
            }),
        }
    }

    /// Returns a clone of the stored value.
    ///
    /// # Errors
    ///
    /// `QueryError::UnsetInput` if the input was never written.
    pub fn get(&self) -> QueryResult<V> {
        self.state
            .lock()
            .value
            .clone()
            .ok_or_else(|| self.unset_error())
    }

    /// Returns true once a value has been written.
    pub fn is_set(&self) -> bool {
        self.state.lock().value.is_some()
    }

    /// Diagnostic description of this slot.
    pub fn info(&self) -> &SlotInfo {
        &self.info
    }

    /// Store `value` and stamp it with a freshly issued revision.
    pub(crate) fn set(&self, system: &DependencySystem, value: V) -> Revision {
        let revision = system.next_revision();
        {
            let mut state = self.state.lock();
            state.value = Some(value);
            state.changed_at = revision;
        }
        debug!(slot = %self.info, %revision, "input set");
        system.tracer().on_input_set(&self.info, revision);
        revision
    }

    fn unset_error(&self) -> QueryError {
        QueryError::UnsetInput {
            query: self.info.query.as_str(),
            key: self.info.key.clone(),
        }
    }
}

#[async_trait]
impl<V: QueryValue> DependencyValue for InputValue<V> {
    fn slot(&self) -> SlotId {
        self.slot
    }

    fn changed_at(&self) -> Revision {
        self.state.lock().changed_at
    }

    fn verified_at(&self) -> Revision {
        self.changed_at()
    }

    async fn touch(
        &self,
        _system: &DependencySystem,
        _cancel: &CancellationToken,
    ) -> QueryResult<Revision> {
        // An unset input stays at `NONE` until written. A reader that
        // recovered from `UnsetInput` is still valid until then.
        Ok(self.changed_at())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QueryId;

    #[test]
    fn test_unset_input_fails() {
        let system = DependencySystem::new();
        let cache = system.cache::<&'static str, i64>(QueryId::new("x")).unwrap();
        let input = cache.get_or_create_input("x").unwrap();

        assert!(!input.is_set());
        assert_eq!(input.changed_at(), Revision::NONE);
        match input.get() {
            Err(QueryError::UnsetInput { query, key }) => {
                assert_eq!(query, "x");
                assert_eq!(key, "\"x\"");
            }
            other => panic!("expected UnsetInput, got {:?}", other),
        }
    }

    #[test]
    fn test_touching_unset_input_is_not_an_error() {
        let system = DependencySystem::new();
        let cache = system.cache::<u8, i64>(QueryId::new("opt")).unwrap();
        let input = cache.get_or_create_input(0).unwrap();
        let cancel = CancellationToken::new();

        let touched = futures::executor::block_on(input.touch(&system, &cancel)).unwrap();
        assert_eq!(touched, Revision::NONE);

        let revision = input.set(&system, 4);
        let touched = futures::executor::block_on(input.touch(&system, &cancel)).unwrap();
        assert_eq!(touched, revision);
    }

    #[test]
    fn test_set_always_bumps_revision() {
        let system = DependencySystem::new();
        let cache = system.cache::<&'static str, i64>(QueryId::new("x")).unwrap();
        let input = cache.get_or_create_input("x").unwrap();

        let r1 = input.set(&system, 1);
        assert_eq!(input.get().unwrap(), 1);
        assert_eq!(input.changed_at(), r1);
        assert_eq!(input.verified_at(), r1);

        // Same content, still a new revision.
        let r2 = input.set(&system, 1);
        assert!(r2 > r1);
        assert_eq!(input.changed_at(), r2);
        assert_eq!(system.current_revision(), r2);
    }
}
