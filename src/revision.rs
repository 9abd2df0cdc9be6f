//! Revision type: the unit of "time" in the dependency system.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Revision is a monotonically increasing logical timestamp issued by a
/// [`DependencySystem`](crate::DependencySystem).
///
/// Revisions are totally ordered. They are only ever created by the system's
/// counter, so two revisions from the same system can always be compared to
/// decide which event happened first.
///
/// # Examples
///
/// ```
/// # use revquery::Revision;
/// assert!(Revision::NONE < Revision::START);
/// assert!(Revision::START < Revision::START.next());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Revision(u64);

impl Revision {
    /// Sentinel meaning "never computed" / "never written".
    pub const NONE: Revision = Revision(0);

    /// The revision a fresh system starts at.
    pub const START: Revision = Revision(1);

    /// Returns the revision that follows this one.
    #[inline]
    pub const fn next(self) -> Revision {
        Revision(self.0 + 1)
    }

    /// Returns true if this is [`Revision::NONE`].
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Raw counter value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Atomic revision counter owned by the system.
///
/// Only [`RevisionCounter::increment`] moves time forward.
#[derive(Debug)]
pub(crate) struct RevisionCounter {
    current: AtomicU64,
}

impl Default for RevisionCounter {
    fn default() -> Self {
        Self {
            current: AtomicU64::new(Revision::START.0),
        }
    }
}

impl RevisionCounter {
    /// Current revision.
    #[inline]
    pub(crate) fn current(&self) -> Revision {
        Revision(self.current.load(Ordering::Acquire))
    }

    /// Issue a new revision, strictly greater than every revision issued before.
    pub(crate) fn increment(&self) -> Revision {
        Revision(self.current.fetch_add(1, Ordering::AcqRel) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_ordering() {
        assert!(Revision::NONE.is_none());
        assert!(!Revision::START.is_none());
        assert!(Revision::NONE < Revision::START);
        assert_eq!(Revision::START.next().as_u64(), 2);
        assert_eq!(Revision::START.to_string(), "R1");
    }

    #[test]
    fn test_counter_strictly_increases() {
        let counter = RevisionCounter::default();
        assert_eq!(counter.current(), Revision::START);

        let r2 = counter.increment();
        let r3 = counter.increment();
        assert!(r2 > Revision::START);
        assert!(r3 > r2);
        assert_eq!(counter.current(), r3);
    }
}
