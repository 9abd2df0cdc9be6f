//! Equality functions for early termination.
//!
//! A [`Query`](crate::Query) decides through `value_eq` whether a recomputed
//! value counts as unchanged. These helpers cover value types whose
//! `PartialEq` is missing or not what early termination needs.

use std::sync::Arc;

/// Compare only the `Ok` values. Returns `false` for any `Err` case,
/// so dependents of a failing value are always recomputed.
///
/// # Example
/// ```ignore
/// fn value_eq(old: &Self::Value, new: &Self::Value) -> bool {
///     revquery::output_eq::ok_or_invalidate(old, new)
/// }
/// ```
pub fn ok_or_invalidate<T: PartialEq, E>(a: &Result<T, E>, b: &Result<T, E>) -> bool {
    match (a, b) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Compare `Ok` values for equality, treat all `Err` as equal.
///
/// Use this to keep dependents cached while a value stays in the error state,
/// regardless of the error content.
pub fn ignore_err<T: PartialEq, E>(a: &Result<T, E>, b: &Result<T, E>) -> bool {
    match (a, b) {
        (Ok(a), Ok(b)) => a == b,
        (Err(_), Err(_)) => true,
        _ => false,
    }
}

/// Never equal: every recomputation counts as a change.
pub fn never_eq<T>(_a: &T, _b: &T) -> bool {
    false
}

/// Identity of the shared allocation, for values without `PartialEq`.
pub fn arc_ptr_eq<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    Arc::ptr_eq(a, b)
}

/// Bitwise float equality: `NaN` equals itself, `0.0` differs from `-0.0`.
pub fn f64_bits_eq(a: &f64, b: &f64) -> bool {
    a.to_bits() == b.to_bits()
}
