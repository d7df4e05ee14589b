//! L0: atomic primitives on a single bfield (one machine word, `W`
//! bits wide, see [`crate::util::constants`]).
//!
//! Every read-modify-write here is acquire-on-success / release (i.e.
//! `AcqRel`); every bare load used for a search hint is `Relaxed` and
//! is re-validated by a subsequent RMW before it is trusted. None of
//! these functions allocate or can fail in the exception sense:
//! outcomes are always carried in the return value.

use crate::util::constants::{AtomicBfield, BfieldInt};
use std::sync::atomic::Ordering;

/// Atomic OR with `1 << i`. Returns true iff the bit transitioned 0->1.
#[inline]
pub fn set(b: &AtomicBfield, i: u32) -> bool {
    debug_assert!(i < crate::util::constants::BFIELD_BITS);
    let mask: BfieldInt = 1 << i;
    let old = b.fetch_or(mask, Ordering::AcqRel);
    old & mask == 0
}

/// Atomic AND with `!(1 << i)`. Returns `(transitioned, all_clear)`
/// where `all_clear` reports whether the whole word is now zero.
#[inline]
pub fn clear(b: &AtomicBfield, i: u32) -> (bool, bool) {
    debug_assert!(i < crate::util::constants::BFIELD_BITS);
    let mask: BfieldInt = 1 << i;
    let old = b.fetch_and(!mask, Ordering::AcqRel);
    (old & mask != 0, old & !mask == 0)
}

/// CAS-loop until `b |= m` succeeds. Returns `(transitioned, already_set)`:
/// `transitioned` is true iff none of `m`'s bits were set beforehand;
/// `already_set` is the count of `m`'s bits that were already 1.
#[inline]
pub fn set_mask(b: &AtomicBfield, m: BfieldInt) -> (bool, u32) {
    debug_assert_ne!(m, 0);
    let mut old = b.load(Ordering::Relaxed);
    loop {
        let new = old | m;
        if new == old {
            // Nothing to change; no RMW needed.
            return (false, m.count_ones());
        }
        match b.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return (old & m == 0, (old & m).count_ones()),
            Err(cur) => old = cur,
        }
    }
}

/// CAS-loop until `b &= !m` succeeds. Returns `(transitioned, already_clear)`.
///
/// `already_clear` is `popcount(!old & m)`: the number of `m`'s bits
/// that were already 0. A naive implementation computes `popcount(!old)`
/// instead (the count of *all* zero bits in the word, not just those
/// within `m`); this version scopes the count to `m`.
#[inline]
pub fn clear_mask(b: &AtomicBfield, m: BfieldInt) -> (bool, u32) {
    debug_assert_ne!(m, 0);
    let mut old = b.load(Ordering::Relaxed);
    loop {
        let new = old & !m;
        if new == old {
            return (false, (!old & m).count_ones());
        }
        match b.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return (old & m == m, (!old & m).count_ones()),
            Err(cur) => old = cur,
        }
    }
}

/// If any bit of `m` is already set, fails without modifying `b`.
/// Otherwise CASes `b |= m`. Retries only on interference from bits
/// outside `m`; a concurrent setter of a bit in `m` is a genuine
/// failure, not something to retry past.
#[inline]
pub fn try_set_mask(b: &AtomicBfield, m: BfieldInt) -> bool {
    debug_assert_ne!(m, 0);
    let mut old = b.load(Ordering::Relaxed);
    loop {
        if old & m != 0 {
            return false;
        }
        let new = old | m;
        match b.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return true,
            Err(cur) => old = cur,
        }
    }
}

/// If `(b & m) != m`, fails without modifying `b`. Otherwise CASes
/// `b &= !m`. Returns `Some(all_clear)` on success, `None` on failure.
#[inline]
pub fn try_clear_mask(b: &AtomicBfield, m: BfieldInt) -> Option<bool> {
    debug_assert_ne!(m, 0);
    let mut old = b.load(Ordering::Relaxed);
    loop {
        if old & m != m {
            return None;
        }
        let new = old & !m;
        match b.compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return Some(new == 0),
            Err(cur) => old = cur,
        }
    }
}

/// Atomic exchange with all-ones. Returns true iff the word was 0.
#[inline]
pub fn set_all(b: &AtomicBfield) -> bool {
    b.swap(BfieldInt::MAX, Ordering::AcqRel) == 0
}

/// Atomic exchange with 0. Returns true iff the word was all-ones.
#[inline]
pub fn clear_all(b: &AtomicBfield) -> bool {
    b.swap(0, Ordering::AcqRel) == BfieldInt::MAX
}

/// CAS all-ones -> 0. Returns true only on the exact transition.
#[inline]
pub fn try_clear_all(b: &AtomicBfield) -> bool {
    b.compare_exchange(BfieldInt::MAX, 0, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
}

/// Busy-wait (yielding the CPU between polls) until bit `i` is
/// observed set, then CAS-clear it.
///
/// This exists for the race where a concurrent free arrives while the
/// owning thread is still publishing the page: the freer must wait to
/// observe the publish before clearing the abandoned bit. There is no
/// producer-side wake mechanism, so this must not become a blocking
/// wait; the caller is responsible for only using it where the target
/// bit is known to become set promptly.
pub fn clear_once_set(b: &AtomicBfield, i: u32) {
    debug_assert!(i < crate::util::constants::BFIELD_BITS);
    let mask: BfieldInt = 1 << i;
    loop {
        let cur = b.load(Ordering::Acquire);
        if crate::util::rust_util::unlikely(cur & mask == 0) {
            std::hint::spin_loop();
            continue;
        }
        match b.compare_exchange_weak(cur, cur & !mask, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return,
            Err(_) => continue,
        }
    }
}

/// Relaxed load + mask comparison: are all bits of `m` set?
#[inline]
pub fn is_set_mask(b: &AtomicBfield, m: BfieldInt) -> bool {
    b.load(Ordering::Relaxed) & m == m
}

/// Relaxed load + mask comparison: are all bits of `m` clear?
#[inline]
pub fn is_clear_mask(b: &AtomicBfield, m: BfieldInt) -> bool {
    b.load(Ordering::Relaxed) & m == 0
}
