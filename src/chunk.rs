//! L1: chunk-level operations over `F` bfields (`F*W` bits total, see
//! [`crate::util::constants`]).
//!
//! A chunk decomposes a local bit index `cidx` into `(field = cidx /
//! W, bit = cidx % W)` and dispatches to [`crate::bfield`]. Multi-bit
//! operations here are not atomic across fields; [`Chunk::try_xsetn`]
//! is the sole all-or-nothing variant, and it achieves that via
//! explicit rollback rather than a cross-field CAS (no such primitive
//! exists on real hardware).

use crate::bfield;
use crate::util::constants::{AtomicBfield, BfieldInt, BFIELD_BITS, FIELDS_PER_CHUNK};
use crate::util::rust_util::unlikely;
use log::debug;
use std::sync::atomic::Ordering;

/// Whether a multi-bit operation is setting bits to 1 or clearing
/// them to 0. A tagged dispatch rather than a function-pointer
/// parameterization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    Set,
    Clear,
}

#[inline]
fn mask_upto(n: u32) -> BfieldInt {
    if n >= BFIELD_BITS {
        BfieldInt::MAX
    } else {
        (1 << n) - 1
    }
}

#[inline]
fn decompose(cidx: usize) -> (usize, u32) {
    (cidx / BFIELD_BITS as usize, (cidx % BFIELD_BITS as usize) as u32)
}

/// One cache-line-sized group of bfields.
#[derive(Debug)]
pub struct Chunk {
    fields: [AtomicBfield; FIELDS_PER_CHUNK],
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}

impl Chunk {
    pub fn new() -> Self {
        Self {
            fields: std::array::from_fn(|_| AtomicBfield::new(0)),
        }
    }

    #[inline]
    pub fn field(&self, i: usize) -> &AtomicBfield {
        &self.fields[i]
    }

    /// Set or clear a single bit. Returns `(transitioned, maybe_all_clear)`;
    /// `maybe_all_clear` is only meaningful for `Polarity::Clear`, used
    /// by the caller to decide whether to attempt a chunkmap downgrade.
    pub fn xset1(&self, polarity: Polarity, cidx: usize) -> (bool, bool) {
        let (f, b) = decompose(cidx);
        match polarity {
            Polarity::Set => (bfield::set(&self.fields[f], b), false),
            Polarity::Clear => bfield::clear(&self.fields[f], b),
        }
    }

    /// Walks the fields spanned by `[cidx, cidx+n)` in order, applying
    /// a per-field mask RMW. Not atomic across fields. Returns
    /// `(all_transitioned, total_already_xset)`.
    pub fn xsetn(&self, polarity: Polarity, cidx: usize, n: usize) -> (bool, u32) {
        debug_assert!(n > 0);
        debug_assert!(cidx + n <= FIELDS_PER_CHUNK * BFIELD_BITS as usize);
        let mut all_transitioned = true;
        let mut already = 0u32;
        self.for_each_span(cidx, n, |field, mask| {
            let (transitioned, count) = match polarity {
                Polarity::Set => bfield::set_mask(field, mask),
                Polarity::Clear => bfield::clear_mask(field, mask),
            };
            all_transitioned &= transitioned;
            already += count;
        });
        (all_transitioned, already)
    }

    /// All-or-nothing `[cidx, cidx+n)` set/clear via per-field
    /// `try_*_mask` with rollback on failure. If this returns false,
    /// no bit in `[cidx, cidx+n)` was changed by this call.
    pub fn try_xsetn(&self, polarity: Polarity, cidx: usize, n: usize) -> bool {
        debug_assert!(n > 0);
        debug_assert!(cidx + n <= FIELDS_PER_CHUNK * BFIELD_BITS as usize);
        let mut applied: Vec<(usize, BfieldInt)> = Vec::new();
        let mut ok = true;
        self.for_each_span_indexed(cidx, n, |field_idx, field, mask| {
            if !ok {
                return;
            }
            let success = match polarity {
                Polarity::Set => bfield::try_set_mask(field, mask),
                Polarity::Clear => bfield::try_clear_mask(field, mask).is_some(),
            };
            if success {
                applied.push((field_idx, mask));
            } else {
                ok = false;
            }
        });
        if !ok {
            debug!("try_xsetn rollback: {} field(s) to undo", applied.len());
            // Roll back in reverse order. This must succeed: only this
            // call could have moved those exact bits from their entry
            // state, so the inverse operation cannot itself race.
            let inverse = match polarity {
                Polarity::Set => Polarity::Clear,
                Polarity::Clear => Polarity::Set,
            };
            for (field_idx, mask) in applied.into_iter().rev() {
                match inverse {
                    Polarity::Set => {
                        bfield::set_mask(&self.fields[field_idx], mask);
                    }
                    Polarity::Clear => {
                        bfield::clear_mask(&self.fields[field_idx], mask);
                    }
                }
            }
        }
        ok
    }

    /// Relaxed read of whether `[cidx, cidx+n)` are all set (or all
    /// clear), per `polarity`.
    pub fn is_xsetn(&self, polarity: Polarity, cidx: usize, n: usize) -> bool {
        debug_assert!(n > 0);
        if n as u32 <= BFIELD_BITS {
            let (f, b) = decompose(cidx);
            // Fast path: the whole span lives in one field (the common case).
            if b as usize + n <= BFIELD_BITS as usize {
                let mask = mask_upto(n as u32) << b;
                return match polarity {
                    Polarity::Set => bfield::is_set_mask(&self.fields[f], mask),
                    Polarity::Clear => bfield::is_clear_mask(&self.fields[f], mask),
                };
            }
        }
        let mut all_match = true;
        self.for_each_span(cidx, n, |field, mask| {
            all_match &= match polarity {
                Polarity::Set => bfield::is_set_mask(field, mask),
                Polarity::Clear => bfield::is_clear_mask(field, mask),
            };
        });
        all_match
    }

    /// Walk the fields spanned by `[cidx, cidx+n)`, invoking `f(field, mask)`
    /// for each one in increasing field order.
    fn for_each_span(&self, cidx: usize, n: usize, mut f: impl FnMut(&AtomicBfield, BfieldInt)) {
        self.for_each_span_indexed(cidx, n, |_, field, mask| f(field, mask));
    }

    fn for_each_span_indexed(
        &self,
        cidx: usize,
        n: usize,
        mut f: impl FnMut(usize, &AtomicBfield, BfieldInt),
    ) {
        let w = BFIELD_BITS as usize;
        let (start_field, start_bit) = decompose(cidx);
        let end_cidx = cidx + n - 1;
        let (end_field, end_bit) = decompose(end_cidx);

        if start_field == end_field {
            let mask = mask_upto(n as u32) << start_bit;
            f(start_field, &self.fields[start_field], mask);
            return;
        }

        let start_mask = mask_upto(w as u32) & !mask_upto(start_bit as u32);
        f(start_field, &self.fields[start_field], start_mask);

        for mid in (start_field + 1)..end_field {
            f(mid, &self.fields[mid], BfieldInt::MAX);
        }

        let end_mask = mask_upto(end_bit + 1);
        f(end_field, &self.fields[end_field], end_mask);
    }

    /// OR all fields, test for zero. A relaxed, best-effort read used
    /// before attempting a chunkmap downgrade.
    pub fn all_clear_relaxed(&self) -> bool {
        self.fields
            .iter()
            .fold(0 as BfieldInt, |acc, f| acc | f.load(Ordering::Relaxed))
            == 0
    }

    /// Most significant set bit, scanning fields high to low.
    pub fn bsr(&self) -> Option<usize> {
        for (i, field) in self.fields.iter().enumerate().rev() {
            let v = field.load(Ordering::Relaxed);
            if v != 0 {
                let bit = BFIELD_BITS - 1 - v.leading_zeros();
                return Some(i * BFIELD_BITS as usize + bit as usize);
            }
        }
        None
    }

    pub fn clear_once_set(&self, cidx: usize) {
        let (f, b) = decompose(cidx);
        bfield::clear_once_set(&self.fields[f], b);
    }

    /// Find any single set bit and atomically clear it. Prefers
    /// fields that are not fully set on a first pass (to reduce
    /// fragmentation of long runs), falling back to fully-set fields
    /// on a second pass.
    pub fn find_and_clear_1(&self) -> Option<usize> {
        for pass in 0..2 {
            for (i, field) in self.fields.iter().enumerate() {
                loop {
                    let v = field.load(Ordering::Relaxed);
                    if v == 0 {
                        break;
                    }
                    if pass == 0 && v == BfieldInt::MAX {
                        break;
                    }
                    let bit = v.trailing_zeros();
                    let mask: BfieldInt = 1 << bit;
                    if bfield::try_clear_mask(field, mask).is_some() {
                        return Some(i * BFIELD_BITS as usize + bit as usize);
                    }
                    // Lost the race for that bit; re-read and retry.
                }
            }
        }
        None
    }

    /// Find the least aligned byte whose 8 bits are all set, and
    /// atomically clear it.
    pub fn find_and_clear_8(&self) -> Option<usize> {
        let ones01: BfieldInt = BfieldInt::MAX / 0xFF;
        let ones80: BfieldInt = ones01 * 0x80;
        for pass in 0..2 {
            for (i, field) in self.fields.iter().enumerate() {
                loop {
                    let v = field.load(Ordering::Relaxed);
                    if v == 0 {
                        break;
                    }
                    if pass == 0 && v == BfieldInt::MAX {
                        break;
                    }
                    let byte_marks = (!v).wrapping_sub(ones01) & v & ones80;
                    if byte_marks == 0 {
                        break;
                    }
                    let byte_idx = (byte_marks.trailing_zeros()) / 8;
                    let mask: BfieldInt = 0xFFu64 as BfieldInt << (8 * byte_idx);
                    if bfield::try_clear_mask(field, mask).is_some() {
                        return Some(i * BFIELD_BITS as usize + (8 * byte_idx) as usize);
                    }
                }
            }
        }
        None
    }

    /// Find a field that is entirely set and atomically clear it all
    /// at once.
    pub fn find_and_clear_x(&self) -> Option<usize> {
        for (i, field) in self.fields.iter().enumerate() {
            loop {
                let v = field.load(Ordering::Relaxed);
                if v != BfieldInt::MAX {
                    break;
                }
                if bfield::try_clear_all(field) {
                    return Some(i * BFIELD_BITS as usize);
                }
                // Someone else cleared a bit out from under us; re-read.
            }
        }
        None
    }

    /// Find a run of `n` consecutive set bits within a single field
    /// (`1 < n < W`) and atomically clear it.
    pub fn find_and_clear_nx(&self, n: usize) -> Option<usize> {
        debug_assert!(n > 1 && (n as u32) < BFIELD_BITS);
        for (i, field) in self.fields.iter().enumerate() {
            if let Some(bit) = Self::scan_field_for_run(field, n as u32) {
                return Some(i * BFIELD_BITS as usize + bit as usize);
            }
        }
        None
    }

    fn scan_field_for_run(field: &AtomicBfield, n: u32) -> Option<u32> {
        let mask_n = mask_upto(n);
        let mut b = field.load(Ordering::Relaxed);
        let mut s: u32 = 0;
        let mut cur = b;
        loop {
            if s + n > BFIELD_BITS || cur == 0 {
                return None;
            }
            let tz = cur.trailing_zeros();
            s += tz;
            if s + n > BFIELD_BITS {
                return None;
            }
            cur >>= tz;
            if cur & mask_n == mask_n {
                let full_mask = mask_n << s;
                match bfield::try_clear_mask(field, full_mask) {
                    Some(_) => return Some(s),
                    None => {
                        // Reload, but keep searching from the same offset:
                        // the window we found is still the best candidate
                        // until proven otherwise.
                        b = field.load(Ordering::Relaxed);
                        cur = b >> s;
                        continue;
                    }
                }
            } else {
                let skip = (!cur).trailing_zeros();
                if unlikely(skip == 0) {
                    // cur's LSB isn't set after a ctz landed on it: only
                    // possible if the field changed under us. Reload.
                    b = field.load(Ordering::Relaxed);
                    cur = b >> s;
                    continue;
                }
                s += skip;
                cur >>= skip;
            }
        }
    }

    /// Find a run of `n` consecutive set bits spanning
    /// `ceil(n/W)` consecutive whole fields (`W <= n <= F*W`) and
    /// atomically clear it via [`Chunk::try_xsetn`].
    pub fn find_and_clear_n_wide(&self, n: usize) -> Option<usize> {
        let w = BFIELD_BITS as usize;
        debug_assert!(n >= w && n <= FIELDS_PER_CHUNK * w);
        let required_fields = n.div_ceil(w);
        let remainder = n % w;
        let full_count = if remainder == 0 {
            required_fields
        } else {
            required_fields - 1
        };
        if required_fields > FIELDS_PER_CHUNK {
            return None;
        }
        for start in 0..=(FIELDS_PER_CHUNK - required_fields) {
            let mut ok = (0..full_count)
                .all(|k| self.fields[start + k].load(Ordering::Relaxed) == BfieldInt::MAX);
            if ok && remainder > 0 {
                let need = mask_upto(remainder as u32);
                let last = self.fields[start + full_count].load(Ordering::Relaxed);
                ok = last & need == need;
            }
            if ok && self.try_xsetn(Polarity::Clear, start * w, n) {
                return Some(start * w);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::FIELDS_PER_CHUNK as F;

    fn chunk() -> Chunk {
        Chunk::new()
    }

    macro_rules! roundtrip_at_offset_test {
        ($name:ident, $offset:expr, $len:expr) => {
            paste::paste! {
                #[test]
                fn [<xsetn_roundtrip_ $name>]() {
                    let c = chunk();
                    let (all_t, already) = c.xsetn(Polarity::Set, $offset, $len);
                    assert!(all_t);
                    assert_eq!(already, 0);
                    assert!(c.is_xsetn(Polarity::Set, $offset, $len));
                    let (all_t, already) = c.xsetn(Polarity::Clear, $offset, $len);
                    assert!(all_t);
                    assert_eq!(already, 0);
                    assert!(c.all_clear_relaxed());
                }
            }
        };
    }

    roundtrip_at_offset_test!(one_bit, 0, 1);
    roundtrip_at_offset_test!(one_byte, 0, 8);
    roundtrip_at_offset_test!(mid_field, 17, 9);
    roundtrip_at_offset_test!(last_bit_of_field, BFIELD_BITS as usize - 1, 1);

    #[test]
    fn xsetn_single_field_roundtrip() {
        let c = chunk();
        let (all_t, already) = c.xsetn(Polarity::Set, 4, 5);
        assert!(all_t);
        assert_eq!(already, 0);
        assert!(c.is_xsetn(Polarity::Set, 4, 5));
        let (all_t, already) = c.xsetn(Polarity::Clear, 4, 5);
        assert!(all_t);
        assert_eq!(already, 0);
        assert!(c.is_xsetn(Polarity::Clear, 4, 5));
    }

    #[test]
    fn xsetn_cross_field_run() {
        // Bits 60..68 span field 0 bits 60-63 and field 1 bits 0-3.
        let c = chunk();
        if F < 2 {
            return;
        }
        let (all_t, _) = c.xsetn(Polarity::Set, 60, 8);
        assert!(all_t);
        assert!(c.is_xsetn(Polarity::Set, 60, 8));
    }

    #[test]
    fn try_xsetn_rollback_leaves_other_bits_untouched() {
        let c = chunk();
        if F < 2 {
            return;
        }
        c.xset1(Polarity::Set, 130);
        // Requires bits [64, 192) all set; bit 130 alone isn't enough.
        let ok = c.try_xsetn(Polarity::Clear, 64, 128);
        assert!(!ok);
        assert!(c.is_xsetn(Polarity::Set, 130, 1));
        // Nothing else should have become set.
        for i in 0..(F * crate::util::constants::BFIELD_BITS as usize) {
            if i != 130 {
                assert!(c.is_xsetn(Polarity::Clear, i, 1), "bit {i} unexpectedly set");
            }
        }
    }

    #[test]
    fn find_and_clear_1_finds_and_clears() {
        let c = chunk();
        c.xset1(Polarity::Set, 7);
        assert_eq!(c.find_and_clear_1(), Some(7));
        assert!(c.all_clear_relaxed());
        assert_eq!(c.find_and_clear_1(), None);
    }

    #[test]
    fn find_and_clear_8_requires_whole_byte() {
        let c = chunk();
        c.xsetn(Polarity::Set, 8, 8);
        assert_eq!(c.find_and_clear_8(), Some(8));
        assert!(c.is_xsetn(Polarity::Clear, 8, 8));
    }

    #[test]
    fn find_and_clear_8_skips_partial_byte() {
        let c = chunk();
        c.xsetn(Polarity::Set, 8, 7); // only 7 of 8 bits in the byte
        assert_eq!(c.find_and_clear_8(), None);
    }

    #[test]
    fn find_and_clear_x_requires_full_field() {
        let c = chunk();
        c.xsetn(Polarity::Set, 0, crate::util::constants::BFIELD_BITS as usize - 1);
        assert_eq!(c.find_and_clear_x(), None);
        c.xset1(Polarity::Set, crate::util::constants::BFIELD_BITS as usize - 1);
        assert_eq!(c.find_and_clear_x(), Some(0));
    }

    #[test]
    fn find_and_clear_nx_does_not_cross_fields() {
        if F < 2 {
            return;
        }
        let c = chunk();
        let w = crate::util::constants::BFIELD_BITS as usize;
        c.xsetn(Polarity::Set, w - 4, 8); // spans field boundary
        assert_eq!(c.find_and_clear_nx(8), None);
        c.xsetn(Polarity::Clear, w - 4, 8);
        c.xsetn(Polarity::Set, 2, 8); // aligned within one field
        assert_eq!(c.find_and_clear_nx(8), Some(2));
    }

    #[test]
    fn find_and_clear_n_wide_large_run() {
        // A run of 300 bits needs 2 chunks in the bitmap, but at the
        // chunk level we can still exercise a run spanning every field
        // of this chunk.
        if F < 2 {
            return;
        }
        let c = chunk();
        let total = F * crate::util::constants::BFIELD_BITS as usize;
        c.xsetn(Polarity::Set, 0, total);
        let got = c.find_and_clear_n_wide(total);
        assert_eq!(got, Some(0));
        assert!(c.all_clear_relaxed());
    }

    #[test]
    fn try_xsetn_rollback_fuzz() {
        // A failing try_xsetn must leave every bit in [idx, idx+n)
        // exactly as it was at entry. Random bit patterns give this
        // much better coverage than the single hand-picked case above.
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha8Rng;

        let total_bits = F * crate::util::constants::BFIELD_BITS as usize;
        let mut rng = ChaCha8Rng::seed_from_u64(0xC0FFEE);

        for _ in 0..500 {
            let c = chunk();
            // Seed a random subset of bits as the chunk's starting state.
            let mut snapshot = vec![false; total_bits];
            for (i, slot) in snapshot.iter_mut().enumerate() {
                let set = rng.random_bool(0.4);
                *slot = set;
                if set {
                    c.xset1(Polarity::Set, i);
                }
            }

            let n = rng.random_range(1..=total_bits.min(64));
            let idx = rng.random_range(0..=(total_bits - n));
            let polarity = if rng.random_bool(0.5) {
                Polarity::Set
            } else {
                Polarity::Clear
            };

            let ok = c.try_xsetn(polarity, idx, n);
            if !ok {
                for i in idx..idx + n {
                    assert_eq!(
                        c.is_xsetn(Polarity::Set, i, 1),
                        snapshot[i],
                        "bit {i} changed despite try_xsetn returning false"
                    );
                }
            }
        }
    }
}
