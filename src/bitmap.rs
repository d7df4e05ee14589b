//! L2: the top-level bitmap. A chunkmap, a dense array of chunks, and
//! the two atomic hints (`chunk_count`, `chunk_max_accessed`) that tie
//! them together.
//!
//! This is the only module that knows about the chunkmap coherence
//! protocol and the staggered search order; everything below it
//! (`chunk`, `bfield`, `cycle`) is oblivious to chunk-of-chunks
//! structure.

use crate::chunk::{Chunk, Polarity};
use crate::cycle::CycleIter;
use crate::util::constants::{BfieldInt, BFIELD_BITS, BITS_PER_CHUNK, FIELDS_PER_CHUNK};
use crossbeam::utils::CachePadded;
use log::{debug, trace};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Which chunk-level finder `find` should invoke. A tagged variant
/// instead of a function pointer, matched once per call.
#[derive(Debug, Clone, Copy)]
enum FindKind {
    One,
    Eight,
    FullField,
    SmallN(usize),
    LargeN(usize),
}

fn dispatch_finder(chunk: &Chunk, kind: FindKind) -> Option<usize> {
    match kind {
        FindKind::One => chunk.find_and_clear_1(),
        FindKind::Eight => chunk.find_and_clear_8(),
        FindKind::FullField => chunk.find_and_clear_x(),
        FindKind::SmallN(n) => chunk.find_and_clear_nx(n),
        FindKind::LargeN(n) => chunk.find_and_clear_n_wide(n),
    }
}

/// Purely informational layout used to compute `size_for`'s header
/// offset; the real `Bitmap` owns its chunks via `Box<[_]>` rather
/// than a true trailing flexible array (Rust has no FAM).
#[repr(C)]
struct BitmapLayout {
    chunk_count: AtomicUsize,
    chunk_max_accessed: AtomicUsize,
    chunkmap: CachePadded<Chunk>,
    chunks: [CachePadded<Chunk>; 0],
}

/// A concurrent, lock-free, hierarchical bitmap.
pub struct Bitmap {
    chunk_count: AtomicUsize,
    chunk_max_accessed: AtomicUsize,
    chunkmap: CachePadded<Chunk>,
    chunks: Box<[CachePadded<Chunk>]>,
}

impl Bitmap {
    /// Computes `(size_bytes, chunk_count)` for `bit_count` bits,
    /// aligned up to `F*W`. `size_bytes` is vestigial here (useful to
    /// a caller estimating footprint, but this crate allocates its own
    /// storage rather than accepting caller-provided memory).
    pub fn size_for(bit_count: usize) -> (usize, usize) {
        assert!(bit_count > 0, "bitmap must have a non-zero bit count");
        let aligned = bit_count.div_ceil(BITS_PER_CHUNK) * BITS_PER_CHUNK;
        let chunk_count = aligned / BITS_PER_CHUNK;
        assert!(
            chunk_count <= BITS_PER_CHUNK,
            "chunk_count {chunk_count} exceeds one chunkmap's capacity ({BITS_PER_CHUNK}); \
             partition into multiple bitmaps"
        );
        let header_size = memoffset::offset_of!(BitmapLayout, chunks);
        let size_bytes = header_size + chunk_count * std::mem::size_of::<CachePadded<Chunk>>();
        (size_bytes, chunk_count)
    }

    /// Allocates and zero-initializes a bitmap covering at least
    /// `bit_count` bits. Combines initialization with allocation,
    /// since this crate owns its storage.
    pub fn new(bit_count: usize) -> Self {
        let (_, chunk_count) = Self::size_for(bit_count);
        let chunks: Box<[CachePadded<Chunk>]> = (0..chunk_count)
            .map(|_| CachePadded::new(Chunk::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let bitmap = Self {
            chunk_count: AtomicUsize::new(0),
            chunk_max_accessed: AtomicUsize::new(0),
            chunkmap: CachePadded::new(Chunk::new()),
            chunks,
        };
        // Already zero by construction; publish chunk_count with release
        // order so any thread that observes it also observes the zeroed
        // chunks and chunkmap.
        bitmap.chunk_count.store(chunk_count, Ordering::Release);
        bitmap
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count.load(Ordering::Acquire)
    }

    pub fn bit_count(&self) -> usize {
        self.chunk_count() * BITS_PER_CHUNK
    }

    #[inline]
    fn decompose(&self, idx: usize) -> (usize, usize) {
        (idx / BITS_PER_CHUNK, idx % BITS_PER_CHUNK)
    }

    fn advance_chunk_max_accessed(&self, chunk_idx: usize) {
        let mut cur = self.chunk_max_accessed.load(Ordering::Relaxed);
        while chunk_idx > cur {
            match self.chunk_max_accessed.compare_exchange_weak(
                cur,
                chunk_idx,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Sets the chunkmap bit for `chunk_idx`, then advances
    /// `chunk_max_accessed` if needed. Must be called only after the
    /// corresponding chunk bit has already been set with release
    /// order, so a searcher that observes the chunkmap bit also
    /// observes a matching chunk bit.
    fn chunkmap_set(&self, chunk_idx: usize) {
        self.chunkmap.xset1(Polarity::Set, chunk_idx);
        self.advance_chunk_max_accessed(chunk_idx);
    }

    /// Two-phase clear-then-recheck race-closing protocol. Returns
    /// false without side effects if the chunk is not (relaxed-)
    /// observed empty, or if a concurrent setter raced the clear.
    fn chunkmap_try_clear(&self, chunk_idx: usize) -> bool {
        if !self.chunks[chunk_idx].all_clear_relaxed() {
            return false;
        }
        self.chunkmap.xset1(Polarity::Clear, chunk_idx);
        if !self.chunks[chunk_idx].all_clear_relaxed() {
            debug!("chunkmap_try_clear lost the race on chunk {chunk_idx}, re-setting");
            self.chunkmap.xset1(Polarity::Set, chunk_idx);
            return false;
        }
        true
    }

    /// Sets or clears a single bit.
    pub fn xset(&self, polarity: Polarity, idx: usize) -> bool {
        let (chunk_idx, local) = self.decompose(idx);
        let (transitioned, maybe_all_clear) = self.chunks[chunk_idx].xset1(polarity, local);
        match polarity {
            Polarity::Set => self.chunkmap_set(chunk_idx),
            Polarity::Clear => {
                if maybe_all_clear {
                    self.chunkmap_try_clear(chunk_idx);
                }
            }
        }
        transitioned
    }

    /// Sets or clears `[idx, idx+n)`. Must not cross a chunk boundary
    /// (`(idx % (F*W)) + n <= F*W`).
    pub fn xsetn(&self, polarity: Polarity, idx: usize, n: usize) -> (bool, u32) {
        debug_assert!(n > 0 && n <= BITS_PER_CHUNK);
        let (chunk_idx, local) = self.decompose(idx);
        debug_assert!(local + n <= BITS_PER_CHUNK, "xsetn must not cross a chunk boundary");
        let (all_transitioned, already) = self.chunks[chunk_idx].xsetn(polarity, local, n);
        match polarity {
            Polarity::Set => self.chunkmap_set(chunk_idx),
            Polarity::Clear => {
                if self.chunks[chunk_idx].all_clear_relaxed() {
                    self.chunkmap_try_clear(chunk_idx);
                }
            }
        }
        (all_transitioned, already)
    }

    pub fn is_xsetn(&self, polarity: Polarity, idx: usize, n: usize) -> bool {
        let (chunk_idx, local) = self.decompose(idx);
        self.chunks[chunk_idx].is_xsetn(polarity, local, n)
    }

    /// Fills `[idx, idx+n)`, which may span chunks. Not atomic and
    /// not thread-safe; for use only while building an arena
    /// single-threaded.
    ///
    /// # Safety
    /// The caller must guarantee no other thread observes or mutates
    /// this bitmap for the duration of the call.
    pub unsafe fn unsafe_setn(&self, idx: usize, n: usize) {
        debug_assert!(n > 0);
        debug_assert!(idx + n <= self.bit_count());
        let w = BFIELD_BITS as usize;
        let end = idx + n;
        let mut cur = idx;
        while cur < end {
            let chunk_idx = cur / BITS_PER_CHUNK;
            let local = cur % BITS_PER_CHUNK;

            // Optimization: a whole chunkmap-field's worth of fully
            // covered, aligned chunks can be stamped in one word store
            // each, instead of per-chunk / per-bit RMWs.
            if local == 0 && chunk_idx % w == 0 && end - cur >= w * BITS_PER_CHUNK {
                for c in chunk_idx..chunk_idx + w {
                    for f in 0..FIELDS_PER_CHUNK {
                        self.chunks[c].field(f).store(BfieldInt::MAX, Ordering::Relaxed);
                    }
                }
                self.chunkmap
                    .field(chunk_idx / w)
                    .store(BfieldInt::MAX, Ordering::Relaxed);
                self.advance_chunk_max_accessed(chunk_idx + w - 1);
                cur += w * BITS_PER_CHUNK;
                continue;
            }

            let take = (end - cur).min(BITS_PER_CHUNK - local);
            if local == 0 && take == BITS_PER_CHUNK {
                for f in 0..FIELDS_PER_CHUNK {
                    self.chunks[chunk_idx].field(f).store(BfieldInt::MAX, Ordering::Relaxed);
                }
            } else {
                self.chunks[chunk_idx].xsetn(Polarity::Set, local, take);
            }
            self.chunkmap_set(chunk_idx);
            cur += take;
        }
    }

    /// Iterates chunk indices whose chunkmap bit is set, in an order
    /// staggered by `tseq`. Stops as soon as `visitor` returns true.
    fn find(&self, tseq: usize, mut visitor: impl FnMut(usize) -> bool) {
        let chunk_count = self.chunk_count();
        let cmap_fields = chunk_count.div_ceil(BFIELD_BITS as usize);
        let max_ch = self.chunk_max_accessed.load(Ordering::Relaxed);
        for j in 0..cmap_fields {
            let v = self.chunkmap.field(j).load(Ordering::Relaxed);
            if v == 0 {
                continue;
            }
            let field_base = j * BFIELD_BITS as usize;
            let relative_max = max_ch.saturating_sub(field_base) as u32;
            let cycle = relative_max.saturating_add(1).min(BFIELD_BITS);
            for bit in CycleIter::new(v, cycle, tseq) {
                let chunk_idx = field_base + bit as usize;
                if chunk_idx >= chunk_count {
                    continue;
                }
                if visitor(chunk_idx) {
                    return;
                }
            }
        }
    }

    fn try_find_and_clear_kind(&self, tseq: usize, kind: FindKind) -> Option<usize> {
        let mut result = None;
        self.find(tseq, |chunk_idx| {
            trace!("bitmap_find: kind={kind:?} chunk={chunk_idx}");
            match dispatch_finder(&self.chunks[chunk_idx], kind) {
                Some(local) => {
                    result = Some(chunk_idx * BITS_PER_CHUNK + local);
                    true
                }
                None => {
                    self.chunkmap_try_clear(chunk_idx);
                    false
                }
            }
        });
        result
    }

    pub fn try_find_and_clear(&self, tseq: usize) -> Option<usize> {
        self.try_find_and_clear_kind(tseq, FindKind::One)
    }

    pub fn try_find_and_clear8(&self, tseq: usize) -> Option<usize> {
        self.try_find_and_clear_kind(tseq, FindKind::Eight)
    }

    pub fn try_find_and_clear_x(&self, tseq: usize) -> Option<usize> {
        self.try_find_and_clear_kind(tseq, FindKind::FullField)
    }

    /// Dispatches to the within-field (`NX`) or cross-field (`N_`)
    /// finder depending on `n`.
    pub fn try_find_and_clear_n(&self, tseq: usize, n: usize) -> Option<usize> {
        debug_assert!(n > 1, "use try_find_and_clear for n == 1");
        let kind = if (n as u32) < BFIELD_BITS {
            FindKind::SmallN(n)
        } else {
            FindKind::LargeN(n)
        };
        self.try_find_and_clear_kind(tseq, kind)
    }

    /// Find-and-claim for abandoned-page reclamation. Clears a set
    /// bit, then asks `claim_fn(slice_idx)` whether the
    /// claim was accepted; on rejection, either re-sets the bit
    /// (`keep_set`) or leaves it cleared permanently.
    pub fn try_find_and_claim(
        &self,
        tseq: usize,
        mut claim_fn: impl FnMut(usize) -> (bool, bool),
    ) -> Option<usize> {
        let mut result = None;
        self.find(tseq, |chunk_idx| match self.chunks[chunk_idx].find_and_clear_1() {
            Some(local) => {
                let slice_idx = chunk_idx * BITS_PER_CHUNK + local;
                let (claimed, keep_set) = claim_fn(slice_idx);
                if claimed {
                    result = Some(slice_idx);
                    true
                } else {
                    if keep_set {
                        let (transitioned, _) = self.chunks[chunk_idx].xset1(Polarity::Set, local);
                        debug_assert!(
                            transitioned,
                            "find_and_claim re-set must observe a 0->1 transition"
                        );
                        self.chunkmap_set(chunk_idx);
                    } else {
                        self.chunkmap_try_clear(chunk_idx);
                    }
                    false
                }
            }
            None => {
                self.chunkmap_try_clear(chunk_idx);
                false
            }
        });
        result
    }

    pub fn clear_once_set(&self, idx: usize) {
        let (chunk_idx, local) = self.decompose(idx);
        self.chunks[chunk_idx].clear_once_set(local);
        self.chunkmap_try_clear(chunk_idx);
    }

    /// Most significant set bit across the whole bitmap.
    pub fn bsr(&self) -> Option<usize> {
        let chunk_idx = self.chunkmap.bsr()?;
        let local = self.chunks[chunk_idx].bsr()?;
        Some(chunk_idx * BITS_PER_CHUNK + local)
    }

    /// Walks every currently-set bit via the chunkmap summary. A
    /// snapshot-ish scan: concurrent mutation may cause individual
    /// bits to be missed or double-reported, but each reported bit
    /// corresponds to a real state at some instant. Returns false if
    /// `visit` requested an early stop.
    pub fn forall_set(&self, mut visit: impl FnMut(usize) -> bool) -> bool {
        let chunk_count = self.chunk_count();
        let cmap_fields = chunk_count.div_ceil(BFIELD_BITS as usize);
        for j in 0..cmap_fields {
            let mut cmap_word = self.chunkmap.field(j).load(Ordering::Relaxed);
            while cmap_word != 0 {
                let bit = cmap_word.trailing_zeros();
                cmap_word &= cmap_word - 1;
                let chunk_idx = j * BFIELD_BITS as usize + bit as usize;
                if chunk_idx >= chunk_count {
                    continue;
                }
                for f in 0..FIELDS_PER_CHUNK {
                    let mut fv = self.chunks[chunk_idx].field(f).load(Ordering::Relaxed);
                    while fv != 0 {
                        let b = fv.trailing_zeros();
                        fv &= fv - 1;
                        let global = chunk_idx * BITS_PER_CHUNK + f * BFIELD_BITS as usize + b as usize;
                        if !visit(global) {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests assume the default configuration: W=64, F=4
    // (256 bits per chunk).
    const CHUNK_BITS: usize = 256;

    fn is_default_config() -> bool {
        BITS_PER_CHUNK == CHUNK_BITS
    }

    #[test]
    fn find_and_clear_single_bit() {
        if !is_default_config() {
            return;
        }
        let bm = Bitmap::new(512);
        bm.xsetn(Polarity::Set, 100, 1);
        assert!(bm.is_xsetn(Polarity::Set, 100, 1));
        assert_eq!(bm.try_find_and_clear(0), Some(100));
        assert!(!bm.is_xsetn(Polarity::Set, 100, 1));
    }

    #[test]
    fn find_and_clear_aligned_byte() {
        if !is_default_config() {
            return;
        }
        let bm = Bitmap::new(512);
        bm.xsetn(Polarity::Set, 8, 8);
        assert_eq!(bm.try_find_and_clear8(0), Some(8));
        for i in 8..16 {
            assert!(bm.is_xsetn(Polarity::Clear, i, 1));
        }
    }

    #[test]
    fn cross_field_run_is_not_found_by_nx() {
        if !is_default_config() {
            return;
        }
        let bm = Bitmap::new(512);
        bm.xsetn(Polarity::Set, 60, 8); // spans field 0 bits 60-63, field 1 bits 0-3
        assert!(bm.is_xsetn(Polarity::Set, 60, 8));
        assert_eq!(bm.try_find_and_clear_n(0, 8), None);
        bm.xsetn(Polarity::Set, 2, 8); // aligned run, doesn't cross fields
        assert_eq!(bm.try_find_and_clear_n(0, 8), Some(2));
    }

    #[test]
    fn find_and_clear_large_run_across_fields() {
        if !is_default_config() {
            return;
        }
        let bm = Bitmap::new(512);
        unsafe {
            bm.unsafe_setn(0, 300);
        }
        assert_eq!(bm.try_find_and_clear_n(0, 200), Some(0));
        assert_eq!(bm.bsr(), Some(299));
        for i in 200..300 {
            assert!(bm.is_xsetn(Polarity::Set, i, 1), "bit {i} should remain set");
        }
        for i in 0..200 {
            assert!(bm.is_xsetn(Polarity::Clear, i, 1), "bit {i} should be cleared");
        }
    }

    #[test]
    fn try_xsetn_rollback_leaves_other_bits_untouched() {
        if !is_default_config() {
            return;
        }
        let bm = Bitmap::new(512);
        bm.xsetn(Polarity::Set, 130, 1);
        let (chunk_idx, local) = bm.decompose(64);
        let ok = bm.chunks[chunk_idx].try_xsetn(Polarity::Clear, local, 128);
        assert!(!ok);
        assert!(bm.is_xsetn(Polarity::Set, 130, 1));
        for i in 0..512 {
            if i != 130 {
                assert!(bm.is_xsetn(Polarity::Clear, i, 1), "bit {i} unexpectedly set");
            }
        }
    }

    #[test]
    fn chunkmap_downgrades_when_chunk_empties() {
        if !is_default_config() {
            return;
        }
        let bm = Bitmap::new(256);
        bm.xsetn(Polarity::Set, 10, 1);
        assert_eq!(bm.try_find_and_clear(0), Some(10));
        // Chunk 0 is now empty; chunkmap bit may legally be 0 or 1,
        // but a subsequent search must not report a phantom find.
        assert_eq!(bm.try_find_and_clear(0), None);
    }

    #[test]
    fn find_and_claim_keep_set_restores_bit() {
        if !is_default_config() {
            return;
        }
        let bm = Bitmap::new(256);
        bm.xsetn(Polarity::Set, 5, 1);
        let got = bm.try_find_and_claim(0, |idx| {
            assert_eq!(idx, 5);
            (false, true)
        });
        assert_eq!(got, None);
        assert!(bm.is_xsetn(Polarity::Set, 5, 1));
    }

    #[test]
    fn find_and_claim_accepts() {
        if !is_default_config() {
            return;
        }
        let bm = Bitmap::new(256);
        bm.xsetn(Polarity::Set, 5, 1);
        let got = bm.try_find_and_claim(0, |_| (true, false));
        assert_eq!(got, Some(5));
        assert!(bm.is_xsetn(Polarity::Clear, 5, 1));
    }

    #[test]
    fn forall_set_visits_all_and_respects_early_stop() {
        if !is_default_config() {
            return;
        }
        let bm = Bitmap::new(512);
        unsafe {
            bm.unsafe_setn(0, 3);
            bm.unsafe_setn(300, 2);
        }
        let mut seen = Vec::new();
        let completed = bm.forall_set(|idx| {
            seen.push(idx);
            true
        });
        assert!(completed);
        assert_eq!(seen, vec![0, 1, 2, 300, 301]);

        let mut count = 0;
        let completed = bm.forall_set(|_| {
            count += 1;
            false
        });
        assert!(!completed);
        assert_eq!(count, 1);
    }

    #[test]
    fn size_for_aligns_and_rejects_overflow() {
        let (_, chunk_count) = Bitmap::size_for(1);
        assert_eq!(chunk_count, 1);
        let (_, chunk_count) = Bitmap::size_for(CHUNK_BITS + 1);
        assert_eq!(chunk_count, 2);
    }
}
