//! Many threads repeatedly claim and release bits; no bit is ever
//! held by two threads at once.

use hier_bitmap::{Bitmap, Polarity};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const BIT_COUNT: usize = 512;
const THREADS: usize = 8;
const ITERATIONS: usize = 2_000;

#[test]
fn concurrent_claim_release_has_no_double_claim() {
    let bitmap = Bitmap::new(BIT_COUNT);
    unsafe {
        bitmap.unsafe_setn(0, BIT_COUNT);
    }
    let held: Vec<AtomicBool> = (0..BIT_COUNT).map(|_| AtomicBool::new(false)).collect();
    let total_claims = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for tseq in 0..THREADS {
            let bitmap = &bitmap;
            let held = &held;
            let total_claims = &total_claims;
            scope.spawn(move || {
                for _ in 0..ITERATIONS {
                    let Some(idx) = bitmap.try_find_and_clear(tseq) else {
                        continue;
                    };
                    let already_held = held[idx].swap(true, Ordering::AcqRel);
                    assert!(!already_held, "bit {idx} claimed by two threads at once");
                    total_claims.fetch_add(1, Ordering::Relaxed);

                    // Simulate brief ownership of the slice.
                    std::thread::yield_now();

                    held[idx].store(false, Ordering::Release);
                    bitmap.xset(Polarity::Set, idx);
                }
            });
        }
    });

    assert!(total_claims.load(Ordering::Relaxed) > 0);
    // Quiescent: every bit was released back, so the bitmap should be
    // back to fully set and the chunkmap fully summarizing that.
    for idx in 0..BIT_COUNT {
        assert!(bitmap.is_xsetn(Polarity::Set, idx, 1), "bit {idx} not restored");
    }
    assert_eq!(bitmap.bsr(), Some(BIT_COUNT - 1));
}

#[test]
fn staggered_search_finds_bits_regardless_of_tseq() {
    // For a fixed state with at least one set bit, any tseq must
    // still find something.
    let bitmap = Bitmap::new(BIT_COUNT);
    bitmap.xset(Polarity::Set, 200);
    for tseq in 0..64 {
        assert_eq!(bitmap.try_find_and_clear(tseq), Some(200));
        bitmap.xset(Polarity::Set, 200);
    }
}
