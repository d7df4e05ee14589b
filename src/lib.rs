//! `hier_bitmap` is a concurrent, lock-free, hierarchical bitmap
//! intended as the free-space / abandoned-page index of a
//! page-granular memory allocator. It answers three questions under
//! contention with minimal cache traffic:
//!
//! 1. atomically set or clear a bit, a byte, a machine-word field, or
//!    an arbitrary run of `n` consecutive bits;
//! 2. find and atomically claim (clear) the first available run of
//!    `n` consecutive set bits;
//! 3. iterate every currently-set bit for scanning or reclamation
//!    passes.
//!
//! The structure is a three-level cascade: [`bfield`] (one atomic
//! machine word), [`chunk`] (a cache-line-sized group of bfields),
//! and a chunkmap (itself a chunk, summarizing non-emptiness of every
//! chunk), assembled by [`Bitmap`]. [`bitmap`] is the only module
//! that is aware of the chunk-of-chunks structure; everything below
//! it operates purely on atomics.
//!
//! The allocator proper (arenas, page descriptors), CPU intrinsics,
//! and the surrounding page lifecycle state machine are external
//! collaborators and out of scope for this crate.

#[macro_use]
extern crate log;

mod bfield;
mod bitmap;
mod chunk;
mod cycle;
pub mod util;

pub use crate::bitmap::Bitmap;
pub use crate::chunk::Polarity;

/// Installs the crate's built-in `env_logger`-backed sink, if the
/// `builtin_env_logger` feature is enabled. Idempotent; safe to call
/// from multiple threads. A caller embedding this crate in a larger
/// system that already configures `log` does not need to call this.
pub fn init_logging() {
    util::logger::try_init();
}
