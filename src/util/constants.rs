//! Compile-time widths of the three cascade levels.
//!
//! `W` is the width in bits of one bfield (L0), selected by the
//! `narrow_bfield` feature. `F` is the number of bfields per chunk
//! (L1), selected by the `wide_chunk` feature. Both are powers of two
//! by construction; `static_assertions` pins this down at compile
//! time so a typo in a future feature combination fails the build
//! instead of corrupting bit arithmetic silently.

use static_assertions::const_assert;

cfg_if::cfg_if! {
    if #[cfg(feature = "narrow_bfield")] {
        /// The integer type backing one bfield.
        pub type BfieldInt = u32;
        /// The atomic type backing one bfield.
        pub type AtomicBfield = std::sync::atomic::AtomicU32;
        /// log2 of [`BFIELD_BITS`].
        pub const LOG_BFIELD_BITS: u32 = 5;
    } else {
        /// The integer type backing one bfield.
        pub type BfieldInt = u64;
        /// The atomic type backing one bfield.
        pub type AtomicBfield = std::sync::atomic::AtomicU64;
        /// log2 of [`BFIELD_BITS`].
        pub const LOG_BFIELD_BITS: u32 = 6;
    }
}

/// `W`: number of bits in one bfield.
pub const BFIELD_BITS: u32 = 1 << LOG_BFIELD_BITS;

cfg_if::cfg_if! {
    if #[cfg(feature = "wide_chunk")] {
        /// `F`: number of bfields per chunk.
        pub const FIELDS_PER_CHUNK: usize = 8;
        /// log2 of [`FIELDS_PER_CHUNK`].
        pub const LOG_FIELDS_PER_CHUNK: u32 = 3;
    } else {
        /// `F`: number of bfields per chunk.
        pub const FIELDS_PER_CHUNK: usize = 4;
        /// log2 of [`FIELDS_PER_CHUNK`].
        pub const LOG_FIELDS_PER_CHUNK: u32 = 2;
    }
}

/// Bits per chunk, `F * W`.
pub const BITS_PER_CHUNK: usize = FIELDS_PER_CHUNK << LOG_BFIELD_BITS;

const_assert!(FIELDS_PER_CHUNK.is_power_of_two());
const_assert!(BFIELD_BITS.is_power_of_two());
