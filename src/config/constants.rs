//! # Tuning Constants
//!
//! Interdependent values are co-located and their relationships enforced
//! with compile-time assertions.
//!
//! ```text
//! BLOCK size bounds [96, 65536]
//!       │
//!       ├─> BUCKET_HEADER_SIZE (8 bytes: entry count + spill pointer)
//!       │
//!       └─> BUCKET_ENTRY_SIZE (20 bytes: hash + offset + size)
//!             bucket capacity = (block_size - 8) / 20, so the smallest
//!             block still holds at least four entries
//!
//! COMMIT_DATA_TRIGGER
//!       │
//!       └─> MAX_PENDING_DATA (must be >): inserts signal the worker at the
//!           trigger and block (back-pressure) only at the hard cap, so a
//!           healthy worker never stalls writers
//! ```

use std::time::Duration;

/// Smallest supported block size. Combined with the power-of-two rule the
/// smallest usable block is 128 bytes.
pub const MIN_BLOCK_SIZE: usize = 96;

/// Largest supported block size.
pub const MAX_BLOCK_SIZE: usize = 65536;

/// Block size used when the caller does not choose one.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Smallest supported key width in bytes.
pub const MIN_KEY_SIZE: usize = 1;

/// Largest supported key width in bytes.
pub const MAX_KEY_SIZE: usize = 255;

/// Largest supported value size. The record format reserves 48 bits for the
/// size field but values are capped at what a 32-bit length can describe.
pub const MAX_VALUE_SIZE: u64 = u32::MAX as u64;

/// Default target fraction of bucket capacity in use after a commit.
pub const DEFAULT_LOAD_FACTOR: f64 = 0.5;

/// Bucket header: 16-bit entry count + 48-bit spill offset.
pub const BUCKET_HEADER_SIZE: usize = 8;

/// Bucket entry: 64-bit hash + 48-bit data offset + 48-bit value size.
pub const BUCKET_ENTRY_SIZE: usize = 20;

/// Width of the 48-bit size prefix on every data-file record. A zero prefix
/// marks a bucket spill instead of a value record.
pub const RECORD_SIZE_PREFIX: usize = 6;

const _: () = assert!(
    MIN_BLOCK_SIZE >= BUCKET_HEADER_SIZE + 4 * BUCKET_ENTRY_SIZE,
    "smallest block must hold the bucket header and at least four entries"
);

/// Pending data bytes at which an insert signals the commit worker.
pub const COMMIT_DATA_TRIGGER: usize = 8 * 1024 * 1024;

/// Dirty-bucket count at which an insert signals the commit worker.
pub const COMMIT_BUCKET_TRIGGER: usize = 4096;

/// Pending data bytes at which inserts block until the worker finishes a
/// round.
pub const MAX_PENDING_DATA: usize = 32 * 1024 * 1024;

const _: () = assert!(
    MAX_PENDING_DATA > COMMIT_DATA_TRIGGER,
    "back-pressure cap must sit above the worker trigger or every insert would stall"
);

/// Upper bound on the commit worker's condvar wait; doubles as the cadence
/// for periodic commits and arena retuning.
pub const COMMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Number of buckets a bucket of the given block size can index.
#[inline]
pub const fn bucket_capacity(block_size: usize) -> usize {
    (block_size - BUCKET_HEADER_SIZE) / BUCKET_ENTRY_SIZE
}
