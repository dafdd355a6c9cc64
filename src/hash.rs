//! Stable key hashing and the linear-hash bucket mapping.
//!
//! Bucket placement must survive reopening the database on a different
//! toolchain or platform, so keys are digested with an explicit, stable
//! 64-bit hash rather than `std::collections`' default hasher. The digest is
//! keyed with a per-database random salt drawn at create time; the salt's
//! own digest (the *pepper*) is stored in the key-file header so an opened
//! database can prove its hasher still agrees with the one that built it.

use std::fmt;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use twox_hash::XxHash64;

/// Hash algorithm identifier, stored as a u16 in the key and log headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    /// 64-bit xxHash seeded with the database salt.
    Xx64 = 1,
}

impl HashKind {
    pub fn to_u16(self) -> u16 {
        match self {
            HashKind::Xx64 => 1,
        }
    }

    /// Parses an on-disk code. Unknown codes return `None`.
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1 => Some(HashKind::Xx64),
            _ => None,
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashKind::Xx64 => write!(f, "xxhash64"),
        }
    }
}

/// Hash kind for newly created databases.
pub const DEFAULT_HASH_KIND: HashKind = HashKind::Xx64;

/// Computes the salted 64-bit digest of a key.
pub fn hash_key(kind: HashKind, salt: u64, key: &[u8]) -> u64 {
    match kind {
        HashKind::Xx64 => {
            let mut h = XxHash64::with_seed(salt);
            h.write(key);
            h.finish()
        }
    }
}

/// Digest of the salt under its own seed, stored in headers as an integrity
/// check that the opening process hashes identically to the creator.
pub fn pepper(kind: HashKind, salt: u64) -> u64 {
    hash_key(kind, salt, &salt.to_be_bytes())
}

/// Maps a hash to its bucket under linear hashing.
///
/// `modulus` is the power of two bounding the current epoch, with
/// `modulus / 2 <= buckets <= modulus`. Hashes landing on a bucket that has
/// not been created yet this epoch fall back to the previous epoch's
/// modulus.
#[inline]
pub fn bucket_index(hash: u64, buckets: u64, modulus: u64) -> u64 {
    debug_assert!(modulus.is_power_of_two());
    debug_assert!(modulus / 2 <= buckets && buckets <= modulus);
    let n = hash % modulus;
    if n >= buckets {
        n - modulus / 2
    } else {
        n
    }
}

/// Smallest power of two >= `n` (n >= 1).
#[inline]
pub fn ceil_pow2(n: u64) -> u64 {
    debug_assert!(n >= 1);
    n.next_power_of_two()
}

static SEQ: AtomicU64 = AtomicU64::new(0);

fn clock_entropy() -> u64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    // golden-ratio stride keeps back-to-back draws far apart
    (nanos as u64)
        ^ ((nanos >> 64) as u64)
        ^ seq.wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

/// Draws a fresh database salt.
pub fn new_salt() -> u64 {
    hash_key(DEFAULT_HASH_KIND, 0, &clock_entropy().to_be_bytes())
}

/// Draws a fresh database UID.
pub fn new_uid() -> u64 {
    hash_key(DEFAULT_HASH_KIND, 1, &clock_entropy().to_be_bytes())
}
