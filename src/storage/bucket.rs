//! # Bucket Codec
//!
//! A bucket is a view over one `block_size` slice of bytes, either inside
//! the cache arena, read from the key file, or embedded in a spill record
//! in the data file. The codec never owns the block; it reads and writes in
//! place.
//!
//! ## Layout (big-endian)
//!
//! ```text
//! +--------+--------------+---------------------------------------+
//! | count  | spill offset | entries[count]                        |
//! | 16 bit | 48 bit       | (hash: 64, offset: 48, size: 48) x N  |
//! +--------+--------------+---------------------------------------+
//! ```
//!
//! Entries are kept sorted by hash, ties broken by data offset, so lookup
//! is a binary search and chain walks touch each candidate once. A zero
//! spill offset terminates the overflow chain; a zeroed block is a valid
//! empty bucket, which is what a freshly extended key file contains.

use eyre::{ensure, Result};

use crate::config::{bucket_capacity, BUCKET_ENTRY_SIZE, BUCKET_HEADER_SIZE};
use crate::storage::{read_u48, write_u48};

/// One bucket slot: the key's hash, and where its value record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Entry {
    pub hash: u64,
    pub offset: u64,
    pub size: u64,
}

/// Bucket view over a borrowed block. `B` is `&[u8]` for read-only blocks
/// and `&mut [u8]` where entries are inserted.
pub(crate) struct Bucket<B> {
    block: B,
}

impl<B: AsRef<[u8]>> Bucket<B> {
    /// Wraps a block without validation. Use [`check`] first for blocks
    /// that did not come from this process's own cache.
    pub fn over(block: B) -> Self {
        debug_assert!(block.as_ref().len() >= BUCKET_HEADER_SIZE + BUCKET_ENTRY_SIZE);
        Self { block }
    }

    pub fn count(&self) -> usize {
        let b = self.block.as_ref();
        u16::from_be_bytes([b[0], b[1]]) as usize
    }

    pub fn spill(&self) -> u64 {
        read_u48(&self.block.as_ref()[2..8])
    }

    pub fn capacity(&self) -> usize {
        bucket_capacity(self.block.as_ref().len())
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.capacity()
    }

    pub fn entry(&self, i: usize) -> Entry {
        debug_assert!(i < self.count());
        let at = BUCKET_HEADER_SIZE + i * BUCKET_ENTRY_SIZE;
        let b = &self.block.as_ref()[at..at + BUCKET_ENTRY_SIZE];
        Entry {
            hash: u64::from_be_bytes(b[..8].try_into().unwrap()),
            offset: read_u48(&b[8..14]),
            size: read_u48(&b[14..20]),
        }
    }

    /// Index of the first entry with `entry.hash >= hash`, or `count()`.
    pub fn lower_bound(&self, hash: u64) -> usize {
        let mut lo = 0;
        let mut hi = self.count();
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.entry(mid).hash < hash {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    pub fn entries(&self) -> impl Iterator<Item = Entry> + '_ {
        (0..self.count()).map(move |i| self.entry(i))
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Bucket<B> {
    fn set_count(&mut self, count: usize) {
        self.block.as_mut()[..2].copy_from_slice(&(count as u16).to_be_bytes());
    }

    pub fn set_spill(&mut self, offset: u64) {
        write_u48(&mut self.block.as_mut()[2..8], offset);
    }

    /// Empties the bucket and drops its chain.
    pub fn reset(&mut self) {
        self.block.as_mut()[..BUCKET_HEADER_SIZE].fill(0);
    }

    /// Inserts in sorted position. The caller handles full buckets by
    /// spilling first.
    pub fn insert(&mut self, e: Entry) {
        let count = self.count();
        debug_assert!(count < self.capacity(), "insert into full bucket");

        // first slot whose (hash, offset) sorts after the new entry
        let mut i = self.lower_bound(e.hash);
        while i < count {
            let cur = self.entry(i);
            if cur.hash != e.hash || cur.offset > e.offset {
                break;
            }
            i += 1;
        }

        let at = BUCKET_HEADER_SIZE + i * BUCKET_ENTRY_SIZE;
        let end = BUCKET_HEADER_SIZE + count * BUCKET_ENTRY_SIZE;
        let block = self.block.as_mut();
        block.copy_within(at..end, at + BUCKET_ENTRY_SIZE);

        let slot = &mut block[at..at + BUCKET_ENTRY_SIZE];
        slot[..8].copy_from_slice(&e.hash.to_be_bytes());
        write_u48(&mut slot[8..14], e.offset);
        write_u48(&mut slot[14..20], e.size);

        self.set_count(count + 1);
    }
}

/// Validates a block read from disk: entry count within capacity, spill and
/// entry targets inside the data file, entries sorted.
pub(crate) fn check(block: &[u8], key_size: usize, dat_file_size: u64) -> Result<()> {
    let b = Bucket::over(block);
    ensure!(
        b.count() <= b.capacity(),
        "bad bucket: {} entries exceeds capacity {}",
        b.count(),
        b.capacity()
    );
    ensure!(
        b.spill() < dat_file_size,
        "bad spill: offset {} beyond data file size {}",
        b.spill(),
        dat_file_size
    );
    let mut prev: Option<Entry> = None;
    for e in b.entries() {
        ensure!(
            e.size > 0 && e.offset + 6 + key_size as u64 + e.size <= dat_file_size,
            "bad bucket: entry points outside the data file (offset {}, size {})",
            e.offset,
            e.size
        );
        if let Some(p) = prev {
            ensure!(
                (p.hash, p.offset) < (e.hash, e.offset),
                "bad bucket: entries out of order"
            );
        }
        prev = Some(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(hash: u64, offset: u64) -> Entry {
        Entry {
            hash,
            offset,
            size: 16,
        }
    }

    #[test]
    fn zeroed_block_is_empty() {
        let block = vec![0u8; 128];
        let b = Bucket::over(&block[..]);
        assert_eq!(b.count(), 0);
        assert_eq!(b.spill(), 0);
        assert_eq!(b.capacity(), 6);
        assert!(!b.is_full());
    }

    #[test]
    fn insert_keeps_hash_order() {
        let mut block = vec![0u8; 4096];
        let mut b = Bucket::over(&mut block[..]);
        b.insert(entry(50, 100));
        b.insert(entry(10, 200));
        b.insert(entry(90, 300));
        b.insert(entry(50, 50));

        let hashes: Vec<u64> = b.entries().map(|e| e.hash).collect();
        assert_eq!(hashes, vec![10, 50, 50, 90]);

        // equal hashes tie-break by offset
        assert_eq!(b.entry(1).offset, 50);
        assert_eq!(b.entry(2).offset, 100);
    }

    #[test]
    fn lower_bound_finds_first_match() {
        let mut block = vec![0u8; 4096];
        let mut b = Bucket::over(&mut block[..]);
        for h in [10u64, 20, 20, 30] {
            b.insert(entry(h, h));
        }
        assert_eq!(b.lower_bound(5), 0);
        assert_eq!(b.lower_bound(20), 1);
        assert_eq!(b.lower_bound(25), 3);
        assert_eq!(b.lower_bound(31), 4);
    }

    #[test]
    fn spill_field_roundtrip() {
        let mut block = vec![0u8; 128];
        let mut b = Bucket::over(&mut block[..]);
        b.insert(entry(1, 2));
        b.set_spill(0xABCD_EF01);
        assert_eq!(b.spill(), 0xABCD_EF01);
        assert_eq!(b.count(), 1);

        b.reset();
        assert_eq!(b.count(), 0);
        assert_eq!(b.spill(), 0);
    }

    #[test]
    fn fills_to_capacity() {
        let mut block = vec![0u8; 128];
        let mut b = Bucket::over(&mut block[..]);
        for h in 0..6u64 {
            assert!(!b.is_full());
            b.insert(entry(h, 100 + h));
        }
        assert!(b.is_full());
    }

    #[test]
    fn check_accepts_well_formed() {
        let mut block = vec![0u8; 128];
        let mut b = Bucket::over(&mut block[..]);
        b.insert(entry(5, 92));
        b.insert(entry(9, 200));
        check(&block, 8, 100_000).unwrap();
    }

    #[test]
    fn check_rejects_overflowing_count() {
        let mut block = vec![0u8; 128];
        block[..2].copy_from_slice(&100u16.to_be_bytes());
        let err = check(&block, 8, 100_000).unwrap_err();
        assert!(err.to_string().contains("bad bucket"), "{err}");
    }

    #[test]
    fn check_rejects_wild_spill() {
        let mut block = vec![0u8; 128];
        write_u48(&mut block[2..8], 5_000_000);
        let err = check(&block, 8, 100_000).unwrap_err();
        assert!(err.to_string().contains("bad spill"), "{err}");
    }

    #[test]
    fn check_rejects_entry_past_eof() {
        let mut block = vec![0u8; 128];
        let mut b = Bucket::over(&mut block[..]);
        b.insert(Entry {
            hash: 1,
            offset: 99_990,
            size: 1000,
        });
        let err = check(&block, 8, 100_000).unwrap_err();
        assert!(err.to_string().contains("bad bucket"), "{err}");
    }
}
