//! # Bucket Cache
//!
//! Map from bucket index to a block-sized blob living in an arena. The
//! store keeps two of these: `p1` accepts writes, `p0` is the snapshot the
//! commit worker is flushing. There is no eviction - a cache holds exactly
//! the buckets dirtied since the last commit and is drained wholesale.
//!
//! Arena memory is recycled across commits, so `create` zeroes its block
//! before handing it out (a zeroed block is a valid empty bucket).

use hashbrown::HashMap;

use crate::memory::{Arena, ArenaRef};

pub(crate) struct Cache {
    block_size: usize,
    arena: Arena,
    map: HashMap<u64, ArenaRef>,
}

impl Cache {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            arena: Arena::new(),
            map: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, index: u64) -> bool {
        self.map.contains_key(&index)
    }

    /// Allocates a zeroed block for a new empty bucket.
    pub fn create(&mut self, index: u64) -> &mut [u8] {
        debug_assert!(!self.map.contains_key(&index));
        let r = self.arena.alloc(self.block_size);
        self.map.insert(index, r);
        let block = self.arena.get_mut(r);
        block.fill(0);
        block
    }

    /// Inserts a copy of an existing bucket image.
    pub fn insert(&mut self, index: u64, block: &[u8]) -> &mut [u8] {
        debug_assert_eq!(block.len(), self.block_size);
        debug_assert!(!self.map.contains_key(&index));
        let r = self.arena.alloc(self.block_size);
        self.map.insert(index, r);
        let dst = self.arena.get_mut(r);
        dst.copy_from_slice(block);
        dst
    }

    pub fn find(&self, index: u64) -> Option<&[u8]> {
        self.map.get(&index).map(|&r| self.arena.get(r))
    }

    pub fn find_mut(&mut self, index: u64) -> Option<&mut [u8]> {
        match self.map.get(&index) {
            Some(&r) => Some(self.arena.get_mut(r)),
            None => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &[u8])> + '_ {
        self.map.iter().map(|(&i, &r)| (i, self.arena.get(r)))
    }

    /// Drops all entries and recycles the arena.
    pub fn clear(&mut self) {
        self.map.clear();
        self.arena.clear();
    }

    /// Releases the arena's free slabs.
    pub fn shrink_to_fit(&mut self) {
        self.arena.shrink_to_fit();
        self.map.shrink_to_fit();
    }

    pub fn periodic_activity(&mut self) {
        self.arena.periodic_activity();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_returns_zeroed_block() {
        let mut c = Cache::new(128);
        let block = c.create(3);
        assert_eq!(block.len(), 128);
        assert!(block.iter().all(|&b| b == 0));
        block[0] = 0xAA;
        assert_eq!(c.find(3).unwrap()[0], 0xAA);
    }

    #[test]
    fn create_zeroes_recycled_memory() {
        let mut c = Cache::new(128);
        c.create(1).fill(0xFF);
        c.clear();
        // recycled slab must not leak the old contents
        let block = c.create(1);
        assert!(block.iter().all(|&b| b == 0));
    }

    #[test]
    fn insert_copies_the_image() {
        let mut c = Cache::new(128);
        let mut image = vec![0u8; 128];
        image[10] = 7;
        c.insert(5, &image);
        image[10] = 9;
        assert_eq!(c.find(5).unwrap()[10], 7);
    }

    #[test]
    fn find_miss_is_none() {
        let mut c = Cache::new(128);
        c.create(1);
        assert!(c.find(2).is_none());
        assert!(c.find_mut(2).is_none());
    }

    #[test]
    fn clear_empties_the_map() {
        let mut c = Cache::new(128);
        c.create(1);
        c.create(2);
        assert_eq!(c.len(), 2);
        c.clear();
        assert!(c.is_empty());
        assert!(c.find(1).is_none());
    }

    #[test]
    fn iter_sees_every_entry() {
        let mut c = Cache::new(128);
        for i in 0..10 {
            c.create(i);
        }
        let mut seen: Vec<u64> = c.iter().map(|(i, _)| i).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<u64>>());
    }
}
