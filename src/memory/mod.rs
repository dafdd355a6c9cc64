//! Memory management for the bucket caches.
//!
//! The caches turn over their entire contents every commit, so their
//! backing memory comes from an [`Arena`] that recycles large slabs instead
//! of hitting the allocator per bucket.

mod arena;

pub use arena::{retune, Arena, ArenaRef};
