//! # NuDB - Append-Only Key/Value Store
//!
//! NuDB is an insert-and-fetch key/value store for content-addressable
//! workloads: large numbers of fixed-size keys mapped to variable-size
//! values, read-heavy after bulk loading, with crash safety provided by a
//! rollback log. Keys are never updated or deleted; the value log only
//! grows, and the key index grows one bucket at a time under linear hashing.
//!
//! ## Quick Start
//!
//! ```ignore
//! use nudb::{CreateOptions, Store};
//!
//! Store::create("db.dat", "db.key", "db.log", &CreateOptions::new(8))?;
//! let store = Store::open("db.dat", "db.key", "db.log")?;
//!
//! store.insert(b"00000001", b"hello")?;
//! let value = store.fetch(b"00000001")?;
//! assert_eq!(value.as_deref(), Some(&b"hello"[..]));
//! store.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Public API (Store / recover /     │
//! │    rekey / verify / visit)          │
//! ├─────────────────────────────────────┤
//! │  Insert/Fetch Protocol + Splitting  │
//! ├──────────────────┬──────────────────┤
//! │  Bucket Cache    │  Commit Worker   │
//! │  (p1 write set,  │  (log → data →   │
//! │   p0 flush set)  │   key → trunc)   │
//! ├──────────────────┴──────────────────┤
//! │  Bucket / Record / Header Codecs    │
//! ├─────────────────────────────────────┤
//! │  Arena Allocator │ Positional I/O   │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! A database is three files bound together by a shared UID:
//!
//! ```text
//! db.dat     # header + append-only value records and bucket spills
//! db.key     # header block + linear-hashed array of fixed-size buckets
//! db.log     # rollback journal, zero-length whenever the store is clean
//! ```
//!
//! ## Durability Model
//!
//! Mutations accumulate in an in-memory bucket cache and a pending data
//! buffer. A background worker periodically promotes them to disk with a
//! four-phase commit: bucket pre-images are journaled to the log, data
//! records are appended, buckets are written in place, and finally the log
//! is truncated - the atomic commit point. After a crash, [`recover`]
//! replays the journal to roll the key file back to the last commit and
//! discards any data appended after it.
//!
//! ## Module Overview
//!
//! - [`store`]: the engine - open/create lifecycle, insert/fetch, commit
//!   worker, recovery, rekey, verify, visit
//! - `storage`: on-disk formats - file headers, bucket codec, record codec,
//!   bucket cache, positional file I/O
//! - `memory`: arena allocator backing the bucket caches
//! - `hash`: salted 64-bit key digests and the linear-hash bucket mapping
//! - `config`: format limits and commit tuning constants

pub mod config;
pub mod hash;
pub mod memory;
pub(crate) mod storage;
pub mod store;

pub use hash::{new_salt, new_uid, HashKind};
pub use store::{recover, rekey, verify, visit, CreateOptions, Store, VerifyInfo};
