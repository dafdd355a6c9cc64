//! # Store Engine
//!
//! The public engine tying the storage layer together: three files bound by
//! a shared UID, a mutex-guarded state holding the write cache `p1` and the
//! flush cache `p0`, a pending data buffer, and a background commit worker.
//!
//! ## Write path
//!
//! An insert appends its record to the pending buffer (assigning the final
//! data-file offset immediately), places a sorted entry into the target
//! bucket in `p1` - spilling the bucket into the pending buffer first when
//! it is full - and splits one bucket when the load factor crosses its
//! target. Nothing touches disk until the commit worker runs.
//!
//! ## Read path
//!
//! A fetch probes `p1`, then `p0`, then the key file, walking the spill
//! chain of whichever bucket it finds. Cache probes, chain walks and reads
//! of not-yet-durable bytes happen under the store mutex; value bytes at
//! durable offsets are read lock-free because the data file is append-only.
//! The visitor always runs outside the lock on a copied buffer.
//!
//! ## Growth
//!
//! Linear hashing: `buckets` grows by one per split inside a power-of-two
//! epoch bounded by `modulus`. The split source is `buckets - modulus/2`
//! (after doubling `modulus` when the epoch is full), the new bucket is the
//! old `buckets`, and the source's whole chain is redistributed between the
//! two through the cache so the next commit carries it.

mod commit;
mod recover;
mod rekey;
mod verify;
mod visit;

pub use recover::recover;
pub use rekey::rekey;
pub use verify::{verify, VerifyInfo};
pub use visit::visit;

use std::fs::{self, File};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use eyre::{bail, ensure, eyre, Result, WrapErr};
use parking_lot::{Condvar, Mutex};
use zerocopy::IntoBytes;

use crate::config::{
    self, bucket_capacity, COMMIT_BUCKET_TRIGGER, COMMIT_DATA_TRIGGER, DEFAULT_BLOCK_SIZE,
    DEFAULT_LOAD_FACTOR, MAX_PENDING_DATA, MAX_VALUE_SIZE, RECORD_SIZE_PREFIX,
};
use crate::hash::{self, HashKind, DEFAULT_HASH_KIND};
use crate::storage::bucket::{self, Bucket, Entry};
use crate::storage::cache::Cache;
use crate::storage::data;
use crate::storage::file;
use crate::storage::headers::{
    self, DatHeader, KeyHeader, DAT_HEADER_SIZE, KEY_HEADER_SIZE,
};

/// Parameters for [`Store::create`].
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub appnum: u64,
    pub salt: u64,
    pub key_size: usize,
    pub block_size: usize,
    pub load_factor: f64,
}

impl CreateOptions {
    /// Options for a store with the given key width: fresh random salt,
    /// 4096-byte blocks, 0.5 load factor.
    pub fn new(key_size: usize) -> Self {
        Self {
            appnum: 0,
            salt: hash::new_salt(),
            key_size,
            block_size: DEFAULT_BLOCK_SIZE,
            load_factor: DEFAULT_LOAD_FACTOR,
        }
    }

    pub fn appnum(mut self, appnum: u64) -> Self {
        self.appnum = appnum;
        self
    }

    pub fn salt(mut self, salt: u64) -> Self {
        self.salt = salt;
        self
    }

    pub fn block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn load_factor(mut self, load_factor: f64) -> Self {
        self.load_factor = load_factor;
        self
    }
}

/// Immutable per-store facts read from the key header at open.
struct HeaderInfo {
    uid: u64,
    appnum: u64,
    key_size: usize,
    salt: u64,
    block_size: usize,
    hash_kind: HashKind,
    load_factor: u16,
    capacity: usize,
}

/// Everything behind the store mutex.
struct State {
    /// Write cache: buckets dirtied since the last swap.
    p1: Cache,
    /// Flush cache: the batch the worker is committing. Stays visible to
    /// fetches for the whole round.
    p0: Cache,
    /// Data records appended since the last swap.
    pending: Vec<u8>,
    /// The pending buffer taken by the in-flight commit; offsets in
    /// `[dat_size, dat_size + flushing.len())` are served from here until
    /// the data phase lands.
    flushing: Option<Arc<Vec<u8>>>,
    buckets: u64,
    modulus: u64,
    /// Bucket count already materialized in the key file.
    disk_buckets: u64,
    /// Durable data file size.
    dat_size: u64,
    items: u64,
    commit_err: Option<String>,
    stop: bool,
}

impl State {
    fn flushing_len(&self) -> u64 {
        self.flushing.as_ref().map_or(0, |f| f.len() as u64)
    }

    /// End of the data stream including not-yet-durable bytes; also the
    /// offset the next appended record receives.
    fn visible_dat_size(&self) -> u64 {
        self.dat_size + self.flushing_len() + self.pending.len() as u64
    }

    fn has_work(&self) -> bool {
        !self.p1.is_empty() || !self.pending.is_empty()
    }
}

struct Shared {
    df: File,
    kf: File,
    lf: File,
    info: HeaderInfo,
    state: Mutex<State>,
    /// Signaled when pending work crosses a commit trigger or at close.
    work: Condvar,
    /// Signaled when a commit round ends; releases back-pressured inserts.
    done: Condvar,
}

/// An open database. `insert` and `fetch` are safe to call from multiple
/// threads; there is a single internal writer serialization point.
pub struct Store {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Materializes a new database: data and key headers, one empty bucket,
    /// an empty log. Fails if any of the three files exists.
    pub fn create(
        dat_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        log_path: impl AsRef<Path>,
        options: &CreateOptions,
    ) -> Result<()> {
        let (dat_path, key_path, log_path) =
            (dat_path.as_ref(), key_path.as_ref(), log_path.as_ref());
        config::validate_key_size(options.key_size)?;
        config::validate_block_size(options.block_size)?;
        config::validate_load_factor(options.load_factor)?;

        let uid = hash::new_uid();
        let load_factor = (options.load_factor * 65535.0) as u16;

        let df = file::create_new(dat_path)?;
        let kf = match file::create_new(key_path) {
            Ok(f) => f,
            Err(e) => {
                let _ = fs::remove_file(dat_path);
                return Err(e);
            }
        };
        let lf = match file::create_new(log_path) {
            Ok(f) => f,
            Err(e) => {
                let _ = fs::remove_file(dat_path);
                let _ = fs::remove_file(key_path);
                return Err(e);
            }
        };

        let write_all = || -> Result<()> {
            let dh = DatHeader::new(uid, options.appnum, options.key_size);
            file::write_at(&df, 0, dh.as_bytes())?;
            file::sync(&df)?;

            let kh = KeyHeader::new(
                uid,
                options.appnum,
                options.key_size,
                options.salt,
                DEFAULT_HASH_KIND,
                options.block_size,
                load_factor,
                1,
                1,
            );
            // header block plus one empty bucket
            let mut blocks = vec![0u8; options.block_size * 2];
            blocks[..KEY_HEADER_SIZE].copy_from_slice(kh.as_bytes());
            file::write_at(&kf, 0, &blocks)?;
            file::sync(&kf)?;
            file::sync(&lf)?;
            Ok(())
        };
        if let Err(e) = write_all() {
            let _ = fs::remove_file(dat_path);
            let _ = fs::remove_file(key_path);
            let _ = fs::remove_file(log_path);
            return Err(e);
        }
        Ok(())
    }

    /// Opens an existing database and starts the commit worker.
    ///
    /// Fails if the log file is non-empty: the database was not closed
    /// cleanly and [`recover`] must run first.
    pub fn open(
        dat_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        log_path: impl AsRef<Path>,
    ) -> Result<Store> {
        let df = file::open_rw(dat_path.as_ref())?;
        let kf = file::open_rw(key_path.as_ref())?;
        let lf = file::open_or_create(log_path.as_ref())?;
        ensure!(
            file::size(&lf)? == 0,
            "log file exists: recover the database before opening it"
        );

        let mut dh_bytes = [0u8; DAT_HEADER_SIZE];
        file::read_at(&df, 0, &mut dh_bytes)?;
        let dh = DatHeader::from_bytes(&dh_bytes)?;

        let mut kh_bytes = [0u8; KEY_HEADER_SIZE];
        file::read_at(&kf, 0, &mut kh_bytes)?;
        let kh = KeyHeader::from_bytes(&kh_bytes)?;
        headers::check_pair(&dh, &kh)?;

        let block_size = kh.block_size();
        let key_file_size = file::size(&kf)?;
        ensure!(
            key_file_size >= 2 * block_size as u64 && key_file_size % block_size as u64 == 0,
            "invalid key file size {} for block size {}",
            key_file_size,
            block_size
        );
        // The file is authoritative: a crash between the key phase and the
        // log truncate can leave the header's copy one commit ahead of the
        // recovered file.
        let buckets = key_file_size / block_size as u64 - 1;
        let modulus = hash::ceil_pow2(buckets);
        if kh.buckets() != buckets {
            tracing::debug!(
                header = kh.buckets(),
                derived = buckets,
                "key header geometry differs from file size; using the file"
            );
        }

        let dat_size = file::size(&df)?;
        ensure!(
            dat_size >= DAT_HEADER_SIZE as u64,
            "short read: data file smaller than its header"
        );

        let capacity = bucket_capacity(block_size);
        let info = HeaderInfo {
            uid: kh.uid(),
            appnum: kh.appnum(),
            key_size: kh.key_size(),
            salt: kh.salt(),
            block_size,
            hash_kind: kh.hash_kind(),
            load_factor: kh.load_factor(),
            capacity,
        };
        // Seed the item counter at the split threshold so growth resumes at
        // the steady-state cadence without persisting an exact count.
        let items = buckets * capacity as u64 * info.load_factor as u64 / 65536;

        let shared = Arc::new(Shared {
            df,
            kf,
            lf,
            info,
            state: Mutex::new(State {
                p1: Cache::new(block_size),
                p0: Cache::new(block_size),
                pending: Vec::new(),
                flushing: None,
                buckets,
                modulus,
                disk_buckets: buckets,
                dat_size,
                items,
                commit_err: None,
                stop: false,
            }),
            work: Condvar::new(),
            done: Condvar::new(),
        });

        let worker = thread::Builder::new()
            .name("nudb-commit".into())
            .spawn({
                let shared = Arc::clone(&shared);
                move || commit::run(shared)
            })
            .wrap_err("failed to spawn commit worker")?;

        Ok(Store {
            shared,
            worker: Some(worker),
        })
    }

    /// Inserts a key/value pair. Fails with "key already exists" when the
    /// key is present, committed or not; the stored value is unchanged.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let info = &self.shared.info;
        ensure!(
            key.len() == info.key_size,
            "key size mismatch: got {}, store uses {}",
            key.len(),
            info.key_size
        );
        ensure!(
            !value.is_empty() && value.len() as u64 <= MAX_VALUE_SIZE,
            "invalid value size: {}",
            value.len()
        );
        let h = hash::hash_key(info.hash_kind, info.salt, key);

        let shared = &*self.shared;
        let mut s = shared.state.lock();
        if let Some(msg) = &s.commit_err {
            bail!("store is in a failed state: {msg}");
        }
        ensure!(!s.stop, "store is closed");

        match shared.lookup(&s, h, key) {
            Ok(Some(_)) => bail!("key already exists"),
            Ok(None) => {}
            Err(e) => return Err(shared.poison(&mut s, e)),
        }

        let offset = s.visible_dat_size();
        data::append_value_record(&mut s.pending, key, value);
        let index = hash::bucket_index(h, s.buckets, s.modulus);
        let entry = Entry {
            hash: h,
            offset,
            size: value.len() as u64,
        };
        if let Err(e) = shared.place_entry(&mut s, index, entry) {
            return Err(shared.poison(&mut s, e));
        }
        s.items += 1;
        if s.items > shared.split_threshold(s.buckets) {
            if let Err(e) = shared.split(&mut s) {
                return Err(shared.poison(&mut s, e));
            }
        }

        if s.pending.len() >= COMMIT_DATA_TRIGGER || s.p1.len() >= COMMIT_BUCKET_TRIGGER {
            shared.work.notify_one();
        }
        while s.pending.len() >= MAX_PENDING_DATA && s.commit_err.is_none() && !s.stop {
            shared.work.notify_one();
            shared.done.wait(&mut s);
        }
        if let Some(msg) = &s.commit_err {
            bail!("store is in a failed state: {msg}");
        }
        Ok(())
    }

    /// Looks a key up and passes the value to `visitor`. Returns whether
    /// the key was found; visitor errors propagate unchanged.
    pub fn fetch_with<F>(&self, key: &[u8], visitor: F) -> Result<bool>
    where
        F: FnOnce(&[u8]) -> Result<()>,
    {
        let info = &self.shared.info;
        ensure!(
            key.len() == info.key_size,
            "key size mismatch: got {}, store uses {}",
            key.len(),
            info.key_size
        );
        let h = hash::hash_key(info.hash_kind, info.salt, key);

        enum Found {
            Buffered(Vec<u8>),
            OnDisk { offset: u64, size: u64 },
        }

        let shared = &*self.shared;
        let found = {
            let mut s = shared.state.lock();
            ensure!(!s.stop, "store is closed");
            let entry = match shared.lookup(&s, h, key) {
                Ok(e) => e,
                Err(e) => return Err(shared.poison(&mut s, e)),
            };
            let Some(entry) = entry else {
                return Ok(false);
            };
            let value_offset = entry.offset + RECORD_SIZE_PREFIX as u64 + info.key_size as u64;
            if value_offset + entry.size > s.dat_size {
                let mut value = vec![0u8; entry.size as usize];
                if let Err(e) = shared.read_data(&s, value_offset, &mut value) {
                    return Err(shared.poison(&mut s, e));
                }
                Found::Buffered(value)
            } else {
                Found::OnDisk {
                    offset: value_offset,
                    size: entry.size,
                }
            }
        };

        let value = match found {
            Found::Buffered(value) => value,
            Found::OnDisk { offset, size } => {
                let mut value = vec![0u8; size as usize];
                file::read_at(&shared.df, offset, &mut value)?;
                value
            }
        };
        visitor(&value)?;
        Ok(true)
    }

    /// Looks a key up and returns a copy of its value.
    pub fn fetch(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut out = None;
        let hit = self.fetch_with(key, |value| {
            out = Some(value.to_vec());
            Ok(())
        })?;
        Ok(if hit { out } else { None })
    }

    /// Commits everything pending, stops the worker and truncates the log.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        {
            let mut s = self.shared.state.lock();
            s.stop = true;
        }
        self.shared.work.notify_all();
        self.shared.done.notify_all();
        worker
            .join()
            .map_err(|_| eyre!("commit worker panicked"))?;
        {
            let s = self.shared.state.lock();
            if let Some(msg) = &s.commit_err {
                bail!("store is in a failed state: {msg}");
            }
        }
        // final synchronous round drains whatever the worker had not taken
        commit::commit_round(&self.shared)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl Shared {
    /// Byte offset of bucket `index` in the key file.
    fn bucket_offset(&self, index: u64) -> u64 {
        self.info.block_size as u64 * (1 + index)
    }

    /// Item count above which the next insert splits a bucket.
    fn split_threshold(&self, buckets: u64) -> u64 {
        buckets * self.info.capacity as u64 * self.info.load_factor as u64 / 65536
    }

    /// Records a structural or I/O failure so every later mutation reports
    /// it, and hands the original error back.
    fn poison(&self, s: &mut State, e: eyre::Report) -> eyre::Report {
        if s.commit_err.is_none() {
            s.commit_err = Some(format!("{e:#}"));
        }
        self.done.notify_all();
        e
    }

    /// Reads `buf.len()` bytes of the data stream at `offset`, serving
    /// not-yet-durable ranges from the flush and pending buffers. Records
    /// never straddle a buffer boundary: each is appended whole to one
    /// pending buffer, and the buffers are promoted wholesale.
    fn read_data(&self, s: &State, offset: u64, buf: &mut [u8]) -> Result<()> {
        let flushing_len = s.flushing_len();
        if offset >= s.dat_size + flushing_len {
            let rel = (offset - s.dat_size - flushing_len) as usize;
            ensure!(
                rel + buf.len() <= s.pending.len(),
                "short read: {} bytes at pending offset {}",
                buf.len(),
                offset
            );
            buf.copy_from_slice(&s.pending[rel..rel + buf.len()]);
            Ok(())
        } else if offset >= s.dat_size {
            let flushing = s.flushing.as_ref().unwrap();
            let rel = (offset - s.dat_size) as usize;
            ensure!(
                rel + buf.len() <= flushing.len(),
                "short read: {} bytes at flush offset {}",
                buf.len(),
                offset
            );
            buf.copy_from_slice(&flushing[rel..rel + buf.len()]);
            Ok(())
        } else {
            ensure!(
                offset + buf.len() as u64 <= s.dat_size,
                "short read: {} bytes at offset {}",
                buf.len(),
                offset
            );
            file::read_at(&self.df, offset, buf)
        }
    }

    /// Loads and validates the bucket image of a spill record.
    fn read_spill(&self, s: &State, offset: u64) -> Result<Vec<u8>> {
        let block_size = self.info.block_size;
        let mut prefix = [0u8; data::SPILL_PREFIX];
        self.read_data(s, offset, &mut prefix)?;
        ensure!(
            crate::storage::read_u48(&prefix) == 0,
            "bad spill: no spill marker at offset {}",
            offset
        );
        let image_size =
            u32::from_be_bytes([prefix[6], prefix[7], prefix[8], prefix[9]]) as usize;
        ensure!(
            image_size == block_size,
            "bad spill: image size {} does not match block size {}",
            image_size,
            block_size
        );
        let mut block = vec![0u8; block_size];
        self.read_data(s, offset + data::SPILL_PREFIX as u64, &mut block)?;
        bucket::check(&block, self.info.key_size, s.visible_dat_size())?;
        Ok(block)
    }

    /// Loads and validates bucket `index` from the key file.
    fn read_disk_bucket(&self, s: &State, index: u64) -> Result<Vec<u8>> {
        let mut block = vec![0u8; self.info.block_size];
        file::read_at(&self.kf, self.bucket_offset(index), &mut block)?;
        bucket::check(&block, self.info.key_size, s.visible_dat_size())?;
        Ok(block)
    }

    /// Full lookup walk: cache-first bucket selection, then the spill
    /// chain, comparing key bytes at each hash match.
    fn lookup(&self, s: &State, h: u64, key: &[u8]) -> Result<Option<Entry>> {
        let index = hash::bucket_index(h, s.buckets, s.modulus);
        let mut block: Vec<u8> = match s.p1.find(index).or_else(|| s.p0.find(index)) {
            Some(b) => b.to_vec(),
            None if index < s.disk_buckets => self.read_disk_bucket(s, index)?,
            None => return Ok(None),
        };
        loop {
            let b = Bucket::over(&block[..]);
            let mut i = b.lower_bound(h);
            while i < b.count() {
                let e = b.entry(i);
                if e.hash != h {
                    break;
                }
                let mut candidate = vec![0u8; self.info.key_size];
                self.read_data(s, e.offset + RECORD_SIZE_PREFIX as u64, &mut candidate)?;
                if candidate == key {
                    return Ok(Some(e));
                }
                i += 1;
            }
            let spill = b.spill();
            if spill == 0 {
                return Ok(None);
            }
            block = self.read_spill(s, spill)?;
        }
    }

    /// Makes bucket `index` writable in `p1`: reuse the cached copy, copy
    /// the flush cache's version, load it from disk, or start it empty.
    fn ensure_cached(&self, s: &mut State, index: u64) -> Result<()> {
        if s.p1.contains(index) {
            return Ok(());
        }
        if let Some(image) = s.p0.find(index).map(|b| b.to_vec()) {
            s.p1.insert(index, &image);
            return Ok(());
        }
        if index < s.disk_buckets {
            let block = self.read_disk_bucket(s, index)?;
            s.p1.insert(index, &block);
        } else {
            s.p1.create(index);
        }
        Ok(())
    }

    /// Puts an entry into bucket `index` through the cache, spilling the
    /// bucket into the pending buffer first if it is full.
    fn place_entry(&self, s: &mut State, index: u64, entry: Entry) -> Result<()> {
        self.ensure_cached(s, index)?;
        let is_full = Bucket::over(s.p1.find(index).unwrap()).is_full();
        if is_full {
            let image = s.p1.find(index).unwrap().to_vec();
            let spill_offset = s.visible_dat_size();
            data::append_spill_record(&mut s.pending, &image);
            let mut b = Bucket::over(s.p1.find_mut(index).unwrap());
            b.reset();
            b.set_spill(spill_offset);
        }
        Bucket::over(s.p1.find_mut(index).unwrap()).insert(entry);
        Ok(())
    }

    /// Grows the table by one bucket and redistributes the split source's
    /// whole chain between the old and new indices.
    fn split(&self, s: &mut State) -> Result<()> {
        if s.buckets == s.modulus {
            s.modulus *= 2;
        }
        let source = s.buckets - s.modulus / 2;
        let new = s.buckets;
        s.buckets += 1;

        self.ensure_cached(s, source)?;
        let mut entries: Vec<Entry> = Vec::new();
        let mut spill;
        {
            let b = Bucket::over(s.p1.find(source).unwrap());
            entries.extend(b.entries());
            spill = b.spill();
        }
        while spill != 0 {
            let block = self.read_spill(s, spill)?;
            let b = Bucket::over(&block[..]);
            entries.extend(b.entries());
            spill = b.spill();
        }

        Bucket::over(s.p1.find_mut(source).unwrap()).reset();
        s.p1.create(new);
        for entry in entries {
            let target = hash::bucket_index(entry.hash, s.buckets, s.modulus);
            debug_assert!(target == source || target == new);
            self.place_entry(s, target, entry)?;
        }
        tracing::trace!(source, new, buckets = s.buckets, "bucket split");
        Ok(())
    }
}
