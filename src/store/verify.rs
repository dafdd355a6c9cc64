//! # Structural Verification
//!
//! Offline consistency check over a closed database: every bucket chain is
//! well-formed and sorted, every entry lands in the bucket its hash maps
//! to, and bucket entries and data-file value records correspond 1:1.
//!
//! Two algorithms, chosen by the caller's buffer budget:
//!
//! - **fast**: with a budget of at least the key-file size, collect every
//!   chain entry into an offset map, then stream the data file once and
//!   tick records off against it.
//! - **slow**: with no budget, stream the data file and look each record's
//!   key up through the normal bucket walk. Quadratic in chain length but
//!   needs only one block of memory at a time.

use std::fs::File;
use std::path::Path;

use eyre::{ensure, Result};
use hashbrown::HashMap;

use crate::config::bucket_capacity;
use crate::hash;
use crate::storage::bucket::{self, Bucket};
use crate::storage::data::{self, DataScanner, ScanRecord};
use crate::storage::file;
use crate::storage::headers::{self, DatHeader, KeyHeader, DAT_HEADER_SIZE, KEY_HEADER_SIZE};

/// Report produced by [`verify`].
#[derive(Debug, Clone)]
pub struct VerifyInfo {
    /// "fast" (offset map) or "slow" (per-record walk).
    pub algorithm: &'static str,
    pub dat_file_size: u64,
    pub key_file_size: u64,
    pub buckets: u64,
    pub capacity: usize,
    /// Value records indexed by the key file.
    pub value_count: u64,
    /// Total bytes of indexed values.
    pub value_bytes: u64,
    /// Live spill records across all chains (abandoned spills from old
    /// splits are not counted).
    pub spill_count: u64,
    /// `value_count / (buckets * capacity)`.
    pub actual_load: f64,
}

/// Checks a closed database for structural damage and index/data
/// mismatches. `buffer_bytes` selects the algorithm; it is a budget, not an
/// allocation hint.
pub fn verify(
    dat_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
    buffer_bytes: usize,
) -> Result<VerifyInfo> {
    let df = file::open_ro(dat_path.as_ref())?;
    let kf = file::open_ro(key_path.as_ref())?;

    let mut dh_bytes = [0u8; DAT_HEADER_SIZE];
    file::read_at(&df, 0, &mut dh_bytes)?;
    let dh = DatHeader::from_bytes(&dh_bytes)?;
    let mut kh_bytes = [0u8; KEY_HEADER_SIZE];
    file::read_at(&kf, 0, &mut kh_bytes)?;
    let kh = KeyHeader::from_bytes(&kh_bytes)?;
    headers::check_pair(&dh, &kh)?;

    let block_size = kh.block_size();
    let dat_file_size = file::size(&df)?;
    let key_file_size = file::size(&kf)?;
    ensure!(
        dat_file_size >= DAT_HEADER_SIZE as u64,
        "short read: data file smaller than its header"
    );
    ensure!(
        key_file_size >= 2 * block_size as u64 && key_file_size % block_size as u64 == 0,
        "invalid key file size {} for block size {}",
        key_file_size,
        block_size
    );
    let buckets = key_file_size / block_size as u64 - 1;
    let modulus = hash::ceil_pow2(buckets);

    let ctx = Context {
        df: &df,
        kf: &kf,
        kh,
        block_size,
        key_size: kh.key_size(),
        dat_file_size,
        buckets,
        modulus,
    };
    let mut info = VerifyInfo {
        algorithm: if buffer_bytes as u64 >= key_file_size {
            "fast"
        } else {
            "slow"
        },
        dat_file_size,
        key_file_size,
        buckets,
        capacity: bucket_capacity(block_size),
        value_count: 0,
        value_bytes: 0,
        spill_count: 0,
        actual_load: 0.0,
    };
    if buffer_bytes as u64 >= key_file_size {
        verify_fast(&ctx, &mut info)?;
    } else {
        verify_slow(&ctx, &mut info)?;
    }
    info.actual_load = info.value_count as f64 / (info.buckets * info.capacity as u64) as f64;
    Ok(info)
}

struct Context<'f> {
    df: &'f File,
    kf: &'f File,
    kh: KeyHeader,
    block_size: usize,
    key_size: usize,
    dat_file_size: u64,
    buckets: u64,
    modulus: u64,
}

impl Context<'_> {
    fn read_bucket(&self, index: u64) -> Result<Vec<u8>> {
        let mut block = vec![0u8; self.block_size];
        file::read_at(self.kf, self.block_size as u64 * (1 + index), &mut block)?;
        bucket::check(&block, self.key_size, self.dat_file_size)?;
        Ok(block)
    }

    fn read_spill_image(&self, offset: u64) -> Result<Vec<u8>> {
        ensure!(
            offset + data::spill_record_size(self.block_size) <= self.dat_file_size,
            "bad spill: record at offset {} extends past the data file",
            offset
        );
        let mut prefix = [0u8; data::SPILL_PREFIX];
        file::read_at(self.df, offset, &mut prefix)?;
        ensure!(
            crate::storage::read_u48(&prefix) == 0,
            "bad spill: no spill marker at offset {}",
            offset
        );
        let image_size =
            u32::from_be_bytes([prefix[6], prefix[7], prefix[8], prefix[9]]) as usize;
        ensure!(
            image_size == self.block_size,
            "bad spill: image size {} does not match block size {}",
            image_size,
            self.block_size
        );
        let mut block = vec![0u8; self.block_size];
        file::read_at(self.df, offset + data::SPILL_PREFIX as u64, &mut block)?;
        bucket::check(&block, self.key_size, self.dat_file_size)?;
        Ok(block)
    }

    /// Walks the chain rooted at bucket `index`, checking placement, and
    /// feeds every entry to `sink`.
    fn walk_chain<F>(&self, index: u64, spills: &mut u64, mut sink: F) -> Result<()>
    where
        F: FnMut(bucket::Entry) -> Result<()>,
    {
        let mut block = self.read_bucket(index)?;
        loop {
            let b = Bucket::over(&block[..]);
            for e in b.entries() {
                ensure!(
                    hash::bucket_index(e.hash, self.buckets, self.modulus) == index,
                    "bad bucket: entry with hash {:#x} stored in bucket {} maps to {}",
                    e.hash,
                    index,
                    hash::bucket_index(e.hash, self.buckets, self.modulus)
                );
                sink(e)?;
            }
            let spill = b.spill();
            if spill == 0 {
                return Ok(());
            }
            *spills += 1;
            block = self.read_spill_image(spill)?;
        }
    }
}

fn verify_fast(ctx: &Context<'_>, info: &mut VerifyInfo) -> Result<()> {
    // every chain entry, keyed by the record offset it references
    let mut referenced: HashMap<u64, u64> = HashMap::new();
    for index in 0..ctx.buckets {
        ctx.walk_chain(index, &mut info.spill_count, |e| {
            ensure!(
                referenced.insert(e.offset, e.size).is_none(),
                "bad chain: two entries reference the record at offset {}",
                e.offset
            );
            Ok(())
        })?;
    }

    let mut scanner = DataScanner::new(ctx.df, DAT_HEADER_SIZE as u64, ctx.dat_file_size, ctx.key_size);
    while let Some(record) = scanner.next()? {
        if let ScanRecord::Value { offset, size, .. } = record {
            let indexed = referenced.remove(&offset).ok_or_else(|| {
                eyre::eyre!("bad chain: value record at offset {} not referenced by any bucket", offset)
            })?;
            ensure!(
                indexed == size,
                "data missing: entry for offset {} records size {}, record holds {}",
                offset,
                indexed,
                size
            );
            info.value_count += 1;
            info.value_bytes += size;
        }
    }
    ensure!(
        referenced.is_empty(),
        "data missing: {} bucket entries reference records that do not exist",
        referenced.len()
    );
    Ok(())
}

fn verify_slow(ctx: &Context<'_>, info: &mut VerifyInfo) -> Result<()> {
    // structural sweep first so chain damage is reported as such, not as a
    // missing record
    for index in 0..ctx.buckets {
        ctx.walk_chain(index, &mut info.spill_count, |_| Ok(()))?;
    }

    let salt = ctx.kh.salt();
    let kind = ctx.kh.hash_kind();
    let mut scanner = DataScanner::new(ctx.df, DAT_HEADER_SIZE as u64, ctx.dat_file_size, ctx.key_size);
    while let Some(record) = scanner.next()? {
        if let ScanRecord::Value { offset, key, size, .. } = record {
            let h = hash::hash_key(kind, salt, &key);
            let index = hash::bucket_index(h, ctx.buckets, ctx.modulus);
            let mut found = false;
            let mut spills = 0u64;
            ctx.walk_chain(index, &mut spills, |e| {
                if e.offset == offset && e.hash == h && e.size == size {
                    found = true;
                }
                Ok(())
            })?;
            ensure!(
                found,
                "data missing: record at offset {} is not indexed by bucket {}",
                offset,
                index
            );
            info.value_count += 1;
            info.value_bytes += size;
        }
    }
    Ok(())
}
