//! # Key-File Regeneration
//!
//! Rebuilds a lost or deleted key file from the data file alone. The data
//! file stores raw keys, so a fresh salt is drawn and every key is
//! re-hashed; nothing ties the new key file to the old one beyond the UID
//! carried in the data header.
//!
//! The bucket count is sized up front from the caller's item-count hint and
//! the default load factor, then filled in passes: each pass stages a range
//! of buckets in memory (bounded by the buffer budget), streams the whole
//! data file, and writes the range out. A staged bucket that overflows
//! spills into the data file exactly as the live engine would, so chains
//! come out identical in shape to organically grown ones.

use std::fs;
use std::path::Path;

use eyre::{ensure, Result};
use zerocopy::IntoBytes;

use crate::config::{bucket_capacity, DEFAULT_BLOCK_SIZE, DEFAULT_LOAD_FACTOR};
use crate::hash::{self, DEFAULT_HASH_KIND};
use crate::storage::bucket::{Bucket, Entry};
use crate::storage::data::{self, DataScanner, ScanRecord};
use crate::storage::file;
use crate::storage::headers::{DatHeader, KeyHeader, DAT_HEADER_SIZE};

/// Regenerates the key file for `dat_path`. `item_count` is a sizing hint
/// (the number of records expected in the data file); `buffer_bytes` bounds
/// the in-memory staging area and therefore the number of passes over the
/// data file. Fails if the key file exists or the log is non-empty.
pub fn rekey(
    dat_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
    log_path: impl AsRef<Path>,
    item_count: u64,
    buffer_bytes: usize,
) -> Result<()> {
    let (dat_path, key_path, log_path) =
        (dat_path.as_ref(), key_path.as_ref(), log_path.as_ref());
    if log_path.exists() {
        let lf = file::open_ro(log_path)?;
        ensure!(
            file::size(&lf)? == 0,
            "log file exists: recover the database before rekeying it"
        );
    }

    let df = file::open_rw(dat_path)?;
    let mut dh_bytes = [0u8; DAT_HEADER_SIZE];
    file::read_at(&df, 0, &mut dh_bytes)?;
    let dh = DatHeader::from_bytes(&dh_bytes)?;
    let key_size = dh.key_size();

    let block_size = DEFAULT_BLOCK_SIZE;
    let load_factor = (DEFAULT_LOAD_FACTOR * 65535.0) as u16;
    let capacity = bucket_capacity(block_size) as u64;
    let per_bucket = (capacity * load_factor as u64 / 65536).max(1);
    let buckets = item_count.div_ceil(per_bucket).max(1);
    let modulus = hash::ceil_pow2(buckets);
    let salt = hash::new_salt();

    let kf = file::create_new(key_path)?;
    let result = build(
        &df,
        &kf,
        &dh,
        key_size,
        block_size,
        load_factor,
        buckets,
        modulus,
        salt,
        buffer_bytes,
    );
    if result.is_err() {
        let _ = fs::remove_file(key_path);
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn build(
    df: &fs::File,
    kf: &fs::File,
    dh: &DatHeader,
    key_size: usize,
    block_size: usize,
    load_factor: u16,
    buckets: u64,
    modulus: u64,
    salt: u64,
    buffer_bytes: usize,
) -> Result<()> {
    let kh = KeyHeader::new(
        dh.uid(),
        dh.appnum(),
        key_size,
        salt,
        DEFAULT_HASH_KIND,
        block_size,
        load_factor,
        buckets,
        modulus,
    );
    // zero-filled blocks are valid empty buckets
    file::truncate(kf, block_size as u64 * (1 + buckets))?;
    file::write_at(kf, 0, kh.as_bytes())?;

    let mut dat_end = file::size(df)?;
    let span = ((buffer_bytes / block_size) as u64).clamp(1, buckets);

    let mut begin = 0u64;
    while begin < buckets {
        let end = (begin + span).min(buckets);
        let mut staging = vec![0u8; (end - begin) as usize * block_size];

        // spills appended by earlier passes scan as spill records and are
        // skipped, so rescanning up to the pass-start size is safe
        let mut scanner = DataScanner::new(df, DAT_HEADER_SIZE as u64, dat_end, key_size);
        while let Some(record) = scanner.next()? {
            let ScanRecord::Value {
                offset, key, size, ..
            } = record
            else {
                continue;
            };
            let h = hash::hash_key(DEFAULT_HASH_KIND, salt, &key);
            let index = hash::bucket_index(h, buckets, modulus);
            if index < begin || index >= end {
                continue;
            }
            let at = (index - begin) as usize * block_size;
            let slot = at..at + block_size;

            if Bucket::over(&staging[slot.clone()]).is_full() {
                let mut record_buf = Vec::with_capacity(data::SPILL_PREFIX + block_size);
                data::append_spill_record(&mut record_buf, &staging[slot.clone()]);
                file::write_at(df, dat_end, &record_buf)?;
                let mut b = Bucket::over(&mut staging[slot.clone()]);
                b.reset();
                b.set_spill(dat_end);
                dat_end += record_buf.len() as u64;
            }
            Bucket::over(&mut staging[slot]).insert(Entry {
                hash: h,
                offset,
                size,
            });
        }

        file::write_at(kf, block_size as u64 * (1 + begin), &staging)?;
        tracing::debug!(begin, end, buckets, "rekey pass written");
        begin = end;
    }

    file::sync(df)?;
    file::sync(kf)?;
    Ok(())
}
