//! # Crash Recovery
//!
//! Replays the rollback log left behind by an interrupted commit. The log
//! holds the pre-image of every key-file bucket the commit was about to
//! overwrite, plus the data- and key-file sizes from before the commit.
//! Restoring the pre-images and truncating both files to the recorded
//! sizes rolls the database back to the last completed commit.
//!
//! The procedure is idempotent - every run converges to the same state -
//! and a clean database (empty or absent log) is a no-op. Three torn-write
//! shapes are tolerated because of how the log is written (records first,
//! header last, checksummed records):
//!
//! - log shorter than its header: the commit died during the log phase, no
//!   later phase started, the database is already consistent
//! - record fails its checksum: replay stops there; every valid record
//!   before it is a faithful pre-image
//! - trailing partial record: ignored for the same reason
//!
//! A log that parses but describes a different database (uid, salt,
//! geometry contract) is fatal and leaves the log in place.

use std::path::Path;

use eyre::{ensure, Result};
use zerocopy::IntoBytes;

use crate::hash;
use crate::storage::file;
use crate::storage::headers::{
    self, KeyHeader, LogHeader, KEY_HEADER_SIZE, LOG_HEADER_SIZE,
};

/// Rolls the database at the given paths back to its last completed
/// commit, then truncates the log. Must run before [`crate::Store::open`]
/// on a database that was not closed cleanly.
pub fn recover(
    dat_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
    log_path: impl AsRef<Path>,
) -> Result<()> {
    let log_path = log_path.as_ref();
    if !log_path.exists() {
        return Ok(());
    }
    let lf = file::open_rw(log_path)?;
    let log_size = file::size(&lf)?;
    if log_size == 0 {
        return Ok(());
    }
    if log_size < LOG_HEADER_SIZE as u64 {
        // died during the log phase before the header landed; nothing past
        // logging began
        file::truncate(&lf, 0)?;
        file::sync(&lf)?;
        return Ok(());
    }

    let mut lh_bytes = [0u8; LOG_HEADER_SIZE];
    file::read_at(&lf, 0, &mut lh_bytes)?;
    let lh = LogHeader::from_bytes(&lh_bytes)?;

    let kf = file::open_rw(key_path.as_ref())?;
    let mut kh_bytes = [0u8; KEY_HEADER_SIZE];
    file::read_at(&kf, 0, &mut kh_bytes)?;
    let kh = KeyHeader::from_bytes(&kh_bytes)?;
    lh.check_against(&kh)?;

    let df = file::open_rw(dat_path.as_ref())?;
    let block_size = kh.block_size();
    let record_size = headers::log_record_size(block_size) as u64;

    let mut buf = vec![0u8; record_size as usize];
    let mut pos = LOG_HEADER_SIZE as u64;
    let mut replayed = 0u64;
    while pos + record_size <= log_size {
        file::read_at(&lf, pos, &mut buf)?;
        let Some((index, image)) = headers::parse_log_record(&buf, block_size) else {
            break;
        };
        let offset = block_size as u64 * (1 + index);
        ensure!(
            offset + block_size as u64 <= lh.key_file_size(),
            "bad bucket pre-image: index {} outside the journaled key file",
            index
        );
        file::write_at(&kf, offset, image)?;
        replayed += 1;
        pos += record_size;
    }

    file::truncate(&df, lh.dat_file_size())?;
    file::truncate(&kf, lh.key_file_size())?;

    // the header's geometry may be one commit ahead of the truncated file;
    // re-derive it from the recovered size
    let buckets = lh.key_file_size() / block_size as u64 - 1;
    let mut restored = kh;
    restored.set_geometry(buckets, hash::ceil_pow2(buckets));
    file::write_at(&kf, 0, restored.as_bytes())?;

    file::sync(&df)?;
    file::sync(&kf)?;
    file::truncate(&lf, 0)?;
    file::sync(&lf)?;

    tracing::info!(
        replayed,
        dat_size = lh.dat_file_size(),
        key_size = lh.key_file_size(),
        "recovery complete"
    );
    Ok(())
}
