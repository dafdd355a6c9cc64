//! # Data-File Records
//!
//! The data file is a header followed by a stream of records, each prefixed
//! with a 48-bit size:
//!
//! ```text
//! value record:  [size: u48 >= 1][key: key_size bytes][value: size bytes]
//! spill record:  [0: u48][image size: u32][bucket image]
//! ```
//!
//! A record's *data offset* - how bucket entries refer to it - is the file
//! offset of its size prefix. The zero prefix distinguishes a spill (an
//! overflowed bucket serialized into the data file) from a value record;
//! the image size that follows it makes the stream walkable without the
//! key file, which is what `visit` and `rekey` rely on. Spill images are
//! always exactly one block.
//!
//! Records are appended to an in-memory pending buffer during inserts and
//! written to the file en masse by the commit worker; offsets are assigned
//! at append time, so spill pointers written into cached buckets are final
//! before the commit begins.

use std::fs::File;

use eyre::{ensure, Result};

use crate::config::{MAX_BLOCK_SIZE, MAX_VALUE_SIZE, RECORD_SIZE_PREFIX};
use crate::storage::{file, write_u48};

/// Bytes before a spill record's bucket image: zero sentinel + image size.
/// The size field is 32-bit so the largest supported block still fits.
pub(crate) const SPILL_PREFIX: usize = RECORD_SIZE_PREFIX + 4;

/// Total encoded size of a value record.
pub(crate) fn value_record_size(key_size: usize, value_len: usize) -> u64 {
    (RECORD_SIZE_PREFIX + key_size + value_len) as u64
}

/// Total encoded size of a spill record.
pub(crate) fn spill_record_size(block_size: usize) -> u64 {
    (SPILL_PREFIX + block_size) as u64
}

/// Appends a value record to a pending buffer.
pub(crate) fn append_value_record(buf: &mut Vec<u8>, key: &[u8], value: &[u8]) {
    let mut prefix = [0u8; RECORD_SIZE_PREFIX];
    write_u48(&mut prefix, value.len() as u64);
    buf.extend_from_slice(&prefix);
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
}

/// Appends a spill record holding a bucket image to a pending buffer.
pub(crate) fn append_spill_record(buf: &mut Vec<u8>, block: &[u8]) {
    buf.extend_from_slice(&[0u8; RECORD_SIZE_PREFIX]);
    buf.extend_from_slice(&(block.len() as u32).to_be_bytes());
    buf.extend_from_slice(block);
}

/// One record met while scanning the data file.
#[derive(Debug)]
pub(crate) enum ScanRecord {
    Value {
        /// Offset of the record's size prefix.
        offset: u64,
        key: Vec<u8>,
        /// Offset of the value bytes within the file.
        value_offset: u64,
        size: u64,
    },
    Spill {
        offset: u64,
    },
}

/// Sequential reader over a data file's records, used by visit, verify and
/// rekey. Spill bodies are skipped, not parsed.
pub(crate) struct DataScanner<'f> {
    file: &'f File,
    pos: u64,
    end: u64,
    key_size: usize,
}

impl<'f> DataScanner<'f> {
    /// Starts a scan at the first record. `end` is captured once so records
    /// appended during the scan (rekey spills) are not revisited.
    pub fn new(file: &'f File, start: u64, end: u64, key_size: usize) -> Self {
        Self {
            file,
            pos: start,
            end,
            key_size,
        }
    }

    /// Returns the next record, or `None` at a clean end of file. A file
    /// ending mid-record is an error.
    pub fn next(&mut self) -> Result<Option<ScanRecord>> {
        if self.pos == self.end {
            return Ok(None);
        }
        let offset = self.pos;
        ensure!(
            self.end - self.pos >= RECORD_SIZE_PREFIX as u64,
            "short read: truncated record at offset {}",
            offset
        );
        let mut prefix = [0u8; RECORD_SIZE_PREFIX];
        file::read_at(self.file, offset, &mut prefix)?;
        let size = crate::storage::read_u48(&prefix);

        if size == 0 {
            ensure!(
                self.end - self.pos >= SPILL_PREFIX as u64,
                "bad spill: truncated spill record at offset {}",
                offset
            );
            let mut image_size = [0u8; 4];
            file::read_at(self.file, offset + RECORD_SIZE_PREFIX as u64, &mut image_size)?;
            let image_size = u32::from_be_bytes(image_size) as usize;
            ensure!(
                image_size != 0 && image_size <= MAX_BLOCK_SIZE,
                "bad spill: implausible image size {} at offset {}",
                image_size,
                offset
            );
            let total = spill_record_size(image_size);
            ensure!(
                self.end - self.pos >= total,
                "bad spill: truncated spill record at offset {}",
                offset
            );
            self.pos += total;
            return Ok(Some(ScanRecord::Spill { offset }));
        }

        ensure!(
            size <= MAX_VALUE_SIZE,
            "bad bucket: implausible value size {} at offset {}",
            size,
            offset
        );
        let total = value_record_size(self.key_size, size as usize);
        ensure!(
            self.end - self.pos >= total,
            "short read: truncated record at offset {}",
            offset
        );
        let mut key = vec![0u8; self.key_size];
        file::read_at(self.file, offset + RECORD_SIZE_PREFIX as u64, &mut key)?;
        self.pos += total;
        Ok(Some(ScanRecord::Value {
            offset,
            key,
            value_offset: offset + RECORD_SIZE_PREFIX as u64 + self.key_size as u64,
            size,
        }))
    }
}
