//! # File Header Definitions
//!
//! Type-safe, zerocopy-based headers for the three database files. Every
//! multi-byte field is big-endian on disk.
//!
//! ## File Types
//!
//! 1. **data file** (`DatHeader`, 92 bytes) - identity only: magic, version,
//!    UID, appnum, key size. Written once at create time; the rest of the
//!    file is append-only records.
//!
//! 2. **key file** (`KeyHeader`, 68 bytes, padded to one block) - identity
//!    plus the hashing contract (salt, pepper, hasher id), geometry
//!    (block size, bucket count, modulus) and the load-factor target. The
//!    geometry fields are rewritten on every commit.
//!
//! 3. **log file** (`LogHeader`, 66 bytes) - identity plus the data- and
//!    key-file sizes at the start of the in-flight commit. Present only
//!    while a commit is between its log phase and its truncate phase.
//!
//! The UID binds the three files into one database: it is drawn once at
//! create time and must agree everywhere on open. The pepper (digest of the
//! salt) proves that the opening process hashes identically to the creator.
//!
//! ## Log pre-image records
//!
//! After the `LogHeader` slot the log holds one record per dirtied bucket:
//!
//! ```text
//! [bucket index: u64][bucket image: block_size bytes][crc64: u64]
//! ```
//!
//! The checksum (CRC-64/ECMA) covers index and image. Replay stops at the
//! first record that is short or fails its checksum - a torn tail from a
//! crash mid-phase, at which point nothing later in the commit had started.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result};
use zerocopy::big_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config;
use crate::hash::{self, HashKind};

pub(crate) const DAT_MAGIC: &[u8; 8] = b"nudb.dat";
pub(crate) const KEY_MAGIC: &[u8; 8] = b"nudb.key";
pub(crate) const LOG_MAGIC: &[u8; 8] = b"nudb.log";

pub(crate) const CURRENT_VERSION: u16 = 2;

pub(crate) const DAT_HEADER_SIZE: usize = 92;
pub(crate) const KEY_HEADER_SIZE: usize = 68;
pub(crate) const LOG_HEADER_SIZE: usize = 66;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct DatHeader {
    magic: [u8; 8],
    version: U16,
    uid: U64,
    appnum: U64,
    key_size: U16,
    reserved: [u8; 64],
}

const _: () = assert!(std::mem::size_of::<DatHeader>() == DAT_HEADER_SIZE);

impl DatHeader {
    pub fn new(uid: u64, appnum: u64, key_size: usize) -> Self {
        Self {
            magic: *DAT_MAGIC,
            version: U16::new(CURRENT_VERSION),
            uid: U64::new(uid),
            appnum: U64::new(appnum),
            key_size: U16::new(key_size as u16),
            reserved: [0u8; 64],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= DAT_HEADER_SIZE,
            "short read: data file header ({} < {})",
            bytes.len(),
            DAT_HEADER_SIZE
        );
        let header = Self::read_from_bytes(&bytes[..DAT_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse data file header: {:?}", e))?;
        ensure!(&header.magic == DAT_MAGIC, "invalid magic in data file");
        ensure!(
            header.version.get() == CURRENT_VERSION,
            "version mismatch in data file: {} (expected {})",
            header.version.get(),
            CURRENT_VERSION
        );
        ensure!(
            config::validate_key_size(header.key_size.get() as usize).is_ok(),
            "key size mismatch in data file: {}",
            header.key_size.get()
        );
        Ok(header)
    }

    pub fn uid(&self) -> u64 {
        self.uid.get()
    }

    pub fn appnum(&self) -> u64 {
        self.appnum.get()
    }

    pub fn key_size(&self) -> usize {
        self.key_size.get() as usize
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct KeyHeader {
    magic: [u8; 8],
    version: U16,
    uid: U64,
    appnum: U64,
    key_size: U16,
    salt: U64,
    pepper: U64,
    block_size: U32,
    hasher_id: U16,
    load_factor: U16,
    buckets: U64,
    modulus: U64,
}

const _: () = assert!(std::mem::size_of::<KeyHeader>() == KEY_HEADER_SIZE);

impl KeyHeader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uid: u64,
        appnum: u64,
        key_size: usize,
        salt: u64,
        kind: HashKind,
        block_size: usize,
        load_factor: u16,
        buckets: u64,
        modulus: u64,
    ) -> Self {
        Self {
            magic: *KEY_MAGIC,
            version: U16::new(CURRENT_VERSION),
            uid: U64::new(uid),
            appnum: U64::new(appnum),
            key_size: U16::new(key_size as u16),
            salt: U64::new(salt),
            pepper: U64::new(hash::pepper(kind, salt)),
            block_size: U32::new(block_size as u32),
            hasher_id: U16::new(kind.to_u16()),
            load_factor: U16::new(load_factor),
            buckets: U64::new(buckets),
            modulus: U64::new(modulus),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= KEY_HEADER_SIZE,
            "short read: key file header ({} < {})",
            bytes.len(),
            KEY_HEADER_SIZE
        );
        let header = Self::read_from_bytes(&bytes[..KEY_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse key file header: {:?}", e))?;
        ensure!(&header.magic == KEY_MAGIC, "invalid magic in key file");
        ensure!(
            header.version.get() == CURRENT_VERSION,
            "version mismatch in key file: {} (expected {})",
            header.version.get(),
            CURRENT_VERSION
        );
        config::validate_key_size(header.key_size.get() as usize)?;
        config::validate_block_size(header.block_size.get() as usize)?;
        ensure!(
            header.load_factor.get() != 0,
            "invalid load factor in key file header"
        );
        let kind = HashKind::from_u16(header.hasher_id.get())
            .ok_or_else(|| eyre::eyre!("hasher mismatch: unknown hasher id {}", header.hasher_id.get()))?;
        ensure!(
            header.pepper.get() == hash::pepper(kind, header.salt.get()),
            "hasher mismatch: pepper does not match salt digest"
        );
        ensure!(
            header.modulus.get().is_power_of_two()
                && header.modulus.get() / 2 <= header.buckets.get()
                && header.buckets.get() <= header.modulus.get(),
            "bad bucket geometry in key file header: buckets={} modulus={}",
            header.buckets.get(),
            header.modulus.get()
        );
        Ok(header)
    }

    pub fn uid(&self) -> u64 {
        self.uid.get()
    }

    pub fn appnum(&self) -> u64 {
        self.appnum.get()
    }

    pub fn key_size(&self) -> usize {
        self.key_size.get() as usize
    }

    pub fn salt(&self) -> u64 {
        self.salt.get()
    }

    pub fn pepper(&self) -> u64 {
        self.pepper.get()
    }

    pub fn block_size(&self) -> usize {
        self.block_size.get() as usize
    }

    pub fn hash_kind(&self) -> HashKind {
        // validated in from_bytes
        HashKind::from_u16(self.hasher_id.get()).unwrap_or(HashKind::Xx64)
    }

    pub fn load_factor(&self) -> u16 {
        self.load_factor.get()
    }

    pub fn buckets(&self) -> u64 {
        self.buckets.get()
    }

    pub fn modulus(&self) -> u64 {
        self.modulus.get()
    }

    pub fn set_geometry(&mut self, buckets: u64, modulus: u64) {
        self.buckets = U64::new(buckets);
        self.modulus = U64::new(modulus);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct LogHeader {
    magic: [u8; 8],
    version: U16,
    uid: U64,
    appnum: U64,
    key_size: U16,
    salt: U64,
    pepper: U64,
    block_size: U32,
    hasher_id: U16,
    key_file_size: U64,
    dat_file_size: U64,
}

const _: () = assert!(std::mem::size_of::<LogHeader>() == LOG_HEADER_SIZE);

impl LogHeader {
    pub fn new(key: &KeyHeader, key_file_size: u64, dat_file_size: u64) -> Self {
        Self {
            magic: *LOG_MAGIC,
            version: U16::new(CURRENT_VERSION),
            uid: U64::new(key.uid()),
            appnum: U64::new(key.appnum()),
            key_size: U16::new(key.key_size() as u16),
            salt: U64::new(key.salt()),
            pepper: U64::new(key.pepper()),
            block_size: U32::new(key.block_size() as u32),
            hasher_id: U16::new(key.hash_kind().to_u16()),
            key_file_size: U64::new(key_file_size),
            dat_file_size: U64::new(dat_file_size),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= LOG_HEADER_SIZE,
            "short read: log file header ({} < {})",
            bytes.len(),
            LOG_HEADER_SIZE
        );
        let header = Self::read_from_bytes(&bytes[..LOG_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse log file header: {:?}", e))?;
        ensure!(&header.magic == LOG_MAGIC, "invalid magic in log file");
        ensure!(
            header.version.get() == CURRENT_VERSION,
            "version mismatch in log file: {} (expected {})",
            header.version.get(),
            CURRENT_VERSION
        );
        Ok(header)
    }

    pub fn key_file_size(&self) -> u64 {
        self.key_file_size.get()
    }

    pub fn dat_file_size(&self) -> u64 {
        self.dat_file_size.get()
    }

    /// The log must describe the same database and hashing contract as the
    /// key file it will be replayed into.
    pub fn check_against(&self, key: &KeyHeader) -> Result<()> {
        ensure!(self.uid.get() == key.uid(), "uid mismatch between log and key file");
        ensure!(
            self.appnum.get() == key.appnum(),
            "appnum mismatch between log and key file"
        );
        ensure!(
            self.key_size.get() as usize == key.key_size(),
            "key size mismatch between log and key file"
        );
        ensure!(
            self.salt.get() == key.salt() && self.pepper.get() == key.pepper(),
            "hasher mismatch between log and key file"
        );
        ensure!(
            self.block_size.get() as usize == key.block_size(),
            "invalid block size: log and key file disagree"
        );
        ensure!(
            self.hasher_id.get() == key.hash_kind().to_u16(),
            "hasher mismatch between log and key file"
        );
        Ok(())
    }
}

/// The data and key files must belong to the same database.
pub(crate) fn check_pair(dat: &DatHeader, key: &KeyHeader) -> Result<()> {
    ensure!(dat.uid() == key.uid(), "uid mismatch between data and key file");
    ensure!(
        dat.appnum() == key.appnum(),
        "appnum mismatch between data and key file"
    );
    ensure!(
        dat.key_size() == key.key_size(),
        "key size mismatch between data and key file"
    );
    Ok(())
}

/// Total bytes of one log pre-image record for the given block size.
pub(crate) fn log_record_size(block_size: usize) -> usize {
    8 + block_size + 8
}

/// Appends a checksummed bucket pre-image to a log write buffer.
pub(crate) fn append_log_record(buf: &mut Vec<u8>, index: u64, block: &[u8]) {
    let start = buf.len();
    buf.extend_from_slice(&index.to_be_bytes());
    buf.extend_from_slice(block);
    let crc = CRC64.checksum(&buf[start..]);
    buf.extend_from_slice(&crc.to_be_bytes());
}

/// Parses one log pre-image record. Returns `None` when the record is torn
/// or fails its checksum, which ends replay.
pub(crate) fn parse_log_record(bytes: &[u8], block_size: usize) -> Option<(u64, &[u8])> {
    if bytes.len() < log_record_size(block_size) {
        return None;
    }
    let body = &bytes[..8 + block_size];
    let stored = u64::from_be_bytes(bytes[8 + block_size..8 + block_size + 8].try_into().ok()?);
    if CRC64.checksum(body) != stored {
        return None;
    }
    let index = u64::from_be_bytes(body[..8].try_into().ok()?);
    Some((index, &body[8..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_sizes_are_fixed() {
        assert_eq!(std::mem::size_of::<DatHeader>(), 92);
        assert_eq!(std::mem::size_of::<KeyHeader>(), 68);
        assert_eq!(std::mem::size_of::<LogHeader>(), 66);
    }

    fn sample_key_header() -> KeyHeader {
        KeyHeader::new(7, 42, 8, 1234, HashKind::Xx64, 4096, 32767, 1, 1)
    }

    #[test]
    fn dat_header_roundtrip() {
        let h = DatHeader::new(7, 42, 8);
        let parsed = DatHeader::from_bytes(h.as_bytes()).unwrap();
        assert_eq!(parsed.uid(), 7);
        assert_eq!(parsed.appnum(), 42);
        assert_eq!(parsed.key_size(), 8);
    }

    #[test]
    fn key_header_roundtrip() {
        let h = sample_key_header();
        let parsed = KeyHeader::from_bytes(h.as_bytes()).unwrap();
        assert_eq!(parsed.uid(), 7);
        assert_eq!(parsed.salt(), 1234);
        assert_eq!(parsed.block_size(), 4096);
        assert_eq!(parsed.hash_kind(), HashKind::Xx64);
        assert_eq!(parsed.load_factor(), 32767);
        assert_eq!(parsed.buckets(), 1);
        assert_eq!(parsed.modulus(), 1);
    }

    #[test]
    fn log_header_roundtrip() {
        let kh = sample_key_header();
        let lh = LogHeader::new(&kh, 8192, 92);
        let parsed = LogHeader::from_bytes(lh.as_bytes()).unwrap();
        assert_eq!(parsed.key_file_size(), 8192);
        assert_eq!(parsed.dat_file_size(), 92);
        parsed.check_against(&kh).unwrap();
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut bytes = sample_key_header().as_bytes().to_vec();
        bytes[..8].copy_from_slice(b"notmagic");
        let err = KeyHeader::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("invalid magic"), "{err}");
    }

    #[test]
    fn rejects_wrong_version() {
        let mut bytes = DatHeader::new(1, 2, 8).as_bytes().to_vec();
        bytes[8..10].copy_from_slice(&999u16.to_be_bytes());
        let err = DatHeader::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("version mismatch"), "{err}");
    }

    #[test]
    fn rejects_tampered_pepper() {
        let mut bytes = sample_key_header().as_bytes().to_vec();
        // salt field starts after magic(8) + version(2) + uid(8) + appnum(8) + key_size(2)
        bytes[28..36].copy_from_slice(&9999u64.to_be_bytes());
        let err = KeyHeader::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("hasher mismatch"), "{err}");
    }

    #[test]
    fn cross_file_checks() {
        let kh = sample_key_header();
        check_pair(&DatHeader::new(7, 42, 8), &kh).unwrap();

        let err = check_pair(&DatHeader::new(8, 42, 8), &kh).unwrap_err();
        assert!(err.to_string().contains("uid mismatch"), "{err}");

        let err = check_pair(&DatHeader::new(7, 43, 8), &kh).unwrap_err();
        assert!(err.to_string().contains("appnum mismatch"), "{err}");

        let lh = LogHeader::new(&sample_key_header(), 8192, 92);
        let other = KeyHeader::new(9, 42, 8, 1234, HashKind::Xx64, 4096, 32767, 1, 1);
        assert!(lh.check_against(&other).is_err());
    }

    #[test]
    fn log_record_roundtrip() {
        let block = vec![0xA5u8; 128];
        let mut buf = Vec::new();
        append_log_record(&mut buf, 3, &block);
        assert_eq!(buf.len(), log_record_size(128));

        let (index, image) = parse_log_record(&buf, 128).unwrap();
        assert_eq!(index, 3);
        assert_eq!(image, &block[..]);
    }

    #[test]
    fn log_record_rejects_corruption() {
        let block = vec![0xA5u8; 128];
        let mut buf = Vec::new();
        append_log_record(&mut buf, 3, &block);

        // torn tail
        assert!(parse_log_record(&buf[..buf.len() - 1], 128).is_none());

        // flipped byte inside the image
        let mut bad = buf.clone();
        bad[20] ^= 0xFF;
        assert!(parse_log_record(&bad, 128).is_none());
    }
}
