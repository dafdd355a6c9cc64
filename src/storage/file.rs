//! Positional file I/O.
//!
//! Every read and write in the engine is positional: files carry no shared
//! cursor, so concurrent readers never interfere and the commit worker can
//! interleave with fetches. Reads are exact; a file ending mid-structure
//! surfaces as a "short read" error rather than a silent partial buffer.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use eyre::{eyre, Result, WrapErr};

/// Creates a file that must not already exist, opened for read/write.
pub(crate) fn create_new(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
        .wrap_err_with(|| format!("failed to create {:?}", path))
}

/// Opens an existing file for read/write.
pub(crate) fn open_rw(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .wrap_err_with(|| format!("failed to open {:?}", path))
}

/// Opens an existing file read-only.
pub(crate) fn open_ro(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .open(path)
        .wrap_err_with(|| format!("failed to open {:?}", path))
}

/// Opens a file for read/write, creating it empty if absent.
pub(crate) fn open_or_create(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .wrap_err_with(|| format!("failed to open {:?}", path))
}

pub(crate) fn size(file: &File) -> Result<u64> {
    Ok(file.metadata().wrap_err("failed to stat file")?.len())
}

pub(crate) fn sync(file: &File) -> Result<()> {
    file.sync_all().wrap_err("failed to sync file")
}

pub(crate) fn truncate(file: &File, len: u64) -> Result<()> {
    file.set_len(len)
        .wrap_err_with(|| format!("failed to truncate file to {} bytes", len))
}

/// Fills `buf` from `offset`, failing on a short read.
pub(crate) fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> Result<()> {
    imp::read_exact_at(file, offset, buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            eyre!("short read: {} bytes at offset {}", buf.len(), offset)
        } else {
            eyre!(e).wrap_err(format!(
                "failed to read {} bytes at offset {}",
                buf.len(),
                offset
            ))
        }
    })
}

/// Writes all of `buf` at `offset`, extending the file if needed.
pub(crate) fn write_at(file: &File, offset: u64, buf: &[u8]) -> Result<()> {
    imp::write_all_at(file, offset, buf).map_err(|e| {
        eyre!(e).wrap_err(format!(
            "failed to write {} bytes at offset {}",
            buf.len(),
            offset
        ))
    })
}

#[cfg(unix)]
mod imp {
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::FileExt;

    pub(super) fn read_exact_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        file.read_exact_at(buf, offset)
    }

    pub(super) fn write_all_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
        file.write_all_at(buf, offset)
    }
}

#[cfg(windows)]
mod imp {
    use std::fs::File;
    use std::io;
    use std::os::windows::fs::FileExt;

    pub(super) fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match file.seek_read(buf, offset) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub(super) fn write_all_at(file: &File, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match file.seek_write(buf, offset) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
