//! Sequential traversal of a data file's value records.

use std::path::Path;

use eyre::Result;

use crate::storage::data::{DataScanner, ScanRecord};
use crate::storage::file;
use crate::storage::headers::{DatHeader, DAT_HEADER_SIZE};

/// Calls `visitor(key, value)` for every value record in the data file, in
/// append order, skipping bucket spills. Returns the number of records
/// visited. Only the data file is touched, so this works without a key
/// file - the basis of [`crate::rekey`].
pub fn visit<F>(dat_path: impl AsRef<Path>, mut visitor: F) -> Result<u64>
where
    F: FnMut(&[u8], &[u8]) -> Result<()>,
{
    let df = file::open_ro(dat_path.as_ref())?;
    let mut dh_bytes = [0u8; DAT_HEADER_SIZE];
    file::read_at(&df, 0, &mut dh_bytes)?;
    let dh = DatHeader::from_bytes(&dh_bytes)?;

    let dat_size = file::size(&df)?;
    let mut scanner = DataScanner::new(&df, DAT_HEADER_SIZE as u64, dat_size, dh.key_size());
    let mut visited = 0u64;
    let mut value = Vec::new();
    while let Some(record) = scanner.next()? {
        if let ScanRecord::Value {
            key,
            value_offset,
            size,
            ..
        } = record
        {
            value.resize(size as usize, 0);
            file::read_at(&df, value_offset, &mut value)?;
            visitor(&key, &value)?;
            visited += 1;
        }
    }
    Ok(visited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CreateOptions, Store};

    #[test]
    fn visits_every_record_in_append_order() {
        let dir = tempfile::tempdir().unwrap();
        let dat = dir.path().join("db.dat");
        let key = dir.path().join("db.key");
        let log = dir.path().join("db.log");

        Store::create(&dat, &key, &log, &CreateOptions::new(8)).unwrap();
        let store = Store::open(&dat, &key, &log).unwrap();
        for i in 0..100u64 {
            store.insert(&i.to_be_bytes(), &i.to_le_bytes()).unwrap();
        }
        store.close().unwrap();

        let mut seen = Vec::new();
        let visited = visit(&dat, |k, v| {
            assert_eq!(u64::from_be_bytes(k.try_into().unwrap()), u64::from_le_bytes(v.try_into().unwrap()));
            seen.push(u64::from_be_bytes(k.try_into().unwrap()));
            Ok(())
        })
        .unwrap();

        assert_eq!(visited, 100);
        assert_eq!(seen, (0..100).collect::<Vec<u64>>());
    }

    #[test]
    fn visitor_error_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let dat = dir.path().join("db.dat");
        let key = dir.path().join("db.key");
        let log = dir.path().join("db.log");

        Store::create(&dat, &key, &log, &CreateOptions::new(8)).unwrap();
        let store = Store::open(&dat, &key, &log).unwrap();
        store.insert(&1u64.to_be_bytes(), b"x").unwrap();
        store.close().unwrap();

        let err = visit(&dat, |_, _| eyre::bail!("stop here")).unwrap_err();
        assert!(err.to_string().contains("stop here"), "{err}");
    }
}
