//! Rebuilding the key file for a populated database.

use nudb::{rekey, verify, CreateOptions, Store};
use tempfile::tempdir;

#[test]
fn rekey_50k_items_with_1mb_buffer() {
    let dir = tempdir().unwrap();
    let dat = dir.path().join("db.dat");
    let key = dir.path().join("db.key");
    let log = dir.path().join("db.log");

    Store::create(&dat, &key, &log, &CreateOptions::new(8)).unwrap();
    {
        let store = Store::open(&dat, &key, &log).unwrap();
        for i in 0..50_000u64 {
            store.insert(&i.to_be_bytes(), &i.to_le_bytes()).unwrap();
        }
        store.close().unwrap();
    }

    std::fs::remove_file(&key).unwrap();
    rekey(&dat, &key, &log, 50_000, 1024 * 1024).unwrap();

    let info = verify(&dat, &key, 64 * 1024 * 1024).unwrap();
    assert_eq!(info.value_count, 50_000);

    let store = Store::open(&dat, &key, &log).unwrap();
    for i in 0..50_000u64 {
        assert_eq!(
            store.fetch(&i.to_be_bytes()).unwrap().unwrap(),
            i.to_le_bytes()
        );
    }
    assert!(store
        .fetch(&123_456_789u64.to_be_bytes())
        .unwrap()
        .is_none());
    store.close().unwrap();
}
