//! Recovery through the public API: a dirty log blocks `open`, `recover`
//! clears it, and committed data survives the round trip.

use nudb::{recover, CreateOptions, Store};
use tempfile::tempdir;

#[test]
fn open_refuses_a_dirty_log_until_recovered() {
    let dir = tempdir().unwrap();
    let dat = dir.path().join("db.dat");
    let key = dir.path().join("db.key");
    let log = dir.path().join("db.log");

    Store::create(&dat, &key, &log, &CreateOptions::new(8)).unwrap();
    {
        let store = Store::open(&dat, &key, &log).unwrap();
        for i in 0..500u64 {
            store.insert(&i.to_be_bytes(), b"durable").unwrap();
        }
        store.close().unwrap();
    }

    // a crash died during the log phase: some bytes, no complete header
    std::fs::write(&log, [0x17u8; 40]).unwrap();

    let err = Store::open(&dat, &key, &log).unwrap_err();
    assert!(err.to_string().contains("log file exists"), "{err}");

    recover(&dat, &key, &log).unwrap();
    assert_eq!(std::fs::metadata(&log).unwrap().len(), 0);

    let store = Store::open(&dat, &key, &log).unwrap();
    for i in 0..500u64 {
        assert_eq!(store.fetch(&i.to_be_bytes()).unwrap().unwrap(), b"durable");
    }
    store.close().unwrap();
}

#[test]
fn recover_on_clean_database_is_a_noop() {
    let dir = tempdir().unwrap();
    let dat = dir.path().join("db.dat");
    let key = dir.path().join("db.key");
    let log = dir.path().join("db.log");

    Store::create(&dat, &key, &log, &CreateOptions::new(8)).unwrap();
    {
        let store = Store::open(&dat, &key, &log).unwrap();
        store.insert(&1u64.to_be_bytes(), b"v").unwrap();
        store.close().unwrap();
    }

    let dat_bytes = std::fs::read(&dat).unwrap();
    let key_bytes = std::fs::read(&key).unwrap();

    recover(&dat, &key, &log).unwrap();
    recover(&dat, &key, &log).unwrap();

    assert_eq!(std::fs::read(&dat).unwrap(), dat_bytes);
    assert_eq!(std::fs::read(&key).unwrap(), key_bytes);

    let store = Store::open(&dat, &key, &log).unwrap();
    assert!(store.fetch(&1u64.to_be_bytes()).unwrap().is_some());
    store.close().unwrap();
}
