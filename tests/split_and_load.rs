//! Linear-hash growth behavior: splits keep every invariant checkable by
//! `verify`, and the bucket count actually grows under load.

use nudb::{verify, CreateOptions, Store};
use tempfile::tempdir;

#[test]
fn inserts_force_splits_and_invariants_hold() {
    let dir = tempdir().unwrap();
    let dat = dir.path().join("db.dat");
    let key = dir.path().join("db.key");
    let log = dir.path().join("db.log");

    // small blocks keep capacity low so splits come early
    Store::create(
        &dat,
        &key,
        &log,
        &CreateOptions::new(8).block_size(256).load_factor(0.5),
    )
    .unwrap();

    let capacity = (256 - 8) / 20;
    let count = (capacity as u64 * 4).max(200);

    let store = Store::open(&dat, &key, &log).unwrap();
    for i in 0..count {
        store
            .insert(&i.to_be_bytes(), format!("v{i}").as_bytes())
            .unwrap();
    }
    store.close().unwrap();

    let info = verify(&dat, &key, 64 * 1024 * 1024).unwrap();
    assert!(
        info.buckets > 1,
        "{} inserts into capacity-{} buckets should split (got {} buckets)",
        count,
        capacity,
        info.buckets
    );
    assert_eq!(info.value_count, count);

    // the load factor target is honored within one entry per bucket
    assert!(
        info.actual_load <= 0.5 + 1.0 / capacity as f64,
        "actual load {} exceeds target",
        info.actual_load
    );

    // every key still reachable after the splits
    let store = Store::open(&dat, &key, &log).unwrap();
    for i in 0..count {
        assert_eq!(
            store.fetch(&i.to_be_bytes()).unwrap().unwrap(),
            format!("v{i}").as_bytes()
        );
    }
    store.close().unwrap();
}

#[test]
fn chains_survive_overflow_without_splits() {
    let dir = tempdir().unwrap();
    let dat = dir.path().join("db.dat");
    let key = dir.path().join("db.key");
    let log = dir.path().join("db.log");

    // load factor 1.0 lets buckets run completely full, so uneven hash
    // spray overflows into spill chains; the fixed salt keeps the layout
    // reproducible
    Store::create(
        &dat,
        &key,
        &log,
        &CreateOptions::new(8)
            .block_size(128)
            .load_factor(1.0)
            .salt(0xABCD),
    )
    .unwrap();

    let store = Store::open(&dat, &key, &log).unwrap();
    for i in 0..400u64 {
        store.insert(&i.to_be_bytes(), b"spilled").unwrap();
    }
    for i in 0..400u64 {
        assert!(store.fetch(&i.to_be_bytes()).unwrap().is_some());
    }
    store.close().unwrap();

    let info = verify(&dat, &key, 64 * 1024 * 1024).unwrap();
    assert_eq!(info.value_count, 400);
    assert!(
        info.spill_count > 0,
        "capacity-6 buckets at full load must have spilled"
    );

    let store = Store::open(&dat, &key, &log).unwrap();
    for i in 0..400u64 {
        assert_eq!(store.fetch(&i.to_be_bytes()).unwrap().unwrap(), b"spilled");
    }
    store.close().unwrap();
}
