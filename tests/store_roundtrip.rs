//! End-to-end insert/fetch behavior across close/reopen cycles.

use std::collections::HashSet;

use nudb::{CreateOptions, Store};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

struct Paths {
    dat: std::path::PathBuf,
    key: std::path::PathBuf,
    log: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn paths() -> Paths {
    let dir = tempdir().unwrap();
    Paths {
        dat: dir.path().join("db.dat"),
        key: dir.path().join("db.key"),
        log: dir.path().join("db.log"),
        _dir: dir,
    }
}

#[test]
fn single_insert_survives_reopen() {
    let p = paths();
    Store::create(
        &p.dat,
        &p.key,
        &p.log,
        &CreateOptions::new(8).block_size(4096).load_factor(0.5),
    )
    .unwrap();

    {
        let store = Store::open(&p.dat, &p.key, &p.log).unwrap();
        store.insert(&1u64.to_be_bytes(), b"hello").unwrap();
        // read-your-write before any commit
        assert_eq!(
            store.fetch(&1u64.to_be_bytes()).unwrap().as_deref(),
            Some(&b"hello"[..])
        );
        store.close().unwrap();
    }

    {
        let store = Store::open(&p.dat, &p.key, &p.log).unwrap();
        assert_eq!(
            store.fetch(&1u64.to_be_bytes()).unwrap().as_deref(),
            Some(&b"hello"[..])
        );
        store.close().unwrap();
    }
}

#[test]
fn create_refuses_existing_files() {
    let p = paths();
    Store::create(&p.dat, &p.key, &p.log, &CreateOptions::new(8)).unwrap();
    let err = Store::create(&p.dat, &p.key, &p.log, &CreateOptions::new(8)).unwrap_err();
    assert!(err.to_string().contains("failed to create"), "{err}");
}

#[test]
fn duplicate_insert_is_rejected_and_first_value_wins() {
    let p = paths();
    Store::create(&p.dat, &p.key, &p.log, &CreateOptions::new(2)).unwrap();
    let store = Store::open(&p.dat, &p.key, &p.log).unwrap();

    store.insert(b"AA", b"x").unwrap();
    let err = store.insert(b"AA", b"y").unwrap_err();
    assert!(err.to_string().contains("key already exists"), "{err}");
    assert_eq!(store.fetch(b"AA").unwrap().as_deref(), Some(&b"x"[..]));
    store.close().unwrap();

    // still the first value after a commit and reopen
    let store = Store::open(&p.dat, &p.key, &p.log).unwrap();
    let err = store.insert(b"AA", b"z").unwrap_err();
    assert!(err.to_string().contains("key already exists"), "{err}");
    assert_eq!(store.fetch(b"AA").unwrap().as_deref(), Some(&b"x"[..]));
    store.close().unwrap();
}

#[test]
fn bulk_random_inserts_all_fetchable() {
    let p = paths();
    Store::create(&p.dat, &p.key, &p.log, &CreateOptions::new(8)).unwrap();

    let mut rng = StdRng::seed_from_u64(0xBEEF);
    let mut keys: HashSet<u64> = HashSet::new();
    while keys.len() < 100_000 {
        keys.insert(rng.gen());
    }
    let keys: Vec<u64> = keys.into_iter().collect();

    {
        let store = Store::open(&p.dat, &p.key, &p.log).unwrap();
        for &k in &keys {
            let mut value = [0u8; 32];
            value[..8].copy_from_slice(&k.to_le_bytes());
            store.insert(&k.to_be_bytes(), &value).unwrap();
        }
        store.close().unwrap();
    }

    {
        let store = Store::open(&p.dat, &p.key, &p.log).unwrap();
        for &k in &keys {
            let value = store.fetch(&k.to_be_bytes()).unwrap().unwrap();
            assert_eq!(&value[..8], &k.to_le_bytes());
            assert_eq!(value.len(), 32);
        }
        // absent keys miss
        let mut misses = 0;
        let mut probe_rng = StdRng::seed_from_u64(0xD00D);
        while misses < 1000 {
            let k: u64 = probe_rng.gen();
            if keys.contains(&k) {
                continue;
            }
            assert!(store.fetch(&k.to_be_bytes()).unwrap().is_none());
            misses += 1;
        }
        store.close().unwrap();
    }
}

#[test]
fn close_leaves_an_empty_log() {
    let p = paths();
    Store::create(&p.dat, &p.key, &p.log, &CreateOptions::new(8)).unwrap();
    let store = Store::open(&p.dat, &p.key, &p.log).unwrap();
    for i in 0..1000u64 {
        store.insert(&i.to_be_bytes(), b"some value").unwrap();
    }
    store.close().unwrap();
    assert_eq!(std::fs::metadata(&p.log).unwrap().len(), 0);
}

#[test]
fn key_size_is_enforced() {
    let p = paths();
    Store::create(&p.dat, &p.key, &p.log, &CreateOptions::new(8)).unwrap();
    let store = Store::open(&p.dat, &p.key, &p.log).unwrap();

    let err = store.insert(b"short", b"v").unwrap_err();
    assert!(err.to_string().contains("key size mismatch"), "{err}");
    let err = store.fetch(b"toolongforakey").unwrap_err();
    assert!(err.to_string().contains("key size mismatch"), "{err}");
    let err = store.insert(&1u64.to_be_bytes(), b"").unwrap_err();
    assert!(err.to_string().contains("invalid value size"), "{err}");
    store.close().unwrap();
}

#[test]
fn fetch_visitor_sees_exact_bytes_and_errors_propagate() {
    let p = paths();
    Store::create(&p.dat, &p.key, &p.log, &CreateOptions::new(8)).unwrap();
    let store = Store::open(&p.dat, &p.key, &p.log).unwrap();
    store.insert(&7u64.to_be_bytes(), b"payload").unwrap();

    let mut len = 0;
    let hit = store
        .fetch_with(&7u64.to_be_bytes(), |v| {
            len = v.len();
            Ok(())
        })
        .unwrap();
    assert!(hit);
    assert_eq!(len, 7);

    let err = store
        .fetch_with(&7u64.to_be_bytes(), |_| eyre::bail!("visitor bails"))
        .unwrap_err();
    assert!(err.to_string().contains("visitor bails"), "{err}");
    // the store is unaffected
    assert!(store.fetch(&7u64.to_be_bytes()).unwrap().is_some());
    store.close().unwrap();
}

#[test]
fn concurrent_fetches_observe_committed_and_pending_inserts() {
    use std::sync::Arc;

    let p = paths();
    Store::create(&p.dat, &p.key, &p.log, &CreateOptions::new(8)).unwrap();
    let store = Arc::new(Store::open(&p.dat, &p.key, &p.log).unwrap());

    for i in 0..2000u64 {
        store.insert(&i.to_be_bytes(), &i.to_le_bytes()).unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..4 {
        let store = Arc::clone(&store);
        handles.push(std::thread::spawn(move || {
            for i in 0..2000u64 {
                let value = store.fetch(&i.to_be_bytes()).unwrap().unwrap();
                assert_eq!(value, i.to_le_bytes());
            }
        }));
    }
    for i in 2000..3000u64 {
        store.insert(&i.to_be_bytes(), &i.to_le_bytes()).unwrap();
    }
    for handle in handles {
        handle.join().unwrap();
    }
    for i in 0..3000u64 {
        assert!(store.fetch(&i.to_be_bytes()).unwrap().is_some());
    }

    Arc::try_unwrap(store)
        .unwrap_or_else(|_| panic!("store still shared"))
        .close()
        .unwrap();
}
