//! Persistence across store instances: flush, remember the root identity,
//! reopen over the same tier backing.

use tempfile::tempdir;
use tiertree::{BEpsilonStore, BPlusStore, StorageTier, StoreConfig};

#[test]
fn reopen_bplus_from_file_tier() {
    let dir = tempdir().unwrap();
    let config = StoreConfig {
        degree: 16,
        cache_capacity: 32,
        block_size: 2048,
        storage_bytes: 64 * 1024 * 1024,
        file_path: Some(dir.path().join("filestore.hdb")),
        write_tier: StorageTier::File,
        ..StoreConfig::default()
    };

    let root = {
        let store: BPlusStore<u64, u64> = BPlusStore::new(&config).unwrap();
        store.init().unwrap();
        for k in 1..1000u64 {
            store.insert(k, k).unwrap();
        }
        store.flush().unwrap()
    };
    assert_eq!(root.tier(), StorageTier::File);

    let reopened: BPlusStore<u64, u64> = BPlusStore::open(&config, root).unwrap();
    for k in 1..1000u64 {
        assert_eq!(reopened.search(&k).unwrap(), k, "key {k}");
    }
    assert!(reopened.search(&1000).is_err());
}

#[test]
fn reopen_bepsilon_with_pending_buffers_from_pmem_tier() {
    let dir = tempdir().unwrap();
    let config = StoreConfig {
        degree: 3,
        cache_capacity: 16,
        block_size: 2048,
        storage_bytes: 32 * 1024 * 1024,
        pmem_path: Some(dir.path().join("pmempool")),
        write_tier: StorageTier::Pmem,
        ..StoreConfig::default()
    };

    let root = {
        let store: BEpsilonStore<u64, u64> = BEpsilonStore::new(&config).unwrap();
        store.init().unwrap();
        for k in 1..200u64 {
            store.insert(k, k * 11).unwrap();
        }
        // Leave messages sitting in interior buffers; they persist as part
        // of the buffered index pages.
        store.remove(&77).unwrap();
        store.flush().unwrap()
    };
    assert_eq!(root.tier(), StorageTier::Pmem);

    let reopened: BEpsilonStore<u64, u64> = BEpsilonStore::open(&config, root).unwrap();
    for k in 1..200u64 {
        if k == 77 {
            assert!(reopened.search(&k).is_err());
        } else {
            assert_eq!(reopened.search(&k).unwrap(), k * 11, "key {k}");
        }
    }
}

#[test]
fn flush_is_idempotent_when_clean() {
    let dir = tempdir().unwrap();
    let config = StoreConfig {
        degree: 8,
        cache_capacity: 64,
        block_size: 2048,
        storage_bytes: 32 * 1024 * 1024,
        file_path: Some(dir.path().join("filestore.hdb")),
        write_tier: StorageTier::File,
        ..StoreConfig::default()
    };
    let store: BPlusStore<u64, u64> = BPlusStore::new(&config).unwrap();
    store.init().unwrap();
    for k in 0..100u64 {
        store.insert(k, k).unwrap();
    }
    let first = store.flush().unwrap();
    let second = store.flush().unwrap();
    assert_eq!(first, second);
}

#[test]
fn wal_receives_append_only_records() {
    let dir = tempdir().unwrap();
    let wal_path = dir.path().join("wal.bin");
    let config = StoreConfig {
        degree: 4,
        cache_capacity: 32,
        block_size: 2048,
        storage_bytes: 16 * 1024 * 1024,
        wal_path: Some(wal_path.clone()),
        ..StoreConfig::default()
    };
    let store: BPlusStore<u64, u64> = BPlusStore::new(&config).unwrap();
    store.init().unwrap();
    for k in 0..10u64 {
        store.insert(k, k).unwrap();
    }
    store.remove(&3).unwrap();
    let len = std::fs::metadata(&wal_path).unwrap().len();
    assert!(len > 0, "wal stayed empty");
}
