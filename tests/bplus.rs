//! B+ store behavior: the split/merge scenarios, algebraic laws and a
//! little concurrency.

use std::collections::BTreeMap;
use std::sync::Arc;

use quickcheck_macros::quickcheck;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use tiertree::{
    cache::{ClockPolicy, TwoQueuePolicy},
    BPlusStore, Error, StoreConfig,
};

fn config(degree: u16, cache_capacity: usize) -> StoreConfig {
    StoreConfig {
        degree,
        cache_capacity,
        block_size: 2048,
        storage_bytes: 32 * 1024 * 1024,
        ..StoreConfig::default()
    }
}

fn store(degree: u16, cache_capacity: usize) -> BPlusStore<u64, u64> {
    let store = BPlusStore::new(&config(degree, cache_capacity)).unwrap();
    store.init().unwrap();
    store
}

#[test]
fn sequential_insert_splits_at_six() {
    // Degree 3: five keys fill a leaf, the sixth splits it.
    let store = store(3, 64);
    for k in 1..=6 {
        store.insert(k, k).unwrap();
    }
    for k in 1..=6 {
        assert_eq!(store.search(&k).unwrap(), k);
    }
    assert!(matches!(store.search(&7), Err(Error::KeyDoesNotExist)));

    let mut out = Vec::new();
    store.print(&mut out).unwrap();
    let dump = String::from_utf8(out).unwrap();
    // Root [4] over {1,2,3} and {4,5,6}.
    assert!(dump.contains("[4]"), "unexpected tree shape:\n{dump}");
    assert!(dump.contains("[1, 2, 3]"), "unexpected tree shape:\n{dump}");
    assert!(dump.contains("[4, 5, 6]"), "unexpected tree shape:\n{dump}");
}

#[test]
fn reverse_insert_reaches_same_shape() {
    let store = store(3, 64);
    for k in (1..=6).rev() {
        store.insert(k, k).unwrap();
    }
    assert_eq!(store.search(&3).unwrap(), 3);

    let mut out = Vec::new();
    store.print(&mut out).unwrap();
    let dump = String::from_utf8(out).unwrap();
    assert!(dump.contains("[1, 2, 3]"), "unexpected tree shape:\n{dump}");
    assert!(dump.contains("[4, 5, 6]"), "unexpected tree shape:\n{dump}");
}

#[test]
fn delete_borrows_from_right_sibling() {
    let store = store(3, 64);
    for k in 1..=6 {
        store.insert(k, k).unwrap();
    }
    store.remove(&1).unwrap();
    store.remove(&2).unwrap();

    let mut out = Vec::new();
    store.print(&mut out).unwrap();
    let dump = String::from_utf8(out).unwrap();
    // Left leaf underflowed and borrowed 4; the separator moved to 5.
    assert!(dump.contains("[5]"), "unexpected tree shape:\n{dump}");
    assert!(dump.contains("[3, 4]"), "unexpected tree shape:\n{dump}");
    assert!(dump.contains("[5, 6]"), "unexpected tree shape:\n{dump}");
    for k in 3..=6 {
        assert_eq!(store.search(&k).unwrap(), k);
    }
}

#[test]
fn delete_merges_and_collapses_root() {
    let store = store(3, 64);
    for k in 1..=6 {
        store.insert(k, k).unwrap();
    }
    store.remove(&1).unwrap();
    store.remove(&2).unwrap();
    store.remove(&3).unwrap();

    let mut out = Vec::new();
    store.print(&mut out).unwrap();
    let dump = String::from_utf8(out).unwrap();
    // Single root leaf again, one line, height dropped by one.
    assert_eq!(dump.lines().count(), 1, "unexpected tree shape:\n{dump}");
    assert!(dump.contains("[4, 5, 6]"), "unexpected tree shape:\n{dump}");
    for k in 4..=6 {
        assert_eq!(store.search(&k).unwrap(), k);
    }
}

#[test]
fn duplicate_insert_and_double_remove_report_codes() {
    let store = store(3, 64);
    store.insert(10, 100).unwrap();
    assert!(matches!(store.insert(10, 999), Err(Error::KeyAlreadyExists)));
    assert_eq!(store.search(&10).unwrap(), 100);

    store.remove(&10).unwrap();
    assert!(matches!(store.remove(&10), Err(Error::KeyDoesNotExist)));
}

#[test]
fn update_replaces_value_in_place() {
    let store = store(3, 64);
    for k in 0..100 {
        store.insert(k, k).unwrap();
    }
    store.update(&42, 4200).unwrap();
    assert_eq!(store.search(&42).unwrap(), 4200);
    assert!(matches!(store.update(&1000, 1), Err(Error::KeyDoesNotExist)));
}

#[test]
fn tiny_cache_forces_eviction_and_reconciliation() {
    // Four attached bodies for a tree of hundreds of nodes: every descent
    // works through detached tombstones and pending identities.
    let store = store(3, 4);
    for k in 0..2000u64 {
        store.insert(k, k * 3).unwrap();
    }
    for k in 0..2000u64 {
        assert_eq!(store.search(&k).unwrap(), k * 3, "key {k}");
    }
    let stats = store.get_cache().stats();
    assert!(stats.evictions > 0);
    assert!(stats.write_backs > 0);
}

#[test]
fn clock_and_a2q_policies_agree_with_lru() {
    let cfg = config(4, 8);
    let clock: BPlusStore<u64, u64, ClockPolicy> = BPlusStore::new(&cfg).unwrap();
    let a2q: BPlusStore<u64, u64, TwoQueuePolicy> = BPlusStore::new(&cfg).unwrap();
    clock.init().unwrap();
    a2q.init().unwrap();

    let mut rng = XorShiftRng::seed_from_u64(7);
    let mut model = BTreeMap::new();
    for _ in 0..1500 {
        let k: u64 = rng.gen_range(0..500);
        if rng.gen_bool(0.7) {
            let dup = model.insert(k, k).is_some();
            assert_eq!(clock.insert(k, k).is_err(), dup);
            assert_eq!(a2q.insert(k, k).is_err(), dup);
        } else {
            let missing = model.remove(&k).is_none();
            assert_eq!(clock.remove(&k).is_err(), missing);
            assert_eq!(a2q.remove(&k).is_err(), missing);
        }
    }
    for (k, v) in &model {
        assert_eq!(clock.search(k).unwrap(), *v);
        assert_eq!(a2q.search(k).unwrap(), *v);
    }
}

#[test]
fn concurrent_disjoint_writers() {
    let store = Arc::new(store(8, 64));
    let mut handles = Vec::new();
    for t in 0..4u64 {
        let store = Arc::clone(&store);
        handles.push(std::thread::spawn(move || {
            for k in (t * 1000)..(t * 1000 + 500) {
                store.insert(k, k + 1).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    for t in 0..4u64 {
        for k in (t * 1000)..(t * 1000 + 500) {
            assert_eq!(store.search(&k).unwrap(), k + 1);
        }
    }
}

#[quickcheck]
fn insert_search_round_trip(mut keys: Vec<u16>) -> bool {
    keys.sort_unstable();
    keys.dedup();
    let store = store(3, 32);
    for &k in &keys {
        store.insert(k as u64, k as u64 + 7).unwrap();
    }
    keys.iter()
        .all(|&k| store.search(&(k as u64)).unwrap() == k as u64 + 7)
}

#[quickcheck]
fn final_map_is_permutation_independent(keys: Vec<u16>, seed: u64) -> bool {
    let mut unique: Vec<u64> = keys.iter().map(|&k| k as u64).collect();
    unique.sort_unstable();
    unique.dedup();

    let forward = store(3, 32);
    for &k in &unique {
        forward.insert(k, k).unwrap();
    }

    let mut shuffled = unique.clone();
    let mut rng = XorShiftRng::seed_from_u64(seed);
    for i in (1..shuffled.len()).rev() {
        shuffled.swap(i, rng.gen_range(0..=i));
    }
    let permuted = store(3, 32);
    for &k in &shuffled {
        permuted.insert(k, k).unwrap();
    }

    unique
        .iter()
        .all(|k| forward.search(k).unwrap() == permuted.search(k).unwrap())
}

#[quickcheck]
fn remove_everything_and_survive(keys: Vec<u16>) -> bool {
    let mut unique: Vec<u64> = keys.iter().map(|&k| k as u64).collect();
    unique.sort_unstable();
    unique.dedup();

    let store = store(3, 32);
    for &k in &unique {
        store.insert(k, k).unwrap();
    }
    for &k in &unique {
        store.remove(&k).unwrap();
    }
    unique.iter().all(|k| store.search(k).is_err())
}

#[quickcheck]
fn flush_is_neutral_for_reads(keys: Vec<u16>) -> bool {
    let mut unique: Vec<u64> = keys.iter().map(|&k| k as u64).collect();
    unique.sort_unstable();
    unique.dedup();

    let store = store(3, 32);
    for &k in &unique {
        store.insert(k, k * 2).unwrap();
    }
    store.flush().unwrap();
    unique.iter().all(|&k| store.search(&k).unwrap() == k * 2)
        && store.search(&u64::MAX).is_err()
}
