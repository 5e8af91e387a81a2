//! B-ε store behavior: buffered visibility and observational equivalence
//! with the B+ tree.

use std::collections::BTreeMap;

use quickcheck_macros::quickcheck;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use tiertree::{BEpsilonStore, BPlusStore, Error, StoreConfig};

fn config(degree: u16, cache_capacity: usize) -> StoreConfig {
    StoreConfig {
        degree,
        cache_capacity,
        block_size: 2048,
        storage_bytes: 32 * 1024 * 1024,
        ..StoreConfig::default()
    }
}

fn store(degree: u16, cache_capacity: usize) -> BEpsilonStore<u64, u64> {
    let store = BEpsilonStore::new(&config(degree, cache_capacity)).unwrap();
    store.init().unwrap();
    store
}

#[test]
fn buffered_inserts_are_visible_before_and_after_flush() {
    // Degree 3, buffer capacity 5: the first twenty inserts cross both a
    // root-leaf split and several buffer flushes.
    let store = store(3, 64);
    for k in 1..=20 {
        store.insert(k, k).unwrap();
        // Every key is readable immediately, wherever it currently lives
        // (root buffer, flushed leaf, or pre-split root leaf).
        for probe in 1..=k {
            assert_eq!(store.search(&probe).unwrap(), probe, "after insert {k}");
        }
    }
    assert!(matches!(store.search(&21), Err(Error::KeyDoesNotExist)));
}

#[test]
fn buffered_delete_shadows_the_subtree() {
    let store = store(3, 64);
    for k in 1..=20 {
        store.insert(k, k).unwrap();
    }
    store.remove(&15).unwrap();
    assert!(matches!(store.search(&15), Err(Error::KeyDoesNotExist)));
    assert!(matches!(store.remove(&15), Err(Error::KeyDoesNotExist)));
    // Re-insert after the buffered delete.
    store.insert(15, 1500).unwrap();
    assert_eq!(store.search(&15).unwrap(), 1500);
}

#[test]
fn buffered_update_wins_over_older_insert() {
    let store = store(3, 64);
    for k in 1..=20 {
        store.insert(k, k).unwrap();
    }
    store.update(&7, 700).unwrap();
    assert_eq!(store.search(&7).unwrap(), 700);
    assert!(matches!(store.update(&99, 1), Err(Error::KeyDoesNotExist)));
}

#[test]
fn duplicate_insert_is_rejected_from_the_buffer() {
    let store = store(3, 64);
    for k in 1..=20 {
        store.insert(k, k).unwrap();
    }
    // 18 is still buffered, 2 already lives in a leaf.
    assert!(matches!(store.insert(18, 0), Err(Error::KeyAlreadyExists)));
    assert!(matches!(store.insert(2, 0), Err(Error::KeyAlreadyExists)));
}

#[test]
fn deep_tree_with_tiny_cache() {
    let store = store(3, 4);
    for k in 0..2000u64 {
        store.insert(k, k * 7).unwrap();
    }
    for k in 0..2000u64 {
        assert_eq!(store.search(&k).unwrap(), k * 7, "key {k}");
    }
    assert!(store.get_cache().stats().evictions > 0);
}

#[test]
fn flush_preserves_buffered_messages() {
    let store = store(3, 64);
    for k in 1..=30 {
        store.insert(k, k).unwrap();
    }
    store.remove(&12).unwrap();
    // Messages still sitting in interior buffers serialize with their
    // nodes; a flush must not change any answer.
    store.flush().unwrap();
    for k in 1..=30 {
        if k == 12 {
            assert!(store.search(&k).is_err());
        } else {
            assert_eq!(store.search(&k).unwrap(), k);
        }
    }
}

#[quickcheck]
fn matches_bplus_on_any_workload(ops: Vec<(u16, bool)>, seed: u64) -> bool {
    let bplus: BPlusStore<u64, u64> = BPlusStore::new(&config(3, 32)).unwrap();
    let beps = store(3, 32);
    bplus.init().unwrap();

    let mut rng = XorShiftRng::seed_from_u64(seed);
    for (key, is_insert) in ops {
        let k = key as u64 % 256;
        if is_insert {
            let a = bplus.insert(k, k + 1).is_ok();
            let b = beps.insert(k, k + 1).is_ok();
            if a != b {
                return false;
            }
        } else {
            let a = bplus.remove(&k).is_ok();
            let b = beps.remove(&k).is_ok();
            if a != b {
                return false;
            }
        }
        // Interleave reads at a random probe.
        let probe = rng.gen_range(0..256u64);
        match (bplus.search(&probe), beps.search(&probe)) {
            (Ok(a), Ok(b)) if a == b => {}
            (Err(_), Err(_)) => {}
            _ => return false,
        }
    }
    (0..256u64).all(|k| match (bplus.search(&k), beps.search(&k)) {
        (Ok(a), Ok(b)) => a == b,
        (Err(_), Err(_)) => true,
        _ => false,
    })
}

#[quickcheck]
fn model_checked_against_btreemap(ops: Vec<(u16, u8)>) -> bool {
    let store = store(4, 16);
    let mut model: BTreeMap<u64, u64> = BTreeMap::new();
    for (key, action) in ops {
        let k = key as u64 % 128;
        match action % 3 {
            0 => {
                let expect = !model.contains_key(&k);
                let got = store.insert(k, k * 2).is_ok();
                if expect != got {
                    return false;
                }
                model.entry(k).or_insert(k * 2);
            }
            1 => {
                let expect = model.remove(&k).is_some();
                if store.remove(&k).is_ok() != expect {
                    return false;
                }
            }
            _ => {
                let expect = model.get(&k).is_some();
                let updated = store.update(&k, k * 5).is_ok();
                if expect != updated {
                    return false;
                }
                if updated {
                    model.insert(k, k * 5);
                }
            }
        }
    }
    model.iter().all(|(k, v)| store.search(k).unwrap() == *v)
        && (0..128u64)
            .filter(|k| !model.contains_key(k))
            .all(|k| store.search(&k).is_err())
}
