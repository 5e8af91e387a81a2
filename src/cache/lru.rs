//! Least-recently-used replacement.
//!
//! Recency is a monotonic tick per entry; the `BTreeMap` over ticks is the
//! recency list (front = coldest), the `HashMap` finds an entry's current
//! tick on access.

use std::collections::{BTreeMap, HashMap};

use super::policy::Policy;
use crate::uid::ObjectUid;

#[derive(Default)]
pub struct LruPolicy {
    tick: u64,
    ticks: HashMap<ObjectUid, u64>,
    order: BTreeMap<u64, ObjectUid>,
}

impl LruPolicy {
    fn touch(&mut self, uid: ObjectUid) {
        if let Some(old) = self.ticks.get(&uid).copied() {
            self.order.remove(&old);
        }
        self.tick += 1;
        self.ticks.insert(uid, self.tick);
        self.order.insert(self.tick, uid);
    }
}

impl Policy for LruPolicy {
    fn record_insert(&mut self, uid: ObjectUid) {
        self.touch(uid);
    }

    fn record_access(&mut self, uid: ObjectUid) {
        if self.ticks.contains_key(&uid) {
            self.touch(uid);
        }
    }

    fn record_remove(&mut self, uid: ObjectUid) {
        if let Some(tick) = self.ticks.remove(&uid) {
            self.order.remove(&tick);
        }
    }

    fn rekey(&mut self, old: ObjectUid, new: ObjectUid) {
        if let Some(tick) = self.ticks.remove(&old) {
            self.ticks.insert(new, tick);
            self.order.insert(tick, new);
        }
    }

    fn select_victims(&mut self, max: usize) -> Vec<ObjectUid> {
        self.order.values().take(max).copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uid::ObjectKind;

    fn uid(seq: u64) -> ObjectUid {
        ObjectUid::transient(seq, ObjectKind::Leaf)
    }

    #[test]
    fn evicts_least_recent_first() {
        let mut p = LruPolicy::default();
        for i in 0..3 {
            p.record_insert(uid(i));
        }
        p.record_access(uid(0));
        assert_eq!(p.select_victims(2), vec![uid(1), uid(2)]);
    }

    #[test]
    fn remove_and_rekey() {
        let mut p = LruPolicy::default();
        p.record_insert(uid(1));
        p.record_insert(uid(2));
        p.rekey(uid(1), uid(9));
        p.record_remove(uid(2));
        assert_eq!(p.select_victims(4), vec![uid(9)]);
    }
}
