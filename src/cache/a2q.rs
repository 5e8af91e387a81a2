//! 2Q replacement: a recent FIFO in front of a frequent LRU.
//!
//! First contact places an entry in the recent queue. A second hit while
//! still recent promotes it into the frequent queue, which is kept in LRU
//! order. Eviction drains the recent queue first.

use std::collections::{BTreeMap, HashMap, VecDeque};

use super::policy::Policy;
use crate::uid::ObjectUid;

#[derive(Clone, Copy, PartialEq)]
enum Queue {
    Recent,
    Frequent(u64),
}

#[derive(Default)]
pub struct TwoQueuePolicy {
    location: HashMap<ObjectUid, Queue>,
    recent: VecDeque<ObjectUid>,
    frequent: BTreeMap<u64, ObjectUid>,
    tick: u64,
}

impl TwoQueuePolicy {
    fn promote(&mut self, uid: ObjectUid) {
        self.recent.retain(|u| u != &uid);
        self.tick += 1;
        self.frequent.insert(self.tick, uid);
        self.location.insert(uid, Queue::Frequent(self.tick));
    }
}

impl Policy for TwoQueuePolicy {
    fn record_insert(&mut self, uid: ObjectUid) {
        if !self.location.contains_key(&uid) {
            self.location.insert(uid, Queue::Recent);
            self.recent.push_back(uid);
        }
    }

    fn record_access(&mut self, uid: ObjectUid) {
        match self.location.get(&uid).copied() {
            Some(Queue::Recent) => self.promote(uid),
            Some(Queue::Frequent(tick)) => {
                self.frequent.remove(&tick);
                self.tick += 1;
                self.frequent.insert(self.tick, uid);
                self.location.insert(uid, Queue::Frequent(self.tick));
            }
            None => {}
        }
    }

    fn record_remove(&mut self, uid: ObjectUid) {
        match self.location.remove(&uid) {
            Some(Queue::Recent) => self.recent.retain(|u| u != &uid),
            Some(Queue::Frequent(tick)) => {
                self.frequent.remove(&tick);
            }
            None => {}
        }
    }

    fn rekey(&mut self, old: ObjectUid, new: ObjectUid) {
        match self.location.remove(&old) {
            Some(Queue::Recent) => {
                for slot in self.recent.iter_mut() {
                    if *slot == old {
                        *slot = new;
                        break;
                    }
                }
                self.location.insert(new, Queue::Recent);
            }
            Some(q @ Queue::Frequent(tick)) => {
                self.frequent.insert(tick, new);
                self.location.insert(new, q);
            }
            None => {}
        }
    }

    fn select_victims(&mut self, max: usize) -> Vec<ObjectUid> {
        self.recent
            .iter()
            .chain(self.frequent.values())
            .take(max)
            .copied()
            .collect()
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
    fn recent_drains_before_frequent() {
        let mut p = TwoQueuePolicy::default();
        for i in 0..4 {
            p.record_insert(uid(i));
        }
        // 0 becomes frequent, the rest stay recent.
        p.record_access(uid(0));
        assert_eq!(p.select_victims(4), vec![uid(1), uid(2), uid(3), uid(0)]);
    }

    #[test]
    fn frequent_is_lru_ordered() {
        let mut p = TwoQueuePolicy::default();
        for i in 0..3 {
            p.record_insert(uid(i));
            p.record_access(uid(i));
        }
        p.record_access(uid(0));
        assert_eq!(p.select_victims(3), vec![uid(1), uid(2), uid(0)]);
    }
}
