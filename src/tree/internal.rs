//! Hot (owned) index node, plain and buffered.
//!
//! The buffered flavor is the same node with a per-pivot message buffer;
//! structural operations move the buffers alongside their pivots.

use std::mem;

use log::trace;

use super::{
    child_buffer::{Message, MsgBuffer},
    node::Node,
};
use crate::{
    cache::{NodeCache, ObjectRef, ObjectWriteGuard, Policy},
    error::Result,
    pod::Pod,
    uid::ObjectUid,
};

/// Reference to one child subtree: its identity plus an accelerator pointer
/// into the cache, populated on first materialization.
#[derive(Clone)]
pub struct ChildRef<K, V> {
    pub uid: ObjectUid,
    pub cached: Option<ObjectRef<K, V>>,
}

impl<K, V> ChildRef<K, V> {
    pub fn new(uid: ObjectUid, cached: Option<ObjectRef<K, V>>) -> ChildRef<K, V> {
        ChildRef { uid, cached }
    }

    pub fn from_uid(uid: ObjectUid) -> ChildRef<K, V> {
        ChildRef { uid, cached: None }
    }
}

/// Outcome of [IndexNode::rebalance_child].
pub struct RebalanceOutcome<K, V> {
    /// The node a merge emptied; the driver removes it from the cache and
    /// releases its blocks.
    pub deleted: Option<ChildRef<K, V>>,
}

pub struct IndexNode<K, V> {
    degree: u16,
    keys: Vec<K>,
    children: Vec<ChildRef<K, V>>,
    /// `Some` on B-ε nodes; always `children.len()` buffers.
    buffers: Option<Vec<MsgBuffer<K, V>>>,
}

impl<K: Pod, V: Pod> IndexNode<K, V> {
    pub fn new_root(
        degree: u16,
        left: ChildRef<K, V>,
        separator: K,
        right: ChildRef<K, V>,
        buffered: bool,
    ) -> IndexNode<K, V> {
        IndexNode {
            degree,
            keys: vec![separator],
            children: vec![left, right],
            buffers: buffered.then(|| vec![MsgBuffer::new(), MsgBuffer::new()]),
        }
    }

    pub fn from_parts(
        degree: u16,
        keys: Vec<K>,
        children: Vec<ChildRef<K, V>>,
        buffers: Option<Vec<MsgBuffer<K, V>>>,
    ) -> IndexNode<K, V> {
        debug_assert_eq!(children.len(), keys.len() + 1);
        if let Some(buffers) = &buffers {
            debug_assert_eq!(buffers.len(), children.len());
        }
        IndexNode {
            degree,
            keys,
            children,
            buffers,
        }
    }

    pub fn degree(&self) -> u16 {
        self.degree
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn is_buffered(&self) -> bool {
        self.buffers.is_some()
    }

    /// Index of the child whose range covers `key` (upper bound over the
    /// pivot keys).
    pub fn locate_child(&self, key: &K) -> usize {
        self.keys.partition_point(|pivot| pivot <= key)
    }

    pub fn child(&self, idx: usize) -> &ChildRef<K, V> {
        &self.children[idx]
    }

    pub fn child_mut(&mut self, idx: usize) -> &mut ChildRef<K, V> {
        &mut self.children[idx]
    }

    pub fn child_uid(&self, idx: usize) -> ObjectUid {
        self.children[idx].uid
    }

    pub fn set_child_uid(&mut self, idx: usize, uid: ObjectUid) {
        self.children[idx].uid = uid;
    }

    pub fn set_child_cached(&mut self, idx: usize, wrapper: ObjectRef<K, V>) {
        self.children[idx].cached = Some(wrapper);
    }

    /// Installs a new right sibling produced by a child split. On a
    /// buffered node the child's pending messages are divided by the new
    /// separator.
    pub fn insert_pivot(&mut self, key: K, right: ChildRef<K, V>) {
        let idx = match self.keys.binary_search(&key) {
            Ok(_) => panic!("duplicate pivot key inserted"),
            Err(idx) => idx,
        };
        self.keys.insert(idx, key);
        self.children.insert(idx + 1, right);
        if let Some(buffers) = &mut self.buffers {
            let upper = buffers[idx].partition_at(&key);
            buffers.insert(idx + 1, upper);
        }
    }

    /// Splits at the midpoint `m = n/2`: `keys[m]` moves up, everything
    /// right of it forms the new sibling.
    pub fn split(&mut self) -> (IndexNode<K, V>, K) {
        let mid = self.keys.len() / 2;
        let promote = self.keys[mid];
        let right_keys = self.keys.split_off(mid + 1);
        self.keys.truncate(mid);
        let right_children = self.children.split_off(mid + 1);
        let right_buffers = self.buffers.as_mut().map(|b| b.split_off(mid + 1));
        let sibling = IndexNode {
            degree: self.degree,
            keys: right_keys,
            children: right_children,
            buffers: right_buffers,
        };
        (sibling, promote)
    }

    // Buffered accessors. All panic on a plain index node.

    pub fn buffer(&self, idx: usize) -> &MsgBuffer<K, V> {
        &self.buffers.as_ref().expect("not a buffered node")[idx]
    }

    pub fn push_msg(&mut self, idx: usize, msg: Message<K, V>) {
        self.buffers.as_mut().expect("not a buffered node")[idx].push(msg);
    }

    pub fn take_msgs(&mut self, idx: usize) -> Vec<Message<K, V>> {
        self.buffers.as_mut().expect("not a buffered node")[idx].drain()
    }

    pub(crate) fn buffers(&self) -> Option<&[MsgBuffer<K, V>]> {
        self.buffers.as_deref()
    }

    /// Takes the left sibling's last subtree, rotating through the parent
    /// separator. Returns the new separator for the parent.
    pub fn rotate_from_left(&mut self, separator: K, left: &mut IndexNode<K, V>) -> K {
        self.keys.insert(0, separator);
        let child = left.children.pop().expect("rotate from empty sibling");
        self.children.insert(0, child);
        if let Some(buffers) = &mut self.buffers {
            let moved = left.buffers.as_mut().unwrap().pop().unwrap();
            buffers.insert(0, moved);
        }
        left.keys.pop().unwrap()
    }

    /// Takes the right sibling's first subtree. Returns the new separator.
    pub fn rotate_from_right(&mut self, separator: K, right: &mut IndexNode<K, V>) -> K {
        self.keys.push(separator);
        self.children.push(right.children.remove(0));
        if let Some(buffers) = &mut self.buffers {
            let moved = right.buffers.as_mut().unwrap().remove(0);
            buffers.push(moved);
        }
        right.keys.remove(0)
    }

    /// Absorbs the right sibling, pulling the separator down between the
    /// two pivot runs.
    pub fn merge_with(&mut self, separator: K, right: &mut IndexNode<K, V>) {
        self.keys.push(separator);
        self.keys.append(&mut right.keys);
        self.children.append(&mut right.children);
        if let Some(buffers) = &mut self.buffers {
            buffers.append(right.buffers.as_mut().unwrap());
        }
    }

    /// Restores occupancy of the underfull child at `idx`, preferring a
    /// borrow from the left sibling, then merging towards the left. The
    /// caller holds the child's writer lock and passes its body; the
    /// sibling is locked here through the cache.
    pub fn rebalance_child<P: Policy>(
        &mut self,
        cache: &NodeCache<K, V, P>,
        idx: usize,
        child: &mut Node<K, V>,
    ) -> Result<RebalanceOutcome<K, V>> {
        if self.children.len() < 2 {
            panic!("rebalance could not find a sibling");
        }

        if idx > 0 {
            let (_sib_arc, mut sib_g) = self.acquire_sibling(cache, idx - 1)?;
            if sib_g.body().can_lend() {
                let separator = self.keys[idx - 1];
                let new_sep = match (child, sib_g.body_mut()) {
                    (Node::Leaf(c), Node::Leaf(l)) => c.borrow_from_left(l),
                    (Node::Index(c), Node::Index(l)) => c.rotate_from_left(separator, l),
                    _ => panic!("sibling and child disagree on node kind"),
                };
                sib_g.mark_dirty();
                // The child's range grew downwards; pending messages at or
                // above the new separator follow it.
                if let Some(buffers) = &mut self.buffers {
                    let moved = buffers[idx - 1].partition_at(&new_sep);
                    buffers[idx].absorb(moved);
                }
                self.keys[idx - 1] = new_sep;
                trace!("rebalance: borrowed from left sibling at {}", idx - 1);
                return Ok(RebalanceOutcome { deleted: None });
            }

            // Merge the child into the left sibling; the child is deleted.
            let separator = self.keys[idx - 1];
            match (sib_g.body_mut(), child) {
                (Node::Leaf(l), Node::Leaf(c)) => l.merge_with(c),
                (Node::Index(l), Node::Index(c)) => l.merge_with(separator, c),
                _ => panic!("sibling and child disagree on node kind"),
            }
            sib_g.mark_dirty();
            let deleted = self.children.remove(idx);
            self.keys.remove(idx - 1);
            if let Some(buffers) = &mut self.buffers {
                let pending = buffers.remove(idx);
                buffers[idx - 1].absorb(pending);
            }
            trace!("rebalance: merged child {idx} into its left sibling");
            return Ok(RebalanceOutcome {
                deleted: Some(deleted),
            });
        }

        // No left sibling, work with the right one.
        let (_sib_arc, mut sib_g) = self.acquire_sibling(cache, idx + 1)?;
        if sib_g.body().can_lend() {
            let separator = self.keys[idx];
            let new_sep = match (child, sib_g.body_mut()) {
                (Node::Leaf(c), Node::Leaf(r)) => c.borrow_from_right(r),
                (Node::Index(c), Node::Index(r)) => c.rotate_from_right(separator, r),
                _ => panic!("sibling and child disagree on node kind"),
            };
            sib_g.mark_dirty();
            // The child's range grew upwards; the sibling's pending
            // messages below the new separator follow the moved entry.
            if let Some(buffers) = &mut self.buffers {
                let upper = buffers[idx + 1].partition_at(&new_sep);
                let lower = mem::replace(&mut buffers[idx + 1], upper);
                buffers[idx].absorb(lower);
            }
            self.keys[idx] = new_sep;
            trace!("rebalance: borrowed from right sibling at {}", idx + 1);
            return Ok(RebalanceOutcome { deleted: None });
        }

        let separator = self.keys[idx];
        match (child, sib_g.body_mut()) {
            (Node::Leaf(c), Node::Leaf(r)) => c.merge_with(r),
            (Node::Index(c), Node::Index(r)) => c.merge_with(separator, r),
            _ => panic!("sibling and child disagree on node kind"),
        }
        let deleted = self.children.remove(idx + 1);
        self.keys.remove(idx);
        if let Some(buffers) = &mut self.buffers {
            let pending = buffers.remove(idx + 1);
            buffers[idx].absorb(pending);
        }
        trace!("rebalance: merged right sibling into child {idx}");
        Ok(RebalanceOutcome {
            deleted: Some(deleted),
        })
    }

    /// Locks and materializes the sibling at `idx`, reconciling a pending
    /// identity into the pivot on the way.
    fn acquire_sibling<P: Policy>(
        &mut self,
        cache: &NodeCache<K, V, P>,
        idx: usize,
    ) -> Result<(ObjectRef<K, V>, ObjectWriteGuard<K, V>)> {
        let uid = self.children[idx].uid;
        let wrapper = match &self.children[idx].cached {
            Some(wrapper) => wrapper.clone(),
            None => cache.get_object(self.degree, uid)?,
        };
        // Bounded spin first; descent ordering makes the blocking fallback
        // free of lock cycles (only downstream readers can hold a sibling).
        let mut guard = match (0..64).find_map(|_| {
            let guard = wrapper.try_write_arc();
            if guard.is_none() {
                std::thread::yield_now();
            }
            guard
        }) {
            Some(guard) => guard,
            None => wrapper.write_arc(),
        };
        if let Some(new) = guard.updated_uid() {
            guard.adopt_updated();
            cache.retire(uid, new);
            self.children[idx].uid = new;
        }
        cache.ensure_hot(self.degree, &mut guard)?;
        self.children[idx].cached = Some(wrapper.clone());
        Ok((wrapper, guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uid::ObjectKind;

    fn uid(seq: u64) -> ObjectUid {
        ObjectUid::transient(seq, ObjectKind::Leaf)
    }

    fn index(keys: &[u64]) -> IndexNode<u64, u64> {
        let children = (0..=keys.len() as u64).map(|i| ChildRef::from_uid(uid(i))).collect();
        IndexNode::from_parts(3, keys.to_vec(), children, None)
    }

    #[test]
    fn locate_child_upper_bound() {
        let node = index(&[10, 20, 30]);
        assert_eq!(node.locate_child(&5), 0);
        assert_eq!(node.locate_child(&10), 1);
        assert_eq!(node.locate_child(&25), 2);
        assert_eq!(node.locate_child(&30), 3);
        assert_eq!(node.locate_child(&99), 3);
    }

    #[test]
    fn insert_pivot_places_right_child_after_key() {
        let mut node = index(&[10, 30]);
        node.insert_pivot(20, ChildRef::from_uid(uid(99)));
        assert_eq!(node.keys(), &[10, 20, 30]);
        assert_eq!(node.child_uid(2), uid(99));
        assert_eq!(node.child_count(), 4);
    }

    #[test]
    #[should_panic(expected = "duplicate pivot")]
    fn insert_duplicate_pivot_panics() {
        let mut node = index(&[10]);
        node.insert_pivot(10, ChildRef::from_uid(uid(99)));
    }

    #[test]
    fn split_promotes_midpoint() {
        let mut node = index(&[1, 2, 3, 4, 5]);
        let (right, promote) = node.split();
        assert_eq!(promote, 3);
        assert_eq!(node.keys(), &[1, 2]);
        assert_eq!(node.child_count(), 3);
        assert_eq!(right.keys(), &[4, 5]);
        assert_eq!(right.child_count(), 3);
    }

    #[test]
    fn rotate_and_merge_keep_pivot_child_shape() {
        let mut left = index(&[1, 2, 3]);
        let mut node = index(&[8]);
        let new_sep = node.rotate_from_left(5, &mut left);
        assert_eq!(new_sep, 3);
        assert_eq!(node.keys(), &[5, 8]);
        assert_eq!(node.child_count(), 3);
        assert_eq!(left.keys(), &[1, 2]);
        assert_eq!(left.child_count(), 3);

        let mut merged = index(&[1]);
        let mut right = index(&[9]);
        merged.merge_with(5, &mut right);
        assert_eq!(merged.keys(), &[1, 5, 9]);
        assert_eq!(merged.child_count(), 4);
    }
}
