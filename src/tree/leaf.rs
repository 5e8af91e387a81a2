//! Hot (owned) leaf node.

use crate::{
    error::{Error, Result},
    pod::Pod,
};

/// Sorted key/value sequence held in parallel vectors, matching the packed
/// page layout.
#[derive(Debug, Clone)]
pub struct LeafNode<K, V> {
    degree: u16,
    keys: Vec<K>,
    values: Vec<V>,
}

impl<K: Pod, V: Pod> LeafNode<K, V> {
    pub fn new(degree: u16) -> LeafNode<K, V> {
        LeafNode {
            degree,
            keys: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn from_entries(degree: u16, keys: Vec<K>, values: Vec<V>) -> LeafNode<K, V> {
        debug_assert_eq!(keys.len(), values.len());
        debug_assert!(keys.windows(2).all(|w| w[0] < w[1]), "leaf keys not strictly sorted");
        LeafNode {
            degree,
            keys,
            values,
        }
    }

    pub fn degree(&self) -> u16 {
        self.degree
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    pub fn values(&self) -> &[V] {
        &self.values
    }

    pub fn first_key(&self) -> K {
        self.keys[0]
    }

    pub fn find(&self, key: &K) -> Option<V> {
        self.keys
            .binary_search(key)
            .ok()
            .map(|idx| self.values[idx])
    }

    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        match self.keys.binary_search(&key) {
            Ok(_) => Err(Error::KeyAlreadyExists),
            Err(idx) => {
                self.keys.insert(idx, key);
                self.values.insert(idx, value);
                Ok(())
            }
        }
    }

    /// Replaces the value of an existing key.
    pub fn update(&mut self, key: &K, value: V) -> Result<()> {
        match self.keys.binary_search(key) {
            Ok(idx) => {
                self.values[idx] = value;
                Ok(())
            }
            Err(_) => Err(Error::KeyDoesNotExist),
        }
    }

    pub fn remove(&mut self, key: &K) -> Result<()> {
        match self.keys.binary_search(key) {
            Ok(idx) => {
                self.keys.remove(idx);
                self.values.remove(idx);
                Ok(())
            }
            Err(_) => Err(Error::KeyDoesNotExist),
        }
    }

    /// Post-insert overflow check.
    pub fn needs_split(&self) -> bool {
        self.len() > 2 * self.degree as usize - 1
    }

    /// Proactive check used by the driver on the way down.
    pub fn can_trigger_split(&self) -> bool {
        self.len() == 2 * self.degree as usize - 1
    }

    /// Occupancy invariant breach (non-root).
    pub fn needs_merge(&self) -> bool {
        self.len() < self.degree as usize - 1
    }

    /// Proactive merge check used by the driver on the way down.
    pub fn can_trigger_merge(&self) -> bool {
        self.len() < self.degree as usize
    }

    /// Whether this node can spare an entry to an underfull sibling.
    pub fn can_lend(&self) -> bool {
        self.len() > (self.degree as usize + 1) / 2
    }

    /// Splits at `n/2`. The right half becomes the new sibling; the
    /// returned pivot is the sibling's first key and stays in the sibling.
    pub fn split(&mut self) -> (LeafNode<K, V>, K) {
        let mid = self.keys.len() / 2;
        let sibling = LeafNode {
            degree: self.degree,
            keys: self.keys.split_off(mid),
            values: self.values.split_off(mid),
        };
        let pivot = sibling.keys[0];
        (sibling, pivot)
    }

    /// Takes the last entry of the left sibling. Returns the new separator
    /// for the parent: the moved key.
    pub fn borrow_from_left(&mut self, left: &mut LeafNode<K, V>) -> K {
        let key = left.keys.pop().expect("borrow from empty left sibling");
        let value = left.values.pop().unwrap();
        self.keys.insert(0, key);
        self.values.insert(0, value);
        key
    }

    /// Takes the first entry of the right sibling. Returns the new
    /// separator for the parent: the right sibling's new first key.
    pub fn borrow_from_right(&mut self, right: &mut LeafNode<K, V>) -> K {
        self.keys.push(right.keys.remove(0));
        self.values.push(right.values.remove(0));
        right.keys[0]
    }

    /// Appends the right sibling's entries; the caller unlinks and deletes
    /// the sibling.
    pub fn merge_with(&mut self, right: &mut LeafNode<K, V>) {
        self.keys.append(&mut right.keys);
        self.values.append(&mut right.values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(keys: &[u64]) -> LeafNode<u64, u64> {
        LeafNode::from_entries(
            3,
            keys.to_vec(),
            keys.iter().map(|k| k * 10).collect(),
        )
    }

    #[test]
    fn insert_keeps_order_and_rejects_duplicates() {
        let mut n = LeafNode::<u64, u64>::new(3);
        for k in [5, 1, 3] {
            n.insert(k, k * 10).unwrap();
        }
        assert_eq!(n.keys(), &[1, 3, 5]);
        assert!(matches!(n.insert(3, 0), Err(Error::KeyAlreadyExists)));
        assert_eq!(n.find(&3), Some(30));
    }

    #[test]
    fn split_midpoint_and_pivot() {
        let mut n = leaf(&[1, 2, 3, 4, 5, 6]);
        let (right, pivot) = n.split();
        assert_eq!(pivot, 4);
        assert_eq!(n.keys(), &[1, 2, 3]);
        assert_eq!(right.keys(), &[4, 5, 6]);
    }

    #[test]
    fn borrow_from_right_updates_separator() {
        let mut n = leaf(&[3]);
        let mut right = leaf(&[4, 5, 6]);
        let sep = n.borrow_from_right(&mut right);
        assert_eq!(sep, 5);
        assert_eq!(n.keys(), &[3, 4]);
        assert_eq!(right.keys(), &[5, 6]);
    }

    #[test]
    fn borrow_from_left_updates_separator() {
        let mut n = leaf(&[9]);
        let mut left = leaf(&[4, 5, 6]);
        let sep = n.borrow_from_left(&mut left);
        assert_eq!(sep, 6);
        assert_eq!(n.keys(), &[6, 9]);
        assert_eq!(left.keys(), &[4, 5]);
    }

    #[test]
    fn merge_concatenates() {
        let mut n = leaf(&[1, 2]);
        let mut right = leaf(&[4, 5]);
        n.merge_with(&mut right);
        assert_eq!(n.keys(), &[1, 2, 4, 5]);
        assert!(right.is_empty());
    }

    #[test]
    fn occupancy_predicates() {
        // d = 3: max 5 keys, lend above ceil(3/2) = 2.
        assert!(leaf(&[1, 2, 3, 4, 5]).can_trigger_split());
        assert!(!leaf(&[1, 2, 3, 4]).can_trigger_split());
        assert!(leaf(&[1]).needs_merge());
        assert!(!leaf(&[1, 2]).needs_merge());
        assert!(leaf(&[1, 2]).can_trigger_merge());
        assert!(!leaf(&[1, 2, 3]).can_trigger_merge());
        assert!(leaf(&[1, 2, 3]).can_lend());
        assert!(!leaf(&[1, 2]).can_lend());
    }
}
