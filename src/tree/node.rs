//! The node value in one of its representations.
//!
//! A node is either hot (owned vectors) or cold (a view over its page
//! image), and either a leaf or an index node. Mutating paths promote to
//! the hot form; lookups work on either.

use super::{
    child_buffer::BufferedState,
    internal::IndexNode,
    leaf::LeafNode,
    packed::{pack_index, pack_leaf, PackedIndex, PackedLeaf},
};
use crate::{pod::Pod, uid::ObjectKind};

pub enum Node<K, V> {
    Leaf(LeafNode<K, V>),
    PackedLeaf(PackedLeaf<K, V>),
    Index(IndexNode<K, V>),
    PackedIndex(PackedIndex<K, V>),
}

impl<K: Pod, V: Pod> Node<K, V> {
    /// Wraps a page image read from tier storage.
    pub fn cold(degree: u16, kind: ObjectKind, bytes: Box<[u8]>) -> Node<K, V> {
        match kind {
            ObjectKind::Leaf => Node::PackedLeaf(PackedLeaf::new(degree, bytes)),
            ObjectKind::Index | ObjectKind::BufferedIndex => {
                Node::PackedIndex(PackedIndex::new(degree, bytes))
            }
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Node::Leaf(_) | Node::PackedLeaf(_) => ObjectKind::Leaf,
            Node::Index(node) if node.is_buffered() => ObjectKind::BufferedIndex,
            Node::Index(_) => ObjectKind::Index,
            Node::PackedIndex(packed) => packed.kind(),
        }
    }

    pub fn is_hot(&self) -> bool {
        matches!(self, Node::Leaf(_) | Node::Index(_))
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_) | Node::PackedLeaf(_))
    }

    pub fn degree(&self) -> u16 {
        match self {
            Node::Leaf(node) => node.degree(),
            Node::PackedLeaf(packed) => packed.degree(),
            Node::Index(node) => node.degree(),
            Node::PackedIndex(packed) => packed.degree(),
        }
    }

    pub fn key_count(&self) -> usize {
        match self {
            Node::Leaf(node) => node.len(),
            Node::PackedLeaf(packed) => packed.len(),
            Node::Index(node) => node.key_count(),
            Node::PackedIndex(packed) => packed.key_count(),
        }
    }

    /// Deserializes a cold form in place; hot forms are untouched.
    pub fn promote(&mut self) {
        let hot = match self {
            Node::PackedLeaf(packed) => Node::Leaf(packed.unpack()),
            Node::PackedIndex(packed) => Node::Index(packed.unpack()),
            _ => return,
        };
        *self = hot;
    }

    /// Serializes the page image.
    pub fn pack(&self) -> Vec<u8> {
        match self {
            Node::Leaf(node) => pack_leaf(node),
            Node::Index(node) => pack_index(node),
            Node::PackedLeaf(packed) => packed.raw().to_vec(),
            Node::PackedIndex(packed) => packed.raw().to_vec(),
        }
    }

    // Occupancy predicates, uniform over all forms.

    pub fn needs_split(&self) -> bool {
        self.key_count() > 2 * self.degree() as usize - 1
    }

    pub fn can_trigger_split(&self) -> bool {
        self.key_count() == 2 * self.degree() as usize - 1
    }

    pub fn needs_merge(&self) -> bool {
        self.key_count() < self.degree() as usize - 1
    }

    pub fn can_trigger_merge(&self) -> bool {
        self.key_count() < self.degree() as usize
    }

    pub fn can_lend(&self) -> bool {
        self.key_count() > (self.degree() as usize + 1) / 2
    }

    // Leaf access.

    pub fn find(&self, key: &K) -> Option<V> {
        match self {
            Node::Leaf(node) => node.find(key),
            Node::PackedLeaf(packed) => packed.find(key),
            _ => panic!("find on an index node"),
        }
    }

    pub fn as_leaf_mut(&mut self) -> &mut LeafNode<K, V> {
        match self {
            Node::Leaf(node) => node,
            _ => panic!("hot leaf expected"),
        }
    }

    // Index access.

    pub fn locate_child(&self, key: &K) -> usize {
        match self {
            Node::Index(node) => node.locate_child(key),
            Node::PackedIndex(packed) => packed.locate_child(key),
            _ => panic!("locate_child on a leaf"),
        }
    }

    pub fn child_uid(&self, idx: usize) -> crate::uid::ObjectUid {
        match self {
            Node::Index(node) => node.child_uid(idx),
            Node::PackedIndex(packed) => packed.child_uid_at(idx),
            _ => panic!("child_uid on a leaf"),
        }
    }

    pub fn child_count(&self) -> usize {
        match self {
            Node::Index(node) => node.child_count(),
            Node::PackedIndex(packed) => packed.child_count(),
            _ => panic!("child_count on a leaf"),
        }
    }

    /// B-ε: what the pivot buffer covering child `idx` knows about `key`.
    pub fn buffer_state(&self, idx: usize, key: &K) -> BufferedState<V> {
        match self {
            Node::Index(node) if node.is_buffered() => node.buffer(idx).lookup(key),
            Node::Index(_) => BufferedState::Unknown,
            Node::PackedIndex(packed) => packed.buffer_lookup(idx, key),
            _ => panic!("buffer_state on a leaf"),
        }
    }

    pub fn as_index(&self) -> &IndexNode<K, V> {
        match self {
            Node::Index(node) => node,
            _ => panic!("hot index node expected"),
        }
    }

    pub fn as_index_mut(&mut self) -> &mut IndexNode<K, V> {
        match self {
            Node::Index(node) => node,
            _ => panic!("hot index node expected"),
        }
    }

    pub(crate) fn as_index_mut_opt(&mut self) -> Option<&mut IndexNode<K, V>> {
        match self {
            Node::Index(node) => Some(node),
            _ => None,
        }
    }
}
