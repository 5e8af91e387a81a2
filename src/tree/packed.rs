//! Cold node forms: read-only views over serialized pages.
//!
//! Page layout (all integers little-endian):
//!
//! ```text
//! data node:  u8 tag | u16 entry_count | pad | K keys[n] | pad | V values[n]
//! index node: u8 tag | u16 key_count n | pad | K keys[n] | pad | UID children[n+1]
//! buffered:   ... children ... | u16 buffer_lengths[n+1]
//!             | messages: (u8 op, K key, V value unless delete), contiguous
//! ```
//!
//! Key and child arrays start at their type's native alignment; messages
//! are packed without padding and always read bytewise. Lookups binary
//! search the raw key range without deserializing the page.

use std::marker::PhantomData;

use byteorder::{ByteOrder, LittleEndian};

use super::{
    child_buffer::{BufferedState, Message, MsgBuffer, MsgOp},
    internal::{ChildRef, IndexNode},
    leaf::LeafNode,
};
use crate::{
    pod::{align_up, Pod},
    uid::{ObjectKind, ObjectUid},
};

const COUNT_OFFSET: usize = 1;
const HEADER_LEN: usize = 3;

fn keys_offset<K: Pod>() -> usize {
    align_up(HEADER_LEN, K::ALIGN)
}

fn read_count(bytes: &[u8]) -> usize {
    LittleEndian::read_u16(&bytes[COUNT_OFFSET..COUNT_OFFSET + 2]) as usize
}

fn message_len<K: Pod, V: Pod>(op: MsgOp) -> usize {
    1 + K::SIZE + if op == MsgOp::Delete { 0 } else { V::SIZE }
}

/// Binary search over a packed, strictly sorted key array.
fn search_packed_keys<K: Pod>(bytes: &[u8], base: usize, count: usize, key: &K) -> Result<usize, usize> {
    let mut lo = 0;
    let mut hi = count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let probe = K::unpack_from(&bytes[base + mid * K::SIZE..]);
        match probe.cmp(key) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => return Ok(mid),
        }
    }
    Err(lo)
}

// ------------------------------------------------------------------------
// Data node
// ------------------------------------------------------------------------

/// Cold leaf: the serialized image plus enough arithmetic to search it.
pub struct PackedLeaf<K, V> {
    degree: u16,
    bytes: Box<[u8]>,
    _types: PhantomData<(K, V)>,
}

impl<K: Pod, V: Pod> PackedLeaf<K, V> {
    pub fn new(degree: u16, bytes: Box<[u8]>) -> PackedLeaf<K, V> {
        debug_assert_eq!(ObjectKind::from_u8(bytes[0]), ObjectKind::Leaf);
        PackedLeaf {
            degree,
            bytes,
            _types: PhantomData,
        }
    }

    pub fn degree(&self) -> u16 {
        self.degree
    }

    pub fn len(&self) -> usize {
        read_count(&self.bytes)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn values_offset(&self) -> usize {
        align_up(keys_offset::<K>() + self.len() * K::SIZE, V::ALIGN)
    }

    pub fn key_at(&self, idx: usize) -> K {
        K::unpack_from(&self.bytes[keys_offset::<K>() + idx * K::SIZE..])
    }

    pub fn value_at(&self, idx: usize) -> V {
        V::unpack_from(&self.bytes[self.values_offset() + idx * V::SIZE..])
    }

    pub fn find(&self, key: &K) -> Option<V> {
        search_packed_keys::<K>(&self.bytes, keys_offset::<K>(), self.len(), key)
            .ok()
            .map(|idx| self.value_at(idx))
    }

    pub fn raw(&self) -> &[u8] {
        &self.bytes
    }

    /// Deserializes into the owned form.
    pub fn unpack(&self) -> LeafNode<K, V> {
        let n = self.len();
        let keys = (0..n).map(|i| self.key_at(i)).collect();
        let values = (0..n).map(|i| self.value_at(i)).collect();
        LeafNode::from_entries(self.degree, keys, values)
    }
}

/// Serializes a hot leaf into its page image.
pub fn pack_leaf<K: Pod, V: Pod>(leaf: &LeafNode<K, V>) -> Vec<u8> {
    let n = leaf.len();
    let keys_off = keys_offset::<K>();
    let values_off = align_up(keys_off + n * K::SIZE, V::ALIGN);
    let mut buf = vec![0u8; values_off + n * V::SIZE];
    buf[0] = ObjectKind::Leaf as u8;
    LittleEndian::write_u16(&mut buf[COUNT_OFFSET..], n as u16);
    for (i, key) in leaf.keys().iter().enumerate() {
        key.pack_into(&mut buf[keys_off + i * K::SIZE..]);
    }
    for (i, value) in leaf.values().iter().enumerate() {
        value.pack_into(&mut buf[values_off + i * V::SIZE..]);
    }
    buf
}

// ------------------------------------------------------------------------
// Index node
// ------------------------------------------------------------------------

/// Cold index node, plain or buffered depending on its tag.
pub struct PackedIndex<K, V> {
    degree: u16,
    bytes: Box<[u8]>,
    _types: PhantomData<(K, V)>,
}

impl<K: Pod, V: Pod> PackedIndex<K, V> {
    pub fn new(degree: u16, bytes: Box<[u8]>) -> PackedIndex<K, V> {
        debug_assert!(matches!(
            ObjectKind::from_u8(bytes[0]),
            ObjectKind::Index | ObjectKind::BufferedIndex
        ));
        PackedIndex {
            degree,
            bytes,
            _types: PhantomData,
        }
    }

    pub fn degree(&self) -> u16 {
        self.degree
    }

    pub fn kind(&self) -> ObjectKind {
        ObjectKind::from_u8(self.bytes[0])
    }

    pub fn is_buffered(&self) -> bool {
        self.kind() == ObjectKind::BufferedIndex
    }

    pub fn key_count(&self) -> usize {
        read_count(&self.bytes)
    }

    pub fn child_count(&self) -> usize {
        self.key_count() + 1
    }

    fn children_offset(&self) -> usize {
        align_up(
            keys_offset::<K>() + self.key_count() * K::SIZE,
            ObjectUid::ALIGN,
        )
    }

    fn buffer_lengths_offset(&self) -> usize {
        self.children_offset() + self.child_count() * ObjectUid::WIRE_LEN
    }

    pub fn key_at(&self, idx: usize) -> K {
        K::unpack_from(&self.bytes[keys_offset::<K>() + idx * K::SIZE..])
    }

    pub fn child_uid_at(&self, idx: usize) -> ObjectUid {
        ObjectUid::unpack_from(&self.bytes[self.children_offset() + idx * ObjectUid::WIRE_LEN..])
    }

    /// Upper bound over the packed pivot keys.
    pub fn locate_child(&self, key: &K) -> usize {
        match search_packed_keys::<K>(&self.bytes, keys_offset::<K>(), self.key_count(), key) {
            Ok(idx) => idx + 1,
            Err(idx) => idx,
        }
    }

    pub fn buffer_len(&self, idx: usize) -> usize {
        debug_assert!(self.is_buffered());
        let off = self.buffer_lengths_offset() + idx * 2;
        LittleEndian::read_u16(&self.bytes[off..off + 2]) as usize
    }

    /// Walks the packed messages of buffer `idx`, in arrival order.
    fn buffer_messages(&self, idx: usize) -> PackedMessages<'_, K, V> {
        debug_assert!(self.is_buffered());
        let mut offset = self.buffer_lengths_offset() + self.child_count() * 2;
        for prior in 0..idx {
            for _ in 0..self.buffer_len(prior) {
                let op = MsgOp::from_u8(self.bytes[offset]);
                offset += message_len::<K, V>(op);
            }
        }
        PackedMessages {
            bytes: &self.bytes,
            offset,
            remaining: self.buffer_len(idx),
            _types: PhantomData,
        }
    }

    /// Effect of the newest packed message for `key` in buffer `idx`.
    pub fn buffer_lookup(&self, idx: usize, key: &K) -> BufferedState<V> {
        if !self.is_buffered() {
            return BufferedState::Unknown;
        }
        let mut latest = BufferedState::Unknown;
        for msg in self.buffer_messages(idx) {
            if msg.key == *key {
                latest = match msg.op {
                    MsgOp::Insert | MsgOp::Update => BufferedState::Present(msg.value.unwrap()),
                    MsgOp::Delete => BufferedState::Absent,
                };
            }
        }
        latest
    }

    pub fn raw(&self) -> &[u8] {
        &self.bytes
    }

    /// Deserializes into the owned form, buffers included.
    pub fn unpack(&self) -> IndexNode<K, V> {
        let n = self.key_count();
        let keys = (0..n).map(|i| self.key_at(i)).collect();
        let children = (0..=n)
            .map(|i| ChildRef::from_uid(self.child_uid_at(i)))
            .collect();
        let buffers = self.is_buffered().then(|| {
            (0..=n)
                .map(|i| {
                    let mut buffer = MsgBuffer::new();
                    for msg in self.buffer_messages(i) {
                        buffer.push(msg);
                    }
                    buffer
                })
                .collect()
        });
        IndexNode::from_parts(self.degree, keys, children, buffers)
    }
}

struct PackedMessages<'a, K, V> {
    bytes: &'a [u8],
    offset: usize,
    remaining: usize,
    _types: PhantomData<(K, V)>,
}

impl<K: Pod, V: Pod> Iterator for PackedMessages<'_, K, V> {
    type Item = Message<K, V>;

    fn next(&mut self) -> Option<Message<K, V>> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let op = MsgOp::from_u8(self.bytes[self.offset]);
        let key = K::unpack_from(&self.bytes[self.offset + 1..]);
        let value = (op != MsgOp::Delete)
            .then(|| V::unpack_from(&self.bytes[self.offset + 1 + K::SIZE..]));
        self.offset += message_len::<K, V>(op);
        Some(Message { op, key, value })
    }
}

/// Serializes a hot index node, appending the buffer section for B-ε
/// nodes.
pub fn pack_index<K: Pod, V: Pod>(node: &IndexNode<K, V>) -> Vec<u8> {
    let n = node.key_count();
    let keys_off = keys_offset::<K>();
    let children_off = align_up(keys_off + n * K::SIZE, ObjectUid::ALIGN);
    let children_end = children_off + (n + 1) * ObjectUid::WIRE_LEN;

    let total = match node.buffers() {
        None => children_end,
        Some(buffers) => {
            let msgs: usize = buffers
                .iter()
                .flat_map(|b| b.iter())
                .map(|m| message_len::<K, V>(m.op))
                .sum();
            children_end + (n + 1) * 2 + msgs
        }
    };

    let mut buf = vec![0u8; total];
    buf[0] = match node.is_buffered() {
        true => ObjectKind::BufferedIndex as u8,
        false => ObjectKind::Index as u8,
    };
    LittleEndian::write_u16(&mut buf[COUNT_OFFSET..], n as u16);
    for (i, key) in node.keys().iter().enumerate() {
        key.pack_into(&mut buf[keys_off + i * K::SIZE..]);
    }
    for i in 0..=n {
        debug_assert!(
            node.child_uid(i).is_persisted(),
            "serializing an index node with a transient child identity"
        );
        node.child_uid(i)
            .pack_into(&mut buf[children_off + i * ObjectUid::WIRE_LEN..]);
    }

    if let Some(buffers) = node.buffers() {
        let lens_off = children_end;
        let mut offset = lens_off + (n + 1) * 2;
        for (i, buffer) in buffers.iter().enumerate() {
            LittleEndian::write_u16(&mut buf[lens_off + i * 2..], buffer.len() as u16);
            for msg in buffer.iter() {
                buf[offset] = msg.op as u8;
                msg.key.pack_into(&mut buf[offset + 1..]);
                if let Some(value) = msg.value {
                    value.pack_into(&mut buf[offset + 1 + K::SIZE..]);
                }
                offset += message_len::<K, V>(msg.op);
            }
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uid::StorageTier;

    #[test]
    fn leaf_layout_offsets() {
        // u32 keys after the 3-byte header pad to 4, u64 values pad to 8.
        let leaf = LeafNode::<u32, u64>::from_entries(3, vec![1, 2, 3], vec![10, 20, 30]);
        let image = pack_leaf(&leaf);
        assert_eq!(image[0], ObjectKind::Leaf as u8);
        assert_eq!(LittleEndian::read_u16(&image[1..3]), 3);
        assert_eq!(LittleEndian::read_u32(&image[4..8]), 1);
        assert_eq!(LittleEndian::read_u64(&image[16..24]), 10);
        assert_eq!(image.len(), 16 + 3 * 8);
    }

    #[test]
    fn packed_leaf_search_without_deserializing() {
        let leaf =
            LeafNode::<u64, u64>::from_entries(3, vec![2, 4, 6, 8], vec![20, 40, 60, 80]);
        let packed = PackedLeaf::<u64, u64>::new(3, pack_leaf(&leaf).into_boxed_slice());
        assert_eq!(packed.find(&6), Some(60));
        assert_eq!(packed.find(&5), None);
        assert_eq!(packed.unpack().keys(), leaf.keys());
    }

    #[test]
    fn packed_index_children_and_locate() {
        let children = (0..3)
            .map(|i| {
                ChildRef::from_uid(ObjectUid::persisted(
                    StorageTier::File,
                    i * 4096,
                    ObjectKind::Leaf,
                    128,
                ))
            })
            .collect();
        let node = IndexNode::<u64, u64>::from_parts(3, vec![10, 20], children, None);
        let packed = PackedIndex::<u64, u64>::new(3, pack_index(&node).into_boxed_slice());
        assert_eq!(packed.key_count(), 2);
        assert_eq!(packed.locate_child(&10), 1);
        assert_eq!(packed.locate_child(&9), 0);
        assert_eq!(packed.child_uid_at(2).offset(), 2 * 4096);
        assert!(!packed.is_buffered());
    }

    #[test]
    fn buffered_index_round_trips_messages() {
        let children = (0..2)
            .map(|i| {
                ChildRef::from_uid(ObjectUid::persisted(
                    StorageTier::Dram,
                    i * 4096,
                    ObjectKind::Leaf,
                    64,
                ))
            })
            .collect();
        let mut node = IndexNode::<u64, u64>::from_parts(
            3,
            vec![50],
            children,
            Some(vec![MsgBuffer::new(), MsgBuffer::new()]),
        );
        node.push_msg(
            0,
            Message {
                op: MsgOp::Insert,
                key: 7,
                value: Some(70),
            },
        );
        node.push_msg(
            0,
            Message {
                op: MsgOp::Delete,
                key: 3,
                value: None,
            },
        );
        node.push_msg(
            1,
            Message {
                op: MsgOp::Update,
                key: 60,
                value: Some(600),
            },
        );

        let packed = PackedIndex::<u64, u64>::new(3, pack_index(&node).into_boxed_slice());
        assert!(packed.is_buffered());
        assert_eq!(packed.buffer_len(0), 2);
        assert_eq!(packed.buffer_lookup(0, &7), BufferedState::Present(70));
        assert_eq!(packed.buffer_lookup(0, &3), BufferedState::Absent);
        assert_eq!(packed.buffer_lookup(1, &60), BufferedState::Present(600));
        assert_eq!(packed.buffer_lookup(1, &61), BufferedState::Unknown);

        let unpacked = packed.unpack();
        assert_eq!(unpacked.buffer(0).len(), 2);
        assert_eq!(unpacked.buffer(1).len(), 1);
    }
}
