//! Per-pivot message buffers of the buffered (B-ε) index node.
//!
//! Every pivot of a buffered index node owns one [MsgBuffer] holding the
//! operations destined for that child's key range, in arrival order. The
//! newest message for a key shadows both older messages and the subtree
//! below.

use crate::pod::Pod;

/// Operation tag, also the on-page `u8` encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgOp {
    Insert = 0,
    Update = 1,
    Delete = 2,
}

impl MsgOp {
    pub(crate) fn from_u8(tag: u8) -> MsgOp {
        match tag {
            0 => MsgOp::Insert,
            1 => MsgOp::Update,
            2 => MsgOp::Delete,
            _ => panic!("unrecognized message op tag {tag}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Message<K, V> {
    pub op: MsgOp,
    pub key: K,
    /// `None` exactly for [MsgOp::Delete].
    pub value: Option<V>,
}

/// What a buffer knows about a key without consulting the subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferedState<V> {
    /// Latest message materializes the key with this value.
    Present(V),
    /// Latest message deletes the key.
    Absent,
    /// No message for the key; the subtree decides.
    Unknown,
}

#[derive(Debug, Clone)]
pub struct MsgBuffer<K, V> {
    msgs: Vec<Message<K, V>>,
}

impl<K: Pod, V: Pod> MsgBuffer<K, V> {
    pub fn new() -> MsgBuffer<K, V> {
        MsgBuffer { msgs: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    pub fn push(&mut self, msg: Message<K, V>) {
        self.msgs.push(msg);
    }

    /// Effect of the newest message for `key`, if any.
    pub fn lookup(&self, key: &K) -> BufferedState<V> {
        for msg in self.msgs.iter().rev() {
            if msg.key == *key {
                return match msg.op {
                    MsgOp::Insert | MsgOp::Update => BufferedState::Present(msg.value.unwrap()),
                    MsgOp::Delete => BufferedState::Absent,
                };
            }
        }
        BufferedState::Unknown
    }

    /// Empties the buffer for a downward flush, preserving arrival order.
    pub fn drain(&mut self) -> Vec<Message<K, V>> {
        std::mem::take(&mut self.msgs)
    }

    /// Splits off every message with `key >= separator`, used when the
    /// covered child range shrinks during a borrow or split.
    pub fn partition_at(&mut self, separator: &K) -> MsgBuffer<K, V> {
        let (stay, moved): (Vec<_>, Vec<_>) = std::mem::take(&mut self.msgs)
            .into_iter()
            .partition(|m| m.key < *separator);
        self.msgs = stay;
        MsgBuffer { msgs: moved }
    }

    /// Appends all messages of `other`; the two buffers covered disjoint
    /// ranges, so relative order across them is immaterial.
    pub fn absorb(&mut self, other: MsgBuffer<K, V>) {
        self.msgs.extend(other.msgs);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message<K, V>> {
        self.msgs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(op: MsgOp, key: u64) -> Message<u64, u64> {
        Message {
            op,
            key,
            value: (op != MsgOp::Delete).then_some(key * 10),
        }
    }

    #[test]
    fn newest_message_wins() {
        let mut buf = MsgBuffer::new();
        buf.push(msg(MsgOp::Insert, 3));
        buf.push(msg(MsgOp::Delete, 3));
        assert_eq!(buf.lookup(&3), BufferedState::Absent);

        buf.push(msg(MsgOp::Insert, 3));
        assert_eq!(buf.lookup(&3), BufferedState::Present(30));
        assert_eq!(buf.lookup(&4), BufferedState::Unknown);
    }

    #[test]
    fn partition_moves_upper_range() {
        let mut buf = MsgBuffer::new();
        for k in [1, 9, 4, 7] {
            buf.push(msg(MsgOp::Insert, k));
        }
        let upper = buf.partition_at(&5);
        assert_eq!(buf.iter().map(|m| m.key).collect::<Vec<_>>(), vec![1, 4]);
        assert_eq!(upper.iter().map(|m| m.key).collect::<Vec<_>>(), vec![9, 7]);
    }
}
