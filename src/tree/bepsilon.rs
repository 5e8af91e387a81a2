//! B-ε tree driver: interior nodes buffer mutations and flush them
//! downwards lazily.
//!
//! Writers append a message to the root's pivot buffer instead of
//! descending; a full buffer is flushed into the child, recursively for
//! interior children and by direct application for leaf children. A flush
//! runs to completion before the child is checked for a split. Lookups
//! consult the buffers on the descent path, newest message first.

use std::{io::Write, sync::Arc};

use log::trace;
use parking_lot::RwLock;

use super::{
    acquire_child_mut, acquire_child_read, bplus::{build_cache, pack_pod}, child_buffer::{BufferedState, Message, MsgOp},
    flush_subtree, internal::IndexNode, leaf::LeafNode, node::Node, print_subtree,
    read_locked_with_body, split_index_root, write_locked_hot, ChildRef,
};
use crate::{
    cache::{CacheObject, LruPolicy, NodeCache, ObjectRef, ObjectWriteGuard, Policy},
    config::StoreConfig,
    error::{Error, Result},
    pod::Pod,
    uid::ObjectUid,
    wal::{WalAppend, WalRecord},
};

pub struct BEpsilonStore<K: Pod, V: Pod, P: Policy = LruPolicy> {
    degree: u16,
    buffer_cap: usize,
    root: RwLock<Option<ChildRef<K, V>>>,
    cache: Arc<NodeCache<K, V, P>>,
    wal: Option<Arc<dyn WalAppend>>,
}

impl<K: Pod, V: Pod, P: Policy> BEpsilonStore<K, V, P> {
    pub fn new(config: &StoreConfig) -> Result<BEpsilonStore<K, V, P>> {
        assert!(config.degree >= 2, "degree must be at least 2");
        let (cache, wal) = build_cache(config)?;
        Ok(BEpsilonStore {
            degree: config.degree,
            buffer_cap: config.buffer_cap(),
            root: RwLock::new(None),
            cache,
            wal,
        })
    }

    pub fn open(config: &StoreConfig, root_uid: ObjectUid) -> Result<BEpsilonStore<K, V, P>> {
        let store = BEpsilonStore::new(config)?;
        *store.root.write() = Some(ChildRef::from_uid(root_uid));
        Ok(store)
    }

    pub fn init(&self) -> Result<()> {
        let mut root = self.root.write();
        if root.is_none() {
            let (uid, wrapper) = self
                .cache
                .create_object(Node::Leaf(LeafNode::new(self.degree)))?;
            *root = Some(ChildRef::new(uid, Some(wrapper)));
            trace!("initialized empty tree, root {uid:?}");
        }
        Ok(())
    }

    pub fn degree(&self) -> u16 {
        self.degree
    }

    pub fn get_cache(&self) -> &Arc<NodeCache<K, V, P>> {
        &self.cache
    }

    fn wal_append(&self, record: WalRecord) -> Result<()> {
        match &self.wal {
            Some(wal) => wal.append(&record),
            None => Ok(()),
        }
    }

    fn lock_root_mut(
        &self,
        root_ref: &mut ChildRef<K, V>,
    ) -> Result<(ObjectRef<K, V>, ObjectWriteGuard<K, V>)> {
        let wrapper = match &root_ref.cached {
            Some(wrapper) => wrapper.clone(),
            None => self.cache.get_object(self.degree, root_ref.uid)?,
        };
        root_ref.cached = Some(wrapper.clone());
        let mut guard = write_locked_hot(&self.cache, self.degree, &wrapper)?;
        if let Some(new) = guard.updated_uid() {
            let old = root_ref.uid;
            guard.adopt_updated();
            self.cache.retire(old, new);
            root_ref.uid = new;
        }
        Ok((wrapper, guard))
    }

    pub fn search(&self, key: &K) -> Result<V> {
        let result = self.search_inner(key);
        self.cache.evict_excess()?;
        result
    }

    fn search_inner(&self, key: &K) -> Result<V> {
        let root_slot = self.root.read();
        let root_ref = root_slot.as_ref().expect("store not initialized");
        let wrapper = match &root_ref.cached {
            Some(wrapper) => wrapper.clone(),
            None => self.cache.get_object(self.degree, root_ref.uid)?,
        };
        let mut guard = read_locked_with_body(&self.cache, self.degree, &wrapper)?;
        drop(root_slot);
        loop {
            if guard.body().is_leaf() {
                return guard.body().find(key).ok_or(Error::KeyDoesNotExist);
            }
            let idx = guard.body().locate_child(key);
            // A terminal message shadows the whole subtree below.
            match guard.body().buffer_state(idx, key) {
                BufferedState::Present(value) => return Ok(value),
                BufferedState::Absent => return Err(Error::KeyDoesNotExist),
                BufferedState::Unknown => {}
            }
            let (_wrapper, child) =
                acquire_child_read(&self.cache, self.degree, guard.body(), idx)?;
            guard = child;
        }
    }

    /// Buffer-aware lookup below an already locked node, used by mutating
    /// operations to validate their outcome code before enqueueing.
    fn lookup_below(&self, node: &Node<K, V>, key: &K) -> Result<Option<V>> {
        if node.is_leaf() {
            return Ok(node.find(key));
        }
        let idx = node.locate_child(key);
        match node.buffer_state(idx, key) {
            BufferedState::Present(value) => Ok(Some(value)),
            BufferedState::Absent => Ok(None),
            BufferedState::Unknown => {
                let (_wrapper, child) = acquire_child_read(&self.cache, self.degree, node, idx)?;
                self.lookup_below(child.body(), key)
            }
        }
    }

    pub fn insert(&self, key: K, value: V) -> Result<()> {
        self.wal_append(WalRecord::Insert {
            key: pack_pod(&key),
            value: pack_pod(&value),
        })?;
        self.enqueue(key, MsgOp::Insert, Some(value))
    }

    pub fn update(&self, key: &K, value: V) -> Result<()> {
        self.wal_append(WalRecord::Update {
            key: pack_pod(key),
            value: pack_pod(&value),
        })?;
        self.enqueue(*key, MsgOp::Update, Some(value))
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        self.wal_append(WalRecord::Remove { key: pack_pod(key) })?;
        self.enqueue(*key, MsgOp::Delete, None)
    }

    /// Validates the operation against the buffered view, then either
    /// applies it to a root leaf directly or appends it to the root's
    /// buffer, flushing on overflow.
    fn enqueue(&self, key: K, op: MsgOp, value: Option<V>) -> Result<()> {
        let mut root_slot = self.root.write();
        let root_ref = root_slot.as_mut().expect("store not initialized");
        let (root_wrapper, mut cur) = self.lock_root_mut(root_ref)?;

        let existing = self.lookup_below(cur.body(), &key)?;
        match op {
            MsgOp::Insert if existing.is_some() => return Err(Error::KeyAlreadyExists),
            MsgOp::Update | MsgOp::Delete if existing.is_none() => {
                return Err(Error::KeyDoesNotExist)
            }
            _ => {}
        }

        if cur.body().is_leaf() {
            let leaf = cur.body_mut().as_leaf_mut();
            match op {
                MsgOp::Insert => leaf.insert(key, value.unwrap())?,
                MsgOp::Update => leaf.update(&key, value.unwrap())?,
                MsgOp::Delete => leaf.remove(&key)?,
            }
            cur.mark_dirty();
            if cur.body().needs_split() {
                let (sibling, pivot) = cur.body_mut().as_leaf_mut().split();
                let (sib_uid, sib_wrapper) = self.cache.create_object(Node::Leaf(sibling))?;
                let new_root = IndexNode::new_root(
                    self.degree,
                    ChildRef::new(cur.uid(), Some(root_wrapper.clone())),
                    pivot,
                    ChildRef::new(sib_uid, Some(sib_wrapper)),
                    true,
                );
                let (new_uid, new_wrapper) = self.cache.create_object(Node::Index(new_root))?;
                root_ref.uid = new_uid;
                root_ref.cached = Some(new_wrapper);
                trace!("root leaf split, new buffered root {new_uid:?}");
            }
            drop(cur);
            drop(root_slot);
            return self.cache.evict_excess();
        }

        let idx = cur.body().locate_child(&key);
        cur.body_mut()
            .as_index_mut()
            .push_msg(idx, Message { op, key, value });
        cur.mark_dirty();

        if cur.body().as_index().buffer(idx).len() > self.buffer_cap {
            self.flush_buffer(&mut cur, idx)?;

            if cur.body().needs_split() {
                split_index_root(&self.cache, root_ref, &root_wrapper, &mut cur, true)?;
            } else if cur.body().key_count() == 0 {
                // Flushed deletes merged the last two children away.
                let survivor = cur.body().as_index().child(0).clone();
                let old_root = cur.uid();
                root_ref.uid = survivor.uid;
                root_ref.cached = survivor.cached.clone();
                drop(cur);
                self.cache.remove(old_root);
                trace!("root collapsed onto {:?}", survivor.uid);
                drop(root_slot);
                return self.cache.evict_excess();
            }
        }
        drop(cur);
        drop(root_slot);
        self.cache.evict_excess()
    }

    /// Flushes pivot buffer `idx` of the held parent into the child. The
    /// child is checked for splits only after the flush has run to
    /// completion, and for underflow after delete-heavy flushes.
    fn flush_buffer(&self, parent: &mut CacheObject<K, V>, idx: usize) -> Result<()> {
        let msgs = parent.body_mut().as_index_mut().take_msgs(idx);
        if msgs.is_empty() {
            return Ok(());
        }
        trace!("flushing {} messages into child {idx}", msgs.len());
        let (child_wrapper, mut child) = acquire_child_mut(&self.cache, self.degree, parent, idx)?;

        if child.body().is_leaf() {
            self.apply_to_leaf(parent, idx, child_wrapper, child, msgs)?;
        } else {
            for msg in msgs {
                let cidx = child.body().locate_child(&msg.key);
                child.body_mut().as_index_mut().push_msg(cidx, msg);
                if child.body().as_index().buffer(cidx).len() > self.buffer_cap {
                    self.flush_buffer(&mut child, cidx)?;
                }
            }
            child.mark_dirty();
            if child.body().needs_split() {
                let (sibling, promote) = child.body_mut().as_index_mut().split();
                let (sib_uid, sib_wrapper) = self.cache.create_object(Node::Index(sibling))?;
                parent
                    .body_mut()
                    .as_index_mut()
                    .insert_pivot(promote, ChildRef::new(sib_uid, Some(sib_wrapper)));
            } else if child.body().needs_merge() && parent.body().child_count() >= 2 {
                let outcome = parent.body_mut().as_index_mut().rebalance_child(
                    &self.cache,
                    idx,
                    child.body_mut(),
                )?;
                if let Some(deleted) = outcome.deleted {
                    drop(child);
                    self.cache.remove(deleted.uid);
                }
            }
        }
        parent.mark_dirty();
        Ok(())
    }

    /// Applies a drained buffer to a leaf child. Messages are stably
    /// sorted by key, so a leaf split never strands later messages: once
    /// keys pass a new pivot, application moves to the new sibling.
    fn apply_to_leaf(
        &self,
        parent: &mut CacheObject<K, V>,
        idx: usize,
        _child_wrapper: ObjectRef<K, V>,
        mut cur: ObjectWriteGuard<K, V>,
        mut msgs: Vec<Message<K, V>>,
    ) -> Result<()> {
        msgs.sort_by_key(|m| m.key);
        // Right siblings minted by splits during this application, with the
        // pivot that routes into each.
        let mut pending: Vec<(K, ObjectRef<K, V>)> = Vec::new();
        let mut split_happened = false;

        for msg in msgs {
            while let Some(pivot) = pending.first().map(|(p, _)| *p) {
                if msg.key < pivot {
                    break;
                }
                let (_, wrapper) = pending.remove(0);
                // Only lock the rightmost sibling that covers this key;
                // fully passed-over ranges have nothing left to apply.
                if pending.first().map_or(true, |(next, _)| msg.key < *next) {
                    drop(cur);
                    cur = write_locked_hot(&self.cache, self.degree, &wrapper)?;
                }
            }
            let leaf = cur.body_mut().as_leaf_mut();
            match msg.op {
                MsgOp::Insert => {
                    // Racing enqueues can land two inserts for one key; the
                    // newest message wins.
                    if leaf.insert(msg.key, msg.value.unwrap()).is_err() {
                        leaf.update(&msg.key, msg.value.unwrap())?;
                    }
                }
                MsgOp::Update => {
                    let _ = leaf.update(&msg.key, msg.value.unwrap());
                }
                MsgOp::Delete => {
                    let _ = leaf.remove(&msg.key);
                }
            }
            cur.mark_dirty();
            if cur.body().needs_split() {
                let (sibling, pivot) = cur.body_mut().as_leaf_mut().split();
                let (sib_uid, sib_wrapper) = self.cache.create_object(Node::Leaf(sibling))?;
                parent
                    .body_mut()
                    .as_index_mut()
                    .insert_pivot(pivot, ChildRef::new(sib_uid, Some(sib_wrapper.clone())));
                // Repeated splits of the left remainder mint pivots below
                // the earlier ones; keep the queue sorted.
                let pos = pending.partition_point(|(p, _)| *p < pivot);
                pending.insert(pos, (pivot, sib_wrapper));
                split_happened = true;
            }
        }
        drop(cur);

        if !split_happened {
            // Deletes may have drained the child below occupancy.
            let (_w, mut child) = acquire_child_mut(&self.cache, self.degree, parent, idx)?;
            if child.body().needs_merge() && parent.body().child_count() >= 2 {
                child.mark_dirty();
                let outcome = parent.body_mut().as_index_mut().rebalance_child(
                    &self.cache,
                    idx,
                    child.body_mut(),
                )?;
                if let Some(deleted) = outcome.deleted {
                    drop(child);
                    self.cache.remove(deleted.uid);
                }
            }
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<ObjectUid> {
        let mut root_slot = self.root.write();
        let root_ref = root_slot.as_mut().expect("store not initialized");
        flush_subtree(&self.cache, self.degree, root_ref)?;
        trace!("flush complete, root {:?}", root_ref.uid);
        Ok(root_ref.uid)
    }

    pub fn print<W: Write>(&self, out: &mut W) -> Result<()> {
        let root_slot = self.root.read();
        let root_ref = root_slot.as_ref().expect("store not initialized");
        let mut accessed = Vec::new();
        print_subtree(
            &self.cache,
            self.degree,
            root_ref.uid,
            out,
            0,
            &mut accessed,
        )?;
        self.cache.reorder(&accessed);
        Ok(())
    }
}
