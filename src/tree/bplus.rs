//! Classic B+ tree driver over the node cache.
//!
//! Descent is lock-coupled: at most the current node and its parent are
//! locked. Inserts pre-split full index nodes on the way down so parents
//! always have room for one promoted pivot; leaves split reactively after
//! the insert. Deletes rebalance an underfull child before descending into
//! it and collapse the root when it is down to a single child.

use std::{io::Write, sync::Arc};

use log::trace;
use parking_lot::RwLock;

use super::{
    acquire_child_mut, acquire_child_read, flush_subtree, internal::IndexNode, leaf::LeafNode,
    node::Node, print_subtree, read_locked_with_body, split_index_root, write_locked_hot,
    ChildRef,
};
use crate::{
    cache::{LruPolicy, NodeCache, ObjectRef, ObjectWriteGuard, Policy},
    config::StoreConfig,
    error::{Error, Result},
    pod::Pod,
    storage::{FileStorage, HybridStorage, PMemStorage, VolatileStorage},
    uid::ObjectUid,
    wal::{FileWal, WalAppend, WalRecord},
};

/// Builds the tier stack, cache and WAL described by `config`.
pub(crate) fn build_cache<K: Pod, V: Pod, P: Policy>(
    config: &StoreConfig,
) -> Result<(Arc<NodeCache<K, V, P>>, Option<Arc<dyn WalAppend>>)> {
    let dram = VolatileStorage::new(config.block_size, config.storage_bytes);
    let pmem = match &config.pmem_path {
        Some(path) => Some(PMemStorage::open(path, config.block_size, config.storage_bytes)?),
        None => None,
    };
    let file = match &config.file_path {
        Some(path) => Some(FileStorage::open(path, config.block_size, config.storage_bytes)?),
        None => None,
    };
    let storage = Arc::new(HybridStorage::new(dram, pmem, file, config.write_tier));
    let cache = Arc::new(NodeCache::new(
        storage,
        config.cache_capacity,
        config.promotion,
    ));
    let wal = match &config.wal_path {
        Some(path) => Some(Arc::new(FileWal::open(path)?) as Arc<dyn WalAppend>),
        None => None,
    };
    Ok((cache, wal))
}

pub(crate) fn pack_pod<T: Pod>(value: &T) -> Vec<u8> {
    let mut buf = vec![0u8; T::SIZE];
    value.pack_into(&mut buf);
    buf
}

pub struct BPlusStore<K: Pod, V: Pod, P: Policy = LruPolicy> {
    degree: u16,
    root: RwLock<Option<ChildRef<K, V>>>,
    cache: Arc<NodeCache<K, V, P>>,
    wal: Option<Arc<dyn WalAppend>>,
}

impl<K: Pod, V: Pod, P: Policy> BPlusStore<K, V, P> {
    pub fn new(config: &StoreConfig) -> Result<BPlusStore<K, V, P>> {
        assert!(config.degree >= 2, "degree must be at least 2");
        let (cache, wal) = build_cache(config)?;
        Ok(BPlusStore {
            degree: config.degree,
            root: RwLock::new(None),
            cache,
            wal,
        })
    }

    /// Opens a persisted tree at its recorded root identity.
    pub fn open(config: &StoreConfig, root_uid: ObjectUid) -> Result<BPlusStore<K, V, P>> {
        let store = BPlusStore::new(config)?;
        *store.root.write() = Some(ChildRef::from_uid(root_uid));
        Ok(store)
    }

    /// Creates the empty root leaf. Idempotent.
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

    /// The cache handle, a stats provider among other things.
    pub fn get_cache(&self) -> &Arc<NodeCache<K, V, P>> {
        &self.cache
    }

    fn wal_append(&self, record: WalRecord) -> Result<()> {
        match &self.wal {
            Some(wal) => wal.append(&record),
            None => Ok(()),
        }
    }

    /// Locks the root node for writing, folding a pending root identity
    /// back into the root slot.
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
            let (_wrapper, child) =
                acquire_child_read(&self.cache, self.degree, guard.body(), idx)?;
            guard = child;
        }
    }

    pub fn insert(&self, key: K, value: V) -> Result<()> {
        self.wal_append(WalRecord::Insert {
            key: pack_pod(&key),
            value: pack_pod(&value),
        })?;

        let mut root_slot = self.root.write();
        let root_ref = root_slot.as_mut().expect("store not initialized");
        let (root_wrapper, mut cur) = self.lock_root_mut(root_ref)?;

        if cur.body().is_leaf() {
            // Root leaf: insert in place, grow a new root on overflow.
            cur.body_mut().as_leaf_mut().insert(key, value)?;
            cur.mark_dirty();
            if cur.body().needs_split() {
                let (sibling, pivot) = cur.body_mut().as_leaf_mut().split();
                let (sib_uid, sib_wrapper) = self.cache.create_object(Node::Leaf(sibling))?;
                let new_root = IndexNode::new_root(
                    self.degree,
                    ChildRef::new(cur.uid(), Some(root_wrapper.clone())),
                    pivot,
                    ChildRef::new(sib_uid, Some(sib_wrapper)),
                    false,
                );
                let (new_uid, new_wrapper) = self.cache.create_object(Node::Index(new_root))?;
                root_ref.uid = new_uid;
                root_ref.cached = Some(new_wrapper);
                trace!("root leaf split, new root {new_uid:?}");
            }
            drop(cur);
            drop(root_slot);
            return self.cache.evict_excess();
        }

        if cur.body().can_trigger_split() {
            split_index_root(&self.cache, root_ref, &root_wrapper, &mut cur, false)?;
            drop(cur);
            let new_wrapper = root_ref.cached.clone().expect("fresh root is cached");
            cur = write_locked_hot(&self.cache, self.degree, &new_wrapper)?;
        }
        // The root is an index node with room; it cannot be replaced below.
        drop(root_slot);

        let mut parent = cur;
        loop {
            let idx = parent.body().locate_child(&key);
            let (_child_wrapper, mut child) =
                acquire_child_mut(&self.cache, self.degree, &mut parent, idx)?;

            if !child.body().is_leaf() && child.body().can_trigger_split() {
                let (sibling, promote) = child.body_mut().as_index_mut().split();
                child.mark_dirty();
                let (sib_uid, sib_wrapper) = self.cache.create_object(Node::Index(sibling))?;
                parent.body_mut().as_index_mut().insert_pivot(
                    promote,
                    ChildRef::new(sib_uid, Some(sib_wrapper.clone())),
                );
                parent.mark_dirty();
                if key >= promote {
                    drop(child);
                    child = write_locked_hot(&self.cache, self.degree, &sib_wrapper)?;
                }
            }

            if child.body().is_leaf() {
                // Keep the parent pinned: the leaf may hand it a pivot.
                child.body_mut().as_leaf_mut().insert(key, value)?;
                child.mark_dirty();
                if child.body().needs_split() {
                    let (sibling, pivot) = child.body_mut().as_leaf_mut().split();
                    let (sib_uid, sib_wrapper) = self.cache.create_object(Node::Leaf(sibling))?;
                    parent
                        .body_mut()
                        .as_index_mut()
                        .insert_pivot(pivot, ChildRef::new(sib_uid, Some(sib_wrapper)));
                    parent.mark_dirty();
                }
                drop(child);
                drop(parent);
                return self.cache.evict_excess();
            }
            parent = child;
        }
    }

    /// Replaces the value of an existing key.
    pub fn update(&self, key: &K, value: V) -> Result<()> {
        self.wal_append(WalRecord::Update {
            key: pack_pod(key),
            value: pack_pod(&value),
        })?;

        let mut root_slot = self.root.write();
        let root_ref = root_slot.as_mut().expect("store not initialized");
        let (_root_wrapper, mut cur) = self.lock_root_mut(root_ref)?;
        drop(root_slot);
        loop {
            if cur.body().is_leaf() {
                cur.body_mut().as_leaf_mut().update(key, value)?;
                cur.mark_dirty();
                return self.cache.evict_excess();
            }
            let idx = cur.body().locate_child(key);
            let (_wrapper, child) = acquire_child_mut(&self.cache, self.degree, &mut cur, idx)?;
            cur = child;
        }
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        self.wal_append(WalRecord::Remove { key: pack_pod(key) })?;

        let mut root_slot = Some(self.root.write());
        let (_root_wrapper, mut cur) = {
            let slot = root_slot.as_mut().unwrap();
            self.lock_root_mut(slot.as_mut().unwrap())?
        };

        let mut at_root = true;
        loop {
            if cur.body().is_leaf() {
                let result = cur.body_mut().as_leaf_mut().remove(key);
                if result.is_ok() {
                    cur.mark_dirty();
                }
                drop(cur);
                drop(root_slot);
                self.cache.evict_excess()?;
                return result;
            }

            let idx = cur.body().locate_child(key);
            let (_child_wrapper, mut child) =
                acquire_child_mut(&self.cache, self.degree, &mut cur, idx)?;

            if child.body().can_trigger_merge() {
                child.mark_dirty();
                let outcome = {
                    let child_body = &mut *child;
                    cur.body_mut().as_index_mut().rebalance_child(
                        &self.cache,
                        idx,
                        child_body.body_mut(),
                    )?
                };
                cur.mark_dirty();
                if let Some(deleted) = outcome.deleted {
                    drop(child);
                    self.cache.remove(deleted.uid);

                    if at_root && cur.body().key_count() == 0 {
                        // The root is down to one child: collapse.
                        let survivor = cur.body().as_index().child(0).clone();
                        let old_root = cur.uid();
                        {
                            let slot = root_slot.as_mut().unwrap();
                            let root_ref = slot.as_mut().unwrap();
                            root_ref.uid = survivor.uid;
                            root_ref.cached = survivor.cached.clone();
                        }
                        drop(cur);
                        self.cache.remove(old_root);
                        trace!("root collapsed onto {:?}", survivor.uid);
                        let wrapper = survivor.cached.expect("survivor was just materialized");
                        cur = write_locked_hot(&self.cache, self.degree, &wrapper)?;
                        continue;
                    }

                    let idx = cur.body().locate_child(key);
                    let (_w, reacquired) =
                        acquire_child_mut(&self.cache, self.degree, &mut cur, idx)?;
                    child = reacquired;
                }
            }

            if at_root {
                at_root = false;
                root_slot = None;
            }
            cur = child;
        }
    }

    /// Writes back every dirty node bottom-up and returns the root's final
    /// identity; remembering it suffices to reopen the tree.
    pub fn flush(&self) -> Result<ObjectUid> {
        let mut root_slot = self.root.write();
        let root_ref = root_slot.as_mut().expect("store not initialized");
        flush_subtree(&self.cache, self.degree, root_ref)?;
        trace!("flush complete, root {:?}", root_ref.uid);
        Ok(root_ref.uid)
    }

    /// Dumps the tree structure and refreshes the policy for every node
    /// the dump touched.
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
