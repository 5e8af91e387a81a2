//! Tree structures: the classic B+ driver and the buffered B-ε variant,
//! plus the node forms they share.

use std::io::Write;

use log::trace;

use crate::{
    cache::{NodeCache, ObjectReadGuard, ObjectRef, ObjectWriteGuard, Policy},
    error::{Error, Result},
    pod::Pod,
    uid::ObjectUid,
};

pub mod bepsilon;
pub mod bplus;
pub mod child_buffer;
pub mod internal;
pub mod leaf;
pub mod node;
pub mod packed;

pub use bepsilon::BEpsilonStore;
pub use bplus::BPlusStore;
pub use internal::ChildRef;

use internal::IndexNode;
use node::Node;

/// Read-locks a wrapper, re-attaching a detached body first. The loop
/// covers the window in which an eviction detaches the body between our
/// two lock acquisitions.
pub(crate) fn read_locked_with_body<K: Pod, V: Pod, P: Policy>(
    cache: &NodeCache<K, V, P>,
    degree: u16,
    wrapper: &ObjectRef<K, V>,
) -> Result<ObjectReadGuard<K, V>> {
    loop {
        let guard = wrapper.read_arc();
        if guard.node().is_some() {
            return Ok(guard);
        }
        drop(guard);
        let mut write = wrapper.write_arc();
        cache.ensure_body(degree, &mut write)?;
    }
}

/// Write-locks a wrapper and deserializes its body for mutation.
pub(crate) fn write_locked_hot<K: Pod, V: Pod, P: Policy>(
    cache: &NodeCache<K, V, P>,
    degree: u16,
    wrapper: &ObjectRef<K, V>,
) -> Result<ObjectWriteGuard<K, V>> {
    let mut guard = wrapper.write_arc();
    cache.ensure_hot(degree, &mut guard)?;
    Ok(guard)
}

/// Write path descent step: materializes and write-locks child `idx` of
/// the held parent, folding a pending child identity into the pivot.
pub(crate) fn acquire_child_mut<K: Pod, V: Pod, P: Policy>(
    cache: &NodeCache<K, V, P>,
    degree: u16,
    parent: &mut crate::cache::CacheObject<K, V>,
    idx: usize,
) -> Result<(ObjectRef<K, V>, ObjectWriteGuard<K, V>)> {
    let (uid, cached) = {
        let index = parent.body().as_index();
        (index.child_uid(idx), index.child(idx).cached.clone())
    };
    let wrapper = match cached {
        Some(wrapper) => wrapper,
        None => cache.get_object(degree, uid)?,
    };
    let mut guard = wrapper.write_arc();
    if let Some(new) = guard.updated_uid() {
        guard.adopt_updated();
        cache.retire(uid, new);
        parent.body_mut().as_index_mut().set_child_uid(idx, new);
        parent.mark_dirty();
        trace!("reconciled child identity {uid:?} -> {new:?}");
    }
    cache.ensure_hot(degree, &mut guard)?;
    parent
        .body_mut()
        .as_index_mut()
        .set_child_cached(idx, wrapper.clone());
    Ok((wrapper, guard))
}

/// Read path descent step; never mutates the parent, so a pending child
/// identity is followed but not reconciled.
pub(crate) fn acquire_child_read<K: Pod, V: Pod, P: Policy>(
    cache: &NodeCache<K, V, P>,
    degree: u16,
    parent: &Node<K, V>,
    idx: usize,
) -> Result<(ObjectRef<K, V>, ObjectReadGuard<K, V>)> {
    let cached = match parent {
        Node::Index(node) => node.child(idx).cached.clone(),
        _ => None,
    };
    let wrapper = match cached {
        Some(wrapper) => wrapper,
        None => cache.get_object(degree, parent.child_uid(idx))?,
    };
    let guard = read_locked_with_body(cache, degree, &wrapper)?;
    Ok((wrapper, guard))
}

/// Post-order write-back of a subtree. Children are flushed first so every
/// pivot of a flushed index node names a final, persisted identity.
/// Returns whether the child's identity changed.
pub(crate) fn flush_subtree<K: Pod, V: Pod, P: Policy>(
    cache: &NodeCache<K, V, P>,
    degree: u16,
    child: &mut ChildRef<K, V>,
) -> Result<bool> {
    let wrapper = match &child.cached {
        Some(wrapper) => wrapper.clone(),
        None => cache.get_object(degree, child.uid)?,
    };
    let mut guard = wrapper.write_arc();
    let mut changed = false;
    if let Some(new) = guard.updated_uid() {
        let old = child.uid;
        guard.adopt_updated();
        cache.retire(old, new);
        child.uid = new;
        changed = true;
    }
    cache.ensure_body(degree, &mut guard)?;

    if !guard.body().is_leaf() {
        cache.ensure_hot(degree, &mut guard)?;
        let mut pivots_changed = false;
        let index = guard.body_mut().as_index_mut();
        for idx in 0..index.child_count() {
            if flush_subtree(cache, degree, index.child_mut(idx))? {
                pivots_changed = true;
            }
        }
        if pivots_changed {
            guard.mark_dirty();
        }
    }

    if guard.is_dirty() {
        let new = cache.write_back(&mut guard)?;
        child.uid = new;
        child.cached = Some(wrapper.clone());
        changed = true;
    }
    Ok(changed)
}

/// Indented structure dump, collecting every touched identity so the
/// caller can hand the set to the cache policy in one reorder.
pub(crate) fn print_subtree<K: Pod, V: Pod, P: Policy, W: Write>(
    cache: &NodeCache<K, V, P>,
    degree: u16,
    uid: ObjectUid,
    out: &mut W,
    level: usize,
    accessed: &mut Vec<ObjectUid>,
) -> Result<()> {
    accessed.push(uid);
    let wrapper = cache.get_object(degree, uid)?;
    let guard = read_locked_with_body(cache, degree, &wrapper)?;
    let pad = "  ".repeat(level);
    match guard.body() {
        Node::Leaf(node) => {
            writeln!(out, "{pad}leaf {uid:?} {:?}", node.keys()).map_err(Error::Io)?;
        }
        Node::PackedLeaf(packed) => {
            let keys: Vec<K> = (0..packed.len()).map(|i| packed.key_at(i)).collect();
            writeln!(out, "{pad}leaf (cold) {uid:?} {keys:?}").map_err(Error::Io)?;
        }
        Node::Index(node) => {
            writeln!(out, "{pad}index {uid:?} {:?}", node.keys()).map_err(Error::Io)?;
            for idx in 0..node.child_count() {
                print_subtree(cache, degree, node.child_uid(idx), out, level + 1, accessed)?;
            }
        }
        Node::PackedIndex(packed) => {
            let keys: Vec<K> = (0..packed.key_count()).map(|i| packed.key_at(i)).collect();
            writeln!(out, "{pad}index (cold) {uid:?} {keys:?}").map_err(Error::Io)?;
            for idx in 0..packed.child_count() {
                print_subtree(cache, degree, packed.child_uid_at(idx), out, level + 1, accessed)?;
            }
        }
    }
    Ok(())
}

/// Splits a root index node: the old root keeps the left half, and a new
/// root with a single pivot is installed above it.
pub(crate) fn split_index_root<K: Pod, V: Pod, P: Policy>(
    cache: &NodeCache<K, V, P>,
    root_ref: &mut ChildRef<K, V>,
    root_wrapper: &ObjectRef<K, V>,
    root_obj: &mut crate::cache::CacheObject<K, V>,
    buffered: bool,
) -> Result<()> {
    let degree = root_obj.body().degree();
    let (sibling, promote) = root_obj.body_mut().as_index_mut().split();
    root_obj.mark_dirty();
    let (sib_uid, sib_wrapper) = cache.create_object(Node::Index(sibling))?;
    let new_root = IndexNode::new_root(
        degree,
        ChildRef::new(root_obj.uid(), Some(root_wrapper.clone())),
        promote,
        ChildRef::new(sib_uid, Some(sib_wrapper)),
        buffered,
    );
    let (new_uid, new_wrapper) = cache.create_object(Node::Index(new_root))?;
    root_ref.uid = new_uid;
    root_ref.cached = Some(new_wrapper);
    trace!("root split, new root {new_uid:?}");
    Ok(())
}
