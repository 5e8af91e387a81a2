//! Bounded replacement cache over tree-node wrappers.
//!
//! The cache owns the identity→wrapper map and the eviction pipeline; the
//! replacement order lives in an exchangeable [Policy]. Lock order is cache
//! map before wrapper, and wrapper locks are only ever taken non-blocking
//! from inside the eviction path, so a pinned node is skipped rather than
//! waited on.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use crossbeam_channel::Sender;
use log::{debug, trace, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::{
    config::PromotionConfig,
    error::Result,
    pod::Pod,
    storage::HybridStorage,
    tree::node::Node,
    uid::ObjectUid,
};

mod a2q;
mod clock;
mod lru;
pub mod object;
mod policy;

pub use a2q::TwoQueuePolicy;
pub use clock::ClockPolicy;
pub use lru::LruPolicy;
pub use object::{CacheObject, ObjectReadGuard, ObjectRef, ObjectWriteGuard};
pub use policy::Policy;

/// Out-of-band notifications for monitoring, in the spirit of the DML
/// report channel.
#[derive(Debug, Clone, Copy)]
pub enum CacheEvent {
    Evicted(ObjectUid),
    WroteBack { old: ObjectUid, new: ObjectUid },
    Promoted(ObjectUid),
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    write_backs: AtomicU64,
    promotions: AtomicU64,
}

/// Point-in-time counter snapshot.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
    pub promotions: u64,
}

pub struct NodeCache<K, V, P> {
    map: RwLock<HashMap<ObjectUid, ObjectRef<K, V>>>,
    policy: Mutex<P>,
    /// Wrappers with an attached body; detached tombstones are free.
    attached: AtomicUsize,
    capacity: usize,
    storage: Arc<HybridStorage>,
    promotion: PromotionConfig,
    next_transient: AtomicU64,
    counters: Counters,
    report: Option<Sender<CacheEvent>>,
}

impl<K: Pod, V: Pod, P: Policy> NodeCache<K, V, P> {
    pub fn new(
        storage: Arc<HybridStorage>,
        capacity: usize,
        promotion: PromotionConfig,
    ) -> NodeCache<K, V, P> {
        NodeCache {
            map: RwLock::new(HashMap::new()),
            policy: Mutex::new(P::default()),
            attached: AtomicUsize::new(0),
            capacity,
            storage,
            promotion,
            next_transient: AtomicU64::new(1),
            counters: Counters::default(),
            report: None,
        }
    }

    /// Attaches an event channel; all subsequent evictions and write-backs
    /// are reported on it.
    pub fn with_report(mut self, tx: Sender<CacheEvent>) -> Self {
        self.report = Some(tx);
        self
    }

    fn emit(&self, event: CacheEvent) {
        if let Some(tx) = &self.report {
            let _ = tx.try_send(event);
        }
    }

    pub fn storage(&self) -> &Arc<HybridStorage> {
        &self.storage
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            write_backs: self.counters.write_backs.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
        }
    }

    /// Number of wrappers with attached bodies.
    pub fn len(&self) -> usize {
        self.attached.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the wrapper for `uid`, materializing a cold one from tier
    /// storage on a miss.
    pub fn get_object(&self, degree: u16, uid: ObjectUid) -> Result<ObjectRef<K, V>> {
        if let Some(found) = self.map.read().get(&uid).cloned() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            self.policy.lock().record_access(uid);
            self.maybe_promote(&found);
            return Ok(found);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let node = self.storage.get_object(degree, &uid)?;

        let wrapper = {
            let mut map = self.map.write();
            match map.get(&uid) {
                // Lost the race against a parallel miss.
                Some(found) => found.clone(),
                None => {
                    let wrapper: ObjectRef<K, V> =
                        Arc::new(RwLock::new(CacheObject::new(uid, Some(node), false)));
                    map.insert(uid, wrapper.clone());
                    self.attached.fetch_add(1, Ordering::Relaxed);
                    self.policy.lock().record_insert(uid);
                    wrapper
                }
            }
        };
        self.evict_excess()?;
        Ok(wrapper)
    }

    /// Builds a wrapper around a freshly created node body under a minted
    /// pre-persistence identity.
    pub fn create_object(&self, node: Node<K, V>) -> Result<(ObjectUid, ObjectRef<K, V>)> {
        let uid = ObjectUid::transient(
            self.next_transient.fetch_add(1, Ordering::Relaxed),
            node.kind(),
        );
        let wrapper: ObjectRef<K, V> = Arc::new(RwLock::new(CacheObject::new(uid, Some(node), true)));
        self.map.write().insert(uid, wrapper.clone());
        self.attached.fetch_add(1, Ordering::Relaxed);
        self.policy.lock().record_insert(uid);
        trace!("create_object: minted {uid:?}");
        self.evict_excess()?;
        Ok((uid, wrapper))
    }

    /// Re-attaches a cold body to a detached wrapper (`get_core`). The
    /// caller holds the wrapper's writer lock.
    pub fn ensure_body(&self, degree: u16, obj: &mut CacheObject<K, V>) -> Result<()> {
        if obj.is_attached() {
            return Ok(());
        }
        let node = self.storage.get_object(degree, &obj.effective_uid())?;
        obj.attach(node);
        self.attached.fetch_add(1, Ordering::Relaxed);
        self.policy.lock().record_insert(obj.uid());
        Ok(())
    }

    /// Materializes and deserializes the body for mutation.
    pub fn ensure_hot(&self, degree: u16, obj: &mut CacheObject<K, V>) -> Result<()> {
        self.ensure_body(degree, obj)?;
        let body = obj.body_mut();
        if !body.is_hot() {
            body.promote();
            self.counters.promotions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Opportunistic cold→hot promotion driven by the access heuristic.
    /// Never blocks; contended or detached wrappers are left alone.
    fn maybe_promote(&self, wrapper: &ObjectRef<K, V>) {
        let Some(mut obj) = wrapper.try_write() else { return };
        if !obj.record_access(&self.promotion) {
            return;
        }
        if let Some(node) = obj.node_mut() {
            if !node.is_hot() {
                node.promote();
                self.counters.promotions.fetch_add(1, Ordering::Relaxed);
                self.emit(CacheEvent::Promoted(obj.uid()));
            }
        }
    }

    /// Writes a dirty wrapper back under the caller's writer lock and moves
    /// the map entry to the returned identity. Used by the driver's flush,
    /// where the parent adopts the new identity immediately.
    pub fn write_back(&self, obj: &mut CacheObject<K, V>) -> Result<ObjectUid> {
        debug_assert!(obj.is_dirty());
        debug_assert!(obj.updated_uid().is_none(), "write_back with unreconciled identity");
        let old = obj.uid();
        let new = self.storage.add_object(obj.body(), Some(&old))?;
        obj.assign_uid(new);
        obj.clear_dirty();
        self.counters.write_backs.fetch_add(1, Ordering::Relaxed);
        self.emit(CacheEvent::WroteBack { old, new });

        let mut map = self.map.write();
        if let Some(wrapper) = map.remove(&old) {
            map.insert(new, wrapper);
        }
        drop(map);
        self.policy.lock().rekey(old, new);
        Ok(new)
    }

    /// Moves a wrapper's map entry after a parent observed its pending
    /// identity. The caller has already called [CacheObject::adopt_updated]
    /// under the wrapper lock.
    pub fn retire(&self, old: ObjectUid, new: ObjectUid) {
        let mut map = self.map.write();
        if let Some(wrapper) = map.remove(&old) {
            map.insert(new, wrapper);
        }
        drop(map);
        self.policy.lock().rekey(old, new);
    }

    /// Deletes a node outright: drops the wrapper and releases the blocks
    /// behind its current image. Used when a merge empties a sibling.
    pub fn remove(&self, uid: ObjectUid) {
        let wrapper = self.map.write().remove(&uid);
        if let Some(wrapper) = wrapper {
            let mut obj = wrapper.write();
            if obj.detach_any().is_some() {
                self.attached.fetch_sub(1, Ordering::Relaxed);
            }
            self.policy.lock().record_remove(uid);
            self.storage.remove(&obj.effective_uid());
        } else {
            self.storage.remove(&uid);
        }
        debug!("remove: deleted node {uid:?}");
    }

    /// Bulk policy refresh used by printers and scanners.
    pub fn reorder(&self, accessed: &[ObjectUid]) {
        let mut policy = self.policy.lock();
        for uid in accessed {
            policy.record_access(*uid);
        }
    }

    /// Runs the eviction pipeline until the attached count is within
    /// capacity or no further victim can be claimed.
    pub fn evict_excess(&self) -> Result<()> {
        while self.attached.load(Ordering::Relaxed) > self.capacity {
            let victims = self.policy.lock().select_victims(8);
            if victims.is_empty() {
                return Ok(());
            }
            let mut progressed = false;
            let mut map = self.map.write();
            for uid in victims {
                if self.attached.load(Ordering::Relaxed) <= self.capacity {
                    break;
                }
                let Some(wrapper) = map.get(&uid).cloned() else {
                    self.policy.lock().record_remove(uid);
                    continue;
                };
                // A held lock is a pin; move on to the next candidate.
                let Some(mut obj) = wrapper.try_write() else { continue };
                if !obj.is_attached() {
                    self.policy.lock().record_remove(uid);
                    continue;
                }
                if obj.is_dirty() {
                    if !self.reconcile_children_for_write_back(&mut map, &mut obj) {
                        continue;
                    }
                    let old = obj.uid();
                    let new = match self.storage.add_object(obj.body(), Some(&old)) {
                        Ok(new) => new,
                        Err(err) => {
                            // The wrapper stays dirty; eviction retries it
                            // on a later pass.
                            warn!("write-back of {old:?} failed: {err}");
                            continue;
                        }
                    };
                    obj.set_updated(new);
                    obj.clear_dirty();
                    self.counters.write_backs.fetch_add(1, Ordering::Relaxed);
                    self.emit(CacheEvent::WroteBack { old, new });
                }
                obj.detach();
                self.attached.fetch_sub(1, Ordering::Relaxed);
                self.policy.lock().record_remove(uid);
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                self.emit(CacheEvent::Evicted(uid));
                // The wrapper stays in the map as a detached tombstone: it
                // must remain addressable under its original identity (and
                // through parent accelerator pointers) until every parent
                // pivot has been reconciled.
                progressed = true;
                trace!("evicted {uid:?}");
            }
            if !progressed {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Prepares a dirty index node for serialization: every child pivot
    /// must name a persisted, clean image. Pending child identities are
    /// folded into the pivots here (the only other reconciliation point is
    /// the descent path). Returns false when the victim must be skipped.
    fn reconcile_children_for_write_back(
        &self,
        map: &mut HashMap<ObjectUid, ObjectRef<K, V>>,
        obj: &mut CacheObject<K, V>,
    ) -> bool {
        let Some(index) = obj.body_mut().as_index_mut_opt() else {
            return true;
        };
        // First a read-only pass; only touch the pivots once every child
        // is known to be safe.
        let mut pending: Vec<(usize, ObjectUid, ObjectUid)> = Vec::new();
        for idx in 0..index.child_count() {
            let child_uid = index.child_uid(idx);
            let child = map.get(&child_uid).cloned();
            match child {
                None => {
                    if !child_uid.is_persisted() {
                        // An unmapped transient child cannot be resolved.
                        return false;
                    }
                }
                Some(wrapper) => {
                    let Some(child_obj) = wrapper.try_read() else { return false };
                    if child_obj.is_dirty() {
                        return false;
                    }
                    match child_obj.updated_uid() {
                        Some(new) => pending.push((idx, child_uid, new)),
                        None if !child_uid.is_persisted() => return false,
                        None => {}
                    }
                }
            }
        }
        for (idx, old, new) in pending {
            if let Some(wrapper) = map.remove(&old) {
                let locked = {
                    if let Some(mut child_obj) = wrapper.try_write() {
                        child_obj.adopt_updated();
                        true
                    } else {
                        false
                    }
                };
                if locked {
                    map.insert(new, wrapper.clone());
                    self.policy.lock().rekey(old, new);
                } else {
                    map.insert(old, wrapper);
                    return false;
                }
            }
            index.set_child_uid(idx, new);
        }
        true
    }
}
