//! Cache wrapper around one live tree node.

use std::{sync::Arc, time::Instant};

use parking_lot::RwLock;

use crate::{
    config::PromotionConfig,
    pod::Pod,
    tree::node::Node,
    uid::{ObjectKind, ObjectUid},
};

/// Shared handle to a cached node. The wrapper's lock doubles as the pin:
/// holding it keeps the eviction pipeline away.
pub type ObjectRef<K, V> = Arc<RwLock<CacheObject<K, V>>>;

/// Owning write guard used for hand-over-hand descent.
pub type ObjectWriteGuard<K, V> =
    parking_lot::lock_api::ArcRwLockWriteGuard<parking_lot::RawRwLock, CacheObject<K, V>>;
/// Owning read guard used for hand-over-hand descent.
pub type ObjectReadGuard<K, V> =
    parking_lot::lock_api::ArcRwLockReadGuard<parking_lot::RawRwLock, CacheObject<K, V>>;

/// Live state of one tree node: its identity, dirtiness, the (possibly
/// detached) node body and the access-heat bookkeeping of the cold→hot
/// promotion heuristic.
pub struct CacheObject<K, V> {
    uid: ObjectUid,
    /// New identity assigned by a write-back, pending until a parent
    /// reconciles it into its pivot.
    updated: Option<ObjectUid>,
    dirty: bool,
    node: Option<Node<K, V>>,
    hits: u32,
    window_start: Instant,
}

impl<K: Pod, V: Pod> CacheObject<K, V> {
    pub fn new(uid: ObjectUid, node: Option<Node<K, V>>, dirty: bool) -> CacheObject<K, V> {
        CacheObject {
            uid,
            updated: None,
            dirty,
            node,
            hits: 0,
            window_start: Instant::now(),
        }
    }

    pub fn uid(&self) -> ObjectUid {
        self.uid
    }

    pub fn kind(&self) -> ObjectKind {
        self.uid.kind()
    }

    pub fn updated_uid(&self) -> Option<ObjectUid> {
        self.updated
    }

    pub(crate) fn set_updated(&mut self, uid: ObjectUid) {
        self.updated = Some(uid);
    }

    /// Makes the pending identity current. Called once the parent's pivot
    /// has been rewritten.
    pub fn adopt_updated(&mut self) -> ObjectUid {
        let new = self.updated.take().expect("no pending identity to adopt");
        self.uid = new;
        new
    }

    pub(crate) fn assign_uid(&mut self, uid: ObjectUid) {
        self.uid = uid;
        self.updated = None;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// The identity the current bytes live under, preferring a pending
    /// write-back location over the stale one.
    pub fn effective_uid(&self) -> ObjectUid {
        self.updated.unwrap_or(self.uid)
    }

    pub fn node(&self) -> Option<&Node<K, V>> {
        self.node.as_ref()
    }

    pub fn node_mut(&mut self) -> Option<&mut Node<K, V>> {
        self.node.as_mut()
    }

    /// The attached body. Panics if the body was detached; callers go
    /// through the cache's materialization helpers first.
    pub fn body(&self) -> &Node<K, V> {
        self.node.as_ref().expect("node body not attached")
    }

    pub fn body_mut(&mut self) -> &mut Node<K, V> {
        debug_assert!(self.node.is_some(), "node body not attached");
        self.node.as_mut().expect("node body not attached")
    }

    pub fn is_attached(&self) -> bool {
        self.node.is_some()
    }

    pub(crate) fn attach(&mut self, node: Node<K, V>) {
        debug_assert!(self.node.is_none());
        self.node = Some(node);
    }

    pub(crate) fn detach(&mut self) -> Option<Node<K, V>> {
        debug_assert!(!self.dirty, "detaching a dirty body");
        self.node.take()
    }

    /// Detach regardless of dirtiness; only valid when the node itself is
    /// being deleted.
    pub(crate) fn detach_any(&mut self) -> Option<Node<K, V>> {
        self.dirty = false;
        self.node.take()
    }

    /// Records one access for the promotion heuristic. Returns true when
    /// the threshold was reached within the window and a cold body should
    /// be deserialized.
    pub(crate) fn record_access(&mut self, cfg: &PromotionConfig) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start) > cfg.window {
            // Window expired, the previous burst decays.
            self.window_start = now;
            self.hits = 1;
            return false;
        }
        self.hits += 1;
        self.hits >= cfg.threshold
    }
}
