//! Replacement policy interface.
//!
//! Policies only track identities and ordering; the cache owns the map and
//! the wrappers. A selected victim is not necessarily evicted (it may be
//! pinned), so selection must leave candidates reclaimable until the cache
//! confirms removal via [Policy::record_remove].

use crate::uid::ObjectUid;

pub trait Policy: Default + Send {
    /// A wrapper's body was attached and is now evictable.
    fn record_insert(&mut self, uid: ObjectUid);

    /// A tracked wrapper was hit.
    fn record_access(&mut self, uid: ObjectUid);

    /// A wrapper's body left the cache (eviction or deletion).
    fn record_remove(&mut self, uid: ObjectUid);

    /// A write-back moved the wrapper to a new identity.
    fn rekey(&mut self, old: ObjectUid, new: ObjectUid);

    /// Up to `max` eviction candidates, best victim first.
    fn select_victims(&mut self, max: usize) -> Vec<ObjectUid>;
}
