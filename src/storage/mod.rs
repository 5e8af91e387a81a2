//! Tiered block storage.
//!
//! Three parallel tiers (DRAM, PMEM, FILE), each a flat byte region with its
//! own bitmap allocator. [HybridStorage] routes every request by the tier
//! tag carried in the node identity; new images are placed on the
//! configured write-back tier.

use log::trace;

use crate::{
    error::Result,
    pod::Pod,
    tree::node::Node,
    uid::{ObjectUid, StorageTier},
};

mod file;
mod pmem;
mod volatile;

pub use file::FileStorage;
pub use pmem::PMemStorage;
pub use volatile::VolatileStorage;

/// One storage backend: a byte region plus its allocator.
pub trait Tier: Send + Sync {
    fn tier(&self) -> StorageTier;
    /// Allocates blocks and copies `bytes` in. Returns the byte offset.
    fn write(&self, bytes: &[u8]) -> Result<u64>;
    fn read(&self, offset: u64, len: usize) -> Result<Box<[u8]>>;
    fn free(&self, offset: u64, len: usize);
}

/// Tier router. Owns all configured backends.
pub struct HybridStorage {
    dram: VolatileStorage,
    pmem: Option<PMemStorage>,
    file: Option<FileStorage>,
    write_tier: StorageTier,
}

impl HybridStorage {
    pub fn new(
        dram: VolatileStorage,
        pmem: Option<PMemStorage>,
        file: Option<FileStorage>,
        write_tier: StorageTier,
    ) -> HybridStorage {
        let storage = HybridStorage {
            dram,
            pmem,
            file,
            write_tier,
        };
        // Fail now, not on first eviction.
        storage.route(write_tier);
        storage
    }

    fn route(&self, tier: StorageTier) -> &dyn Tier {
        match tier {
            StorageTier::Dram => &self.dram,
            StorageTier::Pmem => self
                .pmem
                .as_ref()
                .map(|t| t as &dyn Tier)
                .expect("pmem tier addressed but not configured"),
            StorageTier::File => self
                .file
                .as_ref()
                .map(|t| t as &dyn Tier)
                .expect("file tier addressed but not configured"),
        }
    }

    /// Serializes `node` onto the write-back tier and returns its new
    /// identity. The old image, if any was persisted, is released only
    /// after the new bytes are durable.
    pub fn add_object<K: Pod, V: Pod>(
        &self,
        node: &Node<K, V>,
        old_uid: Option<&ObjectUid>,
    ) -> Result<ObjectUid> {
        let image = node.pack();
        let kind = node.kind();
        let tier = self.write_tier;
        let offset = self.route(tier).write(&image)?;
        let uid = ObjectUid::persisted(tier, offset, kind, image.len() as u32);
        trace!("add_object: {kind:?} ({} bytes) -> {tier:?}@{offset}", image.len());

        if let Some(old) = old_uid {
            if old.is_persisted() {
                self.route(old.tier()).free(old.offset(), old.size() as usize);
            }
        }
        Ok(uid)
    }

    /// Reads the serialized image behind `uid` and wraps it in its cold
    /// form. The page is not deserialized.
    pub fn get_object<K: Pod, V: Pod>(&self, degree: u16, uid: &ObjectUid) -> Result<Node<K, V>> {
        debug_assert!(uid.is_persisted(), "cold read of a transient identity");
        let bytes = self.route(uid.tier()).read(uid.offset(), uid.size() as usize)?;
        Ok(Node::cold(degree, uid.kind(), bytes))
    }

    /// Releases the blocks behind a persisted identity.
    pub fn remove(&self, uid: &ObjectUid) {
        if uid.is_persisted() {
            self.route(uid.tier()).free(uid.offset(), uid.size() as usize);
        }
    }

    /// The tier new write-backs are placed on.
    pub fn write_tier(&self) -> StorageTier {
        self.write_tier
    }
}
