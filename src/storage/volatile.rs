//! Heap-backed DRAM tier.

use parking_lot::RwLock;

use super::Tier;
use crate::{
    allocator::BitmapAllocator,
    error::{Error, Result},
    uid::StorageTier,
};

struct Inner {
    region: Box<[u8]>,
    allocator: BitmapAllocator,
}

/// A byte region on the heap with its own block allocator.
pub struct VolatileStorage {
    inner: RwLock<Inner>,
}

impl VolatileStorage {
    pub fn new(block_size: usize, storage_size: usize) -> VolatileStorage {
        VolatileStorage {
            inner: RwLock::new(Inner {
                region: vec![0u8; storage_size].into_boxed_slice(),
                allocator: BitmapAllocator::new(block_size, storage_size),
            }),
        }
    }
}

impl Tier for VolatileStorage {
    fn tier(&self) -> StorageTier {
        StorageTier::Dram
    }

    fn write(&self, bytes: &[u8]) -> Result<u64> {
        let mut inner = self.inner.write();
        let offset = inner.allocator.allocate(bytes.len()).ok_or(Error::OutOfStorage)?;
        inner.region[offset as usize..offset as usize + bytes.len()].copy_from_slice(bytes);
        Ok(offset)
    }

    fn read(&self, offset: u64, len: usize) -> Result<Box<[u8]>> {
        let inner = self.inner.read();
        Ok(inner.region[offset as usize..offset as usize + len].into())
    }

    fn free(&self, offset: u64, len: usize) {
        self.inner.write().allocator.free(offset, len);
    }
}
