//! Block-device/file tier using positioned reads and writes.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use parking_lot::Mutex;

use super::Tier;
use crate::{
    allocator::BitmapAllocator,
    error::{Error, Result},
    uid::StorageTier,
};

pub struct FileStorage {
    file: File,
    allocator: Mutex<BitmapAllocator>,
}

impl FileStorage {
    pub fn open(path: &Path, block_size: usize, storage_size: usize) -> Result<FileStorage> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.set_len(storage_size as u64)?;
        Ok(FileStorage {
            file,
            allocator: Mutex::new(BitmapAllocator::new(block_size, storage_size)),
        })
    }
}

impl Tier for FileStorage {
    fn tier(&self) -> StorageTier {
        StorageTier::File
    }

    fn write(&self, bytes: &[u8]) -> Result<u64> {
        let mut allocator = self.allocator.lock();
        let offset = allocator.allocate(bytes.len()).ok_or(Error::OutOfStorage)?;
        if let Err(err) = self
            .file
            .write_all_at(bytes, offset)
            .and_then(|()| self.file.sync_data())
        {
            allocator.free(offset, bytes.len());
            return Err(Error::Io(err));
        }
        Ok(offset)
    }

    fn read(&self, offset: u64, len: usize) -> Result<Box<[u8]>> {
        let mut out = vec![0u8; len].into_boxed_slice();
        self.file.read_exact_at(&mut out, offset)?;
        Ok(out)
    }

    fn free(&self, offset: u64, len: usize) {
        self.allocator.lock().free(offset, len);
    }
}
