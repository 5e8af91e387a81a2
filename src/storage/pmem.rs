//! Persistent-memory tier over a shared file mapping.
//!
//! The region is a `MAP_SHARED` mapping of the configured path, written in
//! place and flushed with `msync`. On real pmem mounts (DAX) the msync cost
//! collapses to a cache-line flush.

use std::{ffi::CString, io, os::unix::ffi::OsStrExt, path::Path, ptr};

use parking_lot::RwLock;

use super::Tier;
use crate::{
    allocator::BitmapAllocator,
    error::{Error, Result},
    uid::StorageTier,
};

pub struct PMemStorage {
    map: *mut u8,
    map_len: usize,
    allocator: RwLock<BitmapAllocator>,
}

// The raw mapping pointer is only dereferenced under the allocator lock for
// writes and on immutable, allocated ranges for reads.
unsafe impl Send for PMemStorage {}
unsafe impl Sync for PMemStorage {}

impl PMemStorage {
    pub fn open(path: &Path, block_size: usize, storage_size: usize) -> Result<PMemStorage> {
        let cpath = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::Io(io::Error::from(io::ErrorKind::InvalidInput)))?;

        let map = unsafe {
            let fd = libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_CREAT, 0o644);
            if fd < 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
            if libc::ftruncate(fd, storage_size as libc::off_t) != 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(Error::Io(err));
            }
            let map = libc::mmap(
                ptr::null_mut(),
                storage_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);
            if map == libc::MAP_FAILED {
                return Err(Error::Io(io::Error::last_os_error()));
            }
            map as *mut u8
        };

        Ok(PMemStorage {
            map,
            map_len: storage_size,
            allocator: RwLock::new(BitmapAllocator::new(block_size, storage_size)),
        })
    }
}

impl Drop for PMemStorage {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map as *mut libc::c_void, self.map_len);
        }
    }
}

impl Tier for PMemStorage {
    fn tier(&self) -> StorageTier {
        StorageTier::Pmem
    }

    fn write(&self, bytes: &[u8]) -> Result<u64> {
        let mut allocator = self.allocator.write();
        let offset = allocator.allocate(bytes.len()).ok_or(Error::OutOfStorage)?;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.map.add(offset as usize), bytes.len());
            // msync wants a page-aligned start, not a block-aligned one.
            let page = libc::sysconf(libc::_SC_PAGESIZE) as usize;
            let start = offset as usize & !(page - 1);
            let sync_len = offset as usize - start + bytes.len();
            if libc::msync(self.map.add(start) as *mut libc::c_void, sync_len, libc::MS_SYNC) != 0 {
                // The blocks were already marked used; release them so the
                // failed write has no lasting effect.
                allocator.free(offset, bytes.len());
                return Err(Error::Io(io::Error::last_os_error()));
            }
        }
        Ok(offset)
    }

    fn read(&self, offset: u64, len: usize) -> Result<Box<[u8]>> {
        assert!(offset as usize + len <= self.map_len, "read past pmem region end");
        let mut out = vec![0u8; len].into_boxed_slice();
        unsafe {
            ptr::copy_nonoverlapping(self.map.add(offset as usize), out.as_mut_ptr(), len);
        }
        Ok(out)
    }

    fn free(&self, offset: u64, len: usize) {
        self.allocator.write().free(offset, len);
    }
}
