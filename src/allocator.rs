//! Bitmap allocator for fixed-size blocks over a flat byte region.
//!
//! Allocations are whole runs of consecutive blocks, found first-fit.
//! Runs are never split or coalesced afterwards; fragmentation is accepted.

use bitvec::prelude::*;

pub struct BitmapAllocator {
    block_size: usize,
    // One bit per block, set = in use.
    bits: BitVec<u64, Lsb0>,
}

impl BitmapAllocator {
    pub fn new(block_size: usize, region_size: usize) -> BitmapAllocator {
        assert!(block_size.is_power_of_two(), "block size {block_size} not a power of two");
        BitmapAllocator {
            block_size,
            bits: bitvec![u64, Lsb0; 0; region_size / block_size],
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    fn blocks_for(&self, n_bytes: usize) -> usize {
        ((n_bytes + self.block_size - 1) / self.block_size).max(1)
    }

    /// First-fit run allocation. Returns the block-aligned byte offset, or
    /// `None` if no run of sufficient length is free.
    pub fn allocate(&mut self, n_bytes: usize) -> Option<u64> {
        let want = self.blocks_for(n_bytes);
        let total = self.bits.len();

        let mut start = 0;
        while start + want <= total {
            match self.bits[start..start + want].last_one() {
                // The window ends right after the last used bit found, so
                // resuming there skips every run that overlaps it.
                Some(used) => start += used + 1,
                None => {
                    self.bits[start..start + want].fill(true);
                    return Some((start * self.block_size) as u64);
                }
            }
        }
        None
    }

    /// Releases the run previously returned for `n_bytes` at `offset`.
    pub fn free(&mut self, offset: u64, n_bytes: usize) {
        let first = offset as usize / self.block_size;
        let count = self.blocks_for(n_bytes);
        debug_assert!(
            self.bits[first..first + count].all(),
            "double free of blocks {first}..{}",
            first + count
        );
        self.bits[first..first + count].fill(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_first_fit_runs() {
        let mut a = BitmapAllocator::new(2048, 16 * 2048);
        assert_eq!(a.allocate(2048), Some(0));
        assert_eq!(a.allocate(5000), Some(2048)); // 3 blocks
        assert_eq!(a.allocate(1), Some(4 * 2048));
    }

    #[test]
    fn reuses_freed_runs() {
        let mut a = BitmapAllocator::new(2048, 8 * 2048);
        let first = a.allocate(3 * 2048).unwrap();
        let second = a.allocate(2 * 2048).unwrap();
        a.free(first, 3 * 2048);
        // A 2-block run fits into the freed 3-block hole before `second`.
        assert_eq!(a.allocate(2 * 2048), Some(0));
        assert!(second > 0);
    }

    #[test]
    fn exhaustion_reports_none() {
        let mut a = BitmapAllocator::new(4096, 2 * 4096);
        assert!(a.allocate(2 * 4096).is_some());
        assert_eq!(a.allocate(1), None);
    }

    #[test]
    fn run_must_be_consecutive() {
        let mut a = BitmapAllocator::new(2048, 4 * 2048);
        let a0 = a.allocate(1).unwrap();
        let _a1 = a.allocate(1).unwrap();
        let _a2 = a.allocate(1).unwrap();
        let _a3 = a.allocate(1).unwrap();
        a.free(a0, 1);
        a.free(_a2, 1);
        // Two free blocks remain but they are not adjacent.
        assert_eq!(a.allocate(2 * 2048), None);
    }
}
