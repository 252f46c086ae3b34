//! Block allocation for a volume
//!
//! A volume hands out blocks in single contiguous runs, so the allocator's job
//! is to answer "where is the first run of `n` free blocks" and to keep the
//! free counter honest while ranges are marked and released.

pub mod bitmap;

pub use bitmap::BitmapAllocator;

use crate::error::{Result, VolumeError};

/// Block allocator trait
///
/// Defines the interface a volume uses to reserve and release block ranges.
pub trait BlockAllocator {
    /// Find the first block that begins a run of `n` free blocks
    ///
    /// Scans left to right. `None` means no such run exists, which is not an
    /// error by itself: callers compare against `free_count()` first so that
    /// exhaustion and fragmentation can be told apart.
    fn find_contiguous(&self, n: usize) -> Option<usize>;

    /// Mark `[start, start + n)` as used (idempotent)
    fn mark_used(&mut self, start: usize, n: usize) -> Result<()>;

    /// Mark `[start, start + n)` as free (idempotent)
    fn mark_free(&mut self, start: usize, n: usize) -> Result<()>;

    /// Number of free blocks, maintained as a running counter
    fn free_count(&self) -> usize;

    /// Total number of blocks managed
    fn total_blocks(&self) -> usize;

    /// Whether a single block is marked used
    fn is_used(&self, block: usize) -> bool;

    /// Calculate fragmentation score (0.0 = no fragmentation, higher = more fragmented)
    fn fragmentation_score(&self) -> f64;

    /// Number of used blocks
    fn used_count(&self) -> usize {
        self.total_blocks() - self.free_count()
    }

    /// Whether every block of `[start, start + n)` is marked used
    fn is_range_used(&self, start: usize, n: usize) -> bool {
        match start.checked_add(n) {
            Some(end) if end <= self.total_blocks() => (start..end).all(|b| self.is_used(b)),
            _ => false,
        }
    }

    /// Reserve a contiguous run of `n` blocks and return its first block
    ///
    /// Fails with `InsufficientSpace` when fewer than `n` blocks are free at
    /// all, and with `InsufficientContiguousSpace` when enough blocks are free
    /// but no single run is long enough.
    fn allocate_contiguous(&mut self, n: usize) -> Result<usize> {
        if n > self.free_count() {
            return Err(VolumeError::InsufficientSpace {
                required: n,
                free: self.free_count(),
            });
        }

        let start = self
            .find_contiguous(n)
            .ok_or(VolumeError::InsufficientContiguousSpace { required: n })?;
        self.mark_used(start, n)?;
        Ok(start)
    }
}

/// Number of blocks needed to hold `len` bytes
pub fn blocks_for(len: usize, block_size: usize) -> usize {
    len.div_ceil(block_size)
}
