//! Bitmap allocator
//!
//! One bit per block, packed into 64-bit words:
//! - 0 = free block
//! - 1 = used block
//!
//! Block `i` lives in word `i / 64`, bit `i % 64`. Serialized little-endian,
//! that is byte `i / 8` under mask `1 << (i % 8)`, which is the on-image layout.

use crate::allocator::BlockAllocator;
use crate::error::{Result, VolumeError};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitmapAllocator {
    /// Bitmap words (each word = 64 bits = 64 blocks)
    bitmap: Vec<u64>,

    /// Total number of blocks tracked
    total_blocks: usize,

    /// Number of free blocks available
    free_blocks: usize,
}

impl BitmapAllocator {
    /// Create a new bitmap allocator with every block free
    pub fn new(total_blocks: usize) -> Self {
        let num_words = total_blocks.div_ceil(64);
        BitmapAllocator {
            bitmap: vec![0u64; num_words],
            total_blocks,
            free_blocks: total_blocks,
        }
    }

    /// Serialized length of a bitmap tracking `total_blocks` blocks
    pub fn byte_len(total_blocks: usize) -> usize {
        total_blocks.div_ceil(8)
    }

    /// Serialize to `ceil(total_blocks / 8)` bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = self.bitmap.iter().flat_map(|w| w.to_le_bytes()).collect();
        bytes.truncate(Self::byte_len(self.total_blocks));
        bytes
    }

    /// Rebuild an allocator from its serialized bitmap
    ///
    /// The free counter is recomputed from the bits. Bits set past
    /// `total_blocks` are rejected since no block can back them.
    pub fn from_bytes(bytes: &[u8], total_blocks: usize) -> Result<Self> {
        if bytes.len() != Self::byte_len(total_blocks) {
            return Err(VolumeError::CorruptImage(format!(
                "bitmap is {} bytes, expected {} for {} blocks",
                bytes.len(),
                Self::byte_len(total_blocks),
                total_blocks
            )));
        }

        let mut bitmap = vec![0u64; total_blocks.div_ceil(64)];
        for (idx, chunk) in bytes.chunks(8).enumerate() {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            bitmap[idx] = u64::from_le_bytes(word);
        }

        let tail_bits = total_blocks % 64;
        if tail_bits != 0 {
            if let Some(last) = bitmap.last() {
                if last >> tail_bits != 0 {
                    return Err(VolumeError::CorruptImage(
                        "bitmap marks blocks beyond the partition".to_string(),
                    ));
                }
            }
        }

        let used: usize = bitmap.iter().map(|w| w.count_ones() as usize).sum();
        Ok(BitmapAllocator {
            bitmap,
            total_blocks,
            free_blocks: total_blocks - used,
        })
    }

    /// Length of the longest run of free blocks
    pub fn largest_free_run(&self) -> usize {
        let mut best = 0;
        let mut run = 0;
        for block in 0..self.total_blocks {
            if self.is_used(block) {
                run = 0;
            } else {
                run += 1;
                best = best.max(run);
            }
        }
        best
    }

    fn check_range(&self, start: usize, n: usize) -> Result<()> {
        match start.checked_add(n) {
            Some(end) if end <= self.total_blocks => Ok(()),
            _ => Err(VolumeError::AllocationInconsistency(format!(
                "block range {}+{} outside 0..{}",
                start, n, self.total_blocks
            ))),
        }
    }

    fn set(&mut self, block: usize, used: bool) -> bool {
        let word_idx = block / 64;
        let mask = 1u64 << (block % 64);
        let was_used = self.bitmap[word_idx] & mask != 0;
        if used {
            self.bitmap[word_idx] |= mask;
        } else {
            self.bitmap[word_idx] &= !mask;
        }
        was_used != used
    }
}

impl BlockAllocator for BitmapAllocator {
    fn find_contiguous(&self, n: usize) -> Option<usize> {
        if n == 0 {
            return Some(0);
        }

        let mut run_start = 0;
        let mut run_len = 0;
        let mut block = 0;
        while block < self.total_blocks {
            // Skip fully used words at a word boundary
            if block % 64 == 0 && self.bitmap[block / 64] == u64::MAX {
                run_len = 0;
                block += 64;
                continue;
            }

            if self.is_used(block) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = block;
                }
                run_len += 1;
                if run_len == n {
                    return Some(run_start);
                }
            }
            block += 1;
        }
        None
    }

    fn mark_used(&mut self, start: usize, n: usize) -> Result<()> {
        self.check_range(start, n)?;
        for block in start..start + n {
            if self.set(block, true) {
                self.free_blocks -= 1;
            }
        }
        Ok(())
    }

    fn mark_free(&mut self, start: usize, n: usize) -> Result<()> {
        self.check_range(start, n)?;
        for block in start..start + n {
            if self.set(block, false) {
                self.free_blocks += 1;
            }
        }
        Ok(())
    }

    fn free_count(&self) -> usize {
        self.free_blocks
    }

    fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    fn is_used(&self, block: usize) -> bool {
        if block >= self.total_blocks {
            return false;
        }
        self.bitmap[block / 64] & (1u64 << (block % 64)) != 0
    }

    fn fragmentation_score(&self) -> f64 {
        if self.total_blocks == 0 {
            return 0.0;
        }

        // Count free -> used transitions across the partition
        let mut transitions = 0usize;
        let mut prev_used = false;
        for block in 0..self.total_blocks {
            let used = self.is_used(block);
            if used && !prev_used && block > 0 {
                transitions += 1;
            }
            prev_used = used;
        }

        (transitions as f64) / (self.total_blocks as f64)
    }
}

/// Prints the bitmap as `0`/`1` digits in groups of eight
impl fmt::Display for BitmapAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in 0..self.total_blocks {
            if block % 8 == 0 && block > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", if self.is_used(block) { '1' } else { '0' })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_creation() {
        let alloc = BitmapAllocator::new(1000);
        assert_eq!(alloc.total_blocks(), 1000);
        assert_eq!(alloc.free_count(), 1000);
        assert_eq!(alloc.used_count(), 0);
    }

    #[test]
    fn test_find_contiguous_first_fit() {
        let mut alloc = BitmapAllocator::new(16);
        alloc.mark_used(0, 2).unwrap();
        alloc.mark_used(3, 1).unwrap();

        // Hole at 2 is too small for 2 blocks, next run starts at 4
        assert_eq!(alloc.find_contiguous(1), Some(2));
        assert_eq!(alloc.find_contiguous(2), Some(4));
        assert_eq!(alloc.find_contiguous(12), Some(4));
        assert_eq!(alloc.find_contiguous(13), None);
    }

    #[test]
    fn test_find_contiguous_zero_is_trivial() {
        let mut alloc = BitmapAllocator::new(4);
        alloc.mark_used(0, 4).unwrap();
        assert_eq!(alloc.find_contiguous(0), Some(0));
    }

    #[test]
    fn test_find_contiguous_across_word_boundary() {
        let mut alloc = BitmapAllocator::new(200);
        alloc.mark_used(0, 62).unwrap();
        // Run 62..66 straddles the first word boundary
        assert_eq!(alloc.find_contiguous(4), Some(62));

        alloc.mark_used(62, 66).unwrap();
        assert_eq!(alloc.find_contiguous(10), Some(128));
    }

    #[test]
    fn test_mark_is_idempotent() {
        let mut alloc = BitmapAllocator::new(10);
        alloc.mark_used(2, 3).unwrap();
        alloc.mark_used(2, 3).unwrap();
        assert_eq!(alloc.free_count(), 7);

        alloc.mark_free(2, 3).unwrap();
        alloc.mark_free(2, 3).unwrap();
        assert_eq!(alloc.free_count(), 10);
    }

    #[test]
    fn test_mark_out_of_range() {
        let mut alloc = BitmapAllocator::new(10);
        assert!(matches!(
            alloc.mark_used(8, 3),
            Err(VolumeError::AllocationInconsistency(_))
        ));
        assert_eq!(alloc.free_count(), 10);
    }

    #[test]
    fn test_free_count_matches_unset_bits() {
        let mut alloc = BitmapAllocator::new(130);
        alloc.mark_used(5, 70).unwrap();
        alloc.mark_free(10, 5).unwrap();
        alloc.mark_used(100, 30).unwrap();

        let unset = (0..130).filter(|&b| !alloc.is_used(b)).count();
        assert_eq!(alloc.free_count(), unset);
    }

    #[test]
    fn test_byte_layout() {
        let mut alloc = BitmapAllocator::new(10);
        alloc.mark_used(0, 1).unwrap();
        alloc.mark_used(9, 1).unwrap();

        let bytes = alloc.to_bytes();
        assert_eq!(bytes, vec![0b0000_0001, 0b0000_0010]);

        let restored = BitmapAllocator::from_bytes(&bytes, 10).unwrap();
        assert_eq!(restored, alloc);
        assert_eq!(restored.free_count(), 8);
    }

    #[test]
    fn test_from_bytes_rejects_bad_length() {
        let result = BitmapAllocator::from_bytes(&[0u8; 3], 10);
        assert!(matches!(result, Err(VolumeError::CorruptImage(_))));
    }

    #[test]
    fn test_from_bytes_rejects_bits_past_end() {
        let result = BitmapAllocator::from_bytes(&[0x00, 0b0000_0100], 10);
        assert!(matches!(result, Err(VolumeError::CorruptImage(_))));
    }

    #[test]
    fn test_largest_free_run() {
        let mut alloc = BitmapAllocator::new(12);
        assert_eq!(alloc.largest_free_run(), 12);
        alloc.mark_used(3, 1).unwrap();
        alloc.mark_used(9, 1).unwrap();
        assert_eq!(alloc.largest_free_run(), 5);
    }

    #[test]
    fn test_display_groups_of_eight() {
        let mut alloc = BitmapAllocator::new(10);
        alloc.mark_used(1, 2).unwrap();
        assert_eq!(alloc.to_string(), "01100000 00");
    }

    #[test]
    fn test_fragmentation_score() {
        let mut alloc = BitmapAllocator::new(100);
        let score1 = alloc.fragmentation_score();

        alloc.mark_used(10, 5).unwrap();
        alloc.mark_used(50, 5).unwrap();
        let score2 = alloc.fragmentation_score();

        assert!(score2 > score1);
    }
}
