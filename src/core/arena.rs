//! Byte arena backing a volume's blocks
//!
//! An arena is a plain owned buffer. A volume occupies the region
//! `[storage_offset * block_size, storage_offset * block_size + partition_size)`
//! of it; several volumes may share one arena only if their regions are
//! disjoint, which nothing here checks.

use crate::error::{Result, VolumeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arena {
    bytes: Vec<u8>,
}

impl Arena {
    /// Create a zero-filled arena
    pub fn new(capacity: usize) -> Self {
        Arena {
            bytes: vec![0u8; capacity],
        }
    }

    /// Create a zero-filled arena, failing instead of aborting when the
    /// allocator cannot provide `capacity` bytes
    pub fn try_new(capacity: usize) -> Result<Self> {
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(capacity).map_err(|err| {
            VolumeError::InvalidGeometry(format!(
                "cannot allocate a {}-byte arena: {}",
                capacity, err
            ))
        })?;
        bytes.resize(capacity, 0);
        Ok(Arena { bytes })
    }

    /// Wrap an existing buffer
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Arena { bytes }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Borrow `len` bytes at `offset`
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = self.check(offset, len)?;
        Ok(&self.bytes[offset..end])
    }

    /// Copy `data` to `offset`
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = self.check(offset, data.len())?;
        self.bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Zero `len` bytes at `offset`
    pub fn zero(&mut self, offset: usize, len: usize) -> Result<()> {
        let end = self.check(offset, len)?;
        self.bytes[offset..end].fill(0);
        Ok(())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }

    fn check(&self, offset: usize, len: usize) -> Result<usize> {
        match offset.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(end),
            _ => Err(VolumeError::AllocationInconsistency(format!(
                "arena access {}+{} outside 0..{}",
                offset,
                len,
                self.bytes.len()
            ))),
        }
    }
}
