//! Volume orchestration
//!
//! A volume ties together the block allocator, the namespace and the arena.
//! Every mutating operation is all-or-nothing: when a step fails after space
//! has been reserved, the reservation is rolled back before the error is
//! returned, so the bitmap, the free counter and the entry table never drift.

use crate::allocator::{blocks_for, BitmapAllocator, BlockAllocator};
use crate::arena::Arena;
use crate::catalog::{child_path, Entry, EntryId, EntryKind, Extent, Namespace};
use crate::config::VolumeConfig;
use crate::error::{Result, VolumeError};
use crate::validation::EntryName;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

/// A volume behind one coarse lock
///
/// Allocation and entry mutation are not independently safe to interleave,
/// so concurrent callers share the whole volume under a single mutex.
pub type SharedVolume = Arc<Mutex<Volume>>;

/// Listing row for one entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub id: EntryId,
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub start_block: usize,
    pub block_count: usize,
    pub path: String,
    pub parent_path: String,
}

/// Space report for a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeStatus {
    pub partition_size: usize,
    pub block_size: usize,
    pub total_blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub entries: usize,
    pub files: usize,
    pub directories: usize,
    /// Blocks held by files (directories hold one block each)
    pub file_blocks: usize,
    /// Bytes in free blocks
    pub free_space: usize,
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "partition size: {}", self.partition_size)?;
        writeln!(f, "used entries: {}", self.entries)?;
        writeln!(f, "files: {}", self.files)?;
        writeln!(f, "directories: {}", self.directories)?;
        writeln!(f, "total blocks: {}", self.total_blocks)?;
        writeln!(f, "used blocks: {}", self.used_blocks)?;
        writeln!(f, "files' blocks: {}", self.file_blocks)?;
        writeln!(f, "free blocks: {}", self.free_blocks)?;
        writeln!(f, "block size: {}", self.block_size)?;
        write!(f, "free space: {}", self.free_space)
    }
}

#[derive(Debug)]
pub struct Volume {
    config: VolumeConfig,
    partition_size: usize,
    /// First block of this volume's region in the arena
    storage_offset: usize,
    allocator: BitmapAllocator,
    namespace: Namespace,
    arena: Arena,
}

impl Volume {
    /// Format a volume with its own arena and default settings
    pub fn new(partition_size: usize) -> Result<Self> {
        Self::format(
            Arena::new(partition_size),
            partition_size,
            0,
            VolumeConfig::default(),
        )
    }

    /// Format a fresh volume inside `arena`
    ///
    /// The partition starts at block `storage_offset` of the arena. The
    /// region is zeroed; `total_blocks` is `partition_size / block_size`.
    pub fn format(
        mut arena: Arena,
        partition_size: usize,
        storage_offset: usize,
        config: VolumeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let block_size = config.block_size;

        let total_blocks = partition_size / block_size;
        if total_blocks == 0 {
            return Err(VolumeError::InvalidGeometry(format!(
                "partition of {} bytes holds no {}-byte block",
                partition_size, block_size
            )));
        }

        let base = region_base(storage_offset, block_size, partition_size, arena.capacity())?;
        arena.zero(base, partition_size)?;

        info!(
            "Formatted volume: {} bytes, {} blocks of {} bytes at block offset {}",
            partition_size, total_blocks, block_size, storage_offset
        );

        Ok(Volume {
            config,
            partition_size,
            storage_offset,
            allocator: BitmapAllocator::new(total_blocks),
            namespace: Namespace::new(),
            arena,
        })
    }

    /// Assemble a volume from decoded parts and verify it
    pub(crate) fn from_parts(
        config: VolumeConfig,
        partition_size: usize,
        storage_offset: usize,
        allocator: BitmapAllocator,
        namespace: Namespace,
        arena: Arena,
    ) -> Result<Self> {
        config.validate()?;
        region_base(storage_offset, config.block_size, partition_size, arena.capacity())?;

        let volume = Volume {
            config,
            partition_size,
            storage_offset,
            allocator,
            namespace,
            arena,
        };
        volume.check_invariants()?;
        Ok(volume)
    }

    pub fn into_shared(self) -> SharedVolume {
        Arc::new(Mutex::new(self))
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    pub fn partition_size(&self) -> usize {
        self.partition_size
    }

    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    pub fn total_blocks(&self) -> usize {
        self.allocator.total_blocks()
    }

    pub fn free_blocks(&self) -> usize {
        self.allocator.free_count()
    }

    pub fn allocator(&self) -> &BitmapAllocator {
        &self.allocator
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn into_arena(self) -> Arena {
        self.arena
    }

    /// The bytes of this volume's partition
    pub fn partition_bytes(&self) -> Result<&[u8]> {
        self.arena.read(self.region_base(), self.partition_size)
    }

    pub fn current_path(&self) -> String {
        self.namespace.current_path()
    }

    /// Change the current directory (`".."` or one child name)
    pub fn cd(&mut self, token: &str) -> Result<()> {
        self.namespace.change_directory(token)?;
        debug!("Current directory: {}", self.namespace.current_path());
        Ok(())
    }

    /// Entries in the current directory
    pub fn ls(&self) -> Vec<EntryInfo> {
        self.namespace
            .children(self.namespace.current_dir())
            .into_iter()
            .map(|(id, _)| self.info(id))
            .collect()
    }

    /// Describe the entry `name` in the current directory
    pub fn stat(&self, name: &str) -> Result<EntryInfo> {
        let (id, _) = self.lookup(name)?;
        Ok(self.info(id))
    }

    /// Create a directory in the current directory
    ///
    /// A directory holds exactly one block.
    pub fn mkdir(&mut self, name: &str) -> Result<EntryId> {
        self.ensure_absent(name)?;
        let start = self.allocator.allocate_contiguous(1)?;

        let entry = Entry::directory(name, Extent::new(start, 1));
        let id = self.insert_entry(entry)?;
        debug!("Created directory {}", self.namespace.path_of(id));
        Ok(id)
    }

    /// Remove an empty directory from the current directory
    pub fn rmdir(&mut self, name: &str) -> Result<()> {
        let (_, entry) = self.lookup(name)?;
        if !entry.is_directory() {
            return Err(VolumeError::NotADirectory(self.child_path(name)));
        }
        self.remove(name)
    }

    /// Store `bytes` as a new file in the current directory
    pub fn put(&mut self, name: &str, bytes: &[u8]) -> Result<EntryId> {
        self.ensure_absent(name)?;

        let required = blocks_for(bytes.len(), self.block_size());
        let start = if required == 0 {
            0
        } else {
            self.allocator.allocate_contiguous(required)?
        };
        let extent = Extent::new(start, required);

        let id = self.insert_entry(Entry::file(name, bytes.len() as u64, extent))?;
        if let Err(err) = self.write_extent(&extent, bytes) {
            // Undo both halves; the arena failing means accounting is already off
            self.namespace.remove_entry(self.namespace.current_dir(), name)?;
            self.allocator.mark_free(extent.start, extent.count)?;
            return Err(err);
        }

        debug!(
            "Stored {} bytes as {} in blocks {}..{}",
            bytes.len(),
            self.namespace.path_of(id),
            extent.start,
            extent.end()
        );
        Ok(id)
    }

    /// Create a file from already-read content
    ///
    /// Same as [`Volume::put`]; the shell reads the text, the volume only
    /// sees bytes.
    pub fn create(&mut self, name: &str, bytes: &[u8]) -> Result<EntryId> {
        self.put(name, bytes)
    }

    /// Copy out the full content of a file in the current directory
    pub fn read_all(&self, name: &str) -> Result<Vec<u8>> {
        let (_, entry) = self.lookup(name)?;
        if entry.is_directory() {
            return Err(VolumeError::IsADirectory(self.child_path(name)));
        }

        let offset = self.block_offset(entry.extent.start);
        Ok(self.arena.read(offset, entry.size as usize)?.to_vec())
    }

    /// Remove a file from the current directory
    pub fn rm(&mut self, name: &str) -> Result<()> {
        let (_, entry) = self.lookup(name)?;
        if entry.is_directory() {
            return Err(VolumeError::IsADirectory(self.child_path(name)));
        }
        self.remove(name)
    }

    /// Replace the content of an existing file
    ///
    /// Shrinking rewrites in place and releases the tail blocks. Growing
    /// relocates the whole file to a single new run; the old run counts as
    /// free during the search, so the new run may overlap it. On failure the
    /// old run is reinstated and the file is untouched.
    pub fn edit(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let (id, entry) = self.lookup(name)?;
        if entry.is_directory() {
            return Err(VolumeError::IsADirectory(self.child_path(name)));
        }
        let old = entry.extent;
        self.ensure_held(id, &old)?;

        let required = blocks_for(bytes.len(), self.block_size());
        let extent = if required <= old.count {
            let extent = Extent::new(if required == 0 { 0 } else { old.start }, required);
            self.write_extent(&extent, bytes)?;
            self.allocator.mark_free(old.start + required, old.count - required)?;
            extent
        } else {
            let available = self.allocator.free_count() + old.count;
            if required > available {
                return Err(VolumeError::InsufficientSpace {
                    required,
                    free: available,
                });
            }

            self.allocator.mark_free(old.start, old.count)?;
            let Some(start) = self.allocator.find_contiguous(required) else {
                self.allocator.mark_used(old.start, old.count)?;
                return Err(VolumeError::InsufficientContiguousSpace { required });
            };
            self.allocator.mark_used(start, required)?;

            let extent = Extent::new(start, required);
            if let Err(err) = self.write_extent(&extent, bytes) {
                self.allocator.mark_free(start, required)?;
                self.allocator.mark_used(old.start, old.count)?;
                return Err(err);
            }
            extent
        };

        if let Some(entry) = self.namespace.get_mut(id) {
            entry.size = bytes.len() as u64;
            entry.extent = extent;
        }

        debug!(
            "Edited {}: {} bytes in blocks {}..{}",
            self.namespace.path_of(id),
            bytes.len(),
            extent.start,
            extent.end()
        );
        Ok(())
    }

    /// Rename an entry in the current directory
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let id = self
            .namespace
            .rename(self.namespace.current_dir(), old, new)?;
        debug!("Renamed {} to {}", old, self.namespace.path_of(id));
        Ok(())
    }

    /// Space report, derived without side effects
    pub fn status(&self) -> VolumeStatus {
        let mut files = 0;
        let mut directories = 0;
        let mut file_blocks = 0;
        for (_, entry) in self.namespace.iter() {
            match entry.kind {
                EntryKind::File => {
                    files += 1;
                    file_blocks += entry.extent.count;
                }
                EntryKind::Directory => directories += 1,
            }
        }

        let free_blocks = self.allocator.free_count();
        VolumeStatus {
            partition_size: self.partition_size,
            block_size: self.block_size(),
            total_blocks: self.allocator.total_blocks(),
            used_blocks: self.allocator.used_count(),
            free_blocks,
            entries: files + directories,
            files,
            directories,
            file_blocks,
            free_space: free_blocks * self.block_size(),
        }
    }

    /// Verify space accounting and naming invariants
    ///
    /// - every live extent lies in the partition and is marked used
    /// - no two live extents overlap and no used block is unclaimed
    /// - `free_blocks == total_blocks - sum(block_count)`
    /// - directories hold one block, files `ceil(size / block_size)`
    /// - the current directory is the root or a live directory
    pub fn check_invariants(&self) -> Result<()> {
        let total = self.allocator.total_blocks();
        let mut owners: Vec<Option<EntryId>> = vec![None; total];
        let mut claimed = 0usize;

        for (id, entry) in self.namespace.iter() {
            let expected = match entry.kind {
                EntryKind::Directory => 1,
                EntryKind::File => blocks_for(entry.size as usize, self.block_size()),
            };
            if entry.extent.count != expected {
                return Err(self.inconsistency(format!(
                    "{} holds {} blocks, expected {}",
                    self.namespace.path_of(id),
                    entry.extent.count,
                    expected
                )));
            }

            if entry.extent.is_empty() {
                continue;
            }
            if entry.extent.start.checked_add(entry.extent.count).map_or(true, |end| end > total) {
                return Err(self.inconsistency(format!(
                    "{} extends past block {}",
                    self.namespace.path_of(id),
                    total
                )));
            }

            for block in entry.extent.start..entry.extent.end() {
                if let Some(other) = owners[block] {
                    return Err(self.inconsistency(format!(
                        "block {} claimed by {} and {}",
                        block,
                        self.namespace.path_of(other),
                        self.namespace.path_of(id)
                    )));
                }
                if !self.allocator.is_used(block) {
                    return Err(self.inconsistency(format!(
                        "block {} of {} is marked free",
                        block,
                        self.namespace.path_of(id)
                    )));
                }
                owners[block] = Some(id);
            }
            claimed += entry.extent.count;
        }

        if self.allocator.free_count() != total - claimed {
            return Err(self.inconsistency(format!(
                "{} blocks free, entries account for {} of {}",
                self.allocator.free_count(),
                claimed,
                total
            )));
        }

        if let Some(cwd) = self.namespace.current_dir() {
            if !self.namespace.get(cwd).is_some_and(Entry::is_directory) {
                return Err(self.inconsistency(format!(
                    "current directory {} is not a live directory",
                    cwd
                )));
            }
        }

        Ok(())
    }

    pub(crate) fn set_current_path(&mut self, path: &str) -> Result<()> {
        let dir = self.namespace.resolve_dir_path(path)?;
        self.namespace.set_current_dir(dir)
    }

    fn lookup(&self, name: &str) -> Result<(EntryId, &Entry)> {
        self.namespace
            .resolve(name)
            .and_then(|id| self.namespace.get(id).map(|e| (id, e)))
            .ok_or_else(|| VolumeError::NotFound(self.child_path(name)))
    }

    fn info(&self, id: EntryId) -> EntryInfo {
        let entry = self.namespace.get(id);
        EntryInfo {
            id,
            name: entry.map(|e| e.name.clone()).unwrap_or_default(),
            kind: entry.map(|e| e.kind).unwrap_or(EntryKind::File),
            size: entry.map(|e| e.size).unwrap_or(0),
            start_block: entry.map(|e| e.extent.start).unwrap_or(0),
            block_count: entry.map(|e| e.extent.count).unwrap_or(0),
            path: self.namespace.path_of(id),
            parent_path: self.namespace.parent_path(id),
        }
    }

    /// Validate `name` and make sure the current directory lacks it
    fn ensure_absent(&self, name: &str) -> Result<()> {
        EntryName::new(name)?;
        if self.namespace.resolve(name).is_some() {
            return Err(VolumeError::AlreadyExists(self.child_path(name)));
        }
        Ok(())
    }

    /// Record an entry whose blocks are already marked, undoing the marks on failure
    fn insert_entry(&mut self, entry: Entry) -> Result<EntryId> {
        let extent = entry.extent;
        match self.namespace.create_entry(self.namespace.current_dir(), entry) {
            Ok(id) => Ok(id),
            Err(err) => {
                self.allocator.mark_free(extent.start, extent.count)?;
                Err(err)
            }
        }
    }

    /// Remove `name` from the current directory and release its blocks
    fn remove(&mut self, name: &str) -> Result<()> {
        let (id, entry) = self.lookup(name)?;
        let extent = entry.extent;
        self.ensure_held(id, &extent)?;

        let (_, entry) = self
            .namespace
            .remove_entry(self.namespace.current_dir(), name)?;
        self.allocator.mark_free(extent.start, extent.count)?;

        debug!(
            "Removed {} ({:?}), released {} blocks",
            self.child_path(&entry.name),
            entry.kind,
            extent.count
        );
        Ok(())
    }

    /// Fail loudly if an entry's blocks are not all marked used
    fn ensure_held(&self, id: EntryId, extent: &Extent) -> Result<()> {
        if self.allocator.is_range_used(extent.start, extent.count) {
            return Ok(());
        }
        Err(self.inconsistency(format!(
            "{} owns blocks {}..{} that are not all marked used",
            self.namespace.path_of(id),
            extent.start,
            extent.end()
        )))
    }

    /// Write `bytes` into an extent, zero-filling the rest of its last block
    fn write_extent(&mut self, extent: &Extent, bytes: &[u8]) -> Result<()> {
        if extent.is_empty() {
            return Ok(());
        }
        let offset = self.block_offset(extent.start);
        let span = extent.count * self.block_size();
        self.arena.write(offset, bytes)?;
        self.arena.zero(offset + bytes.len(), span - bytes.len())
    }

    fn inconsistency(&self, message: String) -> VolumeError {
        error!("Allocation inconsistency: {}", message);
        VolumeError::AllocationInconsistency(message)
    }

    fn child_path(&self, name: &str) -> String {
        child_path(&self.namespace.current_path(), name)
    }

    fn region_base(&self) -> usize {
        self.storage_offset * self.block_size()
    }

    fn block_offset(&self, block: usize) -> usize {
        (self.storage_offset + block) * self.block_size()
    }
}

/// Byte offset of a partition region, checking it fits the arena
fn region_base(
    storage_offset: usize,
    block_size: usize,
    partition_size: usize,
    capacity: usize,
) -> Result<usize> {
    let base = storage_offset.checked_mul(block_size);
    match base.and_then(|b| b.checked_add(partition_size)) {
        Some(end) if end <= capacity => Ok(storage_offset * block_size),
        _ => Err(VolumeError::InvalidGeometry(format!(
            "partition of {} bytes at block offset {} exceeds arena capacity {}",
            partition_size, storage_offset, capacity
        ))),
    }
}
