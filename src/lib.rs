//! # volstore - Single-Volume File Store
//!
//! `volstore` simulates a small file system inside a fixed-size byte arena:
//!
//! - **Block allocation** from a bitmap, one contiguous run per file
//! - **Flat namespace** of files and directories with a current directory
//! - **Binary images** that save and restore a volume, optionally obfuscated
//!   with a passphrase
//!
//! ## Quick Start
//!
//! ```rust
//! use volstore::{ImageCodec, Result, Volume};
//!
//! # fn main() -> Result<()> {
//! // Ten 1 KiB blocks
//! let mut vol = Volume::new(10 * 1024)?;
//!
//! vol.mkdir("docs")?;
//! vol.cd("docs")?;
//! vol.put("report.txt", b"Hello, World!")?;
//! assert_eq!(vol.read_all("report.txt")?, b"Hello, World!");
//!
//! // Save and restore
//! let codec = ImageCodec::default();
//! let image = codec.save(&vol, Some("passphrase"))?;
//! let restored = codec.load(&image, Some("passphrase"))?;
//! assert_eq!(restored.current_path(), "/docs");
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Geometry
//!
//! ```rust
//! use volstore::{Result, VolumeBuilder, VolumeConfig};
//!
//! # fn main() -> Result<()> {
//! let vol = VolumeBuilder::new()
//!     .partition_size(64 * 1024)
//!     .storage_offset(4)
//!     .config(VolumeConfig { block_size: 4096, ..Default::default() })
//!     .build()?;
//!
//! assert_eq!(vol.total_blocks(), 16);
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use crate::core::{
    allocator, arena, catalog, config, error, header, image, obfuscation, validation, volume,
};

// Re-export core types that users need
pub use crate::core::{
    allocator::{BitmapAllocator, BlockAllocator},
    arena::Arena,
    catalog::{Entry, EntryId, EntryKind, Extent, Namespace},
    config::VolumeConfig,
    error::{Result, VolumeError},
    image::ImageCodec,
    validation::EntryName,
    volume::{EntryInfo, SharedVolume, Volume, VolumeStatus},
};

use tracing::debug;

/// Builder for formatting volumes with custom settings
///
/// # Examples
///
/// ```rust
/// use volstore::VolumeBuilder;
///
/// # fn main() -> volstore::Result<()> {
/// let vol = VolumeBuilder::new()
///     .partition_size(8 * 1024)
///     .storage_offset(2)
///     .arena_capacity(16 * 1024) // Optional: defaults to an exact fit
///     .build()?;
/// assert_eq!(vol.free_blocks(), 8);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct VolumeBuilder {
    partition_size: Option<usize>,
    storage_offset: usize,
    arena_capacity: Option<usize>,
    config: VolumeConfig,
}

impl VolumeBuilder {
    /// Create a new VolumeBuilder with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the partition size in bytes (defaults to the config's `default_partition_size`)
    pub fn partition_size(mut self, bytes: usize) -> Self {
        self.partition_size = Some(bytes);
        self
    }

    /// Set the first arena block the volume occupies
    pub fn storage_offset(mut self, block: usize) -> Self {
        self.storage_offset = block;
        self
    }

    /// Set the arena size in bytes
    pub fn arena_capacity(mut self, bytes: usize) -> Self {
        self.arena_capacity = Some(bytes);
        self
    }

    pub fn config(mut self, config: VolumeConfig) -> Self {
        self.config = config;
        self
    }

    /// Format the volume
    pub fn build(self) -> Result<Volume> {
        self.config.validate()?;
        let partition_size = self
            .partition_size
            .unwrap_or(self.config.default_partition_size);

        let capacity = match self.arena_capacity {
            Some(capacity) => capacity,
            None => self
                .storage_offset
                .checked_mul(self.config.block_size)
                .and_then(|base| base.checked_add(partition_size))
                .ok_or_else(|| {
                    VolumeError::InvalidGeometry(format!(
                        "storage offset {} overflows the address space",
                        self.storage_offset
                    ))
                })?,
        };

        debug!(
            "Building volume: partition {} bytes, offset {}, arena {} bytes",
            partition_size, self.storage_offset, capacity
        );
        Volume::format(
            Arena::new(capacity),
            partition_size,
            self.storage_offset,
            self.config,
        )
    }
}
