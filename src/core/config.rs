//! Volume configuration
//!
//! Settings are plain serde data so they can come from a TOML file:
//!
//! ```toml
//! block_size = 1024
//! passphrase_attempts = 3
//! default_partition_size = 102400
//! max_arena_size = 1073741824
//! ```

use crate::error::{Result, VolumeError};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_BLOCK_SIZE: usize = 1024;
pub const DEFAULT_PASSPHRASE_ATTEMPTS: u32 = 3;
pub const DEFAULT_PARTITION_SIZE: usize = 102_400;
pub const DEFAULT_MAX_ARENA_SIZE: usize = 1 << 30;

pub const MIN_BLOCK_SIZE: usize = 64;
pub const MAX_BLOCK_SIZE: usize = 65_536;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VolumeConfig {
    /// Allocation unit in bytes (power of two, 64..=65536)
    pub block_size: usize,

    /// How many passphrases an interactive load may try before giving up
    pub passphrase_attempts: u32,

    /// Partition size offered when the shell formats a new volume
    pub default_partition_size: usize,

    /// Largest arena `ImageCodec::load` will allocate for an image's region
    pub max_arena_size: usize,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        VolumeConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            passphrase_attempts: DEFAULT_PASSPHRASE_ATTEMPTS,
            default_partition_size: DEFAULT_PARTITION_SIZE,
            max_arena_size: DEFAULT_MAX_ARENA_SIZE,
        }
    }
}

impl VolumeConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: VolumeConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        tracing::debug!("Loaded volume config from {:?}", path.as_ref());
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&self.block_size)
        {
            return Err(VolumeError::Config(format!(
                "block_size must be a power of two between {} and {}, got {}",
                MIN_BLOCK_SIZE, MAX_BLOCK_SIZE, self.block_size
            )));
        }

        if self.passphrase_attempts == 0 {
            return Err(VolumeError::Config(
                "passphrase_attempts must be at least 1".to_string(),
            ));
        }

        if self.max_arena_size < self.block_size {
            return Err(VolumeError::Config(format!(
                "max_arena_size must hold at least one block, got {}",
                self.max_arena_size
            )));
        }

        Ok(())
    }
}
