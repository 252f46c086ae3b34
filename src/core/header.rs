//! Fixed-size records of the image format
//!
//! An image is laid out as:
//!
//! ```text
//! Preamble   32 B                 plaintext
//! Header     1088 B               obfuscated when a passphrase is used
//! Entries    entry_count * 1312 B
//! Arena      partition_size B
//! Bitmap     ceil(total_blocks / 8) B
//! ```
//!
//! All integers are little-endian. Strings are NUL-padded to their field width.

use crate::catalog::{Entry, EntryKind, Extent};
use crate::config::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
use crate::error::{Result, VolumeError};
use crate::obfuscation::{Salt, SALT_SIZE};
use crate::validation::{MAX_NAME_LEN, MAX_PATH_LEN};

pub const MAGIC: [u8; 8] = *b"VOLIMG\x00\x01";
pub const HEADER_MAGIC: [u8; 8] = *b"VOLHDR01";
pub const VERSION_MAJOR: u16 = 1;
pub const VERSION_MINOR: u16 = 0;

pub const PREAMBLE_SIZE: usize = 32;
pub const HEADER_SIZE: usize = 1088;
pub const ENTRY_RECORD_SIZE: usize = 1312;

/// Byte offset of the checksum within an encoded header
pub const CHECKSUM_OFFSET: usize = 56;

const NAME_FIELD: usize = MAX_NAME_LEN + 1;
const PATH_FIELD: usize = MAX_PATH_LEN + 1;

/// Preamble flag: everything after the preamble is obfuscated
pub const FLAG_OBFUSCATED: u32 = 1;

/// Plaintext image preamble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub magic: [u8; 8],
    pub version_major: u16,
    pub version_minor: u16,
    pub flags: u32,
    /// Keystream salt, zero when the image is plain
    pub salt: Salt,
}

impl Preamble {
    pub fn new(salt: Option<Salt>) -> Self {
        Preamble {
            magic: MAGIC,
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            flags: if salt.is_some() { FLAG_OBFUSCATED } else { 0 },
            salt: salt.unwrap_or([0u8; SALT_SIZE]),
        }
    }

    pub fn is_obfuscated(&self) -> bool {
        self.flags & FLAG_OBFUSCATED != 0
    }

    /// Check magic and version
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC {
            return Err(VolumeError::CorruptImage("not a volume image".to_string()));
        }

        // Minor revisions are backward compatible, newer ones are not
        if self.version_major != VERSION_MAJOR || self.version_minor > VERSION_MINOR {
            return Err(VolumeError::UnsupportedVersion {
                major: self.version_major,
                minor: self.version_minor,
            });
        }

        if self.flags & !FLAG_OBFUSCATED != 0 {
            return Err(VolumeError::CorruptImage(format!(
                "unknown preamble flags {:#x}",
                self.flags
            )));
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PREAMBLE_SIZE);
        bytes.extend_from_slice(&self.magic);
        bytes.extend_from_slice(&self.version_major.to_le_bytes());
        bytes.extend_from_slice(&self.version_minor.to_le_bytes());
        bytes.extend_from_slice(&self.flags.to_le_bytes());
        bytes.extend_from_slice(&self.salt);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(bytes, PREAMBLE_SIZE, "preamble")?;
        let preamble = Preamble {
            magic: reader.array()?,
            version_major: reader.u16()?,
            version_minor: reader.u16()?,
            flags: reader.u32()?,
            salt: reader.array()?,
        };
        preamble.validate()?;
        Ok(preamble)
    }
}

/// Volume header, first section covered by the keystream
///
/// The inner magic doubles as the passphrase check: a wrong keystream turns
/// it into noise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 8],
    pub block_size: u32,
    pub partition_size: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
    pub storage_offset: u64,
    pub entry_count: u64,
    /// CRC-32 of this header (checksum field zeroed) and the body after it
    pub checksum: u32,
    pub current_path: String,
}

impl Header {
    pub fn new() -> Self {
        Header {
            magic: HEADER_MAGIC,
            block_size: 0,
            partition_size: 0,
            total_blocks: 0,
            free_blocks: 0,
            storage_offset: 0,
            entry_count: 0,
            checksum: 0,
            current_path: "/".to_string(),
        }
    }

    /// Check the header against itself
    pub fn validate(&self) -> Result<()> {
        let block_size = self.block_size as usize;
        if !block_size.is_power_of_two()
            || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
        {
            return Err(VolumeError::CorruptImage(format!(
                "block size {} is not a power of two between {} and {}",
                block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }

        if self.total_blocks != self.partition_size / self.block_size as u64 {
            return Err(VolumeError::CorruptImage(format!(
                "{} blocks do not match a {}-byte partition of {}-byte blocks",
                self.total_blocks, self.partition_size, self.block_size
            )));
        }

        if self.free_blocks > self.total_blocks {
            return Err(VolumeError::CorruptImage(format!(
                "free blocks ({}) exceeds total blocks ({})",
                self.free_blocks, self.total_blocks
            )));
        }

        if !self.current_path.starts_with('/') {
            return Err(VolumeError::CorruptImage(format!(
                "current path '{}' is not absolute",
                self.current_path
            )));
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);

        bytes.extend_from_slice(&self.magic);
        bytes.extend_from_slice(&self.block_size.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&self.partition_size.to_le_bytes());
        bytes.extend_from_slice(&self.total_blocks.to_le_bytes());
        bytes.extend_from_slice(&self.free_blocks.to_le_bytes());
        bytes.extend_from_slice(&self.storage_offset.to_le_bytes());
        bytes.extend_from_slice(&self.entry_count.to_le_bytes());
        bytes.extend_from_slice(&self.checksum.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        write_padded(&mut bytes, &self.current_path, PATH_FIELD)?;

        debug_assert_eq!(bytes.len(), HEADER_SIZE);
        Ok(bytes)
    }

    /// Decode a header
    ///
    /// Fails with `BadPassphrase` when the inner magic is wrong, since that is
    /// what a wrong (or missing) keystream produces.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(bytes, HEADER_SIZE, "header")?;

        let magic: [u8; 8] = reader.array()?;
        if magic != HEADER_MAGIC {
            return Err(VolumeError::BadPassphrase);
        }

        let block_size = reader.u32()?;
        reader.skip(4)?;
        let header = Header {
            magic,
            block_size,
            partition_size: reader.u64()?,
            total_blocks: reader.u64()?,
            free_blocks: reader.u64()?,
            storage_offset: reader.u64()?,
            entry_count: reader.u64()?,
            checksum: {
                let checksum = reader.u32()?;
                reader.skip(4)?;
                checksum
            },
            current_path: reader.padded_str(PATH_FIELD)?,
        };

        header.validate()?;
        Ok(header)
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

/// One entry as stored in an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub entry: Entry,
    pub parent_path: String,
}

impl EntryRecord {
    pub fn new(entry: Entry, parent_path: String) -> Self {
        EntryRecord { entry, parent_path }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(ENTRY_RECORD_SIZE);

        write_padded(&mut bytes, &self.entry.name, NAME_FIELD)?;
        bytes.extend_from_slice(&self.entry.size.to_le_bytes());
        bytes.extend_from_slice(&(self.entry.extent.start as u64).to_le_bytes());
        bytes.extend_from_slice(&(self.entry.extent.count as u64).to_le_bytes());
        bytes.push(self.entry.kind.to_flag());
        bytes.extend_from_slice(&[0u8; 7]);
        write_padded(&mut bytes, &self.parent_path, PATH_FIELD)?;

        debug_assert_eq!(bytes.len(), ENTRY_RECORD_SIZE);
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut reader = FieldReader::new(bytes, ENTRY_RECORD_SIZE, "entry record")?;

        let name = reader.padded_str(NAME_FIELD)?;
        let size = reader.u64()?;
        let start = to_usize(reader.u64()?)?;
        let count = to_usize(reader.u64()?)?;
        let flag = reader.array::<1>()?[0];
        let kind = EntryKind::from_flag(flag)
            .ok_or_else(|| VolumeError::CorruptImage(format!("unknown entry kind {}", flag)))?;
        reader.skip(7)?;
        let parent_path = reader.padded_str(PATH_FIELD)?;

        let extent = Extent::new(start, count);
        let entry = match kind {
            EntryKind::File => Entry::file(name, size, extent),
            EntryKind::Directory => {
                if size != 0 {
                    return Err(VolumeError::CorruptImage(format!(
                        "directory '{}' has size {}",
                        name, size
                    )));
                }
                Entry::directory(name, extent)
            }
        };

        Ok(EntryRecord { entry, parent_path })
    }
}

/// CRC-32 over an encoded header and the body that follows it
///
/// The header's own checksum field is hashed as zeros, so every other header
/// field is covered. Returns `None` when `header` is shorter than a header.
pub fn image_checksum(header: &[u8], body: &[u8]) -> Option<u32> {
    let header = header.get(..HEADER_SIZE)?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[..CHECKSUM_OFFSET]);
    hasher.update(&[0u8; 4]);
    hasher.update(&header[CHECKSUM_OFFSET + 4..]);
    hasher.update(body);
    Some(hasher.finalize())
}

pub(crate) fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| VolumeError::CorruptImage(format!("value {} does not fit in memory", value)))
}

fn write_padded(bytes: &mut Vec<u8>, s: &str, width: usize) -> Result<()> {
    if s.len() >= width || s.as_bytes().contains(&0) {
        return Err(VolumeError::PathTooLong {
            len: s.len(),
            limit: width - 1,
        });
    }
    bytes.extend_from_slice(s.as_bytes());
    bytes.resize(bytes.len() + width - s.len(), 0);
    Ok(())
}

/// Sequential little-endian field reader over a fixed-size record
struct FieldReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    fn new(bytes: &'a [u8], size: usize, what: &str) -> Result<Self> {
        if bytes.len() < size {
            return Err(VolumeError::CorruptImage(format!(
                "{} needs {} bytes, {} available",
                what,
                size,
                bytes.len()
            )));
        }
        Ok(FieldReader {
            bytes: &bytes[..size],
            offset: 0,
        })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.offset + n;
        let slice = self
            .bytes
            .get(self.offset..end)
            .ok_or_else(|| VolumeError::CorruptImage("record truncated".to_string()))?;
        self.offset = end;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn padded_str(&mut self, width: usize) -> Result<String> {
        let field = self.take(width)?;
        let len = field.iter().position(|&b| b == 0).ok_or_else(|| {
            VolumeError::CorruptImage("string field is not NUL-terminated".to_string())
        })?;
        String::from_utf8(field[..len].to_vec())
            .map_err(|_| VolumeError::CorruptImage("string field is not UTF-8".to_string()))
    }
}
