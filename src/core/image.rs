//! Image encoding and decoding
//!
//! [`ImageCodec`] turns a [`Volume`] into a single self-describing blob and
//! back. See [`crate::header`] for the byte layout. A passphrase, when given,
//! obfuscates everything after the plaintext preamble; see
//! [`crate::obfuscation`] for what that does and does not protect against.

use crate::allocator::{BitmapAllocator, BlockAllocator};
use crate::arena::Arena;
use crate::catalog::Namespace;
use crate::config::VolumeConfig;
use crate::error::{Result, VolumeError};
use crate::header::{
    image_checksum, to_usize, EntryRecord, Header, Preamble, ENTRY_RECORD_SIZE, HEADER_SIZE,
    PREAMBLE_SIZE,
};
use crate::obfuscation::{self, Keystream};
use crate::validation::normalize_image_path;
use crate::volume::Volume;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Image codec
///
/// Carries the configuration applied to loaded volumes. The block size of a
/// loaded volume always comes from the image itself.
#[derive(Debug, Clone, Default)]
pub struct ImageCodec {
    config: VolumeConfig,
}

impl ImageCodec {
    pub fn new(config: VolumeConfig) -> Self {
        ImageCodec { config }
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Serialize a volume
    ///
    /// With a passphrase, a fresh random salt is drawn and every byte after
    /// the preamble is XORed with the keystream. The passphrase itself is not
    /// stored.
    pub fn save(&self, volume: &Volume, passphrase: Option<&str>) -> Result<Vec<u8>> {
        let namespace = volume.namespace();

        let mut body = Vec::with_capacity(
            namespace.len() * ENTRY_RECORD_SIZE
                + volume.partition_size()
                + BitmapAllocator::byte_len(volume.total_blocks()),
        );
        for (id, entry) in namespace.iter() {
            let record = EntryRecord::new(entry.clone(), namespace.parent_path(id));
            body.extend_from_slice(&record.to_bytes()?);
        }
        body.extend_from_slice(volume.partition_bytes()?);
        body.extend_from_slice(&volume.allocator().to_bytes());

        let mut header = Header {
            block_size: volume.block_size() as u32,
            partition_size: volume.partition_size() as u64,
            total_blocks: volume.total_blocks() as u64,
            free_blocks: volume.free_blocks() as u64,
            storage_offset: volume.storage_offset() as u64,
            entry_count: namespace.len() as u64,
            current_path: volume.current_path(),
            ..Header::new()
        };
        let unsealed = header.to_bytes()?;
        header.checksum = image_checksum(&unsealed, &body).ok_or_else(|| {
            VolumeError::CorruptImage("encoded header is truncated".to_string())
        })?;

        let salt = passphrase.map(|_| obfuscation::generate_salt());
        let preamble = Preamble::new(salt);

        let mut bytes = Vec::with_capacity(PREAMBLE_SIZE + HEADER_SIZE + body.len());
        bytes.extend_from_slice(&preamble.to_bytes());
        bytes.extend_from_slice(&header.to_bytes()?);
        bytes.extend_from_slice(&body);

        if let (Some(passphrase), Some(salt)) = (passphrase, salt) {
            Keystream::new(passphrase, &salt).apply(&mut bytes[PREAMBLE_SIZE..]);
        }

        info!(
            "Saved volume image: {} bytes, {} entries, obfuscated: {}",
            bytes.len(),
            header.entry_count,
            preamble.is_obfuscated()
        );
        Ok(bytes)
    }

    /// Whether an image needs a passphrase to load
    pub fn is_obfuscated(bytes: &[u8]) -> Result<bool> {
        Ok(Preamble::from_bytes(bytes)?.is_obfuscated())
    }

    /// Deserialize a volume into a fresh arena sized to fit its region
    ///
    /// Regions larger than the configured `max_arena_size` are rejected
    /// before anything is allocated.
    pub fn load(&self, bytes: &[u8], passphrase: Option<&str>) -> Result<Volume> {
        let (header, body) = self.open(bytes, passphrase)?;

        let capacity = region_end(&header)?;
        if capacity > self.config.max_arena_size {
            return Err(VolumeError::CorruptImage(format!(
                "image region ends at byte {}, past the {}-byte arena limit",
                capacity, self.config.max_arena_size
            )));
        }
        let arena = Arena::try_new(capacity).map_err(into_corrupt)?;
        self.assemble(header, &body, arena)
    }

    /// Deserialize a volume into an existing arena
    ///
    /// The image's region is copied to its recorded storage offset. Bytes
    /// outside that region are left alone.
    pub fn load_into(&self, bytes: &[u8], passphrase: Option<&str>, arena: Arena) -> Result<Volume> {
        let (header, body) = self.open(bytes, passphrase)?;

        let end = region_end(&header)?;
        if end > arena.capacity() {
            return Err(VolumeError::InvalidGeometry(format!(
                "image region ends at byte {}, arena holds {}",
                end,
                arena.capacity()
            )));
        }
        self.assemble(header, &body, arena)
    }

    /// Load an image, asking `prompt` for passphrases as needed
    ///
    /// Plain images load without calling `prompt`. Obfuscated ones get up to
    /// `max_attempts` tries; `prompt` receives the 1-based attempt number and
    /// may return `None` to give up early.
    pub fn load_with_prompt<F>(&self, bytes: &[u8], max_attempts: u32, mut prompt: F) -> Result<Volume>
    where
        F: FnMut(u32) -> Option<String>,
    {
        if !Self::is_obfuscated(bytes)? {
            return self.load(bytes, None);
        }

        for attempt in 1..=max_attempts {
            let Some(passphrase) = prompt(attempt) else {
                break;
            };
            match self.load(bytes, Some(&passphrase)) {
                Err(VolumeError::BadPassphrase) => {
                    warn!("Passphrase rejected (attempt {} of {})", attempt, max_attempts);
                }
                result => return result,
            }
        }

        Err(VolumeError::BadPassphrase)
    }

    /// Save a volume to a file, replacing it atomically
    ///
    /// A `.img` extension is added when missing. The image is written to a
    /// sibling temporary file, synced, then renamed over the target. Returns
    /// the path actually written.
    pub fn save_to_file<P: AsRef<Path>>(
        &self,
        volume: &Volume,
        path: P,
        passphrase: Option<&str>,
    ) -> Result<PathBuf> {
        let path = normalize_image_path(path.as_ref());
        let bytes = self.save(volume, passphrase)?;

        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);

        let written = File::create(&tmp_path).and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        });
        if let Err(err) = written.and_then(|_| fs::rename(&tmp_path, &path)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }

        info!("Wrote volume image to {:?}", path);
        Ok(path)
    }

    /// Read and deserialize an image file
    pub fn load_from_file<P: AsRef<Path>>(&self, path: P, passphrase: Option<&str>) -> Result<Volume> {
        let bytes = fs::read(path.as_ref())?;
        debug!("Read {} bytes from {:?}", bytes.len(), path.as_ref());
        self.load(&bytes, passphrase)
    }

    /// Check the preamble, undo obfuscation and decode the header
    ///
    /// Returns the header and the body following it.
    fn open(&self, bytes: &[u8], passphrase: Option<&str>) -> Result<(Header, Vec<u8>)> {
        let preamble = Preamble::from_bytes(bytes)?;
        let mut plain = bytes[PREAMBLE_SIZE..].to_vec();

        if preamble.is_obfuscated() {
            let passphrase = passphrase.ok_or(VolumeError::BadPassphrase)?;
            Keystream::new(passphrase, &preamble.salt).apply(&mut plain);
        } else if passphrase.is_some() {
            debug!("Image is not obfuscated, ignoring passphrase");
        }

        let header = Header::from_bytes(&plain)?;
        let body = plain.split_off(HEADER_SIZE);

        let expected = body_len(&header)?;
        if body.len() != expected {
            return Err(VolumeError::CorruptImage(format!(
                "image body is {} bytes, header declares {}",
                body.len(),
                expected
            )));
        }

        let checksum = image_checksum(&plain, &body)
            .ok_or_else(|| VolumeError::CorruptImage("header truncated".to_string()))?;
        if checksum != header.checksum {
            return Err(VolumeError::CorruptImage(format!(
                "checksum mismatch: stored {:#010x}, computed {:#010x}",
                header.checksum, checksum
            )));
        }

        Ok((header, body))
    }

    fn assemble(&self, header: Header, body: &[u8], mut arena: Arena) -> Result<Volume> {
        let entry_count = to_usize(header.entry_count)?;
        let partition_size = to_usize(header.partition_size)?;
        let total_blocks = to_usize(header.total_blocks)?;
        let storage_offset = to_usize(header.storage_offset)?;
        let block_size = header.block_size as usize;

        let (entries, rest) = body.split_at(entry_count * ENTRY_RECORD_SIZE);
        let (partition, bitmap) = rest.split_at(partition_size);

        let records = entries
            .chunks_exact(ENTRY_RECORD_SIZE)
            .map(|chunk| EntryRecord::from_bytes(chunk).map(|r| (r.entry, r.parent_path)))
            .collect::<Result<Vec<_>>>()?;
        let namespace = Namespace::from_records(records)?;

        let allocator = BitmapAllocator::from_bytes(bitmap, total_blocks)?;
        if allocator.free_count() as u64 != header.free_blocks {
            return Err(VolumeError::CorruptImage(format!(
                "header declares {} free blocks, bitmap has {}",
                header.free_blocks,
                allocator.free_count()
            )));
        }

        arena.write(storage_offset * block_size, partition)?;

        let config = VolumeConfig {
            block_size,
            ..self.config.clone()
        };
        let mut volume = Volume::from_parts(
            config,
            partition_size,
            storage_offset,
            allocator,
            namespace,
            arena,
        )
        .map_err(into_corrupt)?;
        volume
            .set_current_path(&header.current_path)
            .map_err(into_corrupt)?;

        info!(
            "Loaded volume: {} entries, {} of {} blocks free",
            entry_count,
            volume.free_blocks(),
            total_blocks
        );
        Ok(volume)
    }
}

/// Length of entries, arena slice and bitmap declared by a header
fn body_len(header: &Header) -> Result<usize> {
    let entries = to_usize(header.entry_count)?.checked_mul(ENTRY_RECORD_SIZE);
    let partition = to_usize(header.partition_size)?;
    let bitmap = to_usize(header.total_blocks)?.div_ceil(8);

    entries
        .and_then(|e| e.checked_add(partition))
        .and_then(|n| n.checked_add(bitmap))
        .ok_or_else(|| VolumeError::CorruptImage("declared sizes overflow".to_string()))
}

/// First byte past the image's region in an arena
fn region_end(header: &Header) -> Result<usize> {
    to_usize(header.storage_offset)?
        .checked_mul(header.block_size as usize)
        .and_then(|base| base.checked_add(to_usize(header.partition_size).ok()?))
        .ok_or_else(|| VolumeError::CorruptImage("storage offset overflows".to_string()))
}

/// Decoded state that fails volume checks means the image is bad
fn into_corrupt(err: VolumeError) -> VolumeError {
    match err {
        VolumeError::AllocationInconsistency(msg)
        | VolumeError::InvalidGeometry(msg)
        | VolumeError::Config(msg) => VolumeError::CorruptImage(msg),
        VolumeError::NotFound(path) | VolumeError::NotADirectory(path) => {
            VolumeError::CorruptImage(format!("current path '{}' does not resolve", path))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> Volume {
        let mut vol = Volume::new(16 * 1024).unwrap();
        vol.mkdir("docs").unwrap();
        vol.put("top.bin", &[0xAB; 1500]).unwrap();
        vol.cd("docs").unwrap();
        vol.put("note.txt", b"hello volume").unwrap();
        vol
    }

    #[test]
    fn test_round_trip_plain() {
        let codec = ImageCodec::default();
        let vol = populated();
        let bytes = codec.save(&vol, None).unwrap();

        let loaded = codec.load(&bytes, None).unwrap();
        assert_eq!(loaded.current_path(), "/docs");
        assert_eq!(loaded.free_blocks(), vol.free_blocks());
        assert_eq!(loaded.read_all("note.txt").unwrap(), b"hello volume");
        assert_eq!(loaded.allocator(), vol.allocator());
        assert_eq!(loaded.partition_bytes().unwrap(), vol.partition_bytes().unwrap());
    }

    #[test]
    fn test_image_size() {
        let codec = ImageCodec::default();
        let vol = populated();
        let bytes = codec.save(&vol, None).unwrap();
        assert_eq!(
            bytes.len(),
            PREAMBLE_SIZE + HEADER_SIZE + 3 * ENTRY_RECORD_SIZE + 16 * 1024 + 2
        );
    }

    #[test]
    fn test_round_trip_obfuscated() {
        let codec = ImageCodec::default();
        let vol = populated();
        let bytes = codec.save(&vol, Some("hunter2")).unwrap();

        assert!(ImageCodec::is_obfuscated(&bytes).unwrap());
        assert!(!bytes.windows(12).any(|w| w == b"hello volume"));

        let loaded = codec.load(&bytes, Some("hunter2")).unwrap();
        assert_eq!(loaded.read_all("note.txt").unwrap(), b"hello volume");
    }

    #[test]
    fn test_wrong_or_missing_passphrase() {
        let codec = ImageCodec::default();
        let bytes = codec.save(&populated(), Some("right")).unwrap();

        assert!(matches!(
            codec.load(&bytes, Some("wrong")),
            Err(VolumeError::BadPassphrase)
        ));
        assert!(matches!(codec.load(&bytes, None), Err(VolumeError::BadPassphrase)));
    }

    #[test]
    fn test_load_with_prompt_retries() {
        let codec = ImageCodec::default();
        let bytes = codec.save(&populated(), Some("third")).unwrap();

        let guesses = ["first", "second", "third"];
        let vol = codec
            .load_with_prompt(&bytes, 3, |n| Some(guesses[n as usize - 1].to_string()))
            .unwrap();
        assert_eq!(vol.current_path(), "/docs");

        let mut calls = 0;
        let result = codec.load_with_prompt(&bytes, 2, |_| {
            calls += 1;
            Some("nope".to_string())
        });
        assert!(matches!(result, Err(VolumeError::BadPassphrase)));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_load_with_prompt_skips_plain_images() {
        let codec = ImageCodec::default();
        let bytes = codec.save(&populated(), None).unwrap();
        let vol = codec
            .load_with_prompt(&bytes, 3, |_| panic!("should not prompt"))
            .unwrap();
        assert_eq!(vol.namespace().len(), 3);
    }

    #[test]
    fn test_truncated_image_is_corrupt() {
        let codec = ImageCodec::default();
        let bytes = codec.save(&populated(), None).unwrap();
        assert!(matches!(
            codec.load(&bytes[..bytes.len() - 1], None),
            Err(VolumeError::CorruptImage(_))
        ));
    }

    #[test]
    fn test_flipped_payload_byte_fails_checksum() {
        let codec = ImageCodec::default();
        let mut bytes = codec.save(&populated(), None).unwrap();
        let last = bytes.len() - 100;
        bytes[last] ^= 0x01;
        assert!(matches!(
            codec.load(&bytes, None),
            Err(VolumeError::CorruptImage(_))
        ));
    }

    #[test]
    fn test_header_edit_fails_checksum() {
        let codec = ImageCodec::default();
        let mut bytes = codec.save(&populated(), None).unwrap();
        // Low byte of free_blocks
        bytes[PREAMBLE_SIZE + 32] ^= 0x01;
        assert!(matches!(
            codec.load(&bytes, None),
            Err(VolumeError::CorruptImage(_))
        ));
    }

    #[test]
    fn test_load_respects_arena_limit() {
        let vol = Volume::format(Arena::new(8 * 1024), 4 * 1024, 4, VolumeConfig::default())
            .unwrap();
        let bytes = ImageCodec::default().save(&vol, None).unwrap();

        let strict = ImageCodec::new(VolumeConfig {
            max_arena_size: 6 * 1024,
            ..Default::default()
        });
        assert!(matches!(
            strict.load(&bytes, None),
            Err(VolumeError::CorruptImage(_))
        ));

        // load_into allocates nothing, so only the arena's size matters
        let loaded = strict.load_into(&bytes, None, Arena::new(8 * 1024)).unwrap();
        assert_eq!(loaded.storage_offset(), 4);
    }

    #[test]
    fn test_load_into_preserves_offset() {
        let codec = ImageCodec::default();
        let mut vol =
            Volume::format(Arena::new(8 * 1024), 4 * 1024, 2, VolumeConfig::default()).unwrap();
        vol.put("f", b"offset data").unwrap();
        let bytes = codec.save(&vol, None).unwrap();

        let loaded = codec.load_into(&bytes, None, Arena::new(8 * 1024)).unwrap();
        assert_eq!(loaded.storage_offset(), 2);
        assert_eq!(loaded.arena().read(2 * 1024, 11).unwrap(), b"offset data");

        assert!(matches!(
            codec.load_into(&bytes, None, Arena::new(4 * 1024)),
            Err(VolumeError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_save_to_file_adds_extension() {
        let dir = tempfile::tempdir().unwrap();
        let codec = ImageCodec::default();
        let vol = populated();

        let path = codec.save_to_file(&vol, dir.path().join("disk"), None).unwrap();
        assert_eq!(path, dir.path().join("disk.img"));
        assert!(!dir.path().join("disk.img.tmp").exists());

        let loaded = codec.load_from_file(&path, None).unwrap();
        assert_eq!(loaded.read_all("note.txt").unwrap(), b"hello volume");
    }
}
