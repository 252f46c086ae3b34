//! Image corruption detection tests
//!
//! Damaged images must be rejected with an error, never loaded into an
//! inconsistent volume and never panic.

use volstore::header::{
    image_checksum, EntryRecord, Header, Preamble, ENTRY_RECORD_SIZE, HEADER_SIZE, PREAMBLE_SIZE,
};
use volstore::{Entry, Extent, ImageCodec, Volume, VolumeError};

fn sample_image() -> Vec<u8> {
    let mut vol = Volume::new(8 * 1024).unwrap();
    vol.mkdir("docs").unwrap();
    vol.cd("docs").unwrap();
    vol.put("a.txt", &[b'a'; 1500]).unwrap();
    vol.cd("..").unwrap();
    vol.put("b.bin", &[0xB0; 700]).unwrap();
    ImageCodec::default().save(&vol, None).unwrap()
}

/// Rebuild an image around modified sections, fixing up the checksum
fn reassemble(header: &mut Header, body: &[u8]) -> Vec<u8> {
    header.checksum = image_checksum(&header.to_bytes().unwrap(), body).unwrap();
    let mut bytes = Preamble::new(None).to_bytes();
    bytes.extend_from_slice(&header.to_bytes().unwrap());
    bytes.extend_from_slice(body);
    bytes
}

fn split(bytes: &[u8]) -> (Header, Vec<u8>) {
    let header = Header::from_bytes(&bytes[PREAMBLE_SIZE..]).unwrap();
    (header, bytes[PREAMBLE_SIZE + HEADER_SIZE..].to_vec())
}

#[test]
fn test_every_truncation_is_rejected() {
    let bytes = sample_image();
    let codec = ImageCodec::default();

    for len in [0, 10, PREAMBLE_SIZE, PREAMBLE_SIZE + 500, bytes.len() - 1] {
        assert!(
            codec.load(&bytes[..len], None).is_err(),
            "truncated image of {} bytes loaded",
            len
        );
    }
}

#[test]
fn test_trailing_garbage_is_rejected() {
    let mut bytes = sample_image();
    bytes.extend_from_slice(b"junk");
    assert!(matches!(
        ImageCodec::default().load(&bytes, None),
        Err(VolumeError::CorruptImage(_))
    ));
}

#[test]
fn test_bit_flips_are_detected() {
    let bytes = sample_image();
    let codec = ImageCodec::default();

    // One flip in each body section: entries, arena, bitmap
    let body_start = PREAMBLE_SIZE + HEADER_SIZE;
    for offset in [body_start + 3, body_start + 3 * ENTRY_RECORD_SIZE + 10, bytes.len() - 1] {
        let mut damaged = bytes.clone();
        damaged[offset] ^= 0x40;
        assert!(
            matches!(codec.load(&damaged, None), Err(VolumeError::CorruptImage(_))),
            "flip at {} not detected",
            offset
        );
    }
}

#[test]
fn test_bad_magic_and_version() {
    let codec = ImageCodec::default();

    let mut bytes = sample_image();
    bytes[..8].copy_from_slice(b"NOTANIMG");
    assert!(matches!(codec.load(&bytes, None), Err(VolumeError::CorruptImage(_))));

    let mut bytes = sample_image();
    bytes[8..10].copy_from_slice(&7u16.to_le_bytes());
    assert!(matches!(
        codec.load(&bytes, None),
        Err(VolumeError::UnsupportedVersion { major: 7, .. })
    ));
}

#[test]
fn test_overlapping_extents_are_rejected() {
    let (mut header, mut body) = split(&sample_image());

    // Point b.bin at the block held by /docs
    let records: Vec<EntryRecord> = body[..3 * ENTRY_RECORD_SIZE]
        .chunks_exact(ENTRY_RECORD_SIZE)
        .map(|chunk| EntryRecord::from_bytes(chunk).unwrap())
        .collect();
    let docs = records.iter().find(|r| r.entry.name == "docs").unwrap();
    let idx = records.iter().position(|r| r.entry.name == "b.bin").unwrap();

    let mut moved = records[idx].clone();
    moved.entry.extent = docs.entry.extent;
    body[idx * ENTRY_RECORD_SIZE..(idx + 1) * ENTRY_RECORD_SIZE]
        .copy_from_slice(&moved.to_bytes().unwrap());

    let bytes = reassemble(&mut header, &body);
    assert!(matches!(
        ImageCodec::default().load(&bytes, None),
        Err(VolumeError::CorruptImage(_))
    ));
}

#[test]
fn test_free_count_disagreement_is_rejected() {
    let (mut header, body) = split(&sample_image());
    header.free_blocks -= 1;

    let bytes = reassemble(&mut header, &body);
    assert!(matches!(
        ImageCodec::default().load(&bytes, None),
        Err(VolumeError::CorruptImage(_))
    ));
}

#[test]
fn test_orphaned_entry_is_rejected() {
    let (mut header, mut body) = split(&sample_image());

    let orphan = EntryRecord::new(Entry::file("lost", 0, Extent::default()), "/nowhere".into());
    let mut entries = orphan.to_bytes().unwrap();
    entries.extend_from_slice(&body);
    body = entries;
    header.entry_count += 1;

    let bytes = reassemble(&mut header, &body);
    assert!(matches!(
        ImageCodec::default().load(&bytes, None),
        Err(VolumeError::CorruptImage(_))
    ));
}

#[test]
fn test_duplicate_sibling_is_rejected() {
    let (mut header, body) = split(&sample_image());

    let dup = EntryRecord::new(Entry::file("b.bin", 0, Extent::default()), "/".into());
    let mut with_dup = dup.to_bytes().unwrap();
    with_dup.extend_from_slice(&body);
    header.entry_count += 1;

    let bytes = reassemble(&mut header, &with_dup);
    assert!(matches!(
        ImageCodec::default().load(&bytes, None),
        Err(VolumeError::CorruptImage(_))
    ));
}

#[test]
fn test_dangling_current_path_is_rejected() {
    let (mut header, body) = split(&sample_image());
    header.current_path = "/gone".to_string();

    let bytes = reassemble(&mut header, &body);
    assert!(matches!(
        ImageCodec::default().load(&bytes, None),
        Err(VolumeError::CorruptImage(_))
    ));
}

#[test]
fn test_declared_sizes_that_overflow() {
    let (mut header, body) = split(&sample_image());
    header.entry_count = u64::MAX / 2;

    let bytes = reassemble(&mut header, &body);
    assert!(matches!(
        ImageCodec::default().load(&bytes, None),
        Err(VolumeError::CorruptImage(_))
    ));
}

/// Re-encode the header in place, leaving the stored checksum as it was
fn rewrite_header(bytes: &[u8], header: &Header) -> Vec<u8> {
    let mut damaged = bytes.to_vec();
    damaged[PREAMBLE_SIZE..PREAMBLE_SIZE + HEADER_SIZE].copy_from_slice(&header.to_bytes().unwrap());
    damaged
}

#[test]
fn test_rewritten_storage_offset_is_rejected() {
    let bytes = sample_image();
    let codec = ImageCodec::default();

    for offset in [1u64, 1 << 20, 1 << 44, u64::MAX] {
        let (mut header, body) = split(&bytes);
        header.storage_offset = offset;

        // Stale checksum
        let damaged = rewrite_header(&bytes, &header);
        assert!(
            matches!(codec.load(&damaged, None), Err(VolumeError::CorruptImage(_))),
            "offset {} with stale checksum loaded",
            offset
        );

        // Resealed: only 1 still describes a region small enough to load
        let resealed = reassemble(&mut header, &body);
        let result = codec.load(&resealed, None);
        if offset == 1 {
            assert_eq!(result.unwrap().storage_offset(), 1);
        } else {
            assert!(
                matches!(result, Err(VolumeError::CorruptImage(_))),
                "resealed offset {} loaded",
                offset
            );
        }
    }
}

#[test]
fn test_rewritten_block_size_is_rejected() {
    let bytes = sample_image();

    for block_size in [3u32, 1 << 20] {
        let (mut header, body) = split(&bytes);
        header.block_size = block_size;
        header.total_blocks = header.partition_size / block_size as u64;

        let resealed = reassemble(&mut header, &body);
        assert!(
            matches!(
                ImageCodec::default().load(&resealed, None),
                Err(VolumeError::CorruptImage(_))
            ),
            "block size {} loaded",
            block_size
        );
    }
}
