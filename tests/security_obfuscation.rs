//! Passphrase obfuscation tests
//!
//! Checks what obfuscation does promise: no plaintext content or names in
//! the image, a fresh salt per save, and rejection of wrong passphrases.

use volstore::header::{FLAG_OBFUSCATED, PREAMBLE_SIZE};
use volstore::{ImageCodec, Volume, VolumeError};

const SECRET: &[u8] = b"the launch code is 0000";

fn volume_with_secret() -> Volume {
    let mut vol = Volume::new(8 * 1024).unwrap();
    vol.mkdir("classified").unwrap();
    vol.cd("classified").unwrap();
    vol.put("codes.txt", SECRET).unwrap();
    vol
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[test]
fn test_plain_image_exposes_content() {
    let bytes = ImageCodec::default().save(&volume_with_secret(), None).unwrap();
    assert!(contains(&bytes, SECRET));
    assert!(contains(&bytes, b"classified"));
}

#[test]
fn test_obfuscated_image_hides_content_and_names() {
    let bytes = ImageCodec::default()
        .save(&volume_with_secret(), Some("correct horse"))
        .unwrap();

    assert!(!contains(&bytes, SECRET));
    assert!(!contains(&bytes, b"classified"));
    assert!(!contains(&bytes, b"codes.txt"));
    assert!(!contains(&bytes, b"correct horse"));
    assert!(!contains(&bytes, b"VOLHDR01"));

    // Only the preamble stays readable
    assert_eq!(&bytes[..8], b"VOLIMG\x00\x01");
    assert_eq!(
        u32::from_le_bytes(bytes[12..16].try_into().unwrap()) & FLAG_OBFUSCATED,
        FLAG_OBFUSCATED
    );
}

#[test]
fn test_each_save_uses_a_fresh_salt() {
    let codec = ImageCodec::default();
    let vol = volume_with_secret();
    let first = codec.save(&vol, Some("pw")).unwrap();
    let second = codec.save(&vol, Some("pw")).unwrap();

    assert_ne!(first[16..PREAMBLE_SIZE], second[16..PREAMBLE_SIZE]);
    assert_ne!(first[PREAMBLE_SIZE..], second[PREAMBLE_SIZE..]);
}

#[test]
fn test_passphrase_is_case_sensitive() {
    let codec = ImageCodec::default();
    let bytes = codec.save(&volume_with_secret(), Some("Secret")).unwrap();

    assert!(matches!(
        codec.load(&bytes, Some("secret")),
        Err(VolumeError::BadPassphrase)
    ));
    let vol = codec.load(&bytes, Some("Secret")).unwrap();
    assert_eq!(vol.read_all("codes.txt").unwrap(), SECRET);
}

#[test]
fn test_tampered_salt_reads_as_bad_passphrase() {
    let codec = ImageCodec::default();
    let mut bytes = codec.save(&volume_with_secret(), Some("pw")).unwrap();
    bytes[20] ^= 0x01;

    assert!(matches!(codec.load(&bytes, Some("pw")), Err(VolumeError::BadPassphrase)));
}

#[test]
fn test_prompt_gives_up_after_attempts() {
    let codec = ImageCodec::default();
    let bytes = codec.save(&volume_with_secret(), Some("pw")).unwrap();

    let mut asked = Vec::new();
    let result = codec.load_with_prompt(&bytes, 3, |attempt| {
        asked.push(attempt);
        Some(format!("guess{}", attempt))
    });
    assert!(matches!(result, Err(VolumeError::BadPassphrase)));
    assert_eq!(asked, vec![1, 2, 3]);

    // Giving up early stops prompting
    let mut calls = 0;
    let result = codec.load_with_prompt(&bytes, 3, |_| {
        calls += 1;
        None
    });
    assert!(matches!(result, Err(VolumeError::BadPassphrase)));
    assert_eq!(calls, 1);
}

#[test]
fn test_obfuscated_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let codec = ImageCodec::default();

    let path = codec
        .save_to_file(&volume_with_secret(), dir.path().join("vault.img"), Some("pw"))
        .unwrap();
    let on_disk = std::fs::read(&path).unwrap();
    assert!(!contains(&on_disk, SECRET));

    let vol = codec.load_from_file(&path, Some("pw")).unwrap();
    assert_eq!(vol.current_path(), "/classified");
    assert_eq!(vol.read_all("codes.txt").unwrap(), SECRET);
}
