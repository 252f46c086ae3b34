//! Passphrase obfuscation for saved images
//!
//! **This is not encryption.** It hides image contents from casual
//! inspection and nothing more: there is no authentication tag, no key
//! stretching, and anyone who can run a dictionary against the passphrase
//! can read the image.
//!
//! **Design**:
//! - A 16-byte random salt is stored in plaintext in the image preamble
//! - Keystream block `i` is `SHA-256(salt || passphrase || i as u64 LE)`
//! - Data is XORed with the keystream from its first byte onward
//! - Applying the same keystream twice restores the input

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Salt size in bytes
pub const SALT_SIZE: usize = 16;

/// Bytes produced per keystream block
const BLOCK_LEN: usize = 32;

pub type Salt = [u8; SALT_SIZE];

/// Generate a random salt
pub fn generate_salt() -> Salt {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Counter-mode keystream derived from a passphrase and salt
#[derive(Clone)]
pub struct Keystream {
    seed: Sha256,
}

impl Keystream {
    pub fn new(passphrase: &str, salt: &Salt) -> Self {
        let mut seed = Sha256::new();
        seed.update(salt);
        seed.update(passphrase.as_bytes());
        Keystream { seed }
    }

    fn block(&self, counter: u64) -> [u8; BLOCK_LEN] {
        let mut hasher = self.seed.clone();
        hasher.update(counter.to_le_bytes());
        hasher.finalize().into()
    }

    /// XOR `data` in place with the keystream starting at byte 0
    pub fn apply(&self, data: &mut [u8]) {
        for (counter, chunk) in data.chunks_mut(BLOCK_LEN).enumerate() {
            let block = self.block(counter as u64);
            for (byte, key) in chunk.iter_mut().zip(block.iter()) {
                *byte ^= key;
            }
        }
    }
}

impl std::fmt::Debug for Keystream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Keystream(..)")
    }
}

/// Obfuscate or restore `data` in place
pub fn apply(passphrase: &str, salt: &Salt, data: &mut [u8]) {
    Keystream::new(passphrase, salt).apply(data);
}
