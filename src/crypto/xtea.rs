//! XTEA block cipher
//!
//! Frames are encrypted in place as a sequence of 8-byte blocks, each block
//! being two little-endian u32 words. The key is negotiated per connection
//! during the first message of the login and game protocols.

use std::fmt;

use rand::Rng;

/// Block size in bytes
pub const BLOCK_SIZE: usize = 8;

/// Key schedule constant
const DELTA: u32 = 0x9E37_79B9;

/// Number of Feistel rounds
const ROUNDS: u32 = 32;

/// 128-bit XTEA key
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct XteaKey(pub [u32; 4]);

impl XteaKey {
    /// Create a key from its four words
    pub fn new(words: [u32; 4]) -> Self {
        Self(words)
    }

    /// Generate a random key
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self([rng.gen(), rng.gen(), rng.gen(), rng.gen()])
    }

    /// Key words
    pub fn words(&self) -> &[u32; 4] {
        &self.0
    }
}

impl fmt::Debug for XteaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log key material
        write!(f, "XteaKey(..)")
    }
}

/// Encrypt `data` in place.
///
/// Returns false and leaves `data` untouched when its length is not a
/// multiple of [`BLOCK_SIZE`].
pub fn encrypt(data: &mut [u8], key: &XteaKey) -> bool {
    if data.len() % BLOCK_SIZE != 0 {
        return false;
    }

    let k = key.words();
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        let (mut v0, mut v1) = read_block(block);
        let mut sum: u32 = 0;

        for _ in 0..ROUNDS {
            v0 = v0.wrapping_add(
                (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                    ^ (sum.wrapping_add(k[(sum & 3) as usize])),
            );
            sum = sum.wrapping_add(DELTA);
            v1 = v1.wrapping_add(
                (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                    ^ (sum.wrapping_add(k[((sum >> 11) & 3) as usize])),
            );
        }

        write_block(block, v0, v1);
    }

    true
}

/// Decrypt `data` in place.
///
/// Returns false and leaves `data` untouched when its length is not a
/// multiple of [`BLOCK_SIZE`].
pub fn decrypt(data: &mut [u8], key: &XteaKey) -> bool {
    if data.len() % BLOCK_SIZE != 0 {
        return false;
    }

    let k = key.words();
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        let (mut v0, mut v1) = read_block(block);
        let mut sum: u32 = DELTA.wrapping_mul(ROUNDS);

        for _ in 0..ROUNDS {
            v1 = v1.wrapping_sub(
                (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                    ^ (sum.wrapping_add(k[((sum >> 11) & 3) as usize])),
            );
            sum = sum.wrapping_sub(DELTA);
            v0 = v0.wrapping_sub(
                (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1))
                    ^ (sum.wrapping_add(k[(sum & 3) as usize])),
            );
        }

        write_block(block, v0, v1);
    }

    true
}

#[inline]
fn read_block(block: &[u8]) -> (u32, u32) {
    let v0 = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
    let v1 = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
    (v0, v1)
}

#[inline]
fn write_block(block: &mut [u8], v0: u32, v1: u32) {
    block[..4].copy_from_slice(&v0.to_le_bytes());
    block[4..].copy_from_slice(&v1.to_le_bytes());
}
