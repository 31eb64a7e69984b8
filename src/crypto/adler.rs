//! Adler-32 checksum
//!
//! Used as the optional integrity field at the start of every frame body.

/// Largest prime smaller than 65536
const MOD_ADLER: u32 = 65521;

/// Largest number of bytes that can be summed before `b` may overflow a u32
const NMAX: usize = 5552;

/// Compute the Adler-32 checksum of `data`
pub fn adler32(data: &[u8]) -> u32 {
    let mut a: u32 = 1;
    let mut b: u32 = 0;

    for chunk in data.chunks(NMAX) {
        for &byte in chunk {
            a += byte as u32;
            b += a;
        }
        a %= MOD_ADLER;
        b %= MOD_ADLER;
    }

    (b << 16) | a
}
