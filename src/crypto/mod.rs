//! Cryptography module
//!
//! This module provides the primitives used by the frame codec:
//! - Adler-32 checksum for frame integrity
//! - XTEA block cipher for per-connection message encryption

pub mod adler;
pub mod xtea;

// Re-export commonly used types
pub use adler::adler32;
pub use xtea::XteaKey;
