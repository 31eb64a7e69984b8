//! Message buffer implementation
//!
//! A fixed-capacity binary buffer with a typed little-endian cursor. The same
//! storage serves both directions:
//! - Inbound: the connection reads the 2-byte length header into the front of
//!   the buffer and the body right after it, then protocols read from it.
//! - Outbound: payload is written starting at [`INITIAL_BUFFER_POSITION`],
//!   leaving a reserved gap in front so length, checksum and inner-length
//!   headers can be prepended once the body is complete, without a copy.
//!
//! Reads and writes never panic on bounds. A refused write leaves the buffer
//! untouched, a short read returns a zero value, and both set a sticky
//! overrun flag that protocols check to detect truncation.

use std::fmt;
use std::ops::{Deref, DerefMut};

use crate::crypto::{adler32, xtea, XteaKey};
use crate::net::pool::Poolable;

/// Total bytes of storage per message (16 KiB minus cursor bookkeeping)
pub const MESSAGE_CAPACITY: usize = 16_368;

/// Size of the frame length header
pub const HEADER_LENGTH: usize = 2;

/// Size of the optional Adler-32 checksum field
pub const CHECKSUM_LENGTH: usize = 4;

/// Encrypted bodies are padded to a multiple of this
pub const XTEA_MULTIPLE: usize = 8;

/// Largest frame body accepted on the wire (exclusive upper bound)
pub const MAX_BODY_LENGTH: usize = MESSAGE_CAPACITY - HEADER_LENGTH - CHECKSUM_LENGTH - XTEA_MULTIPLE;

/// Largest payload a protocol may write into one message
pub const MAX_PROTOCOL_BODY_LENGTH: usize = MAX_BODY_LENGTH - 16;

/// Where outbound payload starts; the bytes before it are the header gap
pub const INITIAL_BUFFER_POSITION: usize = 8;

/// Fixed-capacity message buffer
pub struct NetworkMessage {
    /// Backing storage, always `MESSAGE_CAPACITY` bytes
    buffer: Box<[u8]>,
    /// First valid byte
    start: usize,
    /// One past the last valid byte
    end: usize,
    /// Read cursor
    position: usize,
    /// Set when a write was refused or a read came up short
    overrun: bool,
}

impl NetworkMessage {
    /// Create an empty message ready for writing
    pub fn new() -> Self {
        Self {
            buffer: vec![0u8; MESSAGE_CAPACITY].into_boxed_slice(),
            start: INITIAL_BUFFER_POSITION,
            end: INITIAL_BUFFER_POSITION,
            position: INITIAL_BUFFER_POSITION,
            overrun: false,
        }
    }

    /// Create a message holding a received frame body
    pub fn from_body(body: &[u8]) -> Self {
        let mut msg = Self::new();
        let len = body.len().min(MESSAGE_CAPACITY - HEADER_LENGTH);
        msg.prepare_body(len).copy_from_slice(&body[..len]);
        msg
    }

    /// Reset cursors for reuse
    pub fn reset(&mut self) {
        self.start = INITIAL_BUFFER_POSITION;
        self.end = INITIAL_BUFFER_POSITION;
        self.position = INITIAL_BUFFER_POSITION;
        self.overrun = false;
    }

    // ============ Inbound Framing ============

    /// Prepare to receive a frame header; returns the slice to fill
    pub fn prepare_header(&mut self) -> &mut [u8] {
        self.start = 0;
        self.end = HEADER_LENGTH;
        self.position = 0;
        self.overrun = false;
        &mut self.buffer[..HEADER_LENGTH]
    }

    /// Body length announced by the received header
    pub fn length_header(&self) -> u16 {
        u16::from_le_bytes([self.buffer[0], self.buffer[1]])
    }

    /// Prepare to receive `len` body bytes; returns the slice to fill
    ///
    /// The read cursor is placed at the start of the body.
    pub fn prepare_body(&mut self, len: usize) -> &mut [u8] {
        let len = len.min(MESSAGE_CAPACITY - HEADER_LENGTH);
        self.start = HEADER_LENGTH;
        self.end = HEADER_LENGTH + len;
        self.position = HEADER_LENGTH;
        self.overrun = false;
        &mut self.buffer[HEADER_LENGTH..HEADER_LENGTH + len]
    }

    // ============ Properties ============

    /// Number of valid bytes in the message
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Check if the message holds no bytes
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Current read position, relative to the first valid byte
    #[inline]
    pub fn position(&self) -> usize {
        self.position - self.start
    }

    /// Number of bytes left to read
    #[inline]
    pub fn remaining(&self) -> usize {
        self.end.saturating_sub(self.position)
    }

    /// Whether a write was refused or a read came up short
    #[inline]
    pub fn is_overrun(&self) -> bool {
        self.overrun
    }

    /// All valid bytes
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.buffer[self.start..self.end]
    }

    /// Bytes from the read cursor to the end
    #[inline]
    pub fn unread(&self) -> &[u8] {
        &self.buffer[self.position..self.end]
    }

    /// Mutable view of the bytes from the read cursor to the end
    #[inline]
    pub fn unread_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.position..self.end]
    }

    /// Whether `size` more bytes can be read
    #[inline]
    pub fn can_read(&self, size: usize) -> bool {
        self.position + size <= self.end
    }

    /// Whether `size` more bytes can be written without exceeding the
    /// protocol body limit
    #[inline]
    pub fn can_add(&self, size: usize) -> bool {
        self.end + size <= INITIAL_BUFFER_POSITION + MAX_PROTOCOL_BODY_LENGTH
    }

    /// Move the read cursor; negative counts rewind
    ///
    /// The cursor is clamped to the valid region and the overrun flag is set
    /// if clamping was needed.
    pub fn skip_bytes(&mut self, count: i64) {
        let target = self.position as i64 + count;
        if target < self.start as i64 {
            self.position = self.start;
            self.overrun = true;
        } else if target > self.end as i64 {
            self.position = self.end;
            self.overrun = true;
        } else {
            self.position = target as usize;
        }
    }

    /// Drop everything after `len` unread bytes
    pub fn truncate_unread(&mut self, len: usize) {
        self.end = self.position + len.min(self.remaining());
    }

    /// Replace the unread bytes with `data`; returns false if it does not fit
    pub fn replace_unread(&mut self, data: &[u8]) -> bool {
        if self.position + data.len() > MESSAGE_CAPACITY {
            return false;
        }
        self.buffer[self.position..self.position + data.len()].copy_from_slice(data);
        self.end = self.position + data.len();
        true
    }

    // ============ Reading Methods ============

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        if !self.can_read(N) {
            self.overrun = true;
            return None;
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buffer[self.position..self.position + N]);
        self.position += N;
        Some(out)
    }

    /// Read an unsigned byte
    pub fn get_byte(&mut self) -> u8 {
        self.read_array::<1>().map(|b| b[0]).unwrap_or(0)
    }

    /// Read a little-endian u16
    pub fn get_u16(&mut self) -> u16 {
        self.read_array().map(u16::from_le_bytes).unwrap_or(0)
    }

    /// Read a little-endian u32
    pub fn get_u32(&mut self) -> u32 {
        self.read_array().map(u32::from_le_bytes).unwrap_or(0)
    }

    /// Read a little-endian u64
    pub fn get_u64(&mut self) -> u64 {
        self.read_array().map(u64::from_le_bytes).unwrap_or(0)
    }

    /// Peek at the next byte without advancing
    pub fn peek_byte(&self) -> u8 {
        if self.can_read(1) {
            self.buffer[self.position]
        } else {
            0
        }
    }

    /// Read exactly `length` bytes, or nothing if fewer remain
    pub fn get_bytes(&mut self, length: usize) -> Vec<u8> {
        if !self.can_read(length) {
            self.overrun = true;
            return Vec::new();
        }
        let bytes = self.buffer[self.position..self.position + length].to_vec();
        self.position += length;
        bytes
    }

    /// Read a u16 length-prefixed string
    pub fn get_string(&mut self) -> String {
        let length = self.get_u16() as usize;
        let bytes = self.get_bytes(length);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Read a string that was written with [`add_encrypted_string`](Self::add_encrypted_string)
    pub fn get_encrypted_string(&mut self, key: &XteaKey) -> String {
        let length = self.get_u16() as usize;
        if length % XTEA_MULTIPLE != 0 {
            self.overrun = true;
            return String::new();
        }
        let mut bytes = self.get_bytes(length);
        if !xtea::decrypt(&mut bytes, key) {
            return String::new();
        }
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    // ============ Writing Methods ============

    fn write_slice(&mut self, bytes: &[u8]) -> bool {
        if !self.can_add(bytes.len()) {
            self.overrun = true;
            return false;
        }
        self.buffer[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
        true
    }

    /// Write an unsigned byte
    pub fn add_byte(&mut self, value: u8) -> bool {
        self.write_slice(&[value])
    }

    /// Write a little-endian u16
    pub fn add_u16(&mut self, value: u16) -> bool {
        self.write_slice(&value.to_le_bytes())
    }

    /// Write a little-endian u32
    pub fn add_u32(&mut self, value: u32) -> bool {
        self.write_slice(&value.to_le_bytes())
    }

    /// Write a little-endian u64
    pub fn add_u64(&mut self, value: u64) -> bool {
        self.write_slice(&value.to_le_bytes())
    }

    /// Write raw bytes
    pub fn add_bytes(&mut self, bytes: &[u8]) -> bool {
        self.write_slice(bytes)
    }

    /// Write a u16 length-prefixed string; nothing is written if it does not fit
    pub fn add_string(&mut self, value: &str) -> bool {
        let bytes = value.as_bytes();
        if bytes.len() > u16::MAX as usize || !self.can_add(2 + bytes.len()) {
            self.overrun = true;
            return false;
        }
        self.add_u16(bytes.len() as u16);
        self.write_slice(bytes)
    }

    /// Write a string zero-padded to a block multiple, encrypted, then length-prefixed
    pub fn add_encrypted_string(&mut self, value: &str, key: &XteaKey) -> bool {
        let mut bytes = value.as_bytes().to_vec();
        let padded = bytes.len().div_ceil(XTEA_MULTIPLE) * XTEA_MULTIPLE;
        bytes.resize(padded, 0);
        xtea::encrypt(&mut bytes, key);

        if bytes.len() > u16::MAX as usize || !self.can_add(2 + bytes.len()) {
            self.overrun = true;
            return false;
        }
        self.add_u16(bytes.len() as u16);
        self.write_slice(&bytes)
    }

    /// Append `count` copies of `byte`, bounded by the raw capacity
    ///
    /// Used for cipher padding, which may extend past the protocol body limit.
    pub fn add_padding(&mut self, count: usize, byte: u8) -> bool {
        if self.end + count > MESSAGE_CAPACITY {
            self.overrun = true;
            return false;
        }
        self.buffer[self.end..self.end + count].fill(byte);
        self.end += count;
        true
    }

    /// Mutable view of all valid bytes
    pub(crate) fn body_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.start..self.end]
    }

    /// Replace all valid bytes with `data`, keeping the current start
    pub(crate) fn replace_body(&mut self, data: &[u8]) -> bool {
        if self.start + data.len() > MESSAGE_CAPACITY {
            return false;
        }
        self.buffer[self.start..self.start + data.len()].copy_from_slice(data);
        self.end = self.start + data.len();
        true
    }
}

impl Default for NetworkMessage {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NetworkMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkMessage")
            .field("len", &self.len())
            .field("position", &self.position())
            .field("overrun", &self.overrun)
            .finish()
    }
}

impl Poolable for NetworkMessage {
    fn create() -> Self {
        Self::new()
    }

    fn reset(&mut self) {
        NetworkMessage::reset(self);
    }
}

/// Outbound message: a [`NetworkMessage`] plus backward header emission
#[derive(Debug, Default)]
pub struct OutputMessage {
    message: NetworkMessage,
}

impl OutputMessage {
    /// Create an empty output message
    pub fn new() -> Self {
        Self {
            message: NetworkMessage::new(),
        }
    }

    /// Prepend raw header bytes into the reserved gap
    fn add_header(&mut self, bytes: &[u8]) -> bool {
        let msg = &mut self.message;
        if msg.start < bytes.len() {
            msg.overrun = true;
            return false;
        }
        msg.start -= bytes.len();
        msg.buffer[msg.start..msg.start + bytes.len()].copy_from_slice(bytes);
        true
    }

    /// Prepend a little-endian u16
    pub fn add_header_u16(&mut self, value: u16) -> bool {
        self.add_header(&value.to_le_bytes())
    }

    /// Prepend a little-endian u32
    pub fn add_header_u32(&mut self, value: u32) -> bool {
        self.add_header(&value.to_le_bytes())
    }

    /// Prepend the current length as a u16
    pub fn write_message_length(&mut self) -> bool {
        let len = self.message.len();
        if len > u16::MAX as usize {
            self.message.overrun = true;
            return false;
        }
        self.add_header_u16(len as u16)
    }

    /// Prepend the optional checksum followed by the frame length
    pub fn add_crypto_header(&mut self, checksum: bool) -> bool {
        if checksum {
            let sum = adler32(self.message.body());
            if !self.add_header_u32(sum) {
                return false;
            }
        }
        self.write_message_length()
    }

    /// The bytes to put on the wire
    pub fn output_bytes(&self) -> &[u8] {
        self.message.body()
    }

    /// Number of bytes that would go on the wire
    pub fn output_len(&self) -> usize {
        self.message.len()
    }
}

impl Deref for OutputMessage {
    type Target = NetworkMessage;

    fn deref(&self) -> &NetworkMessage {
        &self.message
    }
}

impl DerefMut for OutputMessage {
    fn deref_mut(&mut self) -> &mut NetworkMessage {
        &mut self.message
    }
}

impl Poolable for OutputMessage {
    fn create() -> Self {
        Self::new()
    }

    fn reset(&mut self) {
        self.message.reset();
    }
}
