//! Message codec
//!
//! Applies the per-connection transforms between a protocol payload and a
//! wire frame. The server protocols and client tools share this type so both
//! ends agree on the exact byte layout.
//!
//! Encode: inner length (when encrypting), pad to 8 with 0x33, XTEA,
//! raw deflate, Adler-32 header, outer length header.
//! Decode runs the reverse, starting after the outer length header.

use std::io::{Read, Write};

use bitflags::bitflags;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::crypto::{adler32, xtea, XteaKey};
use crate::error::ProtocolError;
use crate::net::message::{
    NetworkMessage, OutputMessage, CHECKSUM_LENGTH, HEADER_LENGTH, MAX_BODY_LENGTH, MESSAGE_CAPACITY,
    XTEA_MULTIPLE,
};

/// Fill byte for cipher padding
pub const PADDING_BYTE: u8 = 0x33;

bitflags! {
    /// Transforms enabled on a connection
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProtocolFlags: u8 {
        const CHECKSUM = 0b0001;
        const ENCRYPTION = 0b0010;
        const COMPRESSION = 0b0100;
        /// Length header only, no other transform
        const RAW = 0b1000;
    }
}

/// Per-connection frame transforms
#[derive(Debug, Clone, Default)]
pub struct MessageCodec {
    flags: ProtocolFlags,
    key: Option<XteaKey>,
}

impl MessageCodec {
    pub fn new(flags: ProtocolFlags) -> Self {
        Self { flags, key: None }
    }

    pub fn flags(&self) -> ProtocolFlags {
        self.flags
    }

    pub fn set_flag(&mut self, flag: ProtocolFlags, enabled: bool) {
        self.flags.set(flag, enabled);
    }

    /// Install a key and turn encryption on
    pub fn enable_encryption(&mut self, key: XteaKey) {
        self.key = Some(key);
        self.flags.insert(ProtocolFlags::ENCRYPTION);
    }

    pub fn key(&self) -> Option<&XteaKey> {
        self.key.as_ref()
    }

    fn active_key(&self) -> Option<&XteaKey> {
        if self.flags.contains(ProtocolFlags::ENCRYPTION) {
            self.key.as_ref()
        } else {
            None
        }
    }

    /// Turn a finished payload into a wire frame in place
    pub fn encode(&self, msg: &mut OutputMessage) -> Result<(), ProtocolError> {
        if msg.is_overrun() {
            return Err(ProtocolError::BufferOverrun);
        }

        if self.flags.contains(ProtocolFlags::RAW) {
            return finish(msg.write_message_length(), msg);
        }

        if let Some(key) = self.active_key() {
            msg.write_message_length();
            let padding = (XTEA_MULTIPLE - msg.len() % XTEA_MULTIPLE) % XTEA_MULTIPLE;
            msg.add_padding(padding, PADDING_BYTE);
            if msg.is_overrun() {
                return Err(ProtocolError::BufferOverrun);
            }
            if !xtea::encrypt(msg.body_mut(), key) {
                return Err(ProtocolError::InvalidEncryptedLength(msg.len()));
            }
        }

        if self.flags.contains(ProtocolFlags::COMPRESSION) {
            let compressed = deflate(msg.body())?;
            if !msg.replace_body(&compressed) {
                return Err(ProtocolError::MessageTooLarge {
                    size: compressed.len(),
                    max: MAX_BODY_LENGTH,
                });
            }
        }

        let checksum = self.flags.contains(ProtocolFlags::CHECKSUM);
        let body_len = msg.len() + if checksum { CHECKSUM_LENGTH } else { 0 };
        if body_len >= MAX_BODY_LENGTH {
            return Err(ProtocolError::MessageTooLarge {
                size: body_len,
                max: MAX_BODY_LENGTH,
            });
        }

        finish(msg.add_crypto_header(checksum), msg)
    }

    /// Undo the transforms on a received body; the cursor must be at its start
    pub fn decode(&self, msg: &mut NetworkMessage) -> Result<(), ProtocolError> {
        if self.flags.contains(ProtocolFlags::RAW) {
            return Ok(());
        }

        if self.flags.contains(ProtocolFlags::CHECKSUM) {
            if !msg.can_read(CHECKSUM_LENGTH) {
                return Err(ProtocolError::MalformedPacket("missing checksum".into()));
            }
            let expected = msg.get_u32();
            let actual = adler32(msg.unread());
            if expected != actual {
                return Err(ProtocolError::ChecksumMismatch { expected, actual });
            }
        }

        if self.flags.contains(ProtocolFlags::COMPRESSION) {
            let inflated = inflate(msg.unread())?;
            if !msg.replace_unread(&inflated) {
                return Err(ProtocolError::MessageTooLarge {
                    size: inflated.len(),
                    max: MESSAGE_CAPACITY,
                });
            }
        }

        if let Some(key) = self.active_key() {
            let len = msg.remaining();
            if len == 0 || len % XTEA_MULTIPLE != 0 {
                return Err(ProtocolError::InvalidEncryptedLength(len));
            }
            xtea::decrypt(msg.unread_mut(), key);

            let inner = msg.get_u16() as usize;
            if inner > msg.remaining() {
                return Err(ProtocolError::InvalidInnerLength {
                    length: inner,
                    available: msg.remaining(),
                });
            }
            msg.truncate_unread(inner);
        }

        Ok(())
    }

    /// Build a complete frame from a payload
    pub fn encode_frame(&self, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut msg = OutputMessage::new();
        if !msg.add_bytes(payload) {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max: crate::net::message::MAX_PROTOCOL_BODY_LENGTH,
            });
        }
        self.encode(&mut msg)?;
        Ok(msg.output_bytes().to_vec())
    }

    /// Decode a frame body (everything after the outer length header)
    pub fn decode_frame(&self, body: &[u8]) -> Result<NetworkMessage, ProtocolError> {
        let mut msg = NetworkMessage::from_body(body);
        self.decode(&mut msg)?;
        Ok(msg)
    }
}

fn finish(ok: bool, msg: &OutputMessage) -> Result<(), ProtocolError> {
    if ok && !msg.is_overrun() && msg.output_len() > HEADER_LENGTH {
        Ok(())
    } else if ok && !msg.is_overrun() {
        Err(ProtocolError::MalformedPacket("empty message".into()))
    } else {
        Err(ProtocolError::BufferOverrun)
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len()), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ProtocolError::Compression(e.to_string()))
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();
    // One extra byte detects output that would not fit in a message
    let limit = MESSAGE_CAPACITY as u64 + 1;
    DeflateDecoder::new(data)
        .take(limit)
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Decompression(e.to_string()))?;
    if out.len() as u64 >= limit {
        return Err(ProtocolError::MessageTooLarge {
            size: out.len(),
            max: MESSAGE_CAPACITY,
        });
    }
    Ok(out)
}
