//! Packet definitions
//!
//! Opcodes and typed packets for the login, game and status protocols.
//! Every field is little-endian; strings are u16 length-prefixed.

use std::fmt;
use std::net::Ipv4Addr;

use crate::crypto::XteaKey;
use crate::error::ProtocolError;
use crate::net::message::NetworkMessage;

/// Opcodes sent by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerOpcode {
    /// Game login accepted
    LoginSuccess = 0x0A,
    /// Login refused, carries a message
    LoginError = 0x0B,
    /// Message of the day
    Motd = 0x14,
    /// Keep-alive ping, client answers with a ping back
    Ping = 0x1D,
    /// Answer to a client ping
    Pong = 0x1E,
    /// Game login challenge
    Challenge = 0x1F,
    /// Characters of the account
    CharacterList = 0x64,
}

impl ServerOpcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0A => Some(Self::LoginSuccess),
            0x0B => Some(Self::LoginError),
            0x14 => Some(Self::Motd),
            0x1D => Some(Self::Ping),
            0x1E => Some(Self::Pong),
            0x1F => Some(Self::Challenge),
            0x64 => Some(Self::CharacterList),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::LoginSuccess => "LoginSuccess",
            Self::LoginError => "LoginError",
            Self::Motd => "Motd",
            Self::Ping => "Ping",
            Self::Pong => "Pong",
            Self::Challenge => "Challenge",
            Self::CharacterList => "CharacterList",
        }
    }
}

impl fmt::Display for ServerOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#04x})", self.name(), self.as_u8())
    }
}

/// Opcodes sent by a client on the game connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GameClientOpcode {
    Logout = 0x14,
    /// Client-initiated ping, answered with [`ServerOpcode::Pong`]
    Ping = 0x1D,
    /// Answer to a server [`ServerOpcode::Ping`]
    PingBack = 0x1E,
}

impl GameClientOpcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x14 => Some(Self::Logout),
            0x1D => Some(Self::Ping),
            0x1E => Some(Self::PingBack),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Logout => "Logout",
            Self::Ping => "Ping",
            Self::PingBack => "PingBack",
        }
    }
}

impl fmt::Display for GameClientOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#04x})", self.name(), *self as u8)
    }
}

/// Packet read from a client message
pub trait IncomingPacket: Sized {
    /// Decode the packet from the message cursor
    fn decode(msg: &mut NetworkMessage) -> Result<Self, ProtocolError>;
}

/// Packet written to a client
pub trait OutgoingPacket {
    /// The packet opcode
    const OPCODE: ServerOpcode;

    /// Write everything after the opcode
    fn encode_body(&self, msg: &mut NetworkMessage);

    /// Upper bound on the encoded size, opcode included
    fn size_hint(&self) -> usize;

    /// Write the opcode and body
    fn encode(&self, msg: &mut NetworkMessage) {
        msg.add_byte(Self::OPCODE.as_u8());
        self.encode_body(msg);
    }
}

fn truncated(what: &str) -> ProtocolError {
    ProtocolError::MalformedPacket(format!("truncated {}", what))
}

fn string_size(s: &str) -> usize {
    2 + s.len()
}

fn read_key(msg: &mut NetworkMessage) -> XteaKey {
    XteaKey::new([msg.get_u32(), msg.get_u32(), msg.get_u32(), msg.get_u32()])
}

fn write_key(msg: &mut NetworkMessage, key: &XteaKey) {
    for word in key.words() {
        msg.add_u32(*word);
    }
}

// ============ Incoming Packets ============

/// First message of a login connection
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub os: u16,
    pub version: u16,
    pub key: XteaKey,
    pub account: String,
    pub password: String,
}

impl IncomingPacket for LoginRequest {
    fn decode(msg: &mut NetworkMessage) -> Result<Self, ProtocolError> {
        let packet = Self {
            os: msg.get_u16(),
            version: msg.get_u16(),
            key: read_key(msg),
            account: msg.get_string(),
            password: msg.get_string(),
        };
        if msg.is_overrun() {
            return Err(truncated("login request"));
        }
        Ok(packet)
    }
}

impl LoginRequest {
    /// Client-side encoding, without checksum or identifier
    pub fn encode(&self, msg: &mut NetworkMessage) {
        msg.add_u16(self.os);
        msg.add_u16(self.version);
        write_key(msg, &self.key);
        msg.add_string(&self.account);
        msg.add_string(&self.password);
    }
}

/// First message of a game connection
#[derive(Debug, Clone)]
pub struct GameLoginRequest {
    pub os: u16,
    pub version: u16,
    pub key: XteaKey,
    pub account: String,
    pub character: String,
    pub password: String,
    pub challenge_timestamp: u32,
    pub challenge_random: u8,
}

impl IncomingPacket for GameLoginRequest {
    fn decode(msg: &mut NetworkMessage) -> Result<Self, ProtocolError> {
        let packet = Self {
            os: msg.get_u16(),
            version: msg.get_u16(),
            key: read_key(msg),
            account: msg.get_string(),
            character: msg.get_string(),
            password: msg.get_string(),
            challenge_timestamp: msg.get_u32(),
            challenge_random: msg.get_byte(),
        };
        if msg.is_overrun() {
            return Err(truncated("game login request"));
        }
        Ok(packet)
    }
}

impl GameLoginRequest {
    /// Client-side encoding, without checksum or identifier
    pub fn encode(&self, msg: &mut NetworkMessage) {
        msg.add_u16(self.os);
        msg.add_u16(self.version);
        write_key(msg, &self.key);
        msg.add_string(&self.account);
        msg.add_string(&self.character);
        msg.add_string(&self.password);
        msg.add_u32(self.challenge_timestamp);
        msg.add_byte(self.challenge_random);
    }
}

// ============ Outgoing Packets ============

/// Login refusal with a human-readable reason
#[derive(Debug, Clone)]
pub struct LoginError {
    pub message: String,
}

impl OutgoingPacket for LoginError {
    const OPCODE: ServerOpcode = ServerOpcode::LoginError;

    fn encode_body(&self, msg: &mut NetworkMessage) {
        msg.add_string(&self.message);
    }

    fn size_hint(&self) -> usize {
        1 + string_size(&self.message)
    }
}

/// Message of the day
#[derive(Debug, Clone)]
pub struct Motd {
    pub text: String,
}

impl OutgoingPacket for Motd {
    const OPCODE: ServerOpcode = ServerOpcode::Motd;

    fn encode_body(&self, msg: &mut NetworkMessage) {
        msg.add_string(&self.text);
    }

    fn size_hint(&self) -> usize {
        1 + string_size(&self.text)
    }
}

/// Characters the account may play and where to connect
#[derive(Debug, Clone)]
pub struct CharacterList {
    pub world_name: String,
    pub world_ip: Ipv4Addr,
    pub world_port: u16,
    pub characters: Vec<String>,
}

impl OutgoingPacket for CharacterList {
    const OPCODE: ServerOpcode = ServerOpcode::CharacterList;

    fn encode_body(&self, msg: &mut NetworkMessage) {
        let count = self.characters.len().min(u8::MAX as usize);
        msg.add_byte(count as u8);
        for name in self.characters.iter().take(count) {
            msg.add_string(name);
            msg.add_string(&self.world_name);
            msg.add_u32(u32::from_le_bytes(self.world_ip.octets()));
            msg.add_u16(self.world_port);
        }
    }

    fn size_hint(&self) -> usize {
        let per_world = string_size(&self.world_name) + 4 + 2;
        2 + self
            .characters
            .iter()
            .map(|c| string_size(c) + per_world)
            .sum::<usize>()
    }
}

/// Game login challenge, echoed back by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Challenge {
    pub timestamp: u32,
    pub random: u8,
}

impl OutgoingPacket for Challenge {
    const OPCODE: ServerOpcode = ServerOpcode::Challenge;

    fn encode_body(&self, msg: &mut NetworkMessage) {
        msg.add_u32(self.timestamp);
        msg.add_byte(self.random);
    }

    fn size_hint(&self) -> usize {
        6
    }
}

/// Game login accepted
#[derive(Debug, Clone, Copy)]
pub struct LoginSuccess {
    pub player_id: u32,
    /// Server tick length in milliseconds
    pub beat: u16,
}

impl OutgoingPacket for LoginSuccess {
    const OPCODE: ServerOpcode = ServerOpcode::LoginSuccess;

    fn encode_body(&self, msg: &mut NetworkMessage) {
        msg.add_u32(self.player_id);
        msg.add_u16(self.beat);
    }

    fn size_hint(&self) -> usize {
        7
    }
}

/// Server keep-alive ping
#[derive(Debug, Clone, Copy, Default)]
pub struct Ping;

impl OutgoingPacket for Ping {
    const OPCODE: ServerOpcode = ServerOpcode::Ping;

    fn encode_body(&self, _msg: &mut NetworkMessage) {}

    fn size_hint(&self) -> usize {
        1
    }
}

/// Answer to a client ping
#[derive(Debug, Clone, Copy, Default)]
pub struct Pong;

impl OutgoingPacket for Pong {
    const OPCODE: ServerOpcode = ServerOpcode::Pong;

    fn encode_body(&self, _msg: &mut NetworkMessage) {}

    fn size_hint(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(ServerOpcode::from_u8(0x64), Some(ServerOpcode::CharacterList));
        assert_eq!(ServerOpcode::from_u8(0x99), None);
        assert_eq!(GameClientOpcode::from_u8(0x14), Some(GameClientOpcode::Logout));
        assert_eq!(ServerOpcode::Challenge.to_string(), "Challenge(0x1f)");
    }

    #[test]
    fn test_login_request_decode() {
        let request = LoginRequest {
            os: 2,
            version: 1100,
            key: XteaKey::new([1, 2, 3, 4]),
            account: "tester".to_string(),
            password: "secret".to_string(),
        };
        let mut msg = NetworkMessage::new();
        request.encode(&mut msg);

        let decoded = LoginRequest::decode(&mut msg).unwrap();
        assert_eq!(decoded.version, 1100);
        assert_eq!(decoded.key.words(), &[1, 2, 3, 4]);
        assert_eq!(decoded.account, "tester");
        assert_eq!(decoded.password, "secret");
    }

    #[test]
    fn test_truncated_request_is_rejected() {
        let mut msg = NetworkMessage::from_body(&[2, 0, 0x4C, 0x04, 1, 0]);
        assert!(matches!(
            LoginRequest::decode(&mut msg),
            Err(ProtocolError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_size_hints_cover_encoding() {
        let list = CharacterList {
            world_name: "Realm".to_string(),
            world_ip: Ipv4Addr::LOCALHOST,
            world_port: 7172,
            characters: vec!["Knight".to_string(), "Druid".to_string()],
        };
        let mut msg = NetworkMessage::new();
        list.encode(&mut msg);
        assert!(msg.len() <= list.size_hint());

        let mut msg = NetworkMessage::new();
        Challenge { timestamp: 7, random: 9 }.encode(&mut msg);
        assert_eq!(msg.body(), &[0x1F, 7, 0, 0, 0, 9]);
    }
}
