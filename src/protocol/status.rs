//! Status protocol
//!
//! Answers server-list queries on the login port without a checksum. A
//! request is either `0xFF` followed by the string `"info"`, answered with a
//! JSON document, or `0x01` followed by a u32 of [`StatusSections`],
//! answered with the requested binary sections. The connection is closed
//! after the reply.

use std::sync::Arc;

use bitflags::bitflags;
use serde::Serialize;
use tracing::{debug, warn};

use super::base::{Protocol, ProtocolCore, ProtocolFactory};
use super::codec::ProtocolFlags;
use crate::net::connection::Connection;
use crate::net::message::NetworkMessage;

/// Request type for the JSON document
pub const REQUEST_INFO: u8 = 0xFF;
/// Request type for binary sections
pub const REQUEST_SECTIONS: u8 = 0x01;

/// Section tags in a binary reply
pub const TAG_BASIC_INFO: u8 = 0x10;
pub const TAG_MOTD: u8 = 0x12;
pub const TAG_UPTIME: u8 = 0x13;
pub const TAG_PLAYERS: u8 = 0x20;
pub const TAG_VERSION: u8 = 0x23;

bitflags! {
    /// Sections a binary status request may ask for
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusSections: u32 {
        const BASIC_INFO = 0x01;
        const PLAYERS = 0x02;
        const MOTD = 0x04;
        const UPTIME = 0x08;
        const VERSION = 0x10;
    }
}

/// JSON status document
#[derive(Debug, Clone, Serialize)]
pub struct StatusDocument {
    pub name: String,
    pub online: usize,
    pub max_connections: usize,
    pub uptime: u64,
    pub version: &'static str,
    pub motd: String,
}

pub struct StatusProtocol {
    core: ProtocolCore,
}

impl StatusProtocol {
    fn document(&self) -> StatusDocument {
        let context = self.core.context();
        StatusDocument {
            name: context.config.server_name.clone(),
            online: context.connections.count(),
            max_connections: context.connections.max_connections(),
            uptime: context.uptime().as_secs(),
            version: crate::VERSION,
            motd: context.config.motd.clone(),
        }
    }

    fn send_info(&self) {
        let json = match serde_json::to_string(&self.document()) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize status document");
                return;
            }
        };

        let result = self
            .core
            .with_output_buffer(2 + json.len(), |msg| {
                msg.add_string(&json);
            });
        if let Err(e) = result {
            debug!(connection_id = self.core.connection_id(), error = %e, "Status reply dropped");
        }
    }

    fn send_sections(&self, sections: StatusSections) {
        let document = self.document();
        let config = &self.core.context().config;

        let mut reply = NetworkMessage::new();
        if sections.contains(StatusSections::BASIC_INFO) {
            reply.add_byte(TAG_BASIC_INFO);
            reply.add_string(&document.name);
            reply.add_string(&config.public_addr().to_string());
            reply.add_u16(config.login_port);
        }
        if sections.contains(StatusSections::PLAYERS) {
            reply.add_byte(TAG_PLAYERS);
            reply.add_u32(document.online as u32);
            reply.add_u32(document.max_connections as u32);
        }
        if sections.contains(StatusSections::MOTD) {
            reply.add_byte(TAG_MOTD);
            reply.add_string(&document.motd);
        }
        if sections.contains(StatusSections::UPTIME) {
            reply.add_byte(TAG_UPTIME);
            reply.add_u64(document.uptime);
        }
        if sections.contains(StatusSections::VERSION) {
            reply.add_byte(TAG_VERSION);
            reply.add_string(document.version);
        }

        let body = reply.body();
        if let Err(e) = self.core.with_output_buffer(body.len(), |msg| {
            msg.add_bytes(body);
        }) {
            debug!(connection_id = self.core.connection_id(), error = %e, "Status reply dropped");
        }
    }
}

impl Protocol for StatusProtocol {
    fn core(&self) -> &ProtocolCore {
        &self.core
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_recv_first_message(&self, msg: &mut NetworkMessage) {
        let ip = self.core.ip();
        if !self.core.context().allow_status_request(ip) {
            debug!(address = %ip, "Status request throttled");
            self.core.disconnect();
            return;
        }

        match msg.get_byte() {
            REQUEST_INFO if msg.get_string() == "info" => self.send_info(),
            REQUEST_SECTIONS => {
                let requested = msg.get_u32();
                if !msg.is_overrun() {
                    self.send_sections(StatusSections::from_bits_truncate(requested));
                }
            }
            other => {
                debug!(address = %ip, request = other, "Unknown status request");
            }
        }

        self.core.disconnect();
    }
}

impl ProtocolFactory for StatusProtocol {
    const PROTOCOL_IDENTIFIER: u8 = 0xFF;
    const SERVER_SENDS_FIRST: bool = false;
    const USE_CHECKSUM: bool = false;
    const NAME: &'static str = "status";

    fn create(connection: &Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            core: ProtocolCore::new(connection, ProtocolFlags::empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_section_bits_are_ignored() {
        let sections = StatusSections::from_bits_truncate(0xFFFF_0003);
        assert_eq!(sections, StatusSections::BASIC_INFO | StatusSections::PLAYERS);
    }

    #[test]
    fn test_document_serializes_expected_fields() {
        let document = StatusDocument {
            name: "Realm".to_string(),
            online: 3,
            max_connections: 10,
            uptime: 42,
            version: "0.1.0",
            motd: "hi".to_string(),
        };
        let value: serde_json::Value = serde_json::to_value(&document).unwrap();
        assert_eq!(value["name"], "Realm");
        assert_eq!(value["online"], 3);
        assert_eq!(value["uptime"], 42);
        assert_eq!(value["version"], "0.1.0");
    }
}
