//! Protocol lifecycle contract
//!
//! Every wire protocol implements [`Protocol`] and keeps its shared state in
//! a [`ProtocolCore`]. All trait methods are invoked on the dispatcher
//! thread; only [`ProtocolCore::decode`] runs on the I/O side.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::codec::{MessageCodec, ProtocolFlags};
use super::packets::OutgoingPacket;
use crate::crypto::XteaKey;
use crate::error::{NetworkError, ProtocolError, RealmError, Result};
use crate::net::connection::{CloseMode, Connection, ConnectionId};
use crate::net::message::{NetworkMessage, OutputMessage, MAX_PROTOCOL_BODY_LENGTH};
use crate::net::pool::Pooled;
use crate::state::ServerContext;

/// Per-connection protocol behaviour
pub trait Protocol: Send + Sync + 'static {
    /// Shared protocol state
    fn core(&self) -> &ProtocolCore;

    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Called once when a server-speaks-first protocol is attached
    fn on_connect(&self) {}

    /// Handle the message that selected this protocol
    ///
    /// The cursor is past the checksum and identifier byte.
    fn on_recv_first_message(&self, msg: &mut NetworkMessage);

    /// Handle a decoded message after the first
    fn parse_packet(&self, _msg: &mut NetworkMessage) {}

    /// Tear down after the connection closed
    fn release(&self) {
        self.core().discard_output();
    }
}

/// Constructor and registration constants for a protocol variant
pub trait ProtocolFactory: Protocol + Sized {
    /// Identifier byte the client sends first
    const PROTOCOL_IDENTIFIER: u8;
    /// Whether the server speaks first (claims the port exclusively)
    const SERVER_SENDS_FIRST: bool;
    /// Whether the first message must carry a valid checksum
    const USE_CHECKSUM: bool;
    const NAME: &'static str;

    fn create(connection: &Arc<Connection>) -> Arc<Self>;
}

/// State shared by all protocol variants
pub struct ProtocolCore {
    connection: Weak<Connection>,
    context: Arc<ServerContext>,
    connection_id: ConnectionId,
    peer: SocketAddr,
    codec: Mutex<MessageCodec>,
    /// Message being filled by [`with_output_buffer`](Self::with_output_buffer)
    output: Mutex<Option<Pooled<OutputMessage>>>,
}

impl ProtocolCore {
    pub fn new(connection: &Arc<Connection>, flags: ProtocolFlags) -> Self {
        Self {
            connection: Arc::downgrade(connection),
            context: Arc::clone(connection.context()),
            connection_id: connection.id(),
            peer: connection.peer_addr(),
            codec: Mutex::new(MessageCodec::new(flags)),
            output: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn ip(&self) -> IpAddr {
        self.peer.ip()
    }

    /// The connection, unless it has already been dropped
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    /// Whether the connection is still open
    pub fn is_connected(&self) -> bool {
        self.connection().is_some_and(|c| c.is_open())
    }

    // ============ Codec ============

    pub fn flags(&self) -> ProtocolFlags {
        self.codec.lock().flags()
    }

    pub fn set_flag(&self, flag: ProtocolFlags, enabled: bool) {
        self.codec.lock().set_flag(flag, enabled);
    }

    /// Encrypt everything sent and received from now on
    pub fn enable_encryption(&self, key: XteaKey) {
        self.codec.lock().enable_encryption(key);
    }

    /// Undo the transforms on a received message
    pub fn decode(&self, msg: &mut NetworkMessage) -> std::result::Result<(), ProtocolError> {
        self.codec.lock().decode(msg)
    }

    // ============ Output ============

    /// Allocate a standalone output message
    pub fn new_message(&self) -> Result<Pooled<OutputMessage>> {
        self.context
            .output_pool
            .allocate()
            .ok_or(RealmError::Network(NetworkError::PoolExhausted))
    }

    /// Write into the accumulating output message
    ///
    /// If `size` more bytes would not fit, the current message is sent and a
    /// fresh one started, so small packets share wire frames.
    pub fn with_output_buffer<F>(&self, size: usize, write: F) -> Result<()>
    where
        F: FnOnce(&mut OutputMessage),
    {
        if size > MAX_PROTOCOL_BODY_LENGTH {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: MAX_PROTOCOL_BODY_LENGTH,
            }
            .into());
        }

        let mut output = self.output.lock();
        if output.as_ref().is_some_and(|msg| !msg.can_add(size)) {
            if let Some(full) = output.take() {
                self.send(full)?;
            }
        }

        let mut msg = match output.take() {
            Some(msg) => msg,
            None => self.new_message()?,
        };
        write(&mut *msg);
        *output = Some(msg);
        Ok(())
    }

    /// Queue a packet into the accumulating output message
    pub fn write_packet<P: OutgoingPacket>(&self, packet: &P) -> Result<()> {
        self.with_output_buffer(packet.size_hint(), |msg| packet.encode(msg))
    }

    /// Send whatever has accumulated; returns false if nothing was sent
    pub fn flush(&self) -> bool {
        let Some(msg) = self.output.lock().take() else {
            return false;
        };
        if msg.is_empty() {
            return false;
        }

        match self.send(msg) {
            Ok(()) => true,
            Err(e) => {
                debug!(connection_id = self.connection_id, error = %e, "Dropping output");
                false
            }
        }
    }

    /// Encode and hand a message to the connection
    pub fn send(&self, mut msg: Pooled<OutputMessage>) -> Result<()> {
        let connection = self
            .connection()
            .ok_or(RealmError::Network(NetworkError::ConnectionClosed))?;

        self.codec.lock().encode(&mut msg)?;
        trace!(connection_id = self.connection_id, bytes = msg.output_len(), "Sending message");

        if connection.send(msg) {
            Ok(())
        } else {
            Err(NetworkError::ConnectionClosed.into())
        }
    }

    /// Drop any output that was not flushed
    pub fn discard_output(&self) {
        self.output.lock().take();
    }

    /// Flush pending output, then close once it has been written
    pub fn disconnect(&self) {
        self.flush();
        if let Some(connection) = self.connection() {
            connection.close(CloseMode::Graceful);
        }
    }
}
