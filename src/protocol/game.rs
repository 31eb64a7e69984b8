//! Game protocol
//!
//! Owns the game port. The server speaks first with a [`Challenge`]; the
//! client answers with its credentials, chosen character and the echoed
//! challenge. Once logged in the connection is kept alive with periodic
//! pings from the scheduler, and packets the core does not understand are
//! handed to the [`GameHandler`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::base::{Protocol, ProtocolCore, ProtocolFactory};
use super::codec::ProtocolFlags;
use super::login::check_login;
use super::packets::{
    Challenge, GameClientOpcode, GameLoginRequest, IncomingPacket, LoginError, LoginSuccess, Ping,
    Pong,
};
use crate::auth::Account;
use crate::error::{AuthError, ProtocolError};
use crate::net::connection::Connection;
use crate::net::message::NetworkMessage;

/// Interval between keep-alive pings
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Server tick length reported to the client, in milliseconds
pub const SERVER_BEAT_MS: u16 = 50;

/// Game logic hooks
///
/// Called on the dispatcher thread, so implementations may mutate world
/// state without further locking.
pub trait GameHandler: Send + Sync {
    /// A character entered the game
    fn on_login(&self, _player: &GameProtocol) {}

    /// A packet the core protocol does not handle; the opcode is consumed
    fn on_packet(&self, player: &GameProtocol, opcode: u8, msg: &mut NetworkMessage);

    /// The connection of a logged in character was released
    fn on_logout(&self, _player: &GameProtocol) {}
}

/// Handler that ignores game packets
#[derive(Debug, Default)]
pub struct NullGameHandler;

impl GameHandler for NullGameHandler {
    fn on_packet(&self, player: &GameProtocol, opcode: u8, _msg: &mut NetworkMessage) {
        debug!(
            connection_id = player.core().connection_id(),
            opcode = format!("{:#04x}", opcode),
            "Unhandled game packet"
        );
    }
}

/// The character a game connection is playing
#[derive(Debug, Clone)]
pub struct GameSession {
    pub account_id: Uuid,
    pub account_name: String,
    pub character: String,
}

pub struct GameProtocol {
    core: ProtocolCore,
    this: Weak<GameProtocol>,
    challenge: Mutex<Option<Challenge>>,
    session: Mutex<Option<GameSession>>,
    ping_event: AtomicU32,
}

impl GameProtocol {
    /// The logged in character, if any
    pub fn session(&self) -> Option<GameSession> {
        self.session.lock().clone()
    }

    fn refuse(&self, error: &AuthError) {
        debug!(
            connection_id = self.core.connection_id(),
            address = %self.core.peer_addr(),
            reason = %error,
            "Game login refused"
        );
        let packet = LoginError {
            message: error.client_message(),
        };
        if let Err(e) = self.core.write_packet(&packet) {
            debug!(connection_id = self.core.connection_id(), error = %e, "Login error not sent");
        }
        self.core.disconnect();
    }

    fn enter_game(account: Account, character: &str) -> Result<GameSession, AuthError> {
        let character = account
            .character(character)
            .ok_or_else(|| AuthError::CharacterNotFound(character.to_string()))?
            .to_string();

        Ok(GameSession {
            account_id: account.id,
            account_name: account.name,
            character,
        })
    }

    /// Finish a login once the credentials have been checked
    fn complete_login(&self, result: Result<Account, AuthError>, character: &str) {
        if !self.core.is_connected() {
            return;
        }

        let session = match result.and_then(|account| Self::enter_game(account, character)) {
            Ok(session) => session,
            Err(e) => {
                self.refuse(&e);
                return;
            }
        };

        info!(
            account = %session.account_name,
            character = %session.character,
            address = %self.core.peer_addr(),
            "Character entered the game"
        );
        *self.session.lock() = Some(session);

        let success = LoginSuccess {
            player_id: self.core.connection_id() as u32,
            beat: SERVER_BEAT_MS,
        };
        if let Err(e) = self.core.write_packet(&success) {
            warn!(connection_id = self.core.connection_id(), error = %e, "Login success not sent");
            self.core.disconnect();
            return;
        }

        self.core.context().game_handler.on_login(self);
        self.core.flush();
        self.schedule_ping();
    }

    fn schedule_ping(&self) {
        let protocol = self.this.clone();
        let event_id = self
            .core
            .context()
            .scheduler
            .schedule(KEEPALIVE_INTERVAL, move || {
                if let Some(protocol) = protocol.upgrade() {
                    protocol.on_keepalive();
                }
            });
        self.ping_event.store(event_id, Ordering::SeqCst);
    }

    fn on_keepalive(&self) {
        if !self.core.is_connected() {
            return;
        }
        if let Err(e) = self.core.write_packet(&Ping) {
            debug!(connection_id = self.core.connection_id(), error = %e, "Ping not sent");
        }
        self.core.flush();
        self.schedule_ping();
    }
}

impl Protocol for GameProtocol {
    fn core(&self) -> &ProtocolCore {
        &self.core
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_connect(&self) {
        let challenge = Challenge {
            timestamp: Utc::now().timestamp() as u32,
            random: rand::random(),
        };
        *self.challenge.lock() = Some(challenge);

        if let Err(e) = self.core.write_packet(&challenge) {
            warn!(connection_id = self.core.connection_id(), error = %e, "Challenge not sent");
            self.core.disconnect();
        }
    }

    fn on_recv_first_message(&self, msg: &mut NetworkMessage) {
        let request = match GameLoginRequest::decode(msg) {
            Ok(request) => request,
            Err(e) => {
                debug!(connection_id = self.core.connection_id(), error = %e, "Malformed game login");
                self.core.disconnect();
                return;
            }
        };

        self.core.enable_encryption(request.key);

        let echoed = Challenge {
            timestamp: request.challenge_timestamp,
            random: request.challenge_random,
        };
        if self.challenge.lock().take() != Some(echoed) {
            warn!(
                connection_id = self.core.connection_id(),
                address = %self.core.peer_addr(),
                error = %ProtocolError::ChallengeMismatch,
                "Closing game connection"
            );
            self.core.disconnect();
            return;
        }

        let this = self.this.clone();
        let character = request.character;
        check_login(
            &self.core,
            request.version,
            request.account,
            request.password,
            move |result| {
                if let Some(protocol) = this.upgrade() {
                    protocol.complete_login(result, &character);
                }
            },
        );
    }

    fn parse_packet(&self, msg: &mut NetworkMessage) {
        if self.session.lock().is_none() {
            return;
        }

        let opcode = msg.get_byte();
        match GameClientOpcode::from_u8(opcode) {
            Some(GameClientOpcode::Logout) => {
                debug!(connection_id = self.core.connection_id(), "Logout requested");
                self.core.disconnect();
            }
            Some(GameClientOpcode::Ping) => {
                if let Err(e) = self.core.write_packet(&Pong) {
                    debug!(connection_id = self.core.connection_id(), error = %e, "Pong not sent");
                }
            }
            Some(GameClientOpcode::PingBack) => {
                trace!(connection_id = self.core.connection_id(), "Ping acknowledged");
            }
            None => {
                let handler = Arc::clone(&self.core.context().game_handler);
                handler.on_packet(self, opcode, msg);
            }
        }
    }

    fn release(&self) {
        let event_id = self.ping_event.swap(0, Ordering::SeqCst);
        if event_id != 0 {
            self.core.context().scheduler.stop_event(event_id);
        }

        if self.session.lock().is_some() {
            self.core.context().game_handler.on_logout(self);
            self.session.lock().take();
        }
        self.core.discard_output();
    }
}

impl ProtocolFactory for GameProtocol {
    const PROTOCOL_IDENTIFIER: u8 = 0x0A;
    const SERVER_SENDS_FIRST: bool = true;
    const USE_CHECKSUM: bool = true;
    const NAME: &'static str = "game";

    fn create(connection: &Arc<Connection>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            core: ProtocolCore::new(connection, ProtocolFlags::CHECKSUM),
            this: this.clone(),
            challenge: Mutex::new(None),
            session: Mutex::new(None),
            ping_event: AtomicU32::new(0),
        })
    }
}
