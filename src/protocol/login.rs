//! Login protocol
//!
//! Handles the account login on the login port:
//! 1. Client sends OS, version, XTEA key and credentials (checksummed)
//! 2. Server switches the connection to XTEA
//! 3. Server checks version, IP bans, the failed-login throttle,
//!    credentials and account bans, in that order
//! 4. On success the client gets the MOTD and its character list,
//!    otherwise a login error; either way the connection is then closed

use std::net::IpAddr;
use std::sync::{Arc, Weak};

use tracing::{debug, info, warn};

use super::base::{Protocol, ProtocolCore, ProtocolFactory};
use super::codec::ProtocolFlags;
use super::packets::{CharacterList, IncomingPacket, LoginError, LoginRequest, Motd};
use crate::auth::Account;
use crate::dispatch::Task;
use crate::error::AuthError;
use crate::net::connection::Connection;
use crate::net::message::NetworkMessage;
use crate::state::ServerContext;

/// Checks that need no password hashing: version gate, IP ban, throttle
fn check_client(context: &ServerContext, ip: IpAddr, version: u16) -> Result<(), AuthError> {
    let network = &context.config.network;
    if version < network.client_version_min || version > network.client_version_max {
        return Err(AuthError::UnsupportedVersion(version));
    }

    let bans = &context.bans;
    if bans.is_ip_banned(ip) {
        return Err(AuthError::IpBanned);
    }
    if bans.is_ip_disabled(ip) {
        return Err(AuthError::TooManyAttempts);
    }
    Ok(())
}

/// Record a credential check with the throttle, then apply account bans
fn complete_login(
    context: &ServerContext,
    ip: IpAddr,
    verified: Result<Account, AuthError>,
) -> Result<Account, AuthError> {
    let bans = &context.bans;
    let account = match verified {
        Ok(account) => account,
        Err(e) => {
            bans.add_login_attempt(ip, false);
            return Err(e);
        }
    };

    if bans.is_account_banned(&account.id) {
        return Err(AuthError::AccountBanned);
    }

    bans.add_login_attempt(ip, true);
    Ok(account)
}

/// Run the login checks shared by the login and game protocols
///
/// Password hashing runs on the blocking pool so the dispatcher keeps
/// serving other connections. `done` is always called on the dispatcher.
pub(crate) fn check_login<F>(
    core: &ProtocolCore,
    version: u16,
    name: String,
    password: String,
    done: F,
) where
    F: FnOnce(Result<Account, AuthError>) + Send + 'static,
{
    let context = Arc::clone(core.context());
    let ip = core.ip();
    if let Err(e) = check_client(&context, ip, version) {
        done(Err(e));
        return;
    }

    let Some(connection) = core.connection() else {
        return;
    };
    connection.runtime().spawn_blocking(move || {
        let verified = context.accounts.authenticate(&name, &password);
        let dispatcher = Arc::clone(&context.dispatcher);
        let task = Task::new(move || done(complete_login(&context, ip, verified)));
        if dispatcher.add(task, false).is_err() {
            debug!(address = %ip, "Dispatcher stopped, dropping login result");
        }
    });
}

pub struct LoginProtocol {
    core: ProtocolCore,
    this: Weak<LoginProtocol>,
}

impl LoginProtocol {
    fn refuse(&self, error: &AuthError) {
        debug!(
            connection_id = self.core.connection_id(),
            address = %self.core.peer_addr(),
            reason = %error,
            "Login refused"
        );
        let packet = LoginError {
            message: error.client_message(),
        };
        if let Err(e) = self.core.write_packet(&packet) {
            debug!(connection_id = self.core.connection_id(), error = %e, "Login error not sent");
        }
        self.core.disconnect();
    }

    fn accept(&self, account: &Account) {
        let context = self.core.context();
        info!(
            account = %account.name,
            address = %self.core.peer_addr(),
            characters = account.characters.len(),
            "Account logged in"
        );

        let motd = Motd {
            text: context.config.motd.clone(),
        };
        let characters = CharacterList {
            world_name: context.config.server_name.clone(),
            world_ip: context.config.public_addr(),
            world_port: context.config.game_port,
            characters: account.characters.clone(),
        };

        let result = self
            .core
            .write_packet(&motd)
            .and_then(|()| self.core.write_packet(&characters));
        if let Err(e) = result {
            warn!(connection_id = self.core.connection_id(), error = %e, "Character list not sent");
        }
        self.core.disconnect();
    }
}

impl Protocol for LoginProtocol {
    fn core(&self) -> &ProtocolCore {
        &self.core
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_recv_first_message(&self, msg: &mut NetworkMessage) {
        let request = match LoginRequest::decode(msg) {
            Ok(request) => request,
            Err(e) => {
                debug!(connection_id = self.core.connection_id(), error = %e, "Malformed login request");
                self.core.disconnect();
                return;
            }
        };

        self.core.enable_encryption(request.key);

        let this = self.this.clone();
        check_login(
            &self.core,
            request.version,
            request.account,
            request.password,
            move |result| {
                let Some(protocol) = this.upgrade() else {
                    return;
                };
                if !protocol.core.is_connected() {
                    return;
                }
                match result {
                    Ok(account) => protocol.accept(&account),
                    Err(e) => protocol.refuse(&e),
                }
            },
        );
    }
}

impl ProtocolFactory for LoginProtocol {
    const PROTOCOL_IDENTIFIER: u8 = 0x01;
    const SERVER_SENDS_FIRST: bool = false;
    const USE_CHECKSUM: bool = true;
    const NAME: &'static str = "login";

    fn create(connection: &Arc<Connection>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            core: ProtocolCore::new(connection, ProtocolFlags::CHECKSUM),
            this: this.clone(),
        })
    }
}
