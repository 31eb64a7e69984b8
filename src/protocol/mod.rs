//! Protocol module
//!
//! This module contains the wire protocols served by Realmcore:
//! - Status protocol (server-list queries)
//! - Login protocol (account authentication and character list)
//! - Game protocol (challenge login, keep-alive, game packet routing)
//!
//! All of them share the [`Protocol`] lifecycle and the [`MessageCodec`]
//! frame transforms.

pub mod base;
pub mod codec;
pub mod game;
pub mod login;
pub mod packets;
pub mod status;

pub use base::{Protocol, ProtocolCore, ProtocolFactory};
pub use codec::{MessageCodec, ProtocolFlags};
pub use game::{GameHandler, GameProtocol, NullGameHandler};
pub use login::LoginProtocol;
pub use status::StatusProtocol;
