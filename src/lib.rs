//! Realmcore Game Server Library
//!
//! This library provides the network core of the Realmcore game server:
//! framed binary messages, connection lifecycle, protocol selection and the
//! single-threaded dispatcher all application logic runs on.
//!
//! ## Modules
//!
//! - `auth` - Accounts, IP/account bans and connection admission
//! - `config` - Server configuration management
//! - `crypto` - Adler-32 and XTEA
//! - `dispatch` - Dispatcher and scheduler worker threads
//! - `error` - Error types and result definitions
//! - `net` - Message buffers, connections and listening services
//! - `protocol` - Frame codec and the status, login and game protocols
//! - `state` - The shared server context

pub mod auth;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod net;
pub mod protocol;
pub mod state;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{RealmError, Result};
pub use state::ServerContext;

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
