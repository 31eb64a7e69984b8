//! Error handling module
//!
//! Defines custom error types for the Realmcore server.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Main error type for the Realmcore server
#[derive(Error, Debug)]
pub enum RealmError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Protocol-related errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Service binding errors
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    Timeout,

    #[error("Message pool exhausted")]
    PoolExhausted,

    #[error("Packet rate exceeded: {0} packets per second")]
    RateLimited(u32),

    #[error("Invalid frame length: {0}")]
    InvalidFrameLength(usize),

    #[error("Dispatcher is not running")]
    DispatcherStopped,
}

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unknown protocol identifier: {0:#04x}")]
    UnknownIdentifier(u8),

    #[error("Invalid checksum: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Encrypted body length {0} is not a multiple of 8")]
    InvalidEncryptedLength(usize),

    #[error("Inner message length {length} exceeds decrypted body of {available} bytes")]
    InvalidInnerLength { length: usize, available: usize },

    #[error("Compression failed: {0}")]
    Compression(String),

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Message buffer overrun")]
    BufferOverrun,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Challenge mismatch")]
    ChallengeMismatch,
}

/// Service binding errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Port {port} already hosts a single-socket service")]
    SingleSocketConflict { port: u16 },

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Service manager is not running")]
    NotRunning,
}

/// Authentication-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account disabled")]
    AccountDisabled,

    #[error("Account banned")]
    AccountBanned,

    #[error("IP banned")]
    IpBanned,

    #[error("Too many login attempts")]
    TooManyAttempts,

    #[error("Unsupported client version {0}")]
    UnsupportedVersion(u16),

    #[error("Character not found: {0}")]
    CharacterNotFound(String),

    #[error("Account already exists: {0}")]
    AccountExists(String),
}

impl AuthError {
    /// Message shown to the client for this error
    pub fn client_message(&self) -> String {
        match self {
            AuthError::InvalidCredentials => "Account name or password is not correct.".to_string(),
            AuthError::AccountDisabled => "Your account has been disabled.".to_string(),
            AuthError::AccountBanned => "Your account has been banned.".to_string(),
            AuthError::IpBanned => "Your IP has been banned.".to_string(),
            AuthError::TooManyAttempts => {
                "Too many connection attempts from this IP. Try again later.".to_string()
            }
            AuthError::UnsupportedVersion(_) => "Your client version is not supported.".to_string(),
            AuthError::CharacterNotFound(_) => "Character could not be loaded.".to_string(),
            AuthError::AccountExists(_) => "Account name is already taken.".to_string(),
        }
    }
}

/// Result type alias for Realmcore operations
pub type Result<T> = std::result::Result<T, RealmError>;
