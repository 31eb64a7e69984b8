//! Networking module
//!
//! This module moves bytes between clients and protocols:
//! - Pooled message buffers with typed cursors
//! - Connection lifecycle, framing and ordered writes
//! - The connection registry and admission limit
//! - Listening ports and protocol selection

pub mod connection;
pub mod manager;
pub mod message;
pub mod pool;
pub mod service;

pub use connection::{CloseMode, Connection, ConnectionId, ConnectionState};
pub use manager::ConnectionManager;
pub use message::{NetworkMessage, OutputMessage};
pub use pool::{BufferPool, Poolable, Pooled};
pub use service::{AdmissionPredicate, Service, ServiceDescriptor, ServiceManager, ServicePort};
