//! Connection registry
//!
//! Tracks every live [`Connection`] and enforces the global connection
//! limit. A refused creation is the caller's cue to drop the socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::connection::{CloseMode, Connection, ConnectionId};
use super::service::ServicePort;
use crate::state::ServerContext;

/// Bounded set of live connections
pub struct ConnectionManager {
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    max_connections: usize,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            max_connections,
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a connection for an accepted socket
    ///
    /// Returns `None` once `max_connections` are live. Must be called from
    /// within the tokio runtime that will drive the socket.
    pub fn create_connection(
        &self,
        context: &Arc<ServerContext>,
        stream: TcpStream,
        peer: SocketAddr,
        port: &Arc<ServicePort>,
    ) -> Option<Arc<Connection>> {
        let mut connections = self.connections.lock();
        if connections.len() >= self.max_connections {
            warn!(
                address = %peer,
                max_connections = self.max_connections,
                "Connection limit reached, refusing"
            );
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection::new(
            id,
            stream,
            peer,
            Arc::clone(context),
            Arc::clone(port),
            Handle::current(),
        ));
        connections.insert(id, Arc::clone(&connection));

        debug!(
            connection_id = id,
            address = %peer,
            total = connections.len(),
            "Connection registered"
        );
        Some(connection)
    }

    /// Remove a connection from the registry; returns whether it was present
    pub fn release_connection(&self, id: ConnectionId) -> bool {
        self.connections.lock().remove(&id).is_some()
    }

    /// Force-close every tracked connection
    pub fn close_all(&self) {
        let connections = std::mem::take(&mut *self.connections.lock());
        if !connections.is_empty() {
            info!(count = connections.len(), "Closing all connections");
        }
        for connection in connections.into_values() {
            connection.close(CloseMode::Force);
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.lock().get(&id).cloned()
    }

    /// Number of live connections
    pub fn count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}
