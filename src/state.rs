//! Application state module
//!
//! Contains the context shared by every connection, protocol and worker.
//! Components receive it explicitly instead of looking subsystems up
//! globally.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::auth::{AccountStore, BanManager, BanStore, MemoryAccountStore, MemoryBanStore};
use crate::config::ServerConfig;
use crate::dispatch::{Dispatcher, Scheduler};
use crate::net::manager::ConnectionManager;
use crate::net::message::{NetworkMessage, OutputMessage};
use crate::net::pool::BufferPool;
use crate::protocol::game::{GameHandler, NullGameHandler};

/// State shared across all connections
pub struct ServerContext {
    /// Server configuration
    pub config: ServerConfig,
    /// Single-writer executor for all application logic
    pub dispatcher: Arc<Dispatcher>,
    /// Delayed events, forwarded to the dispatcher
    pub scheduler: Scheduler,
    /// Registry of live connections
    pub connections: ConnectionManager,
    /// Admission control, login throttling and bans
    pub bans: BanManager,
    /// Account storage
    pub accounts: Arc<dyn AccountStore>,
    /// Buffers for received frames
    pub input_pool: BufferPool<NetworkMessage>,
    /// Buffers for outgoing frames
    pub output_pool: BufferPool<OutputMessage>,
    /// Game logic behind the game protocol
    pub game_handler: Arc<dyn GameHandler>,
    /// When the context was created
    pub started_at: Instant,
    /// Last status request per source
    status_requests: DashMap<IpAddr, Instant>,
}

impl ServerContext {
    /// Create a context backed by in-memory stores
    pub fn new(config: ServerConfig) -> Self {
        Self::builder(config).build()
    }

    /// Create a context with the given account and ban stores
    pub fn with_stores(
        config: ServerConfig,
        accounts: Arc<dyn AccountStore>,
        bans: Arc<dyn BanStore>,
    ) -> Self {
        Self::builder(config).accounts(accounts).ban_store(bans).build()
    }

    pub fn builder(config: ServerConfig) -> ServerContextBuilder {
        ServerContextBuilder {
            config,
            accounts: None,
            bans: None,
            game_handler: None,
        }
    }

    /// Start the dispatcher and scheduler threads
    pub fn start(&self) -> std::io::Result<()> {
        self.dispatcher.start()?;
        self.scheduler.start()?;
        info!(
            max_connections = self.connections.max_connections(),
            pool_capacity = self.input_pool.capacity(),
            "Server context started"
        );
        Ok(())
    }

    /// Stop the scheduler, then the dispatcher
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.dispatcher.shutdown();
    }

    /// Time since the context was created
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Record a status request; false if `ip` asked too recently
    pub fn allow_status_request(&self, ip: IpAddr) -> bool {
        let interval = Duration::from_millis(self.config.security.status_request_interval_ms);
        let now = Instant::now();

        match self.status_requests.entry(ip) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < interval {
                    return false;
                }
                entry.insert(now);
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
            }
        }
        true
    }

    /// Forget status sources that may ask again anyway
    pub fn purge_status_requests(&self) {
        let interval = Duration::from_millis(self.config.security.status_request_interval_ms);
        self.status_requests
            .retain(|_, last| last.elapsed() < interval);
    }
}

/// Builder for [`ServerContext`] with optional injected collaborators
pub struct ServerContextBuilder {
    config: ServerConfig,
    accounts: Option<Arc<dyn AccountStore>>,
    bans: Option<Arc<dyn BanStore>>,
    game_handler: Option<Arc<dyn GameHandler>>,
}

impl ServerContextBuilder {
    pub fn accounts(mut self, accounts: Arc<dyn AccountStore>) -> Self {
        self.accounts = Some(accounts);
        self
    }

    pub fn ban_store(mut self, bans: Arc<dyn BanStore>) -> Self {
        self.bans = Some(bans);
        self
    }

    pub fn game_handler(mut self, handler: Arc<dyn GameHandler>) -> Self {
        self.game_handler = Some(handler);
        self
    }

    pub fn build(self) -> ServerContext {
        let config = self.config;
        let dispatcher = Arc::new(Dispatcher::new());
        let pool_capacity = config.network.message_pool_capacity;

        ServerContext {
            scheduler: Scheduler::new(Arc::clone(&dispatcher)),
            dispatcher,
            connections: ConnectionManager::new(config.network.max_connections),
            bans: BanManager::new(
                config.security.clone(),
                self.bans.unwrap_or_else(|| Arc::new(MemoryBanStore::new())),
            ),
            accounts: self
                .accounts
                .unwrap_or_else(|| Arc::new(MemoryAccountStore::new())),
            input_pool: BufferPool::new("input", pool_capacity),
            output_pool: BufferPool::new("output", pool_capacity),
            game_handler: self
                .game_handler
                .unwrap_or_else(|| Arc::new(NullGameHandler)),
            started_at: Instant::now(),
            status_requests: DashMap::new(),
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_status_requests_are_throttled() {
        let ctx = ServerContext::new(ServerConfig::default());
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 7));
        let other = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 8));

        assert!(ctx.allow_status_request(ip));
        assert!(!ctx.allow_status_request(ip));
        assert!(ctx.allow_status_request(other));
    }

    #[test]
    fn test_status_interval_zero_allows_everything() {
        let mut config = ServerConfig::default();
        config.security.status_request_interval_ms = 0;
        let ctx = ServerContext::new(config);
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);

        assert!(ctx.allow_status_request(ip));
        assert!(ctx.allow_status_request(ip));
    }

    #[test]
    fn test_start_and_shutdown() {
        let ctx = ServerContext::new(ServerConfig::default());
        ctx.start().unwrap();
        assert!(ctx.dispatcher.dispatch(|| {}));
        ctx.shutdown();
        assert!(!ctx.dispatcher.dispatch(|| {}));
    }
}
