//! Ban manager
//!
//! Three independent gates, all keyed by peer IP unless noted:
//! - Connection rate: too many new connections within a second blocks the
//!   source for a fixed cooldown.
//! - Failed logins: repeated bad credentials disable login attempts for a while.
//! - Persistent bans: IP ranges and accounts stored in a [`BanStore`].

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SecurityConfig;

/// Width of the connection-rate window in milliseconds
const CONNECTION_WINDOW_MS: i64 = 1000;

/// An IP range ban
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpBan {
    pub ip: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub reason: String,
    pub banned_by: String,
    /// Unix seconds
    pub banned_at: i64,
    /// Unix seconds; zero or negative means permanent
    pub expires_at: i64,
    pub active: bool,
}

impl IpBan {
    /// Ban a single address
    pub fn single(ip: Ipv4Addr, reason: &str, expires_at: i64) -> Self {
        Self::range(ip, Ipv4Addr::BROADCAST, reason, expires_at)
    }

    /// Ban every address matching `ip` under `mask`
    pub fn range(ip: Ipv4Addr, mask: Ipv4Addr, reason: &str, expires_at: i64) -> Self {
        Self {
            ip,
            mask,
            reason: reason.to_string(),
            banned_by: String::new(),
            banned_at: Utc::now().timestamp(),
            expires_at,
            active: true,
        }
    }

    /// Whether `addr` falls inside the banned range
    pub fn matches(&self, addr: IpAddr) -> bool {
        let addr = match addr {
            IpAddr::V4(v4) => v4,
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => v4,
                None => return false,
            },
        };
        let mask = u32::from(self.mask);
        (u32::from(addr) & mask) == (u32::from(self.ip) & mask)
    }

    pub fn is_effective_at(&self, now: i64) -> bool {
        is_effective(self.active, self.expires_at, now)
    }
}

/// An account ban
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBan {
    pub account_id: Uuid,
    pub reason: String,
    pub banned_by: String,
    pub banned_at: i64,
    pub expires_at: i64,
    pub active: bool,
}

impl AccountBan {
    pub fn new(account_id: Uuid, reason: &str, expires_at: i64) -> Self {
        Self {
            account_id,
            reason: reason.to_string(),
            banned_by: String::new(),
            banned_at: Utc::now().timestamp(),
            expires_at,
            active: true,
        }
    }

    pub fn is_effective_at(&self, now: i64) -> bool {
        is_effective(self.active, self.expires_at, now)
    }
}

fn is_effective(active: bool, expires_at: i64, now: i64) -> bool {
    active && (expires_at <= 0 || expires_at >= now)
}

/// Storage backend for persistent bans
pub trait BanStore: Send + Sync {
    fn ip_bans(&self) -> Vec<IpBan>;
    fn add_ip_ban(&self, ban: IpBan);
    /// Deactivate bans whose range contains `ip`; returns how many changed
    fn remove_ip_ban(&self, ip: Ipv4Addr) -> usize;
    fn account_ban(&self, account_id: &Uuid) -> Option<AccountBan>;
    fn add_account_ban(&self, ban: AccountBan);
    fn remove_account_ban(&self, account_id: &Uuid) -> bool;
}

/// In-memory ban storage
#[derive(Default)]
pub struct MemoryBanStore {
    ip_bans: RwLock<Vec<IpBan>>,
    account_bans: DashMap<Uuid, AccountBan>,
}

impl MemoryBanStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BanStore for MemoryBanStore {
    fn ip_bans(&self) -> Vec<IpBan> {
        self.ip_bans.read().clone()
    }

    fn add_ip_ban(&self, ban: IpBan) {
        self.ip_bans.write().push(ban);
    }

    fn remove_ip_ban(&self, ip: Ipv4Addr) -> usize {
        let mut removed = 0;
        for ban in self.ip_bans.write().iter_mut() {
            if ban.active && ban.matches(IpAddr::V4(ip)) {
                ban.active = false;
                removed += 1;
            }
        }
        removed
    }

    fn account_ban(&self, account_id: &Uuid) -> Option<AccountBan> {
        self.account_bans.get(account_id).map(|entry| entry.clone())
    }

    fn add_account_ban(&self, ban: AccountBan) {
        self.account_bans.insert(ban.account_id, ban);
    }

    fn remove_account_ban(&self, account_id: &Uuid) -> bool {
        self.account_bans.remove(account_id).is_some()
    }
}

#[derive(Debug, Clone, Copy)]
struct ConnectBlock {
    window_start: i64,
    count: u32,
    blocked_until: i64,
}

#[derive(Debug, Clone, Copy)]
struct LoginBlock {
    last_attempt: i64,
    failures: u32,
}

/// Admission control and ban lookups
pub struct BanManager {
    config: SecurityConfig,
    store: Arc<dyn BanStore>,
    /// Connection-rate state (times in milliseconds)
    connections: DashMap<IpAddr, ConnectBlock>,
    /// Failed-login state (times in seconds)
    logins: DashMap<IpAddr, LoginBlock>,
}

impl BanManager {
    pub fn new(config: SecurityConfig, store: Arc<dyn BanStore>) -> Self {
        Self {
            config,
            store,
            connections: DashMap::new(),
            logins: DashMap::new(),
        }
    }

    /// The backing ban store
    pub fn store(&self) -> &Arc<dyn BanStore> {
        &self.store
    }

    // ============ Admission ============

    /// Admission predicate for new sockets: rate limit plus persistent IP bans
    pub fn admit(&self, ip: IpAddr) -> bool {
        if !self.accept_connection(ip) {
            debug!(address = %ip, "Connection rate exceeded");
            return false;
        }
        if self.is_ip_banned(ip) {
            debug!(address = %ip, "Connection from banned IP");
            return false;
        }
        true
    }

    /// Record a new connection attempt; false if the source is (now) blocked
    pub fn accept_connection(&self, ip: IpAddr) -> bool {
        self.accept_connection_at(ip, Utc::now().timestamp_millis())
    }

    /// [`accept_connection`](Self::accept_connection) at a given time in milliseconds
    pub fn accept_connection_at(&self, ip: IpAddr, now_ms: i64) -> bool {
        let mut block = self.connections.entry(ip).or_insert(ConnectBlock {
            window_start: now_ms,
            count: 0,
            blocked_until: 0,
        });

        // Attempts during the cooldown do not extend it
        if block.blocked_until > now_ms {
            return false;
        }

        if now_ms - block.window_start >= CONNECTION_WINDOW_MS {
            block.window_start = now_ms;
            block.count = 0;
        }

        block.count += 1;
        if block.count > self.config.max_connections_per_second {
            block.blocked_until = now_ms + (self.config.connection_block_secs as i64) * 1000;
            block.window_start = now_ms;
            block.count = 0;
            warn!(
                address = %ip,
                block_secs = self.config.connection_block_secs,
                "Too many connections, blocking source"
            );
            return false;
        }

        true
    }

    // ============ Failed logins ============

    /// Record the outcome of a login attempt
    pub fn add_login_attempt(&self, ip: IpAddr, success: bool) {
        self.add_login_attempt_at(ip, success, Utc::now().timestamp());
    }

    /// [`add_login_attempt`](Self::add_login_attempt) at a given time in seconds
    pub fn add_login_attempt_at(&self, ip: IpAddr, success: bool, now: i64) {
        if success {
            self.logins.remove(&ip);
            return;
        }

        let mut block = self.logins.entry(ip).or_insert(LoginBlock {
            last_attempt: now,
            failures: 0,
        });

        let tries = self.config.login_tries;
        if block.failures >= tries
            || now - block.last_attempt > self.config.retry_timeout_secs as i64
        {
            block.failures = 0;
        }

        block.failures += 1;
        block.last_attempt = now;
    }

    /// Whether login attempts from `ip` are currently refused
    pub fn is_ip_disabled(&self, ip: IpAddr) -> bool {
        self.is_ip_disabled_at(ip, Utc::now().timestamp())
    }

    /// [`is_ip_disabled`](Self::is_ip_disabled) at a given time in seconds
    pub fn is_ip_disabled_at(&self, ip: IpAddr, now: i64) -> bool {
        let tries = self.config.login_tries;
        if tries == 0 {
            return false;
        }

        match self.logins.get(&ip) {
            Some(block) => {
                block.failures >= tries
                    && now - block.last_attempt < self.config.login_timeout_secs as i64
            }
            None => false,
        }
    }

    // ============ Persistent bans ============

    /// The effective ban covering `ip`, if any
    pub fn ip_ban_at(&self, ip: IpAddr, now: i64) -> Option<IpBan> {
        self.store
            .ip_bans()
            .into_iter()
            .find(|ban| ban.matches(ip) && ban.is_effective_at(now))
    }

    pub fn is_ip_banned(&self, ip: IpAddr) -> bool {
        self.ip_ban_at(ip, Utc::now().timestamp()).is_some()
    }

    /// The effective ban on an account, if any
    pub fn account_ban_at(&self, account_id: &Uuid, now: i64) -> Option<AccountBan> {
        self.store
            .account_ban(account_id)
            .filter(|ban| ban.is_effective_at(now))
    }

    pub fn is_account_banned(&self, account_id: &Uuid) -> bool {
        self.account_ban_at(account_id, Utc::now().timestamp()).is_some()
    }

    pub fn add_ip_ban(&self, ban: IpBan) {
        info!(ip = %ban.ip, mask = %ban.mask, reason = %ban.reason, "IP ban added");
        self.store.add_ip_ban(ban);
    }

    pub fn add_account_ban(&self, ban: AccountBan) {
        info!(account_id = %ban.account_id, reason = %ban.reason, "Account ban added");
        self.store.add_account_ban(ban);
    }

    pub fn remove_ip_ban(&self, ip: Ipv4Addr) -> bool {
        let removed = self.store.remove_ip_ban(ip);
        if removed > 0 {
            info!(ip = %ip, removed, "IP ban lifted");
        }
        removed > 0
    }

    pub fn remove_account_ban(&self, account_id: &Uuid) -> bool {
        self.store.remove_account_ban(account_id)
    }

    /// Drop rate and login entries that no longer affect any decision
    pub fn purge_stale(&self) {
        let now = Utc::now();
        self.purge_stale_at(now.timestamp_millis(), now.timestamp());
    }

    pub fn purge_stale_at(&self, now_ms: i64, now: i64) {
        self.connections.retain(|_, block| {
            block.blocked_until > now_ms || now_ms - block.window_start < CONNECTION_WINDOW_MS
        });

        let horizon = self.config.login_timeout_secs.max(self.config.retry_timeout_secs) as i64;
        self.logins
            .retain(|_, block| now - block.last_attempt <= horizon);
    }

    /// Number of tracked sources, for diagnostics
    pub fn tracked_sources(&self) -> (usize, usize) {
        (self.connections.len(), self.logins.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> BanManager {
        BanManager::new(SecurityConfig::default(), Arc::new(MemoryBanStore::new()))
    }

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_connection_rate_block_and_cooldown() {
        let bans = manager();
        let start = 1_000_000;

        // 20 attempts within 500ms against a cap of 10 per second
        let results: Vec<bool> = (0..20)
            .map(|i| bans.accept_connection_at(ip(1), start + i * 25))
            .collect();
        assert!(results[..10].iter().all(|&ok| ok));
        assert!(results[10..].iter().all(|&ok| !ok));

        // Still blocked just before the cooldown ends
        assert!(!bans.accept_connection_at(ip(1), start + 250 + 9_999));
        // Free again after it
        assert!(bans.accept_connection_at(ip(1), start + 250 + 10_000));

        // Other sources are unaffected
        assert!(bans.accept_connection_at(ip(2), start + 300));
    }

    #[test]
    fn test_connection_window_rolls_over() {
        let bans = manager();
        for second in 0..5 {
            for i in 0..10 {
                assert!(bans.accept_connection_at(ip(1), second * 1000 + i));
            }
        }
    }

    #[test]
    fn test_failed_login_throttle() {
        let bans = manager();
        let now = 5_000;

        for i in 0..10 {
            assert!(!bans.is_ip_disabled_at(ip(1), now + i));
            bans.add_login_attempt_at(ip(1), false, now + i);
        }
        assert!(bans.is_ip_disabled_at(ip(1), now + 10));
        assert!(!bans.is_ip_disabled_at(ip(1), now + 9 + 60));

        // Success clears the counter
        bans.add_login_attempt_at(ip(1), true, now + 11);
        assert!(!bans.is_ip_disabled_at(ip(1), now + 11));
    }

    #[test]
    fn test_failures_spread_out_do_not_accumulate() {
        let bans = manager();
        for i in 0..20 {
            // Further apart than the retry timeout
            bans.add_login_attempt_at(ip(1), false, i * 10);
        }
        assert!(!bans.is_ip_disabled_at(ip(1), 200));
    }

    #[test]
    fn test_login_tries_zero_disables_check() {
        let config = SecurityConfig {
            login_tries: 0,
            ..SecurityConfig::default()
        };
        let bans = BanManager::new(config, Arc::new(MemoryBanStore::new()));
        for _ in 0..50 {
            bans.add_login_attempt_at(ip(1), false, 100);
        }
        assert!(!bans.is_ip_disabled_at(ip(1), 100));
    }

    #[test]
    fn test_ip_range_ban() {
        let bans = manager();
        bans.add_ip_ban(IpBan::range(
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::new(255, 255, 255, 0),
            "range",
            0,
        ));

        assert!(bans.is_ip_banned(ip(77)));
        assert!(!bans.is_ip_banned(IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1))));
        assert!(!bans.admit(ip(5)));

        assert!(bans.remove_ip_ban(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(!bans.is_ip_banned(ip(77)));
    }

    #[test]
    fn test_ban_expiry() {
        let bans = manager();
        bans.add_ip_ban(IpBan::single(Ipv4Addr::new(10, 0, 0, 1), "temp", 1_000));

        assert!(bans.ip_ban_at(ip(1), 999).is_some());
        assert!(bans.ip_ban_at(ip(1), 1_000).is_some());
        assert!(bans.ip_ban_at(ip(1), 1_001).is_none());
    }

    #[test]
    fn test_account_ban() {
        let bans = manager();
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, b"cheater");

        let mut ban = AccountBan::new(id, "botting", -1);
        assert!(ban.is_effective_at(i64::MAX));
        ban.active = false;
        bans.add_account_ban(ban);
        assert!(!bans.is_account_banned(&id));

        bans.add_account_ban(AccountBan::new(id, "botting", 0));
        assert!(bans.is_account_banned(&id));
        assert!(bans.remove_account_ban(&id));
        assert!(!bans.is_account_banned(&id));
    }

    #[test]
    fn test_ipv6_mapped_addresses_match() {
        let ban = IpBan::single(Ipv4Addr::new(192, 168, 1, 1), "", 0);
        let mapped = IpAddr::V6(Ipv4Addr::new(192, 168, 1, 1).to_ipv6_mapped());
        assert!(ban.matches(mapped));
        assert!(!ban.matches("::1".parse().unwrap()));
    }

    #[test]
    fn test_purge_stale() {
        let bans = manager();
        bans.accept_connection_at(ip(1), 0);
        bans.add_login_attempt_at(ip(2), false, 0);
        assert_eq!(bans.tracked_sources(), (1, 1));

        bans.purge_stale_at(100_000, 100);
        assert_eq!(bans.tracked_sources(), (0, 0));
    }
}
