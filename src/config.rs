//! Server configuration module
//!
//! Handles loading and parsing of server configuration from files and environment variables.

use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Path to the configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Server name reported by the status protocol
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Address the listening sockets bind to
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    /// Address advertised to clients in the character list
    #[serde(default = "default_public_ip")]
    pub public_ip: String,

    /// Port hosting the login and status services
    #[serde(default = "default_login_port")]
    pub login_port: u16,

    /// Port hosting the game service
    #[serde(default = "default_game_port")]
    pub game_port: u16,

    /// Message of the day sent after a successful login
    #[serde(default = "default_motd")]
    pub motd: String,

    /// Optional TOML file with seed accounts
    #[serde(default)]
    pub accounts_file: Option<PathBuf>,

    /// Connection and framing limits
    #[serde(default)]
    pub network: NetworkConfig,

    /// Admission control and ban settings
    #[serde(default)]
    pub security: SecurityConfig,
}

/// Connection and framing limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Maximum number of live connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Packets a single connection may send per second before it is dropped
    #[serde(default = "default_max_packets_per_second")]
    pub max_packets_per_second: u32,

    /// Seconds to wait for a header or body before closing
    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,

    /// Seconds a single write may stall before closing
    #[serde(default = "default_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Number of message buffers per pool
    #[serde(default = "default_message_pool_capacity")]
    pub message_pool_capacity: usize,

    /// Lowest accepted client protocol version
    #[serde(default = "default_client_version_min")]
    pub client_version_min: u16,

    /// Highest accepted client protocol version
    #[serde(default = "default_client_version_max")]
    pub client_version_max: u16,
}

/// Admission control and ban settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// New connections one IP may open within a second
    #[serde(default = "default_max_connections_per_second")]
    pub max_connections_per_second: u32,

    /// How long an IP stays blocked after exceeding the connection rate
    #[serde(default = "default_connection_block_secs")]
    pub connection_block_secs: u64,

    /// Failed logins allowed before the IP is disabled (0 disables the check)
    #[serde(default = "default_login_tries")]
    pub login_tries: u32,

    /// Failed logins further apart than this restart the count
    #[serde(default = "default_retry_timeout_secs")]
    pub retry_timeout_secs: u64,

    /// How long an IP stays disabled after too many failed logins
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,

    /// Minimum interval between status requests from one IP
    #[serde(default = "default_status_request_interval_ms")]
    pub status_request_interval_ms: u64,
}

// Default value functions
fn default_server_name() -> String {
    "Realmcore".to_string()
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_public_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_login_port() -> u16 {
    7171
}

fn default_game_port() -> u16 {
    7172
}

fn default_motd() -> String {
    "Welcome to Realmcore!".to_string()
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_packets_per_second() -> u32 {
    25
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_message_pool_capacity() -> usize {
    2048
}

fn default_client_version_min() -> u16 {
    1098
}

fn default_client_version_max() -> u16 {
    1100
}

fn default_max_connections_per_second() -> u32 {
    10
}

fn default_connection_block_secs() -> u64 {
    10
}

fn default_login_tries() -> u32 {
    10
}

fn default_retry_timeout_secs() -> u64 {
    5
}

fn default_login_timeout_secs() -> u64 {
    60
}

fn default_status_request_interval_ms() -> u64 {
    5000
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_packets_per_second: default_max_packets_per_second(),
            read_timeout_secs: default_timeout_secs(),
            write_timeout_secs: default_timeout_secs(),
            message_pool_capacity: default_message_pool_capacity(),
            client_version_min: default_client_version_min(),
            client_version_max: default_client_version_max(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_connections_per_second: default_max_connections_per_second(),
            connection_block_secs: default_connection_block_secs(),
            login_tries: default_login_tries(),
            retry_timeout_secs: default_retry_timeout_secs(),
            login_timeout_secs: default_login_timeout_secs(),
            status_request_interval_ms: default_status_request_interval_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/server.toml"),
            server_name: default_server_name(),
            bind_ip: default_bind_ip(),
            public_ip: default_public_ip(),
            login_port: default_login_port(),
            game_port: default_game_port(),
            motd: default_motd(),
            accounts_file: None,
            network: NetworkConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl NetworkConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub async fn load() -> Result<Self> {
        // Determine config path from environment or use default
        let config_path = env::var("REALMCORE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/server.toml"));

        // Try to load from file
        let mut config = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path)
                .await
                .with_context(|| {
                    format!("Failed to read config file: {}", config_path.display())
                })?;

            Self::from_toml(&content).with_context(|| {
                format!("Failed to parse config file: {}", config_path.display())
            })?
        } else {
            tracing::warn!(
                "Config file not found at {}, using defaults",
                config_path.display()
            );
            Self::default()
        };

        config.config_path = config_path;

        // Override with environment variables
        config.apply_env_overrides();

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Parse a configuration document
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("REALMCORE_SERVER_NAME") {
            self.server_name = val;
        }
        if let Ok(val) = env::var("REALMCORE_BIND_IP") {
            self.bind_ip = val;
        }
        if let Ok(val) = env::var("REALMCORE_PUBLIC_IP") {
            self.public_ip = val;
        }
        if let Ok(val) = env::var("REALMCORE_LOGIN_PORT") {
            if let Ok(port) = val.parse() {
                self.login_port = port;
            }
        }
        if let Ok(val) = env::var("REALMCORE_GAME_PORT") {
            if let Ok(port) = val.parse() {
                self.game_port = port;
            }
        }
        if let Ok(val) = env::var("REALMCORE_MAX_CONNECTIONS") {
            if let Ok(max) = val.parse() {
                self.network.max_connections = max;
            }
        }
        if let Ok(val) = env::var("REALMCORE_MAX_PACKETS_PER_SECOND") {
            if let Ok(max) = val.parse() {
                self.network.max_packets_per_second = max;
            }
        }
        if let Ok(val) = env::var("REALMCORE_ACCOUNTS_FILE") {
            self.accounts_file = Some(PathBuf::from(val));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.bind_ip.parse::<IpAddr>().is_err() {
            anyhow::bail!("Bind IP '{}' is not a valid address", self.bind_ip);
        }

        if self.public_ip.parse::<Ipv4Addr>().is_err() {
            anyhow::bail!("Public IP '{}' is not a valid IPv4 address", self.public_ip);
        }

        // Ports must be set and unique
        if self.login_port == 0 || self.game_port == 0 {
            anyhow::bail!("Login and game ports must be non-zero");
        }
        if self.login_port == self.game_port {
            anyhow::bail!("Login port and game port must be different");
        }

        if self.network.max_connections == 0 {
            anyhow::bail!("Max connections must be at least 1");
        }
        if self.network.max_packets_per_second == 0 {
            anyhow::bail!("Max packets per second must be at least 1");
        }
        if self.network.message_pool_capacity < 16 {
            anyhow::bail!("Message pool capacity must be at least 16");
        }
        if self.network.read_timeout_secs == 0 || self.network.write_timeout_secs == 0 {
            anyhow::bail!("Read and write timeouts must be at least 1 second");
        }
        if self.network.client_version_min > self.network.client_version_max {
            anyhow::bail!("Minimum client version exceeds maximum client version");
        }

        Ok(())
    }

    /// Parsed bind address
    pub fn bind_addr(&self) -> IpAddr {
        self.bind_ip
            .parse()
            .unwrap_or(IpAddr::from([0, 0, 0, 0]))
    }

    /// Parsed advertised address
    pub fn public_addr(&self) -> Ipv4Addr {
        self.public_ip.parse().unwrap_or(Ipv4Addr::LOCALHOST)
    }
}
