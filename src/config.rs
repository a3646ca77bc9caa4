//! Configuration management

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::*;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Presence directory and multicast group
    pub presence: PresenceConfig,

    /// Signaling stream transport
    pub signaling: SignalingConfig,
}

/// Presence configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PresenceConfig {
    /// Multicast group address
    pub group_address: Ipv4Addr,

    /// Multicast group port
    pub group_port: u16,

    /// Interface used to join the group (unspecified lets the OS pick)
    pub interface: Ipv4Addr,

    /// Address advertised in presence messages instead of the resolved one
    pub advertise_address: Option<Ipv4Addr>,

    /// Announcement period in milliseconds
    pub announce_interval_ms: u64,

    /// Call offer retransmission period in milliseconds
    pub offer_retry_interval_ms: u64,

    /// Drop peers not heard from for this long. Unset keeps them forever.
    pub peer_ttl_ms: Option<u64>,

    /// Multicast TTL
    pub multicast_ttl: u32,

    /// Deliver our own datagrams back to local listeners
    pub multicast_loop: bool,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            group_address: DEFAULT_GROUP_ADDRESS,
            group_port: DEFAULT_GROUP_PORT,
            interface: Ipv4Addr::UNSPECIFIED,
            advertise_address: None,
            announce_interval_ms: DEFAULT_ANNOUNCE_INTERVAL_MS,
            offer_retry_interval_ms: DEFAULT_OFFER_RETRY_INTERVAL_MS,
            peer_ttl_ms: None,
            multicast_ttl: DEFAULT_MULTICAST_TTL,
            multicast_loop: true,
        }
    }
}

impl PresenceConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn offer_retry_interval(&self) -> Duration {
        Duration::from_millis(self.offer_retry_interval_ms)
    }

    pub fn peer_ttl(&self) -> Option<Duration> {
        self.peer_ttl_ms.map(Duration::from_millis)
    }

    /// Reject settings the directory cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.announce_interval_ms == 0 {
            return Err(crate::Error::Config(
                "presence.announce_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.offer_retry_interval_ms == 0 {
            return Err(crate::Error::Config(
                "presence.offer_retry_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.peer_ttl_ms == Some(0) {
            return Err(crate::Error::Config(
                "presence.peer_ttl_ms must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Destination for outbound presence datagrams
    pub fn group_socket_addr(&self) -> SocketAddr {
        SocketAddr::from((self.group_address, self.group_port))
    }
}

/// Signaling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalingConfig {
    /// Listen address for the acceptor role
    pub bind_address: String,

    /// TCP port used by both roles
    pub port: u16,

    /// Outbound lines buffered before `send` starts dropping
    pub write_queue_depth: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_SIGNALING_BIND_ADDRESS.to_string(),
            port: DEFAULT_SIGNALING_PORT,
            write_queue_depth: DEFAULT_WRITE_QUEUE_DEPTH,
        }
    }
}

impl SignalingConfig {
    /// Listen endpoint for the acceptor role
    pub fn listen_addr(&self) -> crate::Result<SocketAddr> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| crate::Error::Config(e.to_string()))
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: &PathBuf) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        config.presence.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &PathBuf) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "lan-call", "lan-call-signaling")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}
