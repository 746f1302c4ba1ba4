//! Configuration for the devlink node service.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use devlink_core::engine::ControllerConfig;
use devlink_core::{DevlinkError, PeerAddr, PeerId, TcpTransportConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity of this node.
    pub node: IdentityConfig,
    /// Listen address and peers to dial.
    pub network: NetworkConfig,
    /// Query / modify protocol tunables.
    pub protocol: ProtocolConfig,
    /// Camera capture settings.
    pub capture: CaptureConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Stable peer id announced during the handshake.
    pub id: String,
    /// Display name. Empty means "use the device name".
    pub name: String,
    /// Answer to inbound friend requests from unknown peers.
    pub accept_friend_requests: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP address to accept peers on.
    pub listen_addr: String,
    /// Peers dialed at startup and redialed while unreachable.
    pub peers: Vec<PeerAddr>,
    /// Delay between dial attempts, in milliseconds.
    pub retry_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// How long a query waits for its status reply.
    pub query_timeout_ms: u64,
    /// Platform brightness changes below this are not broadcast.
    pub brightness_tolerance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    /// Target frames per second.
    pub fps: u8,
    /// zstd level for outgoing frames.
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            id: "devlink-node".into(),
            name: String::new(),
            accept_friend_requests: true,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7340".into(),
            peers: Vec::new(),
            retry_interval_ms: 2000,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 5000,
            brightness_tolerance: 0.05,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 15,
            compression_level: 3,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        std::fs::write(path, Self::default_toml()?)
    }

    pub fn default_toml() -> std::io::Result<String> {
        toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)
    }

    /// Peer ids must be bare: a `@` suffix is stripped from incoming
    /// addresses and would no longer match the roster.
    pub fn validate(&self) -> devlink_core::Result<()> {
        let own = PeerId::from(self.node.id.as_str());
        let peers = self.network.peers.iter().map(|p| &p.id);
        match std::iter::once(&own).chain(peers).find(|id| !id.is_bare()) {
            Some(id) => Err(DevlinkError::Other(format!("invalid peer id {id:?}"))),
            None => Ok(()),
        }
    }

    pub fn to_controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            query_timeout: Duration::from_millis(self.protocol.query_timeout_ms.max(1)),
            brightness_tolerance: self.protocol.brightness_tolerance.clamp(0.0, 1.0),
            accept_friend_requests: self.node.accept_friend_requests,
            self_name: self.node.name.clone(),
            ..ControllerConfig::default()
        }
    }

    pub fn to_transport_config(&self) -> TcpTransportConfig {
        let mut config =
            TcpTransportConfig::new(self.node.id.as_str(), self.network.listen_addr.as_str());
        config.name = self.display_name();
        config.peers = self.network.peers.clone();
        config.retry_interval = Duration::from_millis(self.network.retry_interval_ms.max(1));
        config
    }

    /// Name advertised to peers: the configured one, else the id.
    pub fn display_name(&self) -> String {
        if self.node.name.is_empty() {
            self.node.id.clone()
        } else {
            self.node.name.clone()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
