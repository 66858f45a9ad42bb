//! # Configuration Management
//!
//! TOML configuration for the mesh core, validated on load, with defaults
//! matching the reference deployment.
//!
//! ```toml
//! [mesh]
//! mesh_id = "47:45:4f:00:00:01"
//! channel = 1
//! max_layer = 6
//! allow_root = true
//! route_table_size = 50
//!
//! [bridge]
//! queue_size = 8
//! mtu = 1500
//!
//! [external_ap]
//! ssid = "meshgate"
//! max_connections = 4
//!
//! [logging]
//! level = "info"
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::addressing::MeshNodeId;
use crate::bridge::BridgeOptions;
use crate::mesh::{MeshOptions, TransportConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSection {
    /// Mesh group id; all members must share it.
    pub mesh_id: MeshNodeId,
    /// Radio channel, 1..=13.
    pub channel: u8,
    /// Maximum tree depth.
    pub max_layer: u8,
    /// Whether this node may elect itself root when no network is found.
    #[serde(default = "default_allow_root")]
    pub allow_root: bool,
    /// Mesh softAP password; empty for an open mesh.
    #[serde(default)]
    pub password: String,
    /// Route cache capacity.
    #[serde(default = "default_route_table_size")]
    pub route_table_size: usize,
}

fn default_allow_root() -> bool {
    true
}

fn default_route_table_size() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSection {
    /// Forward queue depth; overflow drops packets.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Largest IP packet accepted for bridging.
    #[serde(default = "default_mtu")]
    pub mtu: usize,
}

fn default_queue_size() -> usize {
    8
}

fn default_mtu() -> usize {
    1500
}

impl Default for BridgeSection {
    fn default() -> Self {
        BridgeSection {
            queue_size: default_queue_size(),
            mtu: default_mtu(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalApSection {
    /// Broadcast network name for non-mesh clients.
    pub ssid: String,
    #[serde(default = "default_ap_max_connections")]
    pub max_connections: u8,
}

fn default_ap_max_connections() -> u8 {
    4
}

impl Default for ExternalApSection {
    fn default() -> Self {
        ExternalApSection {
            ssid: "meshgate".to_string(),
            max_connections: default_ap_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file; stdout only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        LoggingSection {
            level: default_log_level(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mesh: MeshSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub external_ap: ExternalApSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mesh: MeshSection {
                mesh_id: MeshNodeId::new([0x47, 0x45, 0x4F, 0x00, 0x00, 0x01]),
                channel: 1,
                max_layer: 6,
                allow_root: true,
                password: String::new(),
                route_table_size: 50,
            },
            bridge: BridgeSection::default(),
            external_ap: ExternalApSection::default(),
            logging: LoggingSection::default(),
        }
    }
}

impl Config {
    pub async fn load(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("cannot read config file {}: {}", path, e))?;
        let config: Config =
            toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, path: &str) -> Result<()> {
        let raw = toml::to_string_pretty(self)?;
        fs::write(path, raw).await?;
        Ok(())
    }

    /// Write a commented starter config; refuses to clobber an existing
    /// file.
    pub async fn create_default(path: &str) -> Result<()> {
        if fs::try_exists(path).await? {
            return Err(anyhow!("{} already exists", path));
        }
        Config::default().save(path).await
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=13).contains(&self.mesh.channel) {
            return Err(anyhow!("mesh.channel must be 1..=13"));
        }
        if self.mesh.max_layer == 0 {
            return Err(anyhow!("mesh.max_layer must be at least 1"));
        }
        if self.mesh.route_table_size == 0 {
            return Err(anyhow!("mesh.route_table_size must be at least 1"));
        }
        if self.bridge.queue_size == 0 {
            return Err(anyhow!("bridge.queue_size must be at least 1"));
        }
        if !(64..=1500).contains(&self.bridge.mtu) {
            return Err(anyhow!("bridge.mtu must be 64..=1500"));
        }
        if self.external_ap.ssid.is_empty() || self.external_ap.ssid.len() > 32 {
            return Err(anyhow!("external_ap.ssid must be 1..=32 bytes"));
        }
        Ok(())
    }

    pub fn mesh_options(&self) -> MeshOptions {
        MeshOptions {
            transport: TransportConfig {
                mesh_id: self.mesh.mesh_id,
                channel: self.mesh.channel,
                max_layer: self.mesh.max_layer,
                allow_root: self.mesh.allow_root,
                password: self.mesh.password.clone(),
            },
            route_table_size: self.mesh.route_table_size,
        }
    }

    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            queue_size: self.bridge.queue_size,
            mtu: self.bridge.mtu,
        }
    }
}
