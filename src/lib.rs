//! # Meshgate - Self-Organizing Mesh Core with Subnet Bridging
//!
//! Meshgate forms a tree-topology mesh among peer devices, elects a root
//! when no upstream network exists, assigns each node a deterministic
//! IPv4 subnet derived from its hardware address, and bridges IP traffic
//! between subnets by tunneling framed packets over the mesh transport.
//!
//! ## Features
//!
//! - **Mesh Formation**: Multi-state network-formation protocol with an
//!   explicit root-election fallback when no parent is found.
//! - **Deterministic Addressing**: A node's 6-byte hardware address maps
//!   to a subnet id and on to a `192.168.(10+id).0/24` prefix.
//! - **IP Bridging**: Custom checksummed wire framing with a bounded,
//!   lossy forward queue - best-effort by design, memory-bounded under
//!   burst load.
//! - **External AP Gating**: A root node can expose a conventional access
//!   point for non-mesh clients, independently stoppable.
//! - **Async Design**: Built with Tokio; cooperative task shutdown over
//!   cancellation channels rather than timeout polling.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshgate::config::Config;
//! use meshgate::mesh::{MeshManager, sim::SimNetwork};
//! use meshgate::bridge::IpBridge;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let net = SimNetwork::new();
//!     let transport = net.create_node("24:6f:28:00:00:0a".parse()?);
//!
//!     let manager = MeshManager::new(transport, config.mesh_options(), None);
//!     manager.initialize()?;
//!     manager.start()?;
//!
//!     let bridge = IpBridge::new(manager.clone(), config.bridge_options());
//!     // ... wait for connectivity, then bridge.enable() ...
//!
//!     bridge.disable().await?;
//!     manager.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`mesh`] - Mesh network manager, transport seam, simulated transport
//! - [`bridge`] - IP bridge, wire framing and checksum
//! - [`addressing`] - Node identity and subnet derivation
//! - [`routing`] - Bounded route cache
//! - [`config`] - Configuration management and validation
//! - [`storage`] - Durable mesh identity persistence
//! - [`error`] - Crate-wide error taxonomy

pub mod addressing;
pub mod bridge;
pub mod config;
pub mod error;
pub mod logutil;
pub mod mesh;
pub mod routing;
pub mod storage;

pub use addressing::{MeshNodeId, SubnetId};
pub use error::{MeshError, Result};
