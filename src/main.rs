//! Binary entrypoint for the meshgate CLI.
//!
//! Commands:
//! - `init` - create a starter `config.toml`
//! - `start [--nodes N] [--duration S]` - run a simulated mesh demo with
//!   bridging enabled between the nodes' subnets
//! - `status [--json]` - print the persisted mesh identity
//!
//! See the library crate docs for module-level details: `meshgate::`.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use meshgate::addressing::MeshNodeId;
use meshgate::bridge::{IpBridge, LocalDelivery};
use meshgate::config::Config;
use meshgate::mesh::sim::SimNetwork;
use meshgate::mesh::{MeshEvent, MeshManager, MeshObserver};
use meshgate::storage::ConfigStore;
use meshgate::SubnetId;

#[derive(Parser)]
#[command(name = "meshgate")]
#[command(about = "Self-organizing mesh core with subnet bridging")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a starter configuration file
    Init,
    /// Run a simulated mesh with IP bridging between the nodes
    Start {
        /// Number of simulated nodes
        #[arg(short, long, default_value_t = 3)]
        nodes: u8,
        /// Seconds to run before a clean stop; 0 runs until Ctrl-C
        #[arg(short, long, default_value_t = 0)]
        duration: u64,
    },
    /// Print the persisted mesh identity
    Status {
        /// Identity store directory
        #[arg(long, default_value = "data/meshgate-store")]
        store: String,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let pre_config = match cli.command {
        Commands::Init => None,
        _ => Config::load(&cli.config).await.ok(),
    };
    if !matches!(cli.command, Commands::Init) {
        init_logging(&pre_config, cli.verbose);
    }

    match cli.command {
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            println!("Wrote {}", cli.config);
            Ok(())
        }
        Commands::Start { nodes, duration } => {
            let config = pre_config.ok_or_else(|| {
                anyhow!("no config at {}; run `meshgate init` first", cli.config)
            })?;
            run_demo(config, nodes, duration).await
        }
        Commands::Status { store, json } => show_status(&store, json),
    }
}

/// Logs every mesh event the manager reports.
struct LogObserver {
    node: MeshNodeId,
}

impl MeshObserver for LogObserver {
    fn on_mesh_event(&self, event: MeshEvent) {
        info!("[{}] mesh event: {:?}", self.node, event);
    }
}

/// Demo delivery sink: prints inbound bridged packets.
struct PrintDelivery {
    node: MeshNodeId,
}

impl LocalDelivery for PrintDelivery {
    fn deliver(&self, src_subnet: SubnetId, packet: &[u8]) {
        info!(
            "[{}] delivered {} bytes bridged from subnet {}",
            self.node,
            packet.len(),
            src_subnet
        );
    }
}

async fn run_demo(config: Config, nodes: u8, duration: u64) -> Result<()> {
    if nodes == 0 {
        return Err(anyhow!("need at least one node"));
    }
    info!("Starting meshgate v{} demo mesh", env!("CARGO_PKG_VERSION"));

    let net = SimNetwork::new();
    let mut managers: Vec<MeshManager> = Vec::new();
    let mut bridges: Vec<IpBridge> = Vec::new();

    for i in 0..nodes {
        let addr = MeshNodeId::new([0x24, 0x6f, 0x28, 0x00, 0x00, i + 1]);
        let transport = net.create_node(addr);
        let manager = MeshManager::new(
            transport,
            config.mesh_options(),
            Some(Arc::new(LogObserver { node: addr })),
        );
        manager.initialize()?;
        manager.start()?;
        managers.push(manager);
        // Stagger so the first node wins the root election cleanly.
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    // Give the election and attachments a moment to settle.
    tokio::time::sleep(Duration::from_millis(500)).await;

    for manager in &managers {
        if !manager.is_connected() {
            warn!("node {} did not reach connected state", manager.node_addr());
            continue;
        }
        let bridge = IpBridge::new(manager.clone(), config.bridge_options());
        bridge.set_local_delivery(Arc::new(PrintDelivery {
            node: manager.node_addr(),
        }));
        bridge.enable()?;
        bridges.push(bridge);
    }

    if let Some(root) = managers.iter().find(|m| m.is_root()) {
        root.start_external_ap(&config.external_ap.ssid, config.external_ap.max_connections)?;
        info!(
            "root {} external AP at {}",
            root.node_addr(),
            root.external_ap_ip()?
        );
        match ConfigStore::open("data/meshgate-store") {
            Ok(store) => {
                if let Err(e) = store.save_identity(&root.identity()) {
                    warn!("could not persist mesh identity: {}", e);
                }
            }
            Err(e) => warn!("could not open identity store: {}", e),
        }
    }

    // Push one demo packet per non-root node toward the root's subnet.
    if let Some(root) = managers.iter().find(|m| m.is_root()) {
        let dest: Ipv4Addr = root.get_subnet_id().gateway();
        for (manager, bridge) in managers.iter().zip(&bridges) {
            if manager.is_root() {
                continue;
            }
            let payload = format!("hello from {}", manager.node_addr());
            if let Err(e) = bridge.forward(dest, payload.as_bytes()) {
                warn!("demo forward failed: {}", e);
            }
        }
    }

    if duration > 0 {
        tokio::time::sleep(Duration::from_secs(duration)).await;
    } else {
        info!("running until Ctrl-C");
        tokio::signal::ctrl_c().await?;
    }

    for (manager, bridge) in managers.iter().zip(&bridges) {
        let stats = bridge.stats();
        info!(
            "[{}] bridge stats: tx={} pkts/{} bytes rx={} pkts/{} bytes dropped={}",
            manager.node_addr(),
            stats.packets_tx,
            stats.bytes_tx,
            stats.packets_rx,
            stats.bytes_rx,
            stats.tx_dropped
        );
    }

    for bridge in &bridges {
        bridge.disable().await?;
    }
    for manager in managers.iter().rev() {
        manager.stop().await?;
    }
    info!("demo mesh stopped");
    Ok(())
}

fn show_status(store_path: &str, json: bool) -> Result<()> {
    let store = ConfigStore::open(store_path)?;
    let identity = store
        .load_identity()
        .map_err(|e| anyhow!("no persisted identity in {}: {}", store_path, e))?;
    let mesh_id = MeshNodeId::new(identity.mesh_id);
    if json {
        let out = serde_json::json!({
            "mesh_id": mesh_id.to_string(),
            "channel": identity.channel,
            "max_layer": identity.max_layer,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("Mesh id:   {}", mesh_id);
        println!("Channel:   {}", identity.channel);
        println!("Max layer: {}", identity.max_layer);
    }
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    if let Some(file) = config.as_ref().and_then(|c| c.logging.file.clone()) {
        if let Ok(f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file)
        {
            let sink = std::sync::Arc::new(std::sync::Mutex::new(f));
            // When stdout is not a terminal (service mode) the file is the
            // only destination; in the foreground keep both.
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = sink.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
