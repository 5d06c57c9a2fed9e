use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mesh_core::buffer::LocalBuffer;
use mesh_core::config::{load_config, MeshConfig};
use mesh_core::controller::{ControllerClient, HttpControllerClient, NullControllerClient};
use mesh_core::metrics_source::{MetricsSource, SysinfoMetricsSource};
use mesh_core::node_id::NodeId;
use mesh_core::Agent;

#[derive(Parser, Debug)]
#[command(name = "mesh-agent", about = "Tactical-edge mesh relay agent")]
struct Cli {
    /// Path to the agent's YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override the node id read from the config file.
    #[arg(long)]
    node_id: Option<String>,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = load_config(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    let node_id_raw = cli.node_id.unwrap_or_else(|| config.node_id.clone());
    let node_id = NodeId::new(node_id_raw).context("invalid node id")?;
    info!(%node_id, config = %cli.config.display(), "mesh-agent starting");

    let controller: Arc<dyn ControllerClient> = if config.controller.primary_url.is_empty() {
        warn!("no controller primary_url configured, running mesh-only");
        Arc::new(NullControllerClient::default())
    } else {
        Arc::new(HttpControllerClient::new(
            config.controller.primary_url.clone(),
            Duration::from_secs(config.controller.timeout_seconds as u64),
        ))
    };

    let metrics_source: Arc<dyn MetricsSource> = Arc::new(SysinfoMetricsSource::default());

    let data_dir = PathBuf::from(&config.data_dir);
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data_dir {}", data_dir.display()))?;
    let buffer = LocalBuffer::new(1000, Some(data_dir.join("buffer.json")), 50);

    let mesh_config = config.mesh.clone().unwrap_or_else(|| {
        warn!("no mesh section in config, mesh relay disabled");
        MeshConfig {
            enabled: false,
            ..MeshConfig::default()
        }
    });

    let agent = Agent::new(node_id, mesh_config, controller, metrics_source, buffer);
    agent.start().context("starting mesh agent")?;
    info!("mesh-agent running, listening for peers");

    // The peering, sweeper, and heartbeat threads run for the life of the
    // process; this daemon has no admin socket to trigger a clean stop, so
    // it simply blocks here until killed, same as edge-gateway's accept loop.
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
