//! devlink-node: entry point.
//!
//! ```text
//! devlink-node                   Run in the foreground
//! devlink-node --config <path>   Load a custom config TOML
//! devlink-node --gen-config      Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use devlink_node::config::NodeConfig;
use devlink_node::service::NodeService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "devlink-node", about = "devlink peer device-control node")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "devlink-node.toml")]
    config: PathBuf,

    /// Write the default configuration to the config path and exit.
    #[arg(long)]
    init: bool,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", NodeConfig::default_toml()?);
        return Ok(());
    }

    if cli.init {
        NodeConfig::write_default(&cli.config)?;
        println!("Wrote {}", cli.config.display());
        return Ok(());
    }

    let config = NodeConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("devlink-node v{}", env!("CARGO_PKG_VERSION"));
    info!("node id: {}", config.node.id);
    info!("listen: {}", config.network.listen_addr);
    info!("peers: {}", config.network.peers.len());

    let service = NodeService::new(config);
    let stop = service.stop_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
