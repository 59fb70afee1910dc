//! Bitnode - a Bitcoin-style full node.
//!
//! This is the main entry point for the bitnode binary.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

mod config;
mod console;
mod node;

use config::NodeConfig;
use node::Node;

/// Bitcoin-style P2P full node.
#[derive(Parser, Debug)]
#[command(name = "bitnode")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "bitnode.toml")]
    config: PathBuf,

    /// Network to connect to (mainnet, testnet)
    #[arg(short, long, default_value = "mainnet")]
    network: String,

    /// P2P bind address
    #[arg(long)]
    p2p_bind: Option<String>,

    /// Accept inbound connections and announce our address
    #[arg(short, long)]
    listen: bool,

    /// Peer to connect to (repeatable)
    #[arg(long)]
    connect: Vec<String>,

    /// Maximum inbound connections
    #[arg(long)]
    max_inbound: Option<usize>,

    /// Maximum outbound connections
    #[arg(long)]
    max_outbound: Option<usize>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Disable the interactive console
    #[arg(long)]
    no_console: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting bitnode v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = NodeConfig::load(&args.config, &args)?;

    info!("Network: {}", config.network);
    info!("P2P: {} (listen: {})", config.p2p.bind_address, config.p2p.listen);

    let node = Node::new(config).await?;
    let network = node.network();

    if node.console_enabled() {
        tokio::spawn(console::run(network.clone()));
    }

    let mut running = tokio::spawn(node.run());

    tokio::select! {
        result = &mut running => {
            match result {
                Ok(Err(e)) => error!("Node error: {:#}", e),
                Err(e) => error!("Node task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            network.shutdown();
            if let Ok(Err(e)) = running.await {
                error!("Node error: {:#}", e);
            }
        }
    }

    info!("bitnode stopped");
    Ok(())
}
