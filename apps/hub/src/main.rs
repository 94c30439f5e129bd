use anyhow::Result;
use clap::Parser;
use h2_tunnel_hub::{Hub, HubConfig};
use std::path::PathBuf;
use tracing::{error, info};

/// CLI arguments for the hub
#[derive(Parser, Debug)]
#[command(name = "hub")]
#[command(about = "HTTP/2 tunnel listener and reverse-tunnel portal", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "HUB_CONFIG", default_value = "hub.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    info!("h2-tunnel hub v{}", env!("CARGO_PKG_VERSION"));
    info!("Config: {}", args.config.display());

    let config = HubConfig::load(&args.config)?;
    let hub = Hub::start(&config).await.inspect_err(|e| {
        error!("Failed to start hub: {:#}", e);
    })?;

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl-C, shutting down gracefully...");
    hub.shutdown().await;

    Ok(())
}
