//! wsrelay server
//!
//! Run with: cargo run -- serve --port 9001
//!
//! # Configuration
//!
//! Settings come from a TOML file (`--config`, or the default search paths)
//! with environment overrides:
//! - `WSRELAY_HOST`, `WSRELAY_PORT`: listen address
//! - `WSRELAY_MAX_CONNECTIONS`: connection limit
//! - `WSRELAY_LOG_LEVEL`, `WSRELAY_LOG_FORMAT`: logging
//! - `RUST_LOG`: takes precedence over the configured level

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wsrelay::config::{generate_default_config, Config, LoggingConfig};
use wsrelay::server;

#[derive(Parser)]
#[command(name = "wsrelay")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "WebSocket broadcast relay")]
#[command(long_about = "wsrelay accepts WebSocket clients on one endpoint and relays every message\na client sends to all other connected clients.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config file (default: search standard locations)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the listen host
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Override the listen port
    #[arg(short, long, global = true)]
    pub port: Option<u16>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay (default)
    Serve,

    /// Print a default config file
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(Commands::InitConfig) = cli.command {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    init_tracing(&config.logging);
    tracing::info!("Starting wsrelay v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        max_connections = config.relay.max_connections,
        max_frame_bytes = config.relay.max_frame_bytes,
        "Relay limits"
    );

    let listener = server::bind(&config).await?;
    server::serve(listener, config.relay, server::shutdown_signal()).await?;

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("wsrelay={}", logging.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
