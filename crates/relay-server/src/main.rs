//! # chatd
//!
//! Chat relay node.
//!
//! ## Usage
//!
//! ```bash
//! # Run a single node with default settings
//! chatd
//!
//! # Run with custom config
//! chatd --config /path/to/chatd.toml
//!
//! # Join a multi-node deployment through a bus hub
//! CHAT_PORT=6001 CHAT_BUS_URL=tcp://127.0.0.1:4222 chatd
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Chat relay node", long_about = None)]
struct Args {
    /// Path to a TOML config file.
    #[arg(short, long, env = "CHAT_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatd=info,chat_relay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load(args.config.as_deref())?;

    tracing::info!("Starting chat node on {}:{}", config.host, config.port);

    handlers::run_node(config).await?;

    Ok(())
}
