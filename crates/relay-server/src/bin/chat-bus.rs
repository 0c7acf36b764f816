//! # chat-bus
//!
//! Bus hub for multi-node chat deployments. Every `chatd` started with
//! `CHAT_BUS_URL=tcp://<hub>` links here, and every frame one node publishes
//! is forwarded to all of them.
//!
//! ```bash
//! chat-bus --listen 0.0.0.0:4222
//! ```

use anyhow::{Context, Result};
use chat_relay_transport::BusHub;
use clap::Parser;
use std::net::SocketAddr;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about = "Chat relay bus hub", long_about = None)]
struct Args {
    /// Address to accept node links on.
    #[arg(short, long, env = "CHAT_BUS_LISTEN", default_value = "0.0.0.0:4222")]
    listen: SocketAddr,

    /// Frames queued per node link before frames for it are dropped.
    #[arg(long, env = "CHAT_BUS_LINK_QUEUE", default_value_t = 1024)]
    link_queue: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_bus=info,chat_relay_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let hub = BusHub::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind bus hub on {}", args.listen))?
        .with_link_queue(args.link_queue);

    hub.run_until(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    })
    .await?;

    info!("Bus hub stopped");
    Ok(())
}
