//! Standalone reference server for local development.

use clap::Parser;
use rapid_sync::server::{ServerConfig, SyncServer};

#[derive(Debug, Parser)]
#[command(name = "rapid-sync-server", version, about = "In-memory rapid-sync reference server")]
struct Cli {
    /// Address to bind the websocket listener to.
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Token clients must present with `auth` before reading or writing.
    #[arg(long)]
    token: Option<String>,

    /// Change notices a connection may fall behind before it re-evaluates
    /// its subscriptions.
    #[arg(long, default_value_t = 256)]
    feed_capacity: usize,
}

impl From<Cli> for ServerConfig {
    fn from(cli: Cli) -> Self {
        Self {
            bind_addr: cli.bind,
            feed_capacity: cli.feed_capacity,
            required_token: cli.token,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let server = SyncServer::new(Cli::parse().into());
    log::info!("Starting rapid-sync reference server on {}", server.bind_addr());
    server.run().await
}
