//! relayd binary: flag parsing, logging setup, server composition.

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relayd::client::UpstreamClient;
use relayd::{Relay, RelayConfig, Server};

/// A caching HTTP request relay.
///
/// POST a JSON body of the form {"method": ..., "url": ..., "headers": {...}}
/// to any path; relayd performs the described request once and replies with a
/// JSON summary. Byte-identical bodies are answered from cache.
#[derive(Parser, Debug)]
#[command(name = "relayd", version, about, long_about = None)]
struct Args {
    /// TCP address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: String,

    /// Deadline in seconds for a whole outbound exchange; 0 disables it.
    #[arg(long, default_value_t = 30)]
    upstream_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = RelayConfig::new(args.addr, args.upstream_timeout_secs);
    info!(timeout = ?config.upstream_timeout, "outbound deadline configured");

    let relay = Arc::new(Relay::new(UpstreamClient::new(config.upstream_timeout)));
    let server = Server::bind(&config.bind_addr).await?;
    server
        .run(move |request| {
            let relay = Arc::clone(&relay);
            async move { relay.handle(request).await }
        })
        .await?;

    Ok(())
}
