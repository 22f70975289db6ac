//! Client CLI: expose a local HTTP service through a burrow broker.

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use burrow_client::ClientConfig;
use burrow_proto::tunnel_id;

#[derive(Parser, Debug)]
#[command(name = "burrow-client")]
#[command(about = "Expose a local HTTP service through a burrow broker")]
#[command(version)]
struct Args {
    /// Tunnel id to claim; random when omitted
    #[arg(long, env = "BURROW_ID")]
    id: Option<String>,

    /// Broker base URL
    #[arg(long, env = "BURROW_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Local HTTP origin to serve, host:port
    #[arg(long, env = "BURROW_LOCAL", default_value = "localhost:3000")]
    local: String,

    /// Bearer token, required when the broker has authentication enabled
    #[arg(long, env = "BURROW_TOKEN")]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let id = match args.id {
        Some(id) => {
            tunnel_id::validate(&id).context("invalid tunnel id")?;
            id
        }
        None => tunnel_id::generate_default(),
    };

    let config = ClientConfig {
        tunnel_id: id,
        server_url: args.server,
        local_addr: args.local,
        auth_token: args.token,
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    burrow_client::run(config, shutdown).await;
    Ok(())
}
