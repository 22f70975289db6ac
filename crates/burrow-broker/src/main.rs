//! Broker CLI: serve the tunnel broker, or manage its token store.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use burrow_broker::auth::TokenStore;
use burrow_broker::{Broker, BrokerConfig};

#[derive(Parser, Debug)]
#[command(name = "burrow-broker")]
#[command(about = "Public broker for the burrow HTTP tunnel")]
#[command(version)]
struct Args {
    /// Address to listen on for both public traffic and tunnel clients
    #[arg(long, env = "BURROW_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Path of the token store; omit to disable authentication
    #[arg(long, env = "BURROW_TOKEN_STORE")]
    token_store: Option<PathBuf>,

    /// Seconds the router waits for a tunnel to answer a request
    #[arg(long, default_value_t = 30)]
    request_timeout: u64,

    /// Advertise https in forwarded requests (TLS terminates upstream)
    #[arg(long)]
    behind_tls: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage authentication tokens
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
}

#[derive(Subcommand, Debug)]
enum TokenAction {
    /// Create a token and print its plaintext once
    Create { name: String },
    /// Revoke a token by name
    Revoke { name: String },
    /// List active tokens
    List,
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

    let token_store = match &args.token_store {
        Some(path) => TokenStore::open(path)
            .with_context(|| format!("opening token store at {}", path.display()))?,
        None => TokenStore::disabled(),
    };

    if let Some(Command::Token { action }) = args.command {
        anyhow::ensure!(
            token_store.is_enabled(),
            "token commands need --token-store"
        );
        match action {
            TokenAction::Create { name } => {
                let plaintext = token_store.create(&name)?;
                println!("{plaintext}");
                eprintln!("store this token now; it cannot be recovered");
            }
            TokenAction::Revoke { name } => token_store.revoke(&name)?,
            TokenAction::List => {
                for record in token_store.list() {
                    println!(
                        "{}\t{}...\t{}",
                        record.name, record.prefix, record.created_at
                    );
                }
            }
        }
        return Ok(());
    }

    let config = BrokerConfig {
        request_timeout: Duration::from_secs(args.request_timeout),
        behind_tls: args.behind_tls,
    };
    let broker = Broker::new(config, token_store);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    broker.serve(listener).await.context("broker server error")
}
