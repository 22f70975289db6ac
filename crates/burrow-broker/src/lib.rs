//! The burrow broker: public side of the HTTP tunnel.
//!
//! One listener serves two jobs. Clients claim tunnels through a WebSocket
//! upgrade on `GET /?id=<tunnel-id>`; everything else is public traffic,
//! routed to a tunnel by the subdomain in its `Host` header and answered
//! over the claimed control link.

pub mod auth;
mod control;
pub mod pending;
pub mod registry;
pub mod router;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;

use auth::TokenStore;
use registry::TunnelRegistry;
use router::HostCache;

/// Broker tuning knobs.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long the router waits for a tunnel to answer one request.
    pub request_timeout: Duration,
    /// Set when TLS terminates in front of this process, so forwarded
    /// requests advertise `https`.
    pub behind_tls: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            behind_tls: false,
        }
    }
}

/// Shared broker state behind every handler.
pub struct Broker {
    config: BrokerConfig,
    registry: Arc<TunnelRegistry>,
    host_cache: Arc<HostCache>,
    token_store: Arc<TokenStore>,
}

impl Broker {
    pub fn new(config: BrokerConfig, token_store: TokenStore) -> Arc<Self> {
        let registry = Arc::new(TunnelRegistry::new());
        let host_cache = Arc::new(HostCache::new());
        registry.set_invalidator(host_cache.clone());

        if token_store.is_enabled() {
            info!(active_tokens = token_store.count(), "authentication enabled");
        } else {
            info!("no token store configured, authentication disabled");
        }

        Arc::new(Self {
            config,
            registry,
            host_cache,
            token_store: Arc::new(token_store),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    pub fn host_cache(&self) -> &HostCache {
        &self.host_cache
    }

    pub fn token_store(&self) -> &TokenStore {
        &self.token_store
    }

    /// The single-listener router: every request lands in the ingress
    /// handler, which splits control-plane upgrades from public traffic.
    pub fn into_router(self: &Arc<Self>) -> axum::Router {
        axum::Router::new()
            .fallback(router::ingress)
            .with_state(self.clone())
    }

    /// Serve until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "broker listening");
        axum::serve(
            listener,
            self.into_router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    }
}
