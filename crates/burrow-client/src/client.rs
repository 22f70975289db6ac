//! Per-connection client state.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use burrow_proto::Frame;

/// Bounded outbound queue depth.
pub(crate) const OUTBOUND_CAPACITY: usize = 100;

/// Simultaneous forwarded requests.
pub(crate) const MAX_IN_FLIGHT_REQUESTS: usize = 128;

/// What the client is setting up a tunnel for.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Tunnel id to claim; doubles as the public subdomain.
    pub tunnel_id: String,
    /// Broker base URL, `http://` or `https://`.
    pub server_url: String,
    /// Local origin serving the tunneled requests, `host:port`.
    pub local_addr: String,
    /// Bearer token presented on the upgrade when the broker requires one.
    pub auth_token: Option<String>,
}

/// An entry on the outbound queue: either a data frame or a protocol-level
/// keepalive, which is not a JSON frame.
pub(crate) enum Outbound {
    Frame(Frame),
    Ping,
}

/// State for one connection attempt. The runner creates a fresh instance per
/// connect so a reconnect never inherits stale in-flight bookkeeping.
pub(crate) struct TunnelClient {
    pub(crate) config: ClientConfig,
    pub(crate) outbound_tx: mpsc::Sender<Outbound>,
    pub(crate) outbound_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    /// Cancellation handles for requests currently being forwarded.
    pub(crate) in_flight: DashMap<String, CancellationToken>,
    pub(crate) permits: Arc<Semaphore>,
    /// Cancelled when this connection is done; child of the process-wide
    /// shutdown token so an external shutdown reaches every loop.
    pub(crate) conn: CancellationToken,
    last_pong: Mutex<Instant>,
}

impl TunnelClient {
    pub(crate) fn new(config: ClientConfig, shutdown: &CancellationToken) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        Arc::new(Self {
            config,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            in_flight: DashMap::new(),
            permits: Arc::new(Semaphore::new(MAX_IN_FLIGHT_REQUESTS)),
            conn: shutdown.child_token(),
            last_pong: Mutex::new(Instant::now()),
        })
    }

    /// End this connection. Idempotent; every loop observes the token.
    pub(crate) fn close(&self) {
        if !self.conn.is_cancelled() {
            debug!(tunnel_id = %self.config.tunnel_id, "closing client connection");
            self.conn.cancel();
        }
    }

    pub(crate) fn update_last_pong(&self) {
        if let Ok(mut guard) = self.last_pong.lock() {
            *guard = Instant::now();
        }
    }

    pub(crate) fn last_pong(&self) -> Instant {
        self.last_pong
            .lock()
            .map(|guard| *guard)
            .unwrap_or_else(|e| *e.into_inner())
    }
}
