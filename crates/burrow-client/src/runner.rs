//! Reconnecting outer loop.

use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use crate::client::{ClientConfig, TunnelClient};
use crate::connection::{self, ConnectError};

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Pause after a connection ends before dialing again, so a broker that is
/// flapping does not see a tight reconnect spin.
const STABILIZE_DELAY: Duration = Duration::from_secs(2);

/// Run the client until `shutdown` is cancelled, reconnecting with bounded
/// exponential backoff.
pub async fn run(config: ClientConfig, shutdown: CancellationToken) {
    info!(
        tunnel_id = %config.tunnel_id,
        server_url = %config.server_url,
        local_addr = %config.local_addr,
        has_token = config.auth_token.is_some(),
        "starting tunnel client"
    );

    let mut attempts: u32 = 0;
    loop {
        if shutdown.is_cancelled() {
            info!("shutdown requested, stopping client");
            return;
        }

        info!(attempt = attempts + 1, "connecting to broker");
        let stream = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = connection::connect(&config) => match result {
                Ok(stream) => stream,
                Err(e) => {
                    error!(
                        error = %e,
                        error_category = categorize_connect_error(&e),
                        "connection failed"
                    );
                    let delay = reconnect_delay(attempts);
                    attempts = attempts.saturating_add(1);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = sleep(delay) => continue,
                    }
                }
            },
        };

        info!("connected");
        attempts = 0;
        announce_public_url(&config);

        let client = TunnelClient::new(config.clone(), &shutdown);
        client.clone().run(stream).await;
        client.close();

        if shutdown.is_cancelled() {
            info!("shutdown during active connection, stopping client");
            return;
        }
        warn!("connection lost, will reconnect");
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sleep(STABILIZE_DELAY) => {}
        }
    }
}

fn announce_public_url(config: &ClientConfig) {
    match Url::parse(&config.server_url) {
        Ok(url) => {
            info!(
                public_url = %format!("http://{}.{}", config.tunnel_id, url.authority()),
                "tunnel is available"
            );
        }
        Err(e) => error!(error = %e, "could not derive public url from server url"),
    }
}

/// `min(2^attempts seconds, 30 seconds)`.
pub(crate) fn reconnect_delay(attempts: u32) -> Duration {
    if attempts >= 5 {
        MAX_RECONNECT_DELAY
    } else {
        Duration::from_secs(1 << attempts)
    }
}

/// Coarse bucket for log lines; nothing branches on this.
pub(crate) fn categorize_connect_error(error: &ConnectError) -> &'static str {
    use tokio_tungstenite::tungstenite::Error as WsError;

    match error {
        ConnectError::Timeout => "timeout",
        ConnectError::Url(_) | ConnectError::BadServerUrl | ConnectError::BadToken => "other",
        ConnectError::WebSocket(WsError::Io(io)) => match io.kind() {
            std::io::ErrorKind::ConnectionRefused => "connection_refused",
            std::io::ErrorKind::TimedOut => "timeout",
            _ => {
                let text = io.to_string().to_lowercase();
                if text.contains("failed to lookup") || text.contains("no such host") {
                    "dns_resolution"
                } else if text.contains("network") {
                    "network_error"
                } else {
                    "other"
                }
            }
        },
        ConnectError::WebSocket(WsError::Tls(_)) => "tls_error",
        ConnectError::WebSocket(_) => "websocket_error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(2), Duration::from_secs(4));
        assert_eq!(reconnect_delay(3), Duration::from_secs(8));
        assert_eq!(reconnect_delay(4), Duration::from_secs(16));
        assert_eq!(reconnect_delay(5), Duration::from_secs(30));
        assert_eq!(reconnect_delay(60), Duration::from_secs(30));
    }

    #[test]
    fn connect_errors_get_a_category() {
        assert_eq!(categorize_connect_error(&ConnectError::Timeout), "timeout");

        let refused = ConnectError::WebSocket(tokio_tungstenite::tungstenite::Error::Io(
            std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        ));
        assert_eq!(categorize_connect_error(&refused), "connection_refused");

        let protocol = ConnectError::WebSocket(tokio_tungstenite::tungstenite::Error::Protocol(
            tokio_tungstenite::tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
        ));
        assert_eq!(categorize_connect_error(&protocol), "websocket_error");
    }
}
