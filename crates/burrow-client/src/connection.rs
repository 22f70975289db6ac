//! Dialing the broker.

use std::time::Duration;

use http::header::AUTHORIZATION;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::client::ClientConfig;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid server url: {0}")]
    Url(#[from] url::ParseError),
    #[error("server url has no usable scheme or host")]
    BadServerUrl,
    #[error("auth token is not a valid header value")]
    BadToken,
    #[error("websocket handshake timed out")]
    Timeout,
    #[error("websocket connection failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Derive the control-link URL from the broker base URL: `http` becomes
/// `ws`, `https` becomes `wss`, path `/`, query `id=<tunnel-id>`.
pub(crate) fn control_url(config: &ClientConfig) -> Result<Url, ConnectError> {
    let mut url = Url::parse(&config.server_url)?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        _ => return Err(ConnectError::BadServerUrl),
    };
    url.set_scheme(scheme).map_err(|_| ConnectError::BadServerUrl)?;
    url.set_path("/");
    url.set_query(Some(&format!("id={}", config.tunnel_id)));
    Ok(url)
}

/// Open the control link, presenting the bearer token when configured.
pub(crate) async fn connect(config: &ClientConfig) -> Result<WsStream, ConnectError> {
    let url = control_url(config)?;
    debug!(websocket_url = %url, "dialing broker");

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(ConnectError::WebSocket)?;
    if let Some(token) = &config.auth_token {
        let value = format!("Bearer {token}")
            .parse()
            .map_err(|_| ConnectError::BadToken)?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let ws_config = WebSocketConfig::default()
        .read_buffer_size(BUFFER_SIZE)
        .write_buffer_size(BUFFER_SIZE);

    let (stream, response) = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        connect_async_with_config(request, Some(ws_config), false),
    )
    .await
    .map_err(|_| ConnectError::Timeout)??;

    info!(http_status = %response.status(), "control link established");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(server_url: &str) -> ClientConfig {
        ClientConfig {
            tunnel_id: "abc123".to_string(),
            server_url: server_url.to_string(),
            local_addr: "127.0.0.1:3000".to_string(),
            auth_token: None,
        }
    }

    #[test]
    fn http_maps_to_ws() {
        let url = control_url(&config("http://broker.test:8080")).unwrap();
        assert_eq!(url.as_str(), "ws://broker.test:8080/?id=abc123");
    }

    #[test]
    fn https_maps_to_wss() {
        let url = control_url(&config("https://broker.test")).unwrap();
        assert_eq!(url.as_str(), "wss://broker.test/?id=abc123");
    }

    #[test]
    fn existing_path_is_replaced() {
        let url = control_url(&config("http://broker.test/some/path")).unwrap();
        assert_eq!(url.path(), "/");
        assert_eq!(url.query(), Some("id=abc123"));
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        assert!(matches!(
            control_url(&config("ftp://broker.test")),
            Err(ConnectError::BadServerUrl)
        ));
    }

    #[test]
    fn garbage_url_is_rejected() {
        assert!(matches!(
            control_url(&config("not a url")),
            Err(ConnectError::Url(_))
        ));
    }
}
