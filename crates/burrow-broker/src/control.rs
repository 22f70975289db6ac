//! Control-plane upgrade handler.
//!
//! A client claims its tunnel with `GET /?id=<tunnel-id>` plus a WebSocket
//! handshake. Everything that can be rejected is rejected before the
//! upgrade: missing or invalid id (400), authentication (401/403), and a
//! duplicate id (409). The registry insert is re-checked after the upgrade,
//! so a race between two clients still has exactly one winner.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{info, warn};

use burrow_proto::tunnel_id;

use crate::auth::bearer_token;
use crate::session::TunnelSession;
use crate::Broker;

#[derive(Deserialize)]
struct ConnectQuery {
    id: Option<String>,
}

pub(crate) async fn handle_upgrade(
    broker: Arc<Broker>,
    mut parts: Parts,
    peer: SocketAddr,
) -> Response {
    let id = Query::<ConnectQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|query| query.0.id)
        .unwrap_or_default();
    if id.is_empty() {
        warn!(%peer, "upgrade rejected: missing tunnel id");
        return (StatusCode::BAD_REQUEST, "tunnel id required").into_response();
    }

    if let Err(e) = tunnel_id::validate(&id) {
        warn!(%peer, tunnel_id = %id, error = %e, "upgrade rejected: invalid tunnel id");
        return (
            StatusCode::BAD_REQUEST,
            format!("invalid tunnel id format: {e}"),
        )
            .into_response();
    }

    if broker.token_store().is_enabled() {
        match bearer_token(&parts.headers) {
            None => {
                warn!(%peer, tunnel_id = %id, "upgrade rejected: missing bearer token");
                return (StatusCode::UNAUTHORIZED, "authentication required").into_response();
            }
            Some(token) => {
                if !broker.token_store().verify(&token) {
                    warn!(%peer, tunnel_id = %id, "upgrade rejected: unknown token");
                    return (StatusCode::FORBIDDEN, "invalid token").into_response();
                }
            }
        }
    }

    if broker.registry().exists(&id) {
        warn!(%peer, tunnel_id = %id, "upgrade rejected: tunnel id already in use");
        return (StatusCode::CONFLICT, "tunnel id already in use").into_response();
    }

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws,
        Err(rejection) => {
            warn!(%peer, tunnel_id = %id, "websocket handshake rejected");
            return rejection.into_response();
        }
    };

    info!(%peer, tunnel_id = %id, "upgrading control link");
    ws.on_upgrade(move |socket| run_session(broker, id, socket))
}

async fn run_session(broker: Arc<Broker>, id: String, socket: WebSocket) {
    let session = Arc::new(TunnelSession::new(id.clone()));

    // the pre-upgrade existence check can race a second connect; the
    // registry insert is the authoritative one
    if broker.registry().insert(&id, session.clone()).is_err() {
        warn!(tunnel_id = %id, "tunnel id claimed during upgrade, dropping link");
        return;
    }

    info!(tunnel_id = %id, "tunnel connected");
    session.run(socket).await;
    broker.registry().remove(&id);
    info!(tunnel_id = %id, "tunnel disconnected");
}
