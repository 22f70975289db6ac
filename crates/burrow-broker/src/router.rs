//! Public ingress router.
//!
//! Every public request resolves its tunnel from the `Host` header: the
//! label before the first dot is the tunnel id. The request is packaged into
//! a frame, sent down the control link, and the handler parks on a
//! single-slot sink until the correlated response arrives, the deadline
//! passes, or the caller gives up.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderName, HeaderValue, HOST, UPGRADE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use burrow_proto::headers::is_hop_by_hop;
use burrow_proto::Frame;

use crate::registry::RouteInvalidator;
use crate::session::TunnelSession;
use crate::{control, Broker};

/// Caches `Host` header values against the tunnel id they resolve to.
/// Entries for a tunnel are swept when that tunnel leaves the registry.
pub struct HostCache {
    entries: DashMap<String, String>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HostCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Resolve a host to a tunnel id, populating the cache on first hit.
    pub fn resolve(&self, host: &str) -> Option<String> {
        if let Some(cached) = self.entries.get(host) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(cached.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let tunnel_id = extract_tunnel_id(host)?;
        self.entries
            .insert(host.to_string(), tunnel_id.to_string());
        debug!(host, tunnel_id, "host cached");
        Some(tunnel_id.to_string())
    }

    /// (hits, misses)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for HostCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteInvalidator for HostCache {
    fn invalidate(&self, tunnel_id: &str) {
        let before = self.entries.len();
        self.entries.retain(|_, cached| cached != tunnel_id);
        let swept = before - self.entries.len();
        if swept > 0 {
            info!(tunnel_id, swept, "host cache invalidated");
        }
    }
}

/// Take the subdomain label out of a `Host` value: strip a trailing numeric
/// port, then everything from the first dot. No dot, or a leading dot, means
/// no tunnel.
fn extract_tunnel_id(host: &str) -> Option<&str> {
    if host.is_empty() {
        return None;
    }

    let mut end = host.len();
    for (i, b) in host.bytes().enumerate().rev() {
        if b == b':' {
            end = i;
            break;
        }
        if !b.is_ascii_digit() {
            break;
        }
    }
    let host = &host[..end];

    match host.find('.') {
        Some(0) | None => None,
        Some(dot) => Some(&host[..dot]),
    }
}

/// Resolve the caller's IP: leftmost `X-Forwarded-For` entry, then
/// `X-Real-IP`, then the `for=` token of `X-Forwarded`, then the transport
/// peer address.
fn client_ip(headers: &HeaderMap, peer: SocketAddr) -> String {
    if let Some(xff) = header_str(headers, "x-forwarded-for") {
        let first = xff.split(',').next().unwrap_or(xff).trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }

    if let Some(xri) = header_str(headers, "x-real-ip") {
        let trimmed = xri.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    if let Some(xf) = header_str(headers, "x-forwarded") {
        if let Some((_, rest)) = xf.split_once("for=") {
            let token = rest.split(';').next().unwrap_or(rest).trim();
            if !token.is_empty() {
                return token.to_string();
            }
        }
    }

    peer.ip().to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|s| !s.is_empty())
}

/// Copy the caller's headers for the tunnel, minus the hop-by-hop set, and
/// stamp the forwarding chain onto them.
fn forwarding_headers(
    headers: &HeaderMap,
    peer: SocketAddr,
    host: &str,
    behind_tls: bool,
) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for name in headers.keys() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        let values: Vec<String> = headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::to_string)
            .collect();
        if !values.is_empty() {
            out.insert(name.as_str().to_string(), values);
        }
    }

    let peer_ip = peer.ip().to_string();
    let forwarded_for = match out.get("x-forwarded-for").and_then(|v| v.first()) {
        Some(existing) => format!("{existing}, {peer_ip}"),
        None => peer_ip,
    };
    out.insert("x-forwarded-for".to_string(), vec![forwarded_for]);

    if !host.is_empty() {
        out.insert("x-forwarded-host".to_string(), vec![host.to_string()]);
    }

    let proto = out
        .get("x-forwarded-proto")
        .and_then(|v| v.first())
        .cloned()
        .unwrap_or_else(|| if behind_tls { "https" } else { "http" }.to_string());
    out.insert("x-forwarded-proto".to_string(), vec![proto]);

    out.insert(
        "x-real-ip".to_string(),
        vec![client_ip(headers, peer)],
    );

    out.entry("x-forwarded-server".to_string())
        .or_insert_with(|| vec![host.to_string()]);

    out
}

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

/// Opaque id correlating a forwarded request with its response frame.
/// Timestamp plus a process-unique counter, so concurrent requests within
/// the same nanosecond still get distinct ids.
fn next_request_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}-{}", nanos, REQUEST_SEQ.fetch_add(1, Ordering::Relaxed))
}

fn request_host(req: &Request) -> Option<String> {
    if let Some(value) = req.headers().get(HOST) {
        return value.to_str().ok().map(str::to_string);
    }
    req.uri().authority().map(|a| a.as_str().to_string())
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

/// Single entry point for the public listener: control-plane upgrades are
/// split off, everything else is proxied through a tunnel.
pub(crate) async fn ingress(
    State(broker): State<Arc<Broker>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    if is_websocket_upgrade(req.headers()) {
        let (parts, _body) = req.into_parts();
        return control::handle_upgrade(broker, parts, peer).await;
    }
    proxy(broker, peer, req).await
}

/// Unregisters the sink and fires a best-effort cancel if the proxy future
/// is dropped before the exchange completes. Hyper drops the future when the
/// public caller disconnects, so this is where the 499 path lives.
struct PendingGuard {
    session: Arc<TunnelSession>,
    request_id: String,
    armed: bool,
}

impl PendingGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            tunnel_id = %self.session.id(),
            request_id = %self.request_id,
            status = 499,
            "caller disconnected while awaiting tunnel response"
        );
        self.session.pending().unregister(&self.request_id);
        let _ = self.session.send(Frame::request_cancel(
            self.session.id().to_string(),
            self.request_id.clone(),
        ));
    }
}

async fn proxy(broker: Arc<Broker>, peer: SocketAddr, req: Request) -> Response {
    let Some(host) = request_host(&req) else {
        debug!(%peer, "request without host");
        return tunnel_not_found();
    };

    let Some(tunnel_id) = broker.host_cache().resolve(&host) else {
        debug!(host, "no tunnel id in host");
        return tunnel_not_found();
    };

    let Some(session) = broker.registry().get(&tunnel_id) else {
        debug!(tunnel_id, "no active tunnel for host");
        return tunnel_not_found();
    };

    let method = req.method().as_str().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let headers = forwarding_headers(req.headers(), peer, &host, broker.config().behind_tls);

    let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            warn!(tunnel_id, error = %e, "failed to read request body");
            return (StatusCode::INTERNAL_SERVER_ERROR, "failed to read body").into_response();
        }
    };

    let request_id = next_request_id();
    debug!(tunnel_id, request_id, %method, %path, body_size = body.len(), "forwarding request");

    let rx = session.pending().register(&request_id);
    let mut guard = PendingGuard {
        session: session.clone(),
        request_id: request_id.clone(),
        armed: true,
    };

    let frame = Frame::request(
        session.id().to_string(),
        request_id.clone(),
        method,
        path,
        headers,
        body.to_vec(),
    );
    if let Err(e) = session.send(frame) {
        warn!(tunnel_id, request_id, error = %e, "could not forward request");
        guard.disarm();
        session.pending().unregister(&request_id);
        return (StatusCode::BAD_GATEWAY, "tunnel connection lost").into_response();
    }

    match timeout(broker.config().request_timeout, rx).await {
        Ok(Ok(frame)) => {
            guard.disarm();
            debug!(tunnel_id, request_id, status = frame.status, "response from tunnel");
            write_response(frame)
        }
        Ok(Err(_)) => {
            // sink closed by session teardown
            guard.disarm();
            warn!(tunnel_id, request_id, "tunnel dropped while awaiting response");
            (StatusCode::BAD_GATEWAY, "tunnel connection lost").into_response()
        }
        Err(_) => {
            guard.disarm();
            session.pending().unregister(&request_id);
            let _ = session.send(Frame::request_cancel(
                session.id().to_string(),
                request_id.clone(),
            ));
            warn!(tunnel_id, request_id, "request timed out waiting for tunnel");
            (StatusCode::GATEWAY_TIMEOUT, "request timed out").into_response()
        }
    }
}

fn tunnel_not_found() -> Response {
    (StatusCode::NOT_FOUND, "tunnel not found").into_response()
}

/// Turn a response frame back into an HTTP response, stripping hop-by-hop
/// headers on the way out.
fn write_response(frame: Frame) -> Response {
    let status = if frame.status == 0 {
        StatusCode::OK
    } else {
        match StatusCode::from_u16(frame.status) {
            Ok(status) => status,
            Err(_) => {
                warn!(status = frame.status, "invalid status from tunnel");
                StatusCode::BAD_GATEWAY
            }
        }
    };

    let mut response = Response::new(Body::from(frame.body));
    *response.status_mut() = status;
    for (name, values) in &frame.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            warn!(header = %name, "invalid header name from tunnel");
            continue;
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(header_value) => {
                    response.headers_mut().append(header_name.clone(), header_value);
                }
                Err(_) => warn!(header = %name, "invalid header value from tunnel"),
            }
        }
    }
    response
}
