//! Inner loops of one client connection.
//!
//! Three tasks share a live control link: the read pump decodes frames and
//! spawns one worker per `request`, the write pump is the sole writer, and
//! the heartbeat keeps protocol-level pings flowing. Any of them exiting
//! ends the connection; the runner then reconnects.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use burrow_proto::headers::is_hop_by_hop;
use burrow_proto::{Frame, FrameType};

use crate::client::{Outbound, TunnelClient};
use crate::connection::WsStream;

/// Deadline for one forwarded request, end to end.
const LOCAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// No pong for this long means the link is stale and gets torn down.
const STALE_AFTER: Duration = Duration::from_secs(90);

impl TunnelClient {
    /// Drive the connection until either pump exits.
    pub(crate) async fn run(self: Arc<Self>, stream: WsStream) {
        let outbound_rx = self
            .outbound_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        let Some(outbound_rx) = outbound_rx else {
            warn!("client connection already ran");
            return;
        };

        let (sink, stream) = stream.split();
        let heartbeat = tokio::spawn(self.clone().heartbeat_loop());
        let write = tokio::spawn(self.clone().write_pump(sink, outbound_rx));
        let read = tokio::spawn(self.clone().read_pump(stream));
        let _ = tokio::join!(read, write, heartbeat);
    }

    /// Decode frames from the broker and dispatch them. Exits on any read
    /// error; waits for in-flight workers before handing the link back.
    async fn read_pump(self: Arc<Self>, mut stream: SplitStream<WsStream>) {
        info!("starting request handler loop");

        let http_client = match reqwest::Client::builder()
            .timeout(LOCAL_REQUEST_TIMEOUT)
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "failed to build local http client");
                self.close();
                return;
            }
        };

        let workers = TaskTracker::new();
        loop {
            let message = tokio::select! {
                biased;
                _ = self.conn.cancelled() => break,
                message = stream.next() => match message {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => {
                        error!(error = %e, "websocket read failed");
                        break;
                    }
                    None => {
                        debug!("control link closed");
                        break;
                    }
                },
            };

            match message {
                Message::Text(text) => {
                    let frame = match Frame::decode(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            error!(error = %e, "malformed frame from broker");
                            break;
                        }
                    };
                    match frame.frame_type {
                        FrameType::Request => {
                            debug!(
                                request_id = %frame.request_id,
                                method = %frame.method,
                                path = %frame.path,
                                body_size = frame.body.len(),
                                "request from broker"
                            );
                            workers.spawn(self.clone().process_request(http_client.clone(), frame));
                        }
                        FrameType::RequestCancel => {
                            if let Some((_, cancel)) = self.in_flight.remove(&frame.request_id) {
                                info!(request_id = %frame.request_id, "broker cancelled request");
                                cancel.cancel();
                            }
                        }
                        FrameType::Pong => self.update_last_pong(),
                        other => trace!(frame_type = ?other, "ignoring unhandled frame type"),
                    }
                }
                Message::Pong(_) => self.update_last_pong(),
                // pings are answered by the ws layer
                Message::Ping(_) => {}
                Message::Close(_) => {
                    debug!("close frame from broker");
                    break;
                }
                _ => {}
            }
        }

        self.close();
        workers.close();
        workers.wait().await;
        info!("request handler loop finished");
    }

    /// Sole writer: JSON frames as text, keepalives as protocol pings.
    async fn write_pump(
        self: Arc<Self>,
        mut sink: SplitSink<WsStream, Message>,
        mut outbound_rx: mpsc::Receiver<Outbound>,
    ) {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.conn.cancelled() => break,
                item = outbound_rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            let message = match item {
                Outbound::Ping => Message::Ping(Bytes::new()),
                Outbound::Frame(frame) => match frame.encode() {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        error!(error = %e, "frame encode failed");
                        continue;
                    }
                },
            };
            if let Err(e) = sink.send(message).await {
                error!(error = %e, "websocket write failed");
                break;
            }
        }
        let _ = sink.close().await;
        self.close();
    }

    /// Queue a ping every 30 s and tear the connection down when pongs stop.
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                biased;
                _ = self.conn.cancelled() => return,
                _ = interval.tick() => {}
            }

            let silence = self.last_pong().elapsed();
            if silence > STALE_AFTER {
                warn!(?silence, "no pong received recently, connection is stale");
                self.close();
                return;
            }

            if self.outbound_tx.try_send(Outbound::Ping).is_err() {
                warn!("outbound queue full, cannot queue ping");
            }
        }
    }

    /// One worker per inbound request: bounded by the permit pool,
    /// cancellable by the broker, deadline 30 s.
    async fn process_request(self: Arc<Self>, http_client: reqwest::Client, frame: Frame) {
        let _permit = tokio::select! {
            biased;
            _ = self.conn.cancelled() => {
                warn!(request_id = %frame.request_id, "shutting down, not processing request");
                return;
            }
            permit = self.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let request_id = frame.request_id.clone();
        let cancel = CancellationToken::new();
        self.in_flight.insert(request_id.clone(), cancel.clone());

        self.forward(&http_client, frame, &cancel).await;

        self.in_flight.remove(&request_id);
    }

    async fn forward(&self, http_client: &reqwest::Client, frame: Frame, cancel: &CancellationToken) {
        let request_id = frame.request_id.clone();

        let request = match build_local_request(http_client, &self.config.local_addr, &frame) {
            Ok(request) => request,
            Err(e) => {
                error!(request_id, error = %e, "failed to build local request");
                self.send_error(&request_id, 500, "failed to create request");
                return;
            }
        };

        debug!(request_id, local_url = %request.url(), "forwarding request to local origin");

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(request_id, "request cancelled, dropping");
                return;
            }
            response = http_client.execute(request) => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                // the broker already answered the caller with its own timeout
                warn!(request_id, error = %e, "local request timed out");
                return;
            }
            Err(e) => {
                error!(request_id, error = %e, "local origin unreachable");
                self.send_error(&request_id, 502, "local service connection failed");
                return;
            }
        };

        let status = response.status().as_u16();
        let mut headers = std::collections::HashMap::new();
        for name in response
            .headers()
            .keys()
            .map(|k| k.as_str().to_string())
            .collect::<Vec<_>>()
        {
            if is_hop_by_hop(&name) {
                continue;
            }
            let values: Vec<String> = response
                .headers()
                .get_all(name.as_str())
                .iter()
                .filter_map(|value| value.to_str().ok())
                .map(str::to_string)
                .collect();
            if !values.is_empty() {
                headers.insert(name, values);
            }
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                error!(request_id, error = %e, "failed to read local response body");
                self.send_error(&request_id, 502, "failed to read response body");
                return;
            }
        };

        if cancel.is_cancelled() || self.conn.is_cancelled() {
            info!(request_id, "not sending response after cancellation");
            return;
        }

        debug!(request_id, status, response_size = body.len(), "local origin answered");
        let response_frame = Frame::response(request_id.clone(), status, headers, body.to_vec());
        if self
            .outbound_tx
            .try_send(Outbound::Frame(response_frame))
            .is_err()
        {
            warn!(request_id, "outbound queue full, dropping response");
        }
    }

    fn send_error(&self, request_id: &str, status: u16, text: &str) {
        let mut headers = std::collections::HashMap::new();
        headers.insert(
            "content-type".to_string(),
            vec!["text/plain".to_string()],
        );
        let frame = Frame::response(request_id, status, headers, text.as_bytes().to_vec());
        if self.outbound_tx.try_send(Outbound::Frame(frame)).is_err() {
            warn!(request_id, status, "outbound queue full, dropping error response");
        }
    }
}

/// Rebuild the broker's request against the local origin. Hop-by-hop
/// headers are dropped and `Host` is the local address, which reqwest
/// derives from the URL.
fn build_local_request(
    http_client: &reqwest::Client,
    local_addr: &str,
    frame: &Frame,
) -> Result<reqwest::Request, reqwest::Error> {
    let method = reqwest::Method::from_bytes(frame.method.as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let url = format!("http://{}{}", local_addr, frame.path);

    let mut builder = http_client.request(method, url);
    for (name, values) in &frame.headers {
        if is_hop_by_hop(name) || name.eq_ignore_ascii_case("host") {
            continue;
        }
        for value in values {
            builder = builder.header(name, value);
        }
    }
    builder.body(frame.body.clone()).build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn request_frame(headers: HashMap<String, Vec<String>>) -> Frame {
        Frame::request("abc123", "r1", "POST", "/submit?a=1", headers, b"x".to_vec())
    }

    #[test]
    fn local_request_targets_the_origin() {
        let client = reqwest::Client::new();
        let request = build_local_request(&client, "127.0.0.1:3000", &request_frame(HashMap::new()))
            .unwrap();
        assert_eq!(request.url().as_str(), "http://127.0.0.1:3000/submit?a=1");
        assert_eq!(request.method(), reqwest::Method::POST);
    }

    #[test]
    fn hop_by_hop_and_host_headers_are_dropped() {
        let mut headers = HashMap::new();
        headers.insert("connection".to_string(), vec!["keep-alive".to_string()]);
        headers.insert("host".to_string(), vec!["abc123.example.test".to_string()]);
        headers.insert("x-custom".to_string(), vec!["v".to_string()]);
        headers.insert(
            "x-forwarded-for".to_string(),
            vec!["1.2.3.4".to_string()],
        );

        let client = reqwest::Client::new();
        let request = build_local_request(&client, "127.0.0.1:3000", &request_frame(headers)).unwrap();

        assert!(request.headers().get("connection").is_none());
        assert!(request.headers().get("host").is_none());
        assert_eq!(request.headers().get("x-custom").unwrap(), "v");
        assert_eq!(request.headers().get("x-forwarded-for").unwrap(), "1.2.3.4");
    }

    #[test]
    fn multi_valued_headers_survive() {
        let mut headers = HashMap::new();
        headers.insert(
            "accept".to_string(),
            vec!["text/html".to_string(), "application/json".to_string()],
        );
        let client = reqwest::Client::new();
        let request = build_local_request(&client, "127.0.0.1:3000", &request_frame(headers)).unwrap();

        let values: Vec<_> = request.headers().get_all("accept").iter().collect();
        assert_eq!(values.len(), 2);
    }
}
