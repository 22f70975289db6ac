//! Server-side tunnel session.
//!
//! One session owns one control link. Three loops cooperate over bounded
//! queues: the read loop decodes frames off the socket, the route loop
//! dispatches them, and the write loop is the sole writer. A one-shot
//! teardown closes the pending sinks first, then cancels the loops; after
//! that no frame is written and `send` reports the session closed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use burrow_proto::{Frame, FrameType};

use crate::pending::PendingResponses;

/// Capacity of the inbound and outbound frame queues.
const QUEUE_CAPACITY: usize = 100;

/// The link is considered dead when nothing that proves liveness arrives for
/// this long. Protocol-level ping/pong and in-band pong frames extend it.
const READ_DEADLINE: Duration = Duration::from_secs(300);

/// Why a frame could not be queued for the client.
#[derive(Debug, thiserror::Error)]
pub enum SendFrameError {
    #[error("session is closed")]
    Closed,
    #[error("outgoing frame queue full")]
    QueueFull,
    #[error("frame tunnel id does not match session")]
    IdMismatch,
}

/// Traffic counters, updated by the loops and read at teardown.
#[derive(Default)]
pub struct SessionStats {
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub inbound_dropped: AtomicU64,
    pub outbound_dropped: AtomicU64,
    pub responses_dropped: AtomicU64,
}

pub struct TunnelSession {
    id: String,
    outbound_tx: mpsc::Sender<Frame>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Frame>>>,
    pending: PendingResponses,
    shutdown: CancellationToken,
    torn_down: AtomicBool,
    stats: SessionStats,
    created_at: Instant,
}

impl TunnelSession {
    pub fn new(id: String) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            id,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            pending: PendingResponses::new(),
            shutdown: CancellationToken::new(),
            torn_down: AtomicBool::new(false),
            stats: SessionStats::default(),
            created_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pending(&self) -> &PendingResponses {
        &self.pending
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Queue a frame for the client without blocking.
    ///
    /// A frame carrying a different tunnel id is rejected outright; that can
    /// only happen through a routing bug and must not reach the wire.
    pub fn send(&self, frame: Frame) -> Result<(), SendFrameError> {
        if !frame.tunnel_id.is_empty() && frame.tunnel_id != self.id {
            warn!(
                tunnel_id = %self.id,
                frame_tunnel_id = %frame.tunnel_id,
                request_id = %frame.request_id,
                "frame dropped: tunnel id mismatch"
            );
            return Err(SendFrameError::IdMismatch);
        }
        if self.shutdown.is_cancelled() {
            return Err(SendFrameError::Closed);
        }
        match self.outbound_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.outbound_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(tunnel_id = %self.id, "outgoing frame queue full, dropping frame");
                Err(SendFrameError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendFrameError::Closed),
        }
    }

    /// Begin teardown. First trigger closes every pending sink (so waiters
    /// see a dead tunnel, not a hang), then cancels the loops; queued
    /// outbound frames are discarded with the write half. Idempotent.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(tunnel_id = %self.id, "tunnel session teardown");
        self.pending.close_all();
        self.shutdown.cancel();
    }

    /// Drive the session until teardown. Consumes the link; runs at most
    /// once per session.
    pub async fn run(self: Arc<Self>, socket: WebSocket) {
        let outbound_rx = self
            .outbound_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        let Some(outbound_rx) = outbound_rx else {
            warn!(tunnel_id = %self.id, "session run called twice");
            return;
        };

        debug!(tunnel_id = %self.id, "tunnel session running");

        let (sink, stream) = socket.split();
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_CAPACITY);

        let read = tokio::spawn(self.clone().read_loop(stream, inbound_tx));
        let write = tokio::spawn(self.clone().write_loop(sink, outbound_rx));
        let route = tokio::spawn(self.clone().route_loop(inbound_rx));
        let _ = tokio::join!(read, write, route);

        info!(
            tunnel_id = %self.id,
            lifetime = ?self.created_at.elapsed(),
            messages_received = self.stats.messages_received.load(Ordering::Relaxed),
            messages_sent = self.stats.messages_sent.load(Ordering::Relaxed),
            bytes_received = self.stats.bytes_received.load(Ordering::Relaxed),
            bytes_sent = self.stats.bytes_sent.load(Ordering::Relaxed),
            "tunnel session stopped"
        );
    }

    /// Decode frames off the link and push them onto the inbound queue with a
    /// non-blocking send; when the queue is full the newest frame is dropped
    /// and counted, which the router later surfaces as a timeout.
    async fn read_loop(
        self: Arc<Self>,
        mut stream: SplitStream<WebSocket>,
        inbound_tx: mpsc::Sender<Frame>,
    ) {
        let mut deadline = Instant::now() + READ_DEADLINE;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = timeout_at(deadline, stream.next()) => next,
            };
            let message = match next {
                Err(_) => {
                    warn!(tunnel_id = %self.id, "read deadline elapsed, client presumed dead");
                    break;
                }
                Ok(None) => {
                    debug!(tunnel_id = %self.id, "control link closed by client");
                    break;
                }
                Ok(Some(Err(e))) => {
                    error!(tunnel_id = %self.id, error = %e, "websocket read failed");
                    break;
                }
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => {
                    let frame = match Frame::decode(text.as_str()) {
                        Ok(frame) => frame,
                        Err(e) => {
                            error!(tunnel_id = %self.id, error = %e, "malformed frame from client");
                            break;
                        }
                    };
                    self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .bytes_received
                        .fetch_add(frame.body.len() as u64, Ordering::Relaxed);
                    if frame.frame_type == FrameType::Pong {
                        deadline = Instant::now() + READ_DEADLINE;
                    }
                    if inbound_tx.try_send(frame).is_err() {
                        self.stats.inbound_dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(tunnel_id = %self.id, "inbound frame queue full, dropping frame");
                    }
                }
                // The ws layer answers pings on its own; both directions of
                // protocol keepalive prove the client is still there.
                Message::Ping(_) | Message::Pong(_) => {
                    trace!(tunnel_id = %self.id, "protocol keepalive, read deadline extended");
                    deadline = Instant::now() + READ_DEADLINE;
                }
                Message::Close(_) => {
                    debug!(tunnel_id = %self.id, "close frame from client");
                    break;
                }
                Message::Binary(_) => {
                    warn!(tunnel_id = %self.id, "unexpected binary frame, ignoring");
                }
            }
        }
        self.teardown();
    }

    /// Sole writer on the link: encodes queued frames in submission order.
    async fn write_loop(
        self: Arc<Self>,
        mut sink: SplitSink<WebSocket, Message>,
        mut outbound_rx: mpsc::Receiver<Frame>,
    ) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let body_len = frame.body.len() as u64;
            let text = match frame.encode() {
                Ok(text) => text,
                Err(e) => {
                    error!(tunnel_id = %self.id, error = %e, "frame encode failed");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                error!(tunnel_id = %self.id, error = %e, "websocket write failed");
                break;
            }
            self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            self.stats.bytes_sent.fetch_add(body_len, Ordering::Relaxed);
        }
        let _ = sink.close().await;
        self.teardown();
    }

    /// Dispatch inbound frames: responses to their sinks, in-band pings back
    /// out as pongs, everything else dropped and counted.
    async fn route_loop(self: Arc<Self>, mut inbound_rx: mpsc::Receiver<Frame>) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                frame = inbound_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            match frame.frame_type {
                FrameType::Response => {
                    let request_id = frame.request_id.clone();
                    if !self.pending.fulfill(&request_id, frame) {
                        self.stats.responses_dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            tunnel_id = %self.id,
                            request_id = %request_id,
                            "no pending request for response, dropping"
                        );
                    }
                }
                FrameType::Ping => {
                    if let Err(e) = self.send(Frame::pong()) {
                        debug!(tunnel_id = %self.id, error = %e, "could not queue pong");
                    }
                }
                FrameType::Pong => {
                    trace!(tunnel_id = %self.id, "in-band pong");
                }
                other => {
                    debug!(tunnel_id = %self.id, frame_type = ?other, "unhandled frame type");
                }
            }
        }
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn send_rejects_mismatched_tunnel_id() {
        let session = TunnelSession::new("abc123".to_string());
        let frame = Frame::request("other-id", "r1", "GET", "/", HashMap::new(), Vec::new());
        assert!(matches!(session.send(frame), Err(SendFrameError::IdMismatch)));
    }

    #[test]
    fn send_accepts_matching_and_blank_tunnel_ids() {
        let session = TunnelSession::new("abc123".to_string());
        let frame = Frame::request("abc123", "r1", "GET", "/", HashMap::new(), Vec::new());
        assert!(session.send(frame).is_ok());
        assert!(session.send(Frame::pong()).is_ok());
    }

    #[test]
    fn send_after_teardown_reports_closed() {
        let session = TunnelSession::new("abc123".to_string());
        session.teardown();
        assert!(matches!(session.send(Frame::pong()), Err(SendFrameError::Closed)));
    }

    #[test]
    fn send_reports_queue_full() {
        let session = TunnelSession::new("abc123".to_string());
        for _ in 0..QUEUE_CAPACITY {
            session.send(Frame::pong()).unwrap();
        }
        assert!(matches!(session.send(Frame::pong()), Err(SendFrameError::QueueFull)));
        assert_eq!(session.stats().outbound_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn teardown_closes_pending_sinks_and_is_idempotent() {
        let session = TunnelSession::new("abc123".to_string());
        let rx = session.pending().register("r1");

        session.teardown();
        session.teardown();

        assert!(session.is_closed());
        assert!(rx.await.is_err());
    }
}
