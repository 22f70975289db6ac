//! Full-stack tunnel tests: broker, real client, and an axum local origin.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::Router;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use burrow_broker::auth::TokenStore;
use burrow_broker::{Broker, BrokerConfig};
use burrow_client::ClientConfig;

/// Headers seen by the most recent request to the local origin.
type CapturedHeaders = Arc<Mutex<Option<HeaderMap>>>;

async fn start_local_origin() -> (SocketAddr, CapturedHeaders) {
    let captured: CapturedHeaders = Arc::new(Mutex::new(None));

    let hello_captured = captured.clone();
    let app = Router::new()
        .route(
            "/hello",
            get(move |headers: HeaderMap| {
                let captured = hello_captured.clone();
                async move {
                    *captured.lock().unwrap() = Some(headers);
                    "ok"
                }
            }),
        )
        .route("/echo", post(|body: Bytes| async move { body }));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, captured)
}

async fn start_broker() -> (SocketAddr, Arc<Broker>) {
    let broker = Broker::new(BrokerConfig::default(), TokenStore::disabled());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(broker.clone().serve(listener));
    (addr, broker)
}

/// Spawn the reconnecting client and wait for its tunnel to register.
async fn start_client(
    broker_addr: SocketAddr,
    broker: &Arc<Broker>,
    tunnel_id: &str,
    local_addr: String,
) -> CancellationToken {
    let shutdown = CancellationToken::new();
    let config = ClientConfig {
        tunnel_id: tunnel_id.to_string(),
        server_url: format!("http://{broker_addr}"),
        local_addr,
        auth_token: None,
    };
    tokio::spawn(burrow_client::run(config, shutdown.clone()));

    for _ in 0..100 {
        if broker.registry().exists(tunnel_id) {
            return shutdown;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("client never registered tunnel {tunnel_id}");
}

struct HttpResponse {
    status: u16,
    body: Vec<u8>,
}

async fn http_request(
    addr: SocketAddr,
    method: &str,
    host: &str,
    path: &str,
    extra_headers: &[(&str, &str)],
    body: &[u8],
) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: {host}\r\n");
    for (name, value) in extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()));

    stream.write_all(request.as_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();

    let mut raw = Vec::new();
    timeout(Duration::from_secs(10), stream.read_to_end(&mut raw))
        .await
        .expect("timed out reading response")
        .unwrap();

    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator");
    let head = String::from_utf8_lossy(&raw[..header_end]);
    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .expect("no status code");

    HttpResponse {
        status,
        body: raw[header_end + 4..].to_vec(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_serves_the_local_origin() {
    let (origin_addr, captured) = start_local_origin().await;
    let (broker_addr, broker) = start_broker().await;
    let _shutdown = start_client(broker_addr, &broker, "abc123", origin_addr.to_string()).await;

    let response = http_request(
        broker_addr,
        "GET",
        "abc123.example.test",
        "/hello",
        &[],
        b"",
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"ok");

    let headers = captured.lock().unwrap().take().expect("origin saw no request");
    assert_eq!(headers.get("x-forwarded-for").unwrap(), "127.0.0.1");
    assert_eq!(
        headers.get("x-forwarded-host").unwrap(),
        "abc123.example.test"
    );
    assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
}

#[tokio::test(flavor = "multi_thread")]
async fn hop_by_hop_headers_stop_at_the_tunnel() {
    let (origin_addr, captured) = start_local_origin().await;
    let (broker_addr, broker) = start_broker().await;
    let _shutdown = start_client(broker_addr, &broker, "filter1", origin_addr.to_string()).await;

    let response = http_request(
        broker_addr,
        "GET",
        "filter1.example.test",
        "/hello",
        &[
            ("Connection", "keep-alive"),
            ("X-Custom", "v"),
            ("X-Forwarded-For", "1.2.3.4"),
        ],
        b"",
    )
    .await;
    assert_eq!(response.status, 200);

    let headers = captured.lock().unwrap().take().expect("origin saw no request");
    assert!(headers.get("connection").is_none());
    assert_eq!(headers.get("x-custom").unwrap(), "v");
    assert_eq!(headers.get("x-forwarded-for").unwrap(), "1.2.3.4, 127.0.0.1");
    assert_eq!(headers.get("x-real-ip").unwrap(), "1.2.3.4");
}

#[tokio::test(flavor = "multi_thread")]
async fn post_body_round_trips() {
    let (origin_addr, _captured) = start_local_origin().await;
    let (broker_addr, broker) = start_broker().await;
    let _shutdown = start_client(broker_addr, &broker, "echo1", origin_addr.to_string()).await;

    let payload = b"binary \x00\x01\x02 payload";
    let response = http_request(
        broker_addr,
        "POST",
        "echo1.example.test",
        "/echo",
        &[("Content-Type", "application/octet-stream")],
        payload,
    )
    .await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, payload);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_origin_surfaces_502() {
    let (broker_addr, broker) = start_broker().await;
    // a port nothing listens on
    let dead_origin = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap().to_string()
    };
    let _shutdown = start_client(broker_addr, &broker, "dead1", dead_origin).await;

    let response = http_request(broker_addr, "GET", "dead1.example.test", "/", &[], b"").await;
    assert_eq!(response.status, 502);
    assert_eq!(response.body, b"local service connection failed");
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_releases_the_tunnel() {
    let (origin_addr, _captured) = start_local_origin().await;
    let (broker_addr, broker) = start_broker().await;
    let shutdown = start_client(broker_addr, &broker, "gone1", origin_addr.to_string()).await;

    shutdown.cancel();

    let mut released = false;
    for _ in 0..100 {
        if !broker.registry().exists("gone1") {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(released, "broker never noticed the client leaving");

    let response = http_request(broker_addr, "GET", "gone1.example.test", "/", &[], b"").await;
    assert_eq!(response.status, 404);
}
