#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap

//! Integration tests for the full relay path.
//!
//! Runs the supervisor against an in-process WebSocket cloud and a raw-TCP
//! fake of the local HTTP service: cloud → channel → router → local service
//! → router → channel → cloud.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use tether_connector::local::{LocalClientConfig, LocalServiceClient};
use tether_connector::tunnel::{
    ChannelConfig, ChannelState, ReconnectPolicy, RelayRouter, SessionSupervisor,
    SupervisorPhase, WsConnector,
};
use tether_core::{ConnectorIdentity, StaticToken};
use tether_proto::{CloudMessage, RequestEnvelope, ResponseFrame, auth, is_well_formed};

const SECRET: &str = "00112233445566778899aabbccddeeff";
const WAIT: Duration = Duration::from_secs(5);

// =========================================================================
// Fake cloud
// =========================================================================

struct FakeCloud {
    addr: SocketAddr,
    conns: mpsc::Receiver<CloudConn>,
}

impl FakeCloud {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, conns) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                let conn = CloudConn {
                    ws,
                    answer_pings: true,
                };
                if tx.send(conn).await.is_err() {
                    break;
                }
            }
        });
        Self { addr, conns }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    async fn accept(&mut self) -> CloudConn {
        timeout(WAIT, self.conns.recv())
            .await
            .expect("connector did not connect")
            .expect("cloud listener stopped")
    }

    /// Accept the next connection and complete its handshake.
    async fn accept_authenticated(&mut self) -> CloudConn {
        let mut conn = self.accept().await;
        conn.handshake().await;
        conn
    }
}

struct CloudConn {
    ws: WebSocketStream<TcpStream>,
    answer_pings: bool,
}

impl CloudConn {
    async fn send(&mut self, message: &CloudMessage) {
        self.send_raw(&message.encode().unwrap()).await;
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::text(text)).await.unwrap();
    }

    async fn request(&mut self, envelope: RequestEnvelope) {
        self.send(&CloudMessage::Request(envelope)).await;
    }

    /// Next non-ping message, or `None` once the connector hangs up.
    async fn recv(&mut self) -> Option<CloudMessage> {
        loop {
            let next = timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for the connector");
            let text = match next {
                Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                Some(Ok(Message::Close(_)) | Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            };
            let message = CloudMessage::decode(&text).unwrap();
            if message == CloudMessage::Ping {
                if self.answer_pings {
                    self.send(&CloudMessage::Pong).await;
                }
                continue;
            }
            return Some(message);
        }
    }

    /// Verify the connector's `auth` and accept it. Returns the connector id.
    async fn handshake(&mut self) -> String {
        match self.recv().await {
            Some(CloudMessage::Auth {
                connector_id,
                secret,
                timestamp,
                signature,
            }) => {
                assert_eq!(secret, SECRET);
                assert!(auth::verify(&secret, &connector_id, timestamp, &signature));
                self.send(&CloudMessage::AuthAck {
                    ok: true,
                    reason: None,
                })
                .await;
                connector_id
            }
            other => panic!("expected auth, got {other:?}"),
        }
    }

    /// Frames for `request_id` up to and including its terminal frame.
    /// `None` if the connector hung up first.
    async fn frames_for(&mut self, request_id: &str) -> Option<Vec<ResponseFrame>> {
        let mut frames = Vec::new();
        loop {
            let (id, frame) = self.recv().await?.into_response_frame()?;
            if id != request_id {
                continue;
            }
            let done = frame.is_terminal();
            frames.push(frame);
            if done {
                return Some(frames);
            }
        }
    }
}

// =========================================================================
// Fake local service
// =========================================================================

struct FakeLocal {
    url: String,
    open: Arc<AtomicUsize>,
}

struct OpenGuard(Arc<AtomicUsize>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeLocal {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let open = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&open);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let guard = OpenGuard(Arc::clone(&counter));
                tokio::spawn(async move {
                    let _guard = guard;
                    serve_one(stream).await;
                });
            }
        });
        Self { url, open }
    }

    fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

/// Answer a single HTTP/1.1 request, then close.
async fn serve_one(mut stream: TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let head = loop {
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break String::from_utf8_lossy(&buf[..pos]).to_string();
        }
    };
    let mut lines = head.lines();
    let path = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let authorization = lines
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.eq_ignore_ascii_case("authorization")
                .then(|| value.trim().to_string())
        })
        .unwrap_or_default();

    const CHUNKED_HEAD: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n";
    match path.as_str() {
        "/chunked" => {
            let _ = stream.write_all(CHUNKED_HEAD.as_bytes()).await;
            let _ = stream.write_all(b"2\r\nab\r\n").await;
            let _ = stream.flush().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = stream.write_all(b"2\r\ncd\r\n0\r\n\r\n").await;
        }
        "/stall" => {
            let _ = stream.write_all(CHUNKED_HEAD.as_bytes()).await;
            let _ = stream.write_all(b"2\r\nab\r\n").await;
            let _ = stream.flush().await;
            while matches!(stream.read(&mut chunk).await, Ok(n) if n > 0) {}
        }
        "/hang" => {
            let _ = stream.write_all(CHUNKED_HEAD.as_bytes()).await;
            let _ = stream.flush().await;
            // Hold the connection until the client goes away.
            while matches!(stream.read(&mut chunk).await, Ok(n) if n > 0) {}
        }
        "/whoami" => respond_fixed(&mut stream, 200, &authorization).await,
        "/buffered" | "/v1/models" => respond_fixed(&mut stream, 200, "hello").await,
        _ => respond_fixed(&mut stream, 404, "not found").await,
    }
}

async fn respond_fixed(stream: &mut TcpStream, status: u16, body: &str) {
    let response = format!(
        "HTTP/1.1 {status} X\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

// =========================================================================
// Helpers
// =========================================================================

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        multiplier: 2.0,
        jitter: 0.0,
        stable_threshold: Duration::from_secs(60),
    }
}

fn supervisor(
    cloud: &FakeCloud,
    local_url: &str,
    tweak: impl FnOnce(&mut ChannelConfig),
) -> SessionSupervisor<WsConnector, LocalServiceClient> {
    supervisor_with_request_timeout(cloud, local_url, Duration::from_secs(5), tweak)
}

fn supervisor_with_request_timeout(
    cloud: &FakeCloud,
    local_url: &str,
    request_timeout: Duration,
    tweak: impl FnOnce(&mut ChannelConfig),
) -> SessionSupervisor<WsConnector, LocalServiceClient> {
    let mut channel = ChannelConfig::new(cloud.url());
    channel.connect_timeout = Duration::from_secs(2);
    channel.auth_timeout = Duration::from_secs(2);
    channel.flush_timeout = Duration::from_secs(1);
    tweak(&mut channel);

    let local = LocalServiceClient::new(
        LocalClientConfig {
            base_url: local_url.to_string(),
            request_timeout,
            health_path: "/v1/models".into(),
        },
        Arc::new(StaticToken::new("local-token")),
    )
    .unwrap();

    SessionSupervisor::new(
        ConnectorIdentity::new("conn-test", SECRET),
        WsConnector::new(channel),
        RelayRouter::new(Arc::new(local), "/v1/models"),
        fast_policy(),
    )
}

fn get(request_id: &str, path: &str) -> RequestEnvelope {
    RequestEnvelope::new(request_id, "GET", path)
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached");
}

/// A local URL nothing listens on.
async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}")
}

// =========================================================================
// Relaying
// =========================================================================

#[tokio::test]
async fn chunked_response_is_streamed_frame_by_frame() {
    let mut cloud = FakeCloud::start().await;
    let local = FakeLocal::start().await;
    let sup = supervisor(&cloud, &local.url, |_| {});
    sup.start().unwrap();

    let mut conn = cloud.accept().await;
    assert_eq!(conn.handshake().await, "conn-test");
    conn.request(get("r1", "/chunked")).await;

    let frames = conn.frames_for("r1").await.unwrap();
    assert_eq!(frames.len(), 4, "{frames:?}");
    assert!(matches!(&frames[0], ResponseFrame::Header { status: 200, .. }));
    assert_eq!(frames[1], ResponseFrame::Chunk(Bytes::from_static(b"ab")));
    assert_eq!(frames[2], ResponseFrame::Chunk(Bytes::from_static(b"cd")));
    assert_eq!(frames[3], ResponseFrame::End);
    assert_eq!(sup.state(), ChannelState::Authenticated);

    sup.stop().await;
    assert_eq!(sup.status().phase, SupervisorPhase::Stopped);
}

#[tokio::test]
async fn buffered_response_is_one_chunk() {
    let mut cloud = FakeCloud::start().await;
    let local = FakeLocal::start().await;
    let sup = supervisor(&cloud, &local.url, |_| {});
    sup.start().unwrap();

    let mut conn = cloud.accept_authenticated().await;
    conn.request(get("r1", "/buffered")).await;
    let frames = conn.frames_for("r1").await.unwrap();
    assert!(is_well_formed(&frames));
    assert_eq!(
        &frames[1..],
        &[
            ResponseFrame::Chunk(Bytes::from_static(b"hello")),
            ResponseFrame::End
        ]
    );

    conn.send(&CloudMessage::HealthCheck {
        request_id: "h1".into(),
    })
    .await;
    let frames = conn.frames_for("h1").await.unwrap();
    assert!(matches!(&frames[0], ResponseFrame::Header { status: 200, .. }));

    sup.stop().await;
}

#[tokio::test]
async fn local_token_replaces_cloud_authorization() {
    let mut cloud = FakeCloud::start().await;
    let local = FakeLocal::start().await;
    let sup = supervisor(&cloud, &local.url, |_| {});
    sup.start().unwrap();

    let mut conn = cloud.accept_authenticated().await;
    conn.request(get("r1", "/whoami").with_header("Authorization", "Bearer cloud-user"))
        .await;
    let frames = conn.frames_for("r1").await.unwrap();
    assert_eq!(
        frames[1],
        ResponseFrame::Chunk(Bytes::from_static(b"Bearer local-token"))
    );

    sup.stop().await;
}

#[tokio::test]
async fn stalled_local_stream_times_out_with_error() {
    let mut cloud = FakeCloud::start().await;
    let local = FakeLocal::start().await;
    let sup =
        supervisor_with_request_timeout(&cloud, &local.url, Duration::from_millis(200), |_| {});
    sup.start().unwrap();

    let mut conn = cloud.accept_authenticated().await;
    conn.request(get("r1", "/stall")).await;
    let frames = conn.frames_for("r1").await.unwrap();
    assert_eq!(frames.len(), 3, "{frames:?}");
    assert!(matches!(&frames[0], ResponseFrame::Header { status: 200, .. }));
    assert_eq!(frames[1], ResponseFrame::Chunk(Bytes::from_static(b"ab")));
    assert!(matches!(&frames[2], ResponseFrame::Error(m) if m.contains("did not respond")));

    wait_until(|| sup.router().in_flight().is_empty()).await;
    wait_until(|| local.open_connections() == 0).await;
    assert_eq!(sup.status().connections, 1);

    sup.stop().await;
}

#[tokio::test]
async fn connection_refused_yields_single_error_and_channel_stays_up() {
    let mut cloud = FakeCloud::start().await;
    let local_url = closed_port_url().await;
    let sup = supervisor(&cloud, &local_url, |_| {});
    sup.start().unwrap();

    let mut conn = cloud.accept_authenticated().await;
    conn.request(get("r1", "/buffered")).await;
    let frames = conn.frames_for("r1").await.unwrap();
    assert_eq!(frames.len(), 1, "{frames:?}");
    assert!(matches!(&frames[0], ResponseFrame::Error(m) if m.contains("connection")));
    wait_until(|| sup.router().in_flight().is_empty()).await;

    // Same channel keeps serving.
    conn.request(get("r2", "/buffered")).await;
    assert_eq!(conn.frames_for("r2").await.unwrap().len(), 1);
    assert_eq!(sup.status().connections, 1);

    sup.stop().await;
}

#[tokio::test]
async fn malformed_request_is_answered_on_the_same_channel() {
    let mut cloud = FakeCloud::start().await;
    let local = FakeLocal::start().await;
    let sup = supervisor(&cloud, &local.url, |_| {});
    sup.start().unwrap();

    let mut conn = cloud.accept_authenticated().await;
    conn.send_raw(r#"{"type":"request","request_id":"bad-1"}"#)
        .await;
    let frames = conn.frames_for("bad-1").await.unwrap();
    assert!(matches!(&frames[..], [ResponseFrame::Error(m)] if m.contains("malformed")));

    conn.request(get("r2", "/buffered")).await;
    assert!(is_well_formed(&conn.frames_for("r2").await.unwrap()));

    sup.stop().await;
}

// =========================================================================
// Failure and recovery
// =========================================================================

#[tokio::test]
async fn channel_loss_cancels_requests_and_releases_local_connections() {
    let mut cloud = FakeCloud::start().await;
    let local = FakeLocal::start().await;
    let sup = supervisor(&cloud, &local.url, |_| {});
    sup.start().unwrap();

    let mut conn = cloud.accept_authenticated().await;
    for i in 0..3 {
        conn.request(get(&format!("r{i}"), "/hang")).await;
    }
    for _ in 0..3 {
        let (_, frame) = conn.recv().await.unwrap().into_response_frame().unwrap();
        assert!(matches!(frame, ResponseFrame::Header { status: 200, .. }));
    }
    assert_eq!(sup.router().in_flight().len(), 3);
    assert_eq!(local.open_connections(), 3);

    drop(conn);
    wait_until(|| local.open_connections() == 0).await;
    assert!(sup.router().in_flight().is_empty());

    // And the supervisor comes back on its own.
    let _conn = cloud.accept_authenticated().await;
    let mut status = sup.subscribe();
    timeout(WAIT, status.wait_for(|s| s.connections == 2))
        .await
        .unwrap()
        .unwrap();

    sup.stop().await;
}

#[tokio::test]
async fn heartbeat_timeout_forces_reconnect_despite_traffic() {
    let mut cloud = FakeCloud::start().await;
    let local = FakeLocal::start().await;
    let sup = supervisor(&cloud, &local.url, |c| {
        c.heartbeat_interval = Duration::from_millis(50);
        c.heartbeat_timeout = Duration::from_millis(300);
    });
    let mut status = sup.subscribe();
    sup.start().unwrap();
    let degraded = tokio::spawn(async move {
        status
            .wait_for(|s| s.channel == ChannelState::Degraded)
            .await
            .map(|s| s.last_error.clone())
            .ok()
            .flatten()
    });

    let mut conn = cloud.accept_authenticated().await;
    conn.answer_pings = false;

    // Requests keep flowing, but no pong ever comes back.
    let mut served = 0;
    for i in 0.. {
        let id = format!("r{i}");
        conn.request(get(&id, "/buffered")).await;
        match conn.frames_for(&id).await {
            Some(frames) if is_well_formed(&frames) => served += 1,
            _ => break,
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert!(served >= 3, "only {served} requests served before the timeout");

    let last_error = timeout(WAIT, degraded).await.unwrap().unwrap();
    assert!(last_error.is_some_and(|e| e.contains("Heartbeat")));

    let mut conn = cloud.accept_authenticated().await;
    conn.request(get("after", "/buffered")).await;
    assert!(conn.frames_for("after").await.is_some());

    sup.stop().await;
}

#[tokio::test]
async fn auth_rejection_is_logged_and_retried() {
    let mut cloud = FakeCloud::start().await;
    let local = FakeLocal::start().await;
    let sup = supervisor(&cloud, &local.url, |_| {});
    sup.start().unwrap();

    let mut rejected = cloud.accept().await;
    assert!(matches!(rejected.recv().await, Some(CloudMessage::Auth { .. })));
    rejected
        .send(&CloudMessage::AuthAck {
            ok: false,
            reason: Some("connector revoked".into()),
        })
        .await;

    let mut conn = cloud.accept_authenticated().await;
    let mut status = sup.subscribe();
    let running = timeout(WAIT, status.wait_for(|s| s.phase == SupervisorPhase::Running))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(running.connections, 1);
    assert!(
        running
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("connector revoked"))
    );

    conn.request(get("r1", "/buffered")).await;
    assert!(conn.frames_for("r1").await.is_some());

    sup.stop().await;
}

#[tokio::test]
async fn stop_closes_the_channel_gracefully() {
    let mut cloud = FakeCloud::start().await;
    let local = FakeLocal::start().await;
    let sup = supervisor(&cloud, &local.url, |_| {});
    sup.start().unwrap();

    let mut conn = cloud.accept_authenticated().await;
    conn.request(get("r1", "/hang")).await;
    let (_, header) = conn.recv().await.unwrap().into_response_frame().unwrap();
    assert!(matches!(header, ResponseFrame::Header { .. }));

    sup.stop().await;
    assert_eq!(conn.recv().await, None);
    assert!(sup.router().in_flight().is_empty());
    wait_until(|| local.open_connections() == 0).await;
}
