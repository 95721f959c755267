//! Authenticated bidirectional channel to the cloud.
//!
//! A connected [`CloudChannel`] owns three tasks:
//! - a writer draining the outbound queue onto the socket in FIFO order,
//! - a reader turning cloud messages into [`InboundWork`],
//! - the heartbeat (see [`super::heartbeat`]).
//!
//! Any of them can end the channel; the first recorded failure is kept as
//! the reason and the channel's `closed` token is cancelled.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_core::ConnectorIdentity;
use tether_proto::message::salvage_request_id;
use tether_proto::{CloudMessage, RequestEnvelope, ResponseFrame};

use super::config::ChannelConfig;
use super::error::ChannelError;
use super::heartbeat::{Liveness, spawn_heartbeat};
use crate::local::error::error_chain;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) enum Outbound {
    Message(CloudMessage),
    /// Flush everything queued before this marker, then close the socket.
    Close,
}

/// Cloneable handle for queueing messages to the cloud.
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Outbound>,
}

impl FrameSink {
    pub(crate) const fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, message: CloudMessage) -> Result<(), ChannelError> {
        self.tx
            .send(Outbound::Message(message))
            .await
            .map_err(|_| ChannelError::Closed("outbound queue closed".into()))
    }

    /// Send one response frame tagged with `request_id`.
    pub async fn send_frame(
        &self,
        request_id: &str,
        frame: ResponseFrame,
    ) -> Result<(), ChannelError> {
        self.send(frame.into_message(request_id.to_string())).await
    }
}

/// Work delivered by the cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundWork {
    Request(RequestEnvelope),
    HealthCheck { request_id: String },
    /// A request that could not be decoded but whose id was recovered.
    Malformed { request_id: String, reason: String },
}

/// State shared between a channel and its tasks.
pub(crate) struct ChannelShared {
    pub(crate) closed: CancellationToken,
    failure: Mutex<Option<ChannelError>>,
}

impl ChannelShared {
    pub(crate) fn new() -> Self {
        Self {
            closed: CancellationToken::new(),
            failure: Mutex::new(None),
        }
    }

    /// Record `err` as the reason the channel ended (first one wins) and
    /// close the channel.
    pub(crate) fn fail(&self, err: ChannelError) {
        {
            let mut slot = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(err);
            }
        }
        self.closed.cancel();
    }

    pub(crate) fn failure(&self) -> Option<ChannelError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// One live, authenticated connection to the cloud.
pub struct CloudChannel {
    session_id: String,
    sink: FrameSink,
    inbound: mpsc::Receiver<InboundWork>,
    shared: Arc<ChannelShared>,
    writer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    flush_timeout: Duration,
}

impl CloudChannel {
    /// Identifier for this connection, for logs.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn sink(&self) -> FrameSink {
        self.sink.clone()
    }

    /// Next piece of inbound work; `None` once the channel is closed.
    pub async fn next_work(&mut self) -> Option<InboundWork> {
        tokio::select! {
            biased;
            work = self.inbound.recv() => work,
            () = self.shared.closed.cancelled() => None,
        }
    }

    /// Cancelled when the channel ends for any reason.
    pub fn closed_token(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Why the channel ended, if it ended on its own.
    pub fn failure(&self) -> Option<ChannelError> {
        self.shared.failure()
    }

    /// Close gracefully: frames queued so far are flushed (bounded by the
    /// flush timeout), then the socket is closed and all tasks stop.
    ///
    /// Returns the failure that ended the channel, if any.
    pub async fn shutdown(mut self) -> Option<ChannelError> {
        if !self.shared.closed.is_cancelled() {
            let sink = self.sink.clone();
            let flush = async move {
                let _ = sink.tx.send(Outbound::Close).await;
            };
            if timeout(self.flush_timeout, flush).await.is_err() {
                warn!(session_id = %self.session_id, "Outbound queue still full at close");
            }
        }
        if let Some(mut writer) = self.writer.take() {
            if timeout(self.flush_timeout, &mut writer).await.is_err() {
                warn!(session_id = %self.session_id, "Writer did not flush in time, aborting");
                writer.abort();
            }
        }
        self.shared.closed.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        debug!(session_id = %self.session_id, "Channel shut down");
        self.failure()
    }

    /// An in-memory channel and the peer that plays the cloud.
    pub fn loopback(capacity: usize) -> (Self, LoopbackPeer) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let shared = Arc::new(ChannelShared::new());
        let channel = Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            sink: FrameSink { tx: out_tx },
            inbound: in_rx,
            shared: Arc::clone(&shared),
            writer: None,
            tasks: Vec::new(),
            flush_timeout: Duration::from_secs(5),
        };
        let peer = LoopbackPeer {
            outbound: out_rx,
            inbound: Some(in_tx),
            shared,
        };
        (channel, peer)
    }
}

impl Drop for CloudChannel {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

/// Cloud side of [`CloudChannel::loopback`].
pub struct LoopbackPeer {
    outbound: mpsc::Receiver<Outbound>,
    inbound: Option<mpsc::Sender<InboundWork>>,
    shared: Arc<ChannelShared>,
}

impl LoopbackPeer {
    /// Deliver work to the connector. Returns `false` once the channel is gone.
    pub async fn send(&self, work: InboundWork) -> bool {
        match &self.inbound {
            Some(tx) => tx.send(work).await.is_ok(),
            None => false,
        }
    }

    pub async fn send_request(&self, envelope: RequestEnvelope) -> bool {
        self.send(InboundWork::Request(envelope)).await
    }

    /// Next message the connector sent; `None` after a graceful close or
    /// once the channel has ended and the queue is drained.
    pub async fn next_message(&mut self) -> Option<CloudMessage> {
        let item = tokio::select! {
            biased;
            item = self.outbound.recv() => item,
            () = self.shared.closed.cancelled() => self.outbound.try_recv().ok(),
        };
        match item {
            Some(Outbound::Message(message)) => Some(message),
            Some(Outbound::Close) | None => None,
        }
    }

    /// End the channel with `err` as the failure reason.
    pub fn fail(&self, err: ChannelError) {
        self.shared.fail(err);
    }

    /// Stop delivering work; the connector sees the inbound sequence end.
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

/// Opens cloud channels.
pub trait ChannelConnector: Send + Sync + 'static {
    fn connect(
        &self,
        identity: &ConnectorIdentity,
    ) -> impl Future<Output = Result<CloudChannel, ChannelError>> + Send;
}

/// Opens channels over WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    config: ChannelConfig,
}

impl WsConnector {
    pub const fn new(config: ChannelConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

impl ChannelConnector for WsConnector {
    async fn connect(&self, identity: &ConnectorIdentity) -> Result<CloudChannel, ChannelError> {
        let config = &self.config;
        let connecting = connect_async(config.cloud_url.as_str());
        let (mut ws, _response) = timeout(config.connect_timeout, connecting)
            .await
            .map_err(|_| {
                ChannelError::Connection(format!(
                    "connect to {} timed out after {:?}",
                    config.cloud_url, config.connect_timeout
                ))
            })?
            .map_err(|e| {
                debug!(error = ?e, "connection error details");
                ChannelError::Connection(format!("{e}: {}", error_chain(&e)))
            })?;

        let auth = tether_proto::auth::auth_message(
            &identity.connector_id,
            &identity.secret,
            unix_millis(),
        )
        .map_err(|e| ChannelError::Protocol(e.to_string()))?;
        send_ws(&mut ws, &auth).await?;

        timeout(config.auth_timeout, await_auth_ack(&mut ws))
            .await
            .map_err(|_| {
                ChannelError::Connection(format!(
                    "no auth_ack within {:?}",
                    config.auth_timeout
                ))
            })??;

        info!(connector_id = %identity.connector_id, "Authenticated with cloud");
        Ok(spawn_ws_channel(ws, config))
    }
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

fn message_text(message: &Message) -> Option<&str> {
    match message {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(data) => std::str::from_utf8(data).ok(),
        _ => None,
    }
}

async fn send_ws(ws: &mut WsStream, message: &CloudMessage) -> Result<(), ChannelError> {
    let text = message
        .encode()
        .map_err(|e| ChannelError::Protocol(e.to_string()))?;
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| ChannelError::Connection(format!("write failed: {e}")))
}

async fn await_auth_ack(ws: &mut WsStream) -> Result<(), ChannelError> {
    while let Some(message) = ws.next().await {
        let message =
            message.map_err(|e| ChannelError::Connection(format!("read failed: {e}")))?;
        if let Message::Close(frame) = &message {
            let reason = frame.as_ref().map_or_else(String::new, |f| f.reason.to_string());
            return Err(ChannelError::Connection(format!(
                "cloud closed the connection during handshake: {reason}"
            )));
        }
        let Some(text) = message_text(&message) else {
            continue;
        };
        match CloudMessage::decode(text) {
            Ok(CloudMessage::AuthAck { ok: true, .. }) => return Ok(()),
            Ok(CloudMessage::AuthAck { ok: false, reason }) => {
                return Err(ChannelError::Auth(
                    reason.unwrap_or_else(|| "credentials rejected".into()),
                ));
            }
            Ok(CloudMessage::Ping) => send_ws(ws, &CloudMessage::Pong).await?,
            Ok(other) => debug!(?other, "Ignoring message before auth_ack"),
            Err(e) => warn!(error = %e, "Undecodable message during handshake"),
        }
    }
    Err(ChannelError::Connection(
        "cloud closed the connection during handshake".into(),
    ))
}

fn spawn_ws_channel(ws: WsStream, config: &ChannelConfig) -> CloudChannel {
    let (ws_sink, ws_stream) = ws.split();
    let (out_tx, out_rx) = mpsc::channel(config.outbound_capacity);
    let (in_tx, in_rx) = mpsc::channel(config.inbound_capacity);
    let shared = Arc::new(ChannelShared::new());
    let liveness = Arc::new(Liveness::new());
    let sink = FrameSink { tx: out_tx };

    let writer = tokio::spawn(write_loop(ws_sink, out_rx, Arc::clone(&shared)));
    let reader = tokio::spawn(read_loop(
        ws_stream,
        in_tx,
        sink.clone(),
        Arc::clone(&shared),
        Arc::clone(&liveness),
    ));
    let heartbeat = spawn_heartbeat(
        sink.clone(),
        liveness,
        config.heartbeat_interval,
        config.heartbeat_timeout,
        Arc::clone(&shared),
    );

    CloudChannel {
        session_id: uuid::Uuid::new_v4().to_string(),
        sink,
        inbound: in_rx,
        shared,
        writer: Some(writer),
        tasks: vec![reader, heartbeat],
        flush_timeout: config.flush_timeout,
    }
}

async fn write_loop(
    mut ws_sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    shared: Arc<ChannelShared>,
) {
    loop {
        let next = tokio::select! {
            biased;
            next = outbound.recv() => next,
            () = shared.closed.cancelled() => break,
        };
        match next {
            Some(Outbound::Message(message)) => {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(error = %e, "Failed to encode outbound message");
                        continue;
                    }
                };
                if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                    shared.fail(ChannelError::Connection(format!("write failed: {e}")));
                    break;
                }
            }
            Some(Outbound::Close) | None => {
                let _ = ws_sink.close().await;
                break;
            }
        }
    }
}

async fn read_loop(
    mut ws_stream: SplitStream<WsStream>,
    inbound: mpsc::Sender<InboundWork>,
    sink: FrameSink,
    shared: Arc<ChannelShared>,
    liveness: Arc<Liveness>,
) {
    loop {
        let next = tokio::select! {
            () = shared.closed.cancelled() => break,
            next = ws_stream.next() => next,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                shared.fail(ChannelError::Connection(format!("read failed: {e}")));
                break;
            }
            None => {
                shared.fail(ChannelError::Closed("cloud closed the connection".into()));
                break;
            }
        };
        if let Message::Close(frame) = &message {
            let reason = frame
                .as_ref()
                .map_or_else(|| "no reason given".to_string(), |f| f.reason.to_string());
            shared.fail(ChannelError::Closed(format!("cloud sent close: {reason}")));
            break;
        }
        let Some(text) = message_text(&message) else {
            continue;
        };

        let work = match CloudMessage::decode(text) {
            Ok(CloudMessage::Pong) => {
                liveness.record_pong();
                continue;
            }
            Ok(CloudMessage::Ping) => {
                if sink.send(CloudMessage::Pong).await.is_err() {
                    break;
                }
                continue;
            }
            Ok(CloudMessage::Request(envelope)) => InboundWork::Request(envelope),
            Ok(CloudMessage::HealthCheck { request_id }) => InboundWork::HealthCheck { request_id },
            Ok(other) => {
                warn!(message = ?other, "Unexpected message from cloud");
                continue;
            }
            Err(e) => {
                if let Some(request_id) = salvage_request_id(text) {
                    InboundWork::Malformed {
                        request_id,
                        reason: e.to_string(),
                    }
                } else {
                    warn!(error = %e, "Dropping undecodable message from cloud");
                    continue;
                }
            }
        };

        tokio::select! {
            () = shared.closed.cancelled() => break,
            sent = inbound.send(work) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}
