//! WebSocket tunnel between operator clients and a device-resident service.
//!
//! [`TunnelServer`] accepts client WebSocket connections. Each handshake URI
//! names a device and a remote service (see [`TunnelTarget::from_uri`]); the
//! session then forwards that service to a local port and relays frames in
//! both directions.
//!
//! One reserved client request, `getElementData`, is never relayed: the
//! tunnel answers it itself from a fresh hierarchy snapshot.
//!
//! # Session Tasks
//!
//! ```text
//! client ──► client pump ──► device writer ──► device
//!               │
//!               └──► enrichment task (one per request) ──┐
//!                                                         ▼
//! client ◄── client writer ◄──────────────── device pump ◄── device
//! ```
//!
//! Writers are fed by bounded channels so a slow device write never stalls
//! device-to-client delivery. A [`CancellationToken`] ties the pumps
//! together; whichever side closes first tears the session down.
//!
//! # Close Codes
//!
//! | Situation                         | Code sent to client       |
//! |-----------------------------------|---------------------------|
//! | Device closes with a sendable `c` | `c`                       |
//! | Device closes with anything else  | 1011                      |
//! | Device closes without status      | 1000                      |
//! | Device connection error           | 1011                      |
//! | Device service cannot start       | 4005                      |
//! | Invalid route                     | 4003                      |
//! | Pending buffer exhausted          | 4008                      |

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::DroidtapConfig;
use crate::device::{AdbForwarder, AdbSnapshotProvider, PortForwarder, SnapshotProvider};
use crate::enrichment::{
    classify_client_text, resolve_element_data, ClientText, ElementDataRequest, ElementDataResult,
    TunnelMessage,
};

/// Route action served by the tunnel.
pub const PROXY_ADB_ACTION: &str = "proxy-adb";

/// Maximum close reason length allowed by RFC 6455.
pub const MAX_CLOSE_REASON: usize = 123;

pub const CLOSE_INVALID_ROUTE: u16 = 4003;
pub const CLOSE_SERVICE_START: u16 = 4005;
pub const CLOSE_RESOURCE_EXHAUSTED: u16 = 4008;

const CHANNEL_CAPACITY: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(2);

type DeviceStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors scoped to the tunnel server or to one session.
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The device endpoint could not be established.
    #[error("Failed to start service: {0}")]
    ServiceStart(String),

    #[error("pending frame buffer exhausted ({frames} frames, {bytes} bytes)")]
    ResourceExhausted { frames: usize, bytes: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl TunnelError {
    /// The close code a client receives when its session ends with this error.
    pub fn close_code(&self) -> u16 {
        match self {
            TunnelError::ServiceStart(_) => CLOSE_SERVICE_START,
            TunnelError::ResourceExhausted { .. } => CLOSE_RESOURCE_EXHAUSTED,
            TunnelError::Io(_) | TunnelError::WebSocket(_) => 1011,
        }
    }
}

/// Reasons a handshake URI is rejected. Both close the client with 4003.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("Invalid value for \"{name}\" parameter: \"{value}\"")]
    InvalidParameter { name: &'static str, value: String },

    #[error("Unsupported action")]
    UnsupportedAction,
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// The device service a client asked to be connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub udid: String,
    /// adb forward spec of the device-side service, e.g. `tcp:8886`.
    pub remote: String,
    /// Path requested on the device service; empty or starting with `/`.
    pub path: String,
}

impl TunnelTarget {
    /// Extracts the target from a handshake request URI.
    ///
    /// Accepts `/?action=proxy-adb&udid=..&remote=..&path=..` and the
    /// shortcut `/proxy-adb/<udid>/<remote>/<path...>`, whose segments are
    /// percent-decoded and whose path defaults to `/`.
    pub fn from_uri(uri: &str) -> Result<TunnelTarget, RouteError> {
        let url = url::Url::parse("ws://localhost/")
            .and_then(|base| base.join(uri))
            .map_err(|_| RouteError::UnsupportedAction)?;
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();

        let mut route = None;
        if query.get("action").map(String::as_str) == Some(PROXY_ADB_ACTION) {
            route = Some((
                query.get("udid").cloned().unwrap_or_default(),
                query.get("remote").cloned().unwrap_or_default(),
                query.get("path").cloned().unwrap_or_default(),
            ));
        }

        let segments: Vec<&str> = url.path().split('/').collect();
        if segments.len() >= 4 && segments[0].is_empty() && segments[1] == PROXY_ADB_ACTION {
            let path = segments[4..].join("/");
            route = Some((
                percent_decode(segments[2]),
                percent_decode(segments[3]),
                if path.is_empty() { "/".to_string() } else { path },
            ));
        }

        let (udid, remote, path) = route.ok_or(RouteError::UnsupportedAction)?;
        if remote.is_empty() {
            return Err(RouteError::InvalidParameter {
                name: "remote",
                value: remote,
            });
        }
        if udid.is_empty() {
            return Err(RouteError::InvalidParameter {
                name: "udid",
                value: udid,
            });
        }
        let path = if path.is_empty() || path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        Ok(TunnelTarget { udid, remote, path })
    }

    /// WebSocket URL of the forwarded device service.
    pub fn device_url(&self, port: u16) -> String {
        format!("ws://127.0.0.1:{port}{}", self.path)
    }
}

fn percent_decode(raw: &str) -> String {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

// ---------------------------------------------------------------------------
// Close handling
// ---------------------------------------------------------------------------

/// Returns `true` for codes an endpoint may put in a close frame.
pub fn is_sendable_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1013 | 3000..=4999)
}

/// Maps a close code received from one side to the code relayed to the other.
pub fn translate_close_code(code: u16) -> u16 {
    if is_sendable_close_code(code) {
        code
    } else {
        1011
    }
}

/// Truncates a close reason to the WebSocket limit on a char boundary.
pub fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

fn close_frame(code: u16, reason: &str) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: truncate_reason(reason).to_string().into(),
    }
}

/// The frame relayed after the peer closed with `frame`.
fn translate_close(frame: Option<CloseFrame<'_>>) -> CloseFrame<'static> {
    match frame {
        Some(frame) => close_frame(translate_close_code(u16::from(frame.code)), &frame.reason),
        None => close_frame(1000, ""),
    }
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(close_frame(code, reason)))
}

// ---------------------------------------------------------------------------
// Pending frames
// ---------------------------------------------------------------------------

/// Client frames received before the device endpoint is ready.
#[derive(Debug)]
struct PendingFrames {
    frames: VecDeque<Message>,
    bytes: usize,
    max_frames: usize,
    max_bytes: usize,
}

impl PendingFrames {
    fn new(config: &DroidtapConfig) -> Self {
        Self {
            frames: VecDeque::new(),
            bytes: 0,
            max_frames: config.max_pending_frames,
            max_bytes: config.max_pending_bytes,
        }
    }

    fn push(&mut self, message: Message) -> Result<(), TunnelError> {
        let bytes = self.bytes + message.len();
        let frames = self.frames.len() + 1;
        if frames > self.max_frames || bytes > self.max_bytes {
            return Err(TunnelError::ResourceExhausted { frames, bytes });
        }
        self.bytes = bytes;
        self.frames.push_back(message);
        Ok(())
    }

    fn into_frames(self) -> VecDeque<Message> {
        self.frames
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Collaborators shared by every tunnel session, built once at startup.
#[derive(Clone)]
pub struct TunnelContext {
    pub forwarder: Arc<dyn PortForwarder>,
    pub snapshots: Arc<dyn SnapshotProvider>,
    pub config: DroidtapConfig,
}

impl TunnelContext {
    pub fn new(
        forwarder: Arc<dyn PortForwarder>,
        snapshots: Arc<dyn SnapshotProvider>,
        config: DroidtapConfig,
    ) -> Self {
        Self {
            forwarder,
            snapshots,
            config,
        }
    }

    /// A context backed by the `adb` executable named in `config`.
    pub fn adb(config: DroidtapConfig) -> Self {
        Self::new(
            Arc::new(AdbForwarder::from_config(&config)),
            Arc::new(AdbSnapshotProvider::from_config(&config)),
            config,
        )
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Accepts client connections and runs one [`TunnelSession`] per connection.
pub struct TunnelServer {
    listener: TcpListener,
    context: Arc<TunnelContext>,
}

impl TunnelServer {
    pub async fn bind(addr: impl ToSocketAddrs, context: TunnelContext) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            context: Arc::new(context),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TunnelError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves connections until `shutdown` is cancelled.
    ///
    /// Cancelling `shutdown` also closes every open session with 1001.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), TunnelError> {
        info!(addr = %self.local_addr()?, "tunnel server listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let context = self.context.clone();
                        let token = shutdown.child_token();
                        tokio::spawn(
                            handle_connection(stream, context, token)
                                .instrument(info_span!("tunnel_client", %peer)),
                        );
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                },
            }
        }
        info!("tunnel server stopped");
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, context: Arc<TunnelContext>, shutdown: CancellationToken) {
    let mut request_uri = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        request_uri = Some(request.uri().to_string());
        Ok(response)
    };
    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let uri = request_uri.unwrap_or_default();
    match TunnelTarget::from_uri(&uri) {
        Ok(target) => {
            TunnelSession::accept(ws, target, context).run(shutdown).await;
        }
        Err(e) => {
            warn!(%uri, error = %e, "rejecting tunnel request");
            close_and_drain(ws, close_frame(CLOSE_INVALID_ROUTE, &e.to_string())).await;
        }
    }
}

async fn close_and_drain<S>(mut ws: WebSocketStream<S>, frame: CloseFrame<'static>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if ws.close(Some(frame)).await.is_err() {
        return;
    }
    let drain = async { while let Some(Ok(_)) = ws.next().await {} };
    let _ = tokio::time::timeout(CLOSE_GRACE, drain).await;
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// How the client pump treats one client frame.
enum ClientFrame {
    Intercept(Option<ElementDataRequest>),
    Forward(Message),
    Closed(Option<CloseFrame<'static>>),
    Ignore,
}

fn classify_frame(message: Message) -> ClientFrame {
    match message {
        Message::Text(text) => match classify_client_text(&text) {
            ClientText::Intercept(request) => ClientFrame::Intercept(request),
            ClientText::Forward => ClientFrame::Forward(Message::Text(text)),
        },
        message @ Message::Binary(_) => ClientFrame::Forward(message),
        Message::Close(frame) => ClientFrame::Closed(frame),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => ClientFrame::Ignore,
    }
}

/// One relayed client connection.
pub struct TunnelSession<S> {
    id: Uuid,
    client: WebSocketStream<S>,
    target: TunnelTarget,
    context: Arc<TunnelContext>,
}

impl<S> TunnelSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn accept(client: WebSocketStream<S>, target: TunnelTarget, context: Arc<TunnelContext>) -> Self {
        Self {
            id: Uuid::new_v4(),
            client,
            target,
            context,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Relays frames until either side closes or `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let span = info_span!(
            "tunnel_session",
            id = %self.id,
            udid = %self.target.udid,
            remote = %self.target.remote
        );
        self.relay(shutdown).instrument(span).await
    }

    async fn relay(self, shutdown: CancellationToken) {
        let TunnelSession {
            client,
            target,
            context,
            ..
        } = self;
        info!(path = %target.path, "tunnel session started");

        let cancel = shutdown.child_token();
        let (client_sink, mut client_stream) = client.split();
        let (client_tx, client_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
        tokio::spawn(write_frames(client_sink, VecDeque::new(), client_rx).in_current_span());

        // Phase 1: the device endpoint is being established.
        let mut pending = PendingFrames::new(&context.config);
        let connect = connect_device(&target, &context);
        tokio::pin!(connect);
        let device = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = client_tx.send(close_message(1001, "server shutting down")).await;
                    return;
                }
                result = &mut connect => match result {
                    Ok(device) => break device,
                    Err(e) => {
                        warn!(error = %e, "device service unavailable");
                        let _ = client_tx.send(close_message(e.close_code(), &e.to_string())).await;
                        return;
                    }
                },
                frame = client_stream.next() => match frame.map(|r| r.map(classify_frame)) {
                    Some(Ok(ClientFrame::Intercept(request))) => {
                        spawn_enrichment(request, &target, &context, client_tx.clone());
                    }
                    Some(Ok(ClientFrame::Forward(message))) => {
                        if let Err(e) = pending.push(message) {
                            warn!(error = %e, "client sent too much before device was ready");
                            let _ = client_tx.send(close_message(e.close_code(), &e.to_string())).await;
                            return;
                        }
                    }
                    Some(Ok(ClientFrame::Ignore)) => {}
                    Some(Ok(ClientFrame::Closed(_))) | Some(Err(_)) | None => {
                        debug!("client left before device was ready");
                        return;
                    }
                },
            }
        };

        // Phase 2: relay in both directions.
        info!(buffered = pending.frames.len(), "device service connected");
        let (device_sink, device_stream) = device.split();
        let (device_tx, device_rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);
        tokio::spawn(write_frames(device_sink, pending.into_frames(), device_rx).in_current_span());
        tokio::spawn(pump_device(device_stream, client_tx.clone(), cancel.clone()).in_current_span());

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = client_stream.next() => frame,
            };
            let close = match frame.map(|r| r.map(classify_frame)) {
                Some(Ok(ClientFrame::Intercept(request))) => {
                    spawn_enrichment(request, &target, &context, client_tx.clone());
                    continue;
                }
                Some(Ok(ClientFrame::Forward(message))) => {
                    if device_tx.send(message).await.is_err() {
                        cancel.cancel();
                        break;
                    }
                    continue;
                }
                Some(Ok(ClientFrame::Ignore)) => continue,
                Some(Ok(ClientFrame::Closed(frame))) => translate_close(frame),
                Some(Err(e)) => close_frame(1011, &e.to_string()),
                None => close_frame(1000, ""),
            };
            debug!(code = u16::from(close.code), "client closed; closing device");
            let _ = device_tx.send(Message::Close(Some(close))).await;
            cancel.cancel();
            break;
        }

        if shutdown.is_cancelled() {
            let _ = device_tx.send(close_message(1001, "server shutting down")).await;
            let _ = client_tx.send(close_message(1001, "server shutting down")).await;
        }
        info!("tunnel session ended");
    }
}

/// Forwards the device service and opens its WebSocket, within the configured timeout.
async fn connect_device(target: &TunnelTarget, context: &TunnelContext) -> Result<DeviceStream, TunnelError> {
    let limit = context.config.device_connect_timeout();
    let connect = async {
        let port = context
            .forwarder
            .forward(&target.udid, &target.remote)
            .await
            .map_err(|e| TunnelError::ServiceStart(e.to_string()))?;
        let url = target.device_url(port);
        debug!(%url, "connecting to device service");
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TunnelError::ServiceStart(e.to_string()))?;
        Ok(ws)
    };
    tokio::time::timeout(limit, connect)
        .await
        .map_err(|_| TunnelError::ServiceStart(format!("timed out after {limit:?}")))?
}

/// Relays device frames to the client until the device closes or `cancel` fires.
async fn pump_device(
    mut stream: SplitStream<DeviceStream>,
    client_tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = stream.next() => frame,
        };
        let close = match frame {
            Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                if client_tx.send(message).await.is_err() {
                    cancel.cancel();
                    return;
                }
                continue;
            }
            Some(Ok(Message::Close(frame))) => translate_close(frame),
            Some(Ok(_)) => continue,
            Some(Err(e)) => close_frame(1011, &e.to_string()),
            None => close_frame(1011, "device connection lost"),
        };
        debug!(code = u16::from(close.code), "device closed; closing client");
        let _ = client_tx.send(Message::Close(Some(close))).await;
        cancel.cancel();
        return;
    }
}

/// Writes `backlog` and then every queued message, stopping after a close frame.
async fn write_frames<W>(mut sink: W, backlog: VecDeque<Message>, mut rx: mpsc::Receiver<Message>)
where
    W: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    for message in backlog {
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "write failed while flushing backlog");
            return;
        }
    }
    while let Some(message) = rx.recv().await {
        let closing = message.is_close();
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "write failed");
            return;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Answers one intercepted request on its own task.
fn spawn_enrichment(
    request: Option<ElementDataRequest>,
    target: &TunnelTarget,
    context: &Arc<TunnelContext>,
    client_tx: mpsc::Sender<Message>,
) {
    let context = context.clone();
    let session_udid = target.udid.clone();
    tokio::spawn(
        async move {
            let result = match request {
                Some(mut request) => {
                    if request.udid.is_empty() {
                        request.udid = session_udid;
                    }
                    resolve_element_data(context.snapshots.as_ref(), &request).await
                }
                None => {
                    warn!("malformed getElementData request");
                    ElementDataResult::empty()
                }
            };
            let text = TunnelMessage::ElementDataResult(result).to_text();
            if client_tx.send(Message::Text(text)).await.is_err() {
                debug!("client gone before element data was ready");
            }
        }
        .in_current_span(),
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
