//! Shared test helpers for droidtap-core integration tests.
//!
//! Provides a mock device-side WebSocket service, a scripted port forwarder,
//! a canned snapshot provider and helpers to run a tunnel server on an
//! ephemeral port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use droidtap_core::config::DroidtapConfig;
use droidtap_core::device::{ForwardError, PortForwarder, SnapshotError, SnapshotProvider};
use droidtap_core::element::HierarchyNode;
use droidtap_core::tunnel::{TunnelContext, TunnelServer};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Mock device service
// ---------------------------------------------------------------------------

/// A device-side WebSocket service that accepts one connection.
///
/// Every frame it receives is pushed to `received`; frames sent on `commands`
/// are written to the tunnel (a close frame closes the connection).
pub struct MockDevice {
    pub addr: SocketAddr,
    pub received: mpsc::UnboundedReceiver<Message>,
    pub commands: mpsc::UnboundedSender<Message>,
}

impl MockDevice {
    pub async fn start() -> MockDevice {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (commands, mut commands_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            loop {
                tokio::select! {
                    frame = ws.next() => match frame {
                        Some(Ok(message)) => {
                            let _ = received_tx.send(message);
                        }
                        _ => break,
                    },
                    Some(command) = commands_rx.recv() => {
                        if ws.send(command).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        MockDevice {
            addr,
            received,
            commands,
        }
    }

    /// Next frame received from the tunnel, or `None` on timeout.
    pub async fn next_frame(&mut self) -> Option<Message> {
        tokio::time::timeout(WAIT, self.received.recv()).await.ok().flatten()
    }

    pub fn send(&self, message: Message) {
        self.commands.send(message).unwrap();
    }

    pub fn close_with(&self, code: u16, reason: &str) {
        self.send(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        })));
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Forwarder that answers with a fixed port (or error) after an optional delay.
pub struct ScriptedForwarder {
    pub outcome: Result<u16, String>,
    pub delay: Duration,
    pub calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedForwarder {
    pub fn to_port(port: u16) -> Arc<Self> {
        Arc::new(Self {
            outcome: Ok(port),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn delayed(port: u16, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            outcome: Ok(port),
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            outcome: Err(message.to_string()),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl PortForwarder for ScriptedForwarder {
    async fn forward(&self, udid: &str, remote: &str) -> Result<u16, ForwardError> {
        self.calls
            .lock()
            .unwrap()
            .push((udid.to_string(), remote.to_string()));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.outcome
            .clone()
            .map_err(ForwardError::CommandFailed)
    }
}

/// Snapshot provider returning a fixed tree, or `Unavailable` when empty.
pub struct CannedSnapshots {
    pub root: Option<HierarchyNode>,
    pub requests: Mutex<Vec<String>>,
}

impl CannedSnapshots {
    pub fn with(root: HierarchyNode) -> Arc<Self> {
        Arc::new(Self {
            root: Some(root),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            root: None,
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl SnapshotProvider for CannedSnapshots {
    async fn snapshot(&self, udid: &str) -> Result<HierarchyNode, SnapshotError> {
        self.requests.lock().unwrap().push(udid.to_string());
        self.root
            .clone()
            .ok_or_else(|| SnapshotError::Unavailable("device offline".into()))
    }
}

/// A 720x1280 screen with a single OK button at `[0,0][100,100]`.
pub fn sample_hierarchy() -> HierarchyNode {
    HierarchyNode::new("hierarchy").with_child(
        HierarchyNode::new("node")
            .with_attr("bounds", "[0,0][720,1280]")
            .with_attr("class", "android.widget.FrameLayout")
            .with_attr("index", "0")
            .with_child(
                HierarchyNode::new("node")
                    .with_attr("bounds", "[0,0][100,100]")
                    .with_attr("class", "android.widget.Button")
                    .with_attr("resource-id", "com.example:id/ok")
                    .with_attr("text", "OK")
                    .with_attr("index", "0"),
            ),
    )
}

// ---------------------------------------------------------------------------
// Tunnel helpers
// ---------------------------------------------------------------------------

/// Starts a tunnel server on an ephemeral port.
pub async fn start_tunnel(
    forwarder: Arc<dyn PortForwarder>,
    snapshots: Arc<dyn SnapshotProvider>,
    config: DroidtapConfig,
) -> (SocketAddr, CancellationToken) {
    let context = TunnelContext::new(forwarder, snapshots, config);
    let server = TunnelServer::bind("127.0.0.1:0", context).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));
    (addr, shutdown)
}

/// Route URL for `udid` and `remote` on a tunnel at `addr`.
pub fn route_url(addr: SocketAddr, udid: &str) -> String {
    format!("ws://{addr}/?action=proxy-adb&udid={udid}&remote=tcp:8886&path=/")
}

pub async fn connect_client(url: &str) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

/// Reads frames until a data frame arrives, or `None` on close/timeout.
pub async fn next_data(client: &mut Client) -> Option<Message> {
    let read = async {
        loop {
            match client.next().await {
                Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => return Some(message),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    };
    tokio::time::timeout(WAIT, read).await.ok().flatten()
}

/// Reads frames until the close frame and returns its code and reason.
pub async fn next_close(client: &mut Client) -> Option<(u16, String)> {
    let read = async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(Some(frame)))) => {
                    return Some((u16::from(frame.code), frame.reason.into_owned()))
                }
                Some(Ok(Message::Close(None))) => return Some((1005, String::new())),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    };
    tokio::time::timeout(WAIT, read).await.ok().flatten()
}
