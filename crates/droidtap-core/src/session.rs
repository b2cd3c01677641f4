//! Client side of the device tunnel.
//!
//! A [`ControlSession`] owns one WebSocket connection to the tunnel server.
//! Outgoing events are encoded and written by a dedicated writer task; a
//! reader task dispatches `elementDataResult` frames to the recorder's
//! correlator. Lifecycle changes are published as [`SessionEvent`]s on a
//! broadcast channel.
//!
//! # Example
//!
//! ```no_run
//! use droidtap_core::element::{Point, Position, Size};
//! use droidtap_core::protocol::{ControlEvent, MotionAction, TouchEvent};
//! use droidtap_core::session::ControlSession;
//!
//! # async fn example() -> Result<(), droidtap_core::session::SessionError> {
//! let session = ControlSession::connect(
//!     "ws://127.0.0.1:8886/?action=proxy-adb&udid=emulator-5554&remote=tcp:8886",
//!     "emulator-5554",
//! )
//! .await?;
//!
//! session.start_recording().await;
//! let position = Position::new(Point::new(100, 200), Size::new(1080, 1920));
//! session
//!     .send_event(&ControlEvent::Touch(TouchEvent::new(MotionAction::Down, 0, position)))
//!     .await?;
//! let entries = session.stop_recording().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::element::Size;
use crate::enrichment::{EnrichmentCorrelator, EntryId, TunnelMessage};
use crate::protocol::{encode_event, ControlEvent};
use crate::recording::{RecordedEntry, Recorder, StoredEntry};
use crate::replay::{DispatchError, EventSink, ReplayHandle, Replayer, ResolutionProvider};

const OUTGOING_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 64;
/// How long `close` waits for queued frames to reach the socket.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors raised by the client session.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid tunnel URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("failed to connect to tunnel: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("session is closed")]
    Closed,
}

/// Lifecycle notifications published by a [`ControlSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    RecordingStarted,
    RecordingStopped { entries: usize },
    /// An enrichment result was matched to a recorded entry.
    ElementResolved { entry: EntryId, xpath: Option<String> },
    /// The tunnel connection ended.
    Disconnected { code: Option<u16>, reason: String },
}

/// One client connection to the tunnel server.
pub struct ControlSession {
    id: Uuid,
    udid: String,
    outgoing: mpsc::Sender<Message>,
    recorder: Mutex<Recorder>,
    event_tx: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl ControlSession {
    /// Connects to a tunnel endpoint and spawns the session's reader and writer.
    pub async fn connect(url: &str, udid: impl Into<String>) -> Result<Arc<Self>, SessionError> {
        let url = url::Url::parse(url)?;
        let (ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let id = Uuid::new_v4();
        let udid = udid.into();
        let recorder = Recorder::new(udid.clone());
        let correlator = recorder.correlator();
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(OUTGOING_CAPACITY);
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();
        let span = tracing::info_span!("control_session", %id, %udid);
        info!(parent: &span, url = %url, "connected to tunnel");

        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(
            async move {
                loop {
                    // Queued frames drain before a disconnect stops the writer.
                    let message = tokio::select! {
                        biased;
                        message = outgoing_rx.recv() => message,
                        _ = writer_cancel.cancelled() => None,
                    };
                    let Some(message) = message else {
                        break;
                    };
                    let closing = message.is_close();
                    if let Err(e) = sink.send(message).await {
                        debug!(error = %e, "tunnel write failed");
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                let _ = sink.close().await;
            }
            .instrument(span.clone()),
        );

        let reader_events = event_tx.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(
            async move {
                let (code, reason) = loop {
                    let frame = tokio::select! {
                        _ = reader_cancel.cancelled() => break (None, "session closed".to_string()),
                        frame = stream.next() => frame,
                    };
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            handle_text(&text, &correlator, &reader_events).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            break match frame {
                                Some(f) => (Some(u16::from(f.code)), f.reason.into_owned()),
                                None => (None, String::new()),
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break (None, e.to_string()),
                        None => break (None, String::new()),
                    }
                };
                info!(?code, %reason, "tunnel disconnected");
                reader_cancel.cancel();
                let _ = reader_events.send(SessionEvent::Disconnected { code, reason });
            }
            .instrument(span),
        );

        Ok(Arc::new(Self {
            id,
            udid,
            outgoing,
            recorder: Mutex::new(recorder),
            event_tx,
            cancel,
            writer: Mutex::new(Some(writer)),
        }))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }

    /// Subscribes to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn send_message(&self, message: Message) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Closed);
        }
        self.outgoing
            .send(message)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Sends an event without recording it.
    pub async fn send_raw(&self, event: &ControlEvent) -> Result<(), SessionError> {
        self.send_message(Message::Binary(encode_event(event))).await
    }

    /// Sends an event, recording it when recording is on.
    ///
    /// A recorded touch-down is followed by an enrichment request.
    pub async fn send_event(&self, event: &ControlEvent) -> Result<(), SessionError> {
        self.send_raw(event).await?;
        let request = self.recorder.lock().await.record(event).await;
        if let Some(request) = request {
            let text = TunnelMessage::GetElementData(request).to_text();
            self.send_message(Message::Text(text)).await?;
        }
        Ok(())
    }

    pub async fn start_recording(&self) {
        self.recorder.lock().await.start().await;
        let _ = self.event_tx.send(SessionEvent::RecordingStarted);
    }

    /// Stops recording and returns what was recorded.
    pub async fn stop_recording(&self) -> Vec<RecordedEntry> {
        let entries = self.recorder.lock().await.stop().await;
        let _ = self.event_tx.send(SessionEvent::RecordingStopped {
            entries: entries.len(),
        });
        entries
    }

    pub async fn is_recording(&self) -> bool {
        self.recorder.lock().await.is_recording()
    }

    /// Current recorded entries, including enrichment attached after `stop`.
    pub async fn recorded_entries(&self) -> Vec<RecordedEntry> {
        self.recorder.lock().await.entries().await
    }

    /// Replays `entries` over this session's send path without recording them.
    pub fn replay(
        self: &Arc<Self>,
        entries: Vec<StoredEntry>,
        resolution: Size,
    ) -> ReplayHandle {
        self.replay_with(entries, Arc::new(resolution))
    }

    /// Like [`replay`](Self::replay) with a custom resolution source.
    pub fn replay_with(
        self: &Arc<Self>,
        entries: Vec<StoredEntry>,
        resolution: Arc<dyn ResolutionProvider>,
    ) -> ReplayHandle {
        let sink: Arc<dyn EventSink> = self.clone();
        Replayer::new(sink, resolution).spawn(entries)
    }

    /// Closes the connection with a normal close frame.
    ///
    /// Returns once every frame queued before the call has been written, or
    /// after a short timeout.
    pub async fn close(&self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        let _ = self.send_message(Message::Close(Some(frame))).await;

        let Some(writer) = self.writer.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer).await {
            Ok(_) => debug!("tunnel writer flushed"),
            Err(_) => warn!("tunnel writer did not flush before close timeout"),
        }
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl EventSink for ControlSession {
    async fn dispatch(&self, event: &ControlEvent) -> Result<(), DispatchError> {
        self.send_raw(event)
            .await
            .map_err(|e| DispatchError(e.to_string()))
    }
}

async fn handle_text(
    text: &str,
    correlator: &EnrichmentCorrelator,
    events: &broadcast::Sender<SessionEvent>,
) {
    match TunnelMessage::parse(text) {
        Some(TunnelMessage::ElementDataResult(result)) => {
            if let Some(entry) = correlator.on_enrichment_result(&result).await {
                let xpath = result.element_data.map(|data| data.xpath);
                let _ = events.send(SessionEvent::ElementResolved { entry, xpath });
            }
        }
        Some(TunnelMessage::GetElementData(_)) => {
            warn!("unexpected getElementData request from tunnel");
        }
        None => debug!(len = text.len(), "ignoring text frame"),
    }
}
