//! Element enrichment: the reserved `getElementData` request and its correlation.
//!
//! The request path runs inside the tunnel: an intercepted request is turned
//! into a snapshot, resolved against the touched point and answered with an
//! [`ElementDataResult`] that echoes the request's point and screen size.
//!
//! The correlation path runs on the client: because the response carries no
//! request id, it is matched back to a recorded touch by value, scanning the
//! recorded entries in order for the first touch whose point and screen size
//! equal the echoed ones.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn, Instrument};

use crate::device::SnapshotProvider;
use crate::element::{Point, Size};
use crate::hierarchy::{self, ElementData};
use crate::protocol::ControlEvent;
use crate::recording::RecordedEntry;

/// Message type of the reserved enrichment request.
pub const GET_ELEMENT_DATA: &str = "getElementData";

/// Message type of the enrichment response.
pub const ELEMENT_DATA_RESULT: &str = "elementDataResult";

/// Asks the tunnel which element lies under `point` on device `udid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDataRequest {
    #[serde(default)]
    pub udid: String,
    pub point: Point,
    pub screen_size: Size,
}

/// The tunnel's answer to an [`ElementDataRequest`].
///
/// `element_data` is `null` when nothing matched or the snapshot failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementDataResult {
    pub element_data: Option<ElementData>,
    #[serde(default)]
    pub original_point: Option<Point>,
    #[serde(default)]
    pub original_screen_size: Option<Size>,
}

impl ElementDataResult {
    /// A result with no element and no echoed inputs.
    pub fn empty() -> Self {
        Self {
            element_data: None,
            original_point: None,
            original_screen_size: None,
        }
    }
}

/// JSON text frames exchanged over the tunnel alongside the binary stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TunnelMessage {
    #[serde(rename = "getElementData")]
    GetElementData(ElementDataRequest),

    #[serde(rename = "elementDataResult")]
    ElementDataResult(ElementDataResult),
}

impl TunnelMessage {
    /// Serializes the message into a text frame payload.
    pub fn to_text(&self) -> String {
        // Both variants hold plain data; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parses a text frame, returning `None` for anything else.
    pub fn parse(text: &str) -> Option<TunnelMessage> {
        serde_json::from_str(text).ok()
    }
}

/// How the tunnel treats a text frame coming from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientText {
    /// A reserved request. `None` when its payload could not be parsed; it is
    /// still answered, with an empty result.
    Intercept(Option<ElementDataRequest>),

    /// Any other text, relayed to the device unchanged.
    Forward,
}

/// Classifies a client text frame.
///
/// Only JSON objects with `type == "getElementData"` and a `data` member are
/// intercepted.
pub fn classify_client_text(text: &str) -> ClientText {
    let Ok(serde_json::Value::Object(mut object)) = serde_json::from_str(text) else {
        return ClientText::Forward;
    };
    if object.get("type").and_then(|t| t.as_str()) != Some(GET_ELEMENT_DATA) {
        return ClientText::Forward;
    }
    match object.remove("data") {
        None | Some(serde_json::Value::Null) => ClientText::Forward,
        Some(data) => ClientText::Intercept(serde_json::from_value(data).ok()),
    }
}

/// Answers an enrichment request from a fresh snapshot.
///
/// Snapshot failures are logged and reported as `elementData: null`.
pub async fn resolve_element_data(
    provider: &dyn SnapshotProvider,
    request: &ElementDataRequest,
) -> ElementDataResult {
    let span = tracing::debug_span!(
        "resolve_element_data",
        udid = %request.udid,
        x = request.point.x,
        y = request.point.y
    );
    async {
        let element_data = match provider.snapshot(&request.udid).await {
            Ok(root) => hierarchy::resolve(&root, request.point),
            Err(e) => {
                warn!(error = %e, "hierarchy snapshot failed");
                None
            }
        };
        debug!(found = element_data.is_some(), "element resolution finished");
        ElementDataResult {
            element_data,
            original_point: Some(request.point),
            original_screen_size: Some(request.screen_size),
        }
    }
    .instrument(span)
    .await
}

/// Index of an entry in a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub usize);

/// Attaches enrichment results to recorded touch entries.
///
/// Shares the entry list with the [`Recorder`](crate::recording::Recorder)
/// that owns it; every append and every scan-and-mutate holds the write lock.
#[derive(Debug, Clone)]
pub struct EnrichmentCorrelator {
    entries: Arc<RwLock<Vec<RecordedEntry>>>,
}

impl EnrichmentCorrelator {
    pub fn new(entries: Arc<RwLock<Vec<RecordedEntry>>>) -> Self {
        Self { entries }
    }

    /// Appends a touch-down entry awaiting enrichment.
    pub async fn on_touch_down(&self, event: ControlEvent, offset_millis: u64) -> EntryId {
        let mut entries = self.entries.write().await;
        entries.push(RecordedEntry {
            event,
            offset_millis,
        });
        EntryId(entries.len() - 1)
    }

    /// Attaches `result` to the first touch entry recorded at the echoed
    /// point and screen size.
    ///
    /// Returns the matched entry, or `None` on a correlation miss. A match
    /// whose result carries no element leaves the entry unmodified.
    pub async fn on_enrichment_result(&self, result: &ElementDataResult) -> Option<EntryId> {
        let (Some(point), Some(screen_size)) = (result.original_point, result.original_screen_size)
        else {
            warn!("enrichment result without echoed position; cannot correlate");
            return None;
        };

        let mut entries = self.entries.write().await;
        let found = entries.iter_mut().enumerate().find(|(_, entry)| {
            entry
                .event
                .position()
                .is_some_and(|p| p.point == point && p.screen_size == screen_size)
        });

        let Some((index, entry)) = found else {
            warn!(
                x = point.x,
                y = point.y,
                screen = %screen_size,
                "correlation miss: no recorded touch at this position"
            );
            return None;
        };

        if let (Some(data), Some(touch)) = (&result.element_data, entry.event.as_touch_mut()) {
            debug!(index, xpath = %data.xpath, "attached element data");
            touch.element_data = Some(data.clone());
        }
        Some(EntryId(index))
    }
}
