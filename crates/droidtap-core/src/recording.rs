//! Recording of control events and the recording document format.
//!
//! A recording is a JSON array of `{"message": {...}, "time": <ms>}` objects
//! in playback order. `message` is the attribute-mapping form of a
//! [`ControlEvent`] and `time` is the offset from the start of the recording.
//!
//! # Example
//!
//! ```no_run
//! use droidtap_core::recording::{load_recording, Recorder};
//!
//! # async fn example() -> std::io::Result<()> {
//! let mut recorder = Recorder::new("emulator-5554");
//! recorder.start().await;
//! // ... record events ...
//! let entries = recorder.stop().await;
//! println!("recorded {} events", entries.len());
//!
//! let stored = load_recording("taps.json")?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::recordings_dir;
use crate::enrichment::{ElementDataRequest, EnrichmentCorrelator};
use crate::protocol::{self, ControlEvent, ProtocolError};

/// One recorded event and its offset from the start of the recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEntry {
    #[serde(rename = "message")]
    pub event: ControlEvent,

    #[serde(rename = "time")]
    pub offset_millis: u64,
}

/// A recording entry as read from disk, with its message not yet decoded.
///
/// Keeping the message as raw JSON lets a document with a few bad entries
/// load; those entries are skipped individually at replay time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub message: serde_json::Value,

    #[serde(default)]
    pub time: u64,
}

impl StoredEntry {
    pub fn decode(&self) -> Result<RecordedEntry, ProtocolError> {
        Ok(RecordedEntry {
            event: protocol::event_from_message(&self.message)?,
            offset_millis: self.time,
        })
    }
}

impl From<&RecordedEntry> for StoredEntry {
    fn from(entry: &RecordedEntry) -> Self {
        StoredEntry {
            message: protocol::event_to_message(&entry.event),
            time: entry.offset_millis,
        }
    }
}

impl From<RecordedEntry> for StoredEntry {
    fn from(entry: RecordedEntry) -> Self {
        StoredEntry::from(&entry)
    }
}

/// Captures outgoing events with their offsets from the start of recording.
///
/// The recorder is either idle or recording. Entries survive `stop()` until
/// the next `start()`, so enrichment results that arrive late still reach
/// them through the [`EnrichmentCorrelator`].
#[derive(Debug)]
pub struct Recorder {
    udid: String,
    entries: Arc<RwLock<Vec<RecordedEntry>>>,
    started_at: Option<Instant>,
}

impl Recorder {
    pub fn new(udid: impl Into<String>) -> Self {
        Self {
            udid: udid.into(),
            entries: Arc::new(RwLock::new(Vec::new())),
            started_at: None,
        }
    }

    /// A correlator attached to this recorder's entries.
    pub fn correlator(&self) -> EnrichmentCorrelator {
        EnrichmentCorrelator::new(self.entries.clone())
    }

    pub fn is_recording(&self) -> bool {
        self.started_at.is_some()
    }

    /// Clears previous entries and starts the clock.
    pub async fn start(&mut self) {
        self.entries.write().await.clear();
        self.started_at = Some(Instant::now());
        info!(udid = %self.udid, "recording started");
    }

    /// Records `event` if recording.
    ///
    /// For a touch-down carrying a position, returns the enrichment request
    /// the caller should send. Recording while idle is a no-op.
    pub async fn record(&self, event: &ControlEvent) -> Option<ElementDataRequest> {
        let started_at = self.started_at?;
        let offset_millis = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);

        let position = event.position().filter(|_| event.is_touch_down());
        match position {
            Some(position) => {
                self.correlator()
                    .on_touch_down(event.clone(), offset_millis)
                    .await;
                debug!(offset_millis, x = position.point.x, y = position.point.y, "recorded touch down");
                Some(ElementDataRequest {
                    udid: self.udid.clone(),
                    point: position.point,
                    screen_size: position.screen_size,
                })
            }
            None => {
                self.entries.write().await.push(RecordedEntry {
                    event: event.clone(),
                    offset_millis,
                });
                None
            }
        }
    }

    /// Stops recording and returns a copy of the entries.
    pub async fn stop(&mut self) -> Vec<RecordedEntry> {
        self.started_at = None;
        let entries = self.entries().await;
        info!(udid = %self.udid, count = entries.len(), "recording stopped");
        entries
    }

    /// A copy of the current entries, including any enrichment attached so far.
    pub async fn entries(&self) -> Vec<RecordedEntry> {
        self.entries.read().await.clone()
    }
}

/// Writes `entries` as a pretty-printed recording document.
pub fn save_recording(path: impl AsRef<Path>, entries: &[RecordedEntry]) -> std::io::Result<()> {
    let stored: Vec<StoredEntry> = entries.iter().map(StoredEntry::from).collect();
    let json = serde_json::to_string_pretty(&stored).map_err(std::io::Error::other)?;
    std::fs::write(path, json)
}

/// Reads a recording document without decoding the messages.
pub fn load_recording(path: impl AsRef<Path>) -> std::io::Result<Vec<StoredEntry>> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// A fresh, timestamped file path under the recordings directory.
pub fn default_recording_path() -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    recordings_dir().join(format!("recording-{stamp}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::{Point, Position, Size};
    use crate::protocol::{EventKind, MotionAction, TouchEvent};
    use std::time::Duration;

    fn touch(action: MotionAction, x: i32, y: i32) -> ControlEvent {
        ControlEvent::Touch(TouchEvent::new(
            action,
            0,
            Position::new(Point::new(x, y), Size::new(1080, 1920)),
        ))
    }

    #[tokio::test]
    async fn idle_recorder_ignores_events() {
        let recorder = Recorder::new("dev");
        assert!(recorder.record(&touch(MotionAction::Down, 1, 1)).await.is_none());
        assert!(recorder.entries().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn records_offsets_and_requests_enrichment_on_down() {
        let mut recorder = Recorder::new("dev");
        recorder.start().await;

        let request = recorder.record(&touch(MotionAction::Down, 100, 200)).await;
        assert_eq!(
            request,
            Some(ElementDataRequest {
                udid: "dev".into(),
                point: Point::new(100, 200),
                screen_size: Size::new(1080, 1920),
            })
        );

        tokio::time::advance(Duration::from_millis(120)).await;
        assert!(recorder.record(&touch(MotionAction::Up, 100, 200)).await.is_none());
        assert!(recorder
            .record(&ControlEvent::Bare(EventKind::BackOrScreenOn))
            .await
            .is_none());

        let entries = recorder.stop().await;
        assert!(!recorder.is_recording());
        let offsets: Vec<u64> = entries.iter().map(|e| e.offset_millis).collect();
        assert_eq!(offsets, vec![0, 120, 120]);
    }

    #[tokio::test]
    async fn start_clears_previous_entries() {
        let mut recorder = Recorder::new("dev");
        recorder.start().await;
        recorder.record(&touch(MotionAction::Up, 1, 1)).await;
        recorder.stop().await;

        recorder.start().await;
        assert!(recorder.entries().await.is_empty());
    }

    #[test]
    fn entry_document_form() {
        let entry = RecordedEntry {
            event: touch(MotionAction::Down, 5, 6),
            offset_millis: 250,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["time"], 250);
        assert_eq!(json["message"]["type"], 2);
        assert_eq!(json["message"]["position"]["point"]["x"], 5);

        let stored = StoredEntry::from(&entry);
        assert_eq!(stored.decode().unwrap(), entry);
    }

    #[test]
    fn malformed_message_survives_load_but_fails_decode() {
        let stored: Vec<StoredEntry> = serde_json::from_str(
            r#"[{"message":{"type":250},"time":0},{"message":{"type":4},"time":10}]"#,
        )
        .unwrap();
        assert!(stored[0].decode().is_err());
        assert_eq!(
            stored[1].decode().unwrap().event,
            ControlEvent::Bare(EventKind::BackOrScreenOn)
        );
    }
}
