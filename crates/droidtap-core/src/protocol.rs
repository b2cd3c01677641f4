//! Binary control protocol spoken to the device-side input service.
//!
//! This module defines [`ControlEvent`], the control messages sent from the
//! operator to the device, together with their binary wire encoding and the
//! attribute-mapping (JSON) form used by recording documents.
//!
//! # Touch Layout (Big Endian, 28 bytes)
//!
//! ```text
//! [type u8][action u8][pointer_id u64][x i32][y i32][width u16][height u16][pressure u16][buttons u32]
//! ```
//!
//! `pressure` is packed as `round(pressure * 65535)`. Fields that are absent
//! when encoding are written as zero, except pressure which defaults to `1.0`.
//!
//! Every other event kind is currently encoded as its single type byte; richer
//! encodings can be added per kind without changing the touch layout.
//!
//! # Example
//!
//! ```
//! use droidtap_core::element::{Point, Position, Size};
//! use droidtap_core::protocol::{decode_event, encode_event, ControlEvent, MotionAction, TouchEvent};
//!
//! let touch = TouchEvent::new(
//!     MotionAction::Down,
//!     0,
//!     Position::new(Point::new(100, 200), Size::new(1080, 1920)),
//! );
//! let wire = encode_event(&ControlEvent::Touch(touch));
//! assert_eq!(wire.len(), 28);
//!
//! let decoded = decode_event(&wire).unwrap();
//! assert!(decoded.is_touch_down());
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::element::{Point, Position, Size};
use crate::hierarchy::ElementData;

/// Size in bytes of an encoded touch event.
pub const TOUCH_EVENT_LEN: usize = 28;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur while decoding control events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer or JSON document does not describe a valid event.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
}

impl ProtocolError {
    fn malformed(reason: impl Into<String>) -> Self {
        ProtocolError::MalformedMessage(reason.into())
    }
}

// ---------------------------------------------------------------------------
// EventKind
// ---------------------------------------------------------------------------

/// Numeric event-kind tags understood by the device-side service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    Keycode = 0,
    Text = 1,
    Touch = 2,
    Scroll = 3,
    BackOrScreenOn = 4,
    ExpandNotificationPanel = 5,
    ExpandSettingsPanel = 6,
    CollapsePanels = 7,
    GetClipboard = 8,
    SetClipboard = 9,
    SetScreenPowerMode = 10,
    RotateDevice = 11,
    ChangeStreamParameters = 101,
    PushFile = 102,
}

impl EventKind {
    /// Try to convert a raw type byte into an `EventKind`.
    pub fn from_u8(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0 => Ok(EventKind::Keycode),
            1 => Ok(EventKind::Text),
            2 => Ok(EventKind::Touch),
            3 => Ok(EventKind::Scroll),
            4 => Ok(EventKind::BackOrScreenOn),
            5 => Ok(EventKind::ExpandNotificationPanel),
            6 => Ok(EventKind::ExpandSettingsPanel),
            7 => Ok(EventKind::CollapsePanels),
            8 => Ok(EventKind::GetClipboard),
            9 => Ok(EventKind::SetClipboard),
            10 => Ok(EventKind::SetScreenPowerMode),
            11 => Ok(EventKind::RotateDevice),
            101 => Ok(EventKind::ChangeStreamParameters),
            102 => Ok(EventKind::PushFile),
            other => Err(ProtocolError::malformed(format!("unknown event type {other}"))),
        }
    }

    /// Returns a short, static name suitable for tracing fields.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Keycode => "keycode",
            EventKind::Text => "text",
            EventKind::Touch => "touch",
            EventKind::Scroll => "scroll",
            EventKind::BackOrScreenOn => "back_or_screen_on",
            EventKind::ExpandNotificationPanel => "expand_notification_panel",
            EventKind::ExpandSettingsPanel => "expand_settings_panel",
            EventKind::CollapsePanels => "collapse_panels",
            EventKind::GetClipboard => "get_clipboard",
            EventKind::SetClipboard => "set_clipboard",
            EventKind::SetScreenPowerMode => "set_screen_power_mode",
            EventKind::RotateDevice => "rotate_device",
            EventKind::ChangeStreamParameters => "change_stream_parameters",
            EventKind::PushFile => "push_file",
        }
    }

    /// Minimum number of bytes an encoded event of this kind occupies.
    pub fn min_len(&self) -> usize {
        match self {
            EventKind::Touch => TOUCH_EVENT_LEN,
            _ => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// MotionAction
// ---------------------------------------------------------------------------

/// Android `MotionEvent` action codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum MotionAction {
    Down = 0,
    Up = 1,
    Move = 2,
    Cancel = 3,
}

impl MotionAction {
    pub fn from_u8(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0 => Ok(MotionAction::Down),
            1 => Ok(MotionAction::Up),
            2 => Ok(MotionAction::Move),
            3 => Ok(MotionAction::Cancel),
            other => Err(ProtocolError::malformed(format!("unknown touch action {other}"))),
        }
    }
}

impl TryFrom<u8> for MotionAction {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        MotionAction::from_u8(value)
    }
}

impl From<MotionAction> for u8 {
    fn from(action: MotionAction) -> Self {
        action as u8
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A touch event, optionally enriched with the element it landed on.
///
/// Every field is optional so that partially-populated events (for example
/// hand-edited recordings) still encode; see the module docs for defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TouchEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<MotionAction>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer_id: Option<u64>,

    /// The touched point and the resolution it was captured against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,

    /// Normalized pressure in `0.0..=1.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressure: Option<f64>,

    /// Mouse button bitmask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buttons: Option<u32>,

    /// Element resolved for this touch, attached after enrichment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_data: Option<ElementData>,
}

impl TouchEvent {
    /// Creates a fully-populated touch with full pressure and no buttons.
    pub fn new(action: MotionAction, pointer_id: u64, position: Position) -> Self {
        Self {
            action: Some(action),
            pointer_id: Some(pointer_id),
            position: Some(position),
            pressure: Some(1.0),
            buttons: Some(0),
            element_data: None,
        }
    }

    /// The structural locator attached by enrichment, if any.
    pub fn locator(&self) -> Option<&str> {
        self.element_data
            .as_ref()
            .map(|data| data.xpath.as_str())
            .filter(|xpath| !xpath.is_empty())
    }
}

/// A control message sent from the operator to the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "EventMessage", into = "EventMessage")]
pub enum ControlEvent {
    /// A touch (pointer) event.
    Touch(TouchEvent),

    /// Any other event kind; carries no payload and encodes as its type byte.
    Bare(EventKind),
}

impl ControlEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ControlEvent::Touch(_) => EventKind::Touch,
            ControlEvent::Bare(kind) => *kind,
        }
    }

    pub fn as_touch(&self) -> Option<&TouchEvent> {
        match self {
            ControlEvent::Touch(touch) => Some(touch),
            ControlEvent::Bare(_) => None,
        }
    }

    pub fn as_touch_mut(&mut self) -> Option<&mut TouchEvent> {
        match self {
            ControlEvent::Touch(touch) => Some(touch),
            ControlEvent::Bare(_) => None,
        }
    }

    /// The position of a touch event, if it has one.
    pub fn position(&self) -> Option<Position> {
        self.as_touch().and_then(|touch| touch.position)
    }

    pub fn locator(&self) -> Option<&str> {
        self.as_touch().and_then(TouchEvent::locator)
    }

    /// Returns `true` for touch events whose action is [`MotionAction::Down`].
    pub fn is_touch_down(&self) -> bool {
        matches!(
            self.as_touch(),
            Some(TouchEvent {
                action: Some(MotionAction::Down),
                ..
            })
        )
    }
}

/// Attribute-mapping form of a [`ControlEvent`], as stored in recordings.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(flatten)]
    touch: TouchEvent,
}

impl TryFrom<EventMessage> for ControlEvent {
    type Error = ProtocolError;

    fn try_from(message: EventMessage) -> Result<Self, Self::Error> {
        match EventKind::from_u8(message.kind)? {
            EventKind::Touch => Ok(ControlEvent::Touch(message.touch)),
            other => Ok(ControlEvent::Bare(other)),
        }
    }
}

impl From<ControlEvent> for EventMessage {
    fn from(event: ControlEvent) -> Self {
        let kind = event.kind() as u8;
        match event {
            ControlEvent::Touch(touch) => EventMessage { kind, touch },
            ControlEvent::Bare(_) => EventMessage {
                kind,
                touch: TouchEvent::default(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// JSON message form
// ---------------------------------------------------------------------------

/// Converts an event into its recording-document attribute mapping.
pub fn event_to_message(event: &ControlEvent) -> serde_json::Value {
    serde_json::to_value(event).unwrap_or_else(|_| serde_json::json!({ "type": event.kind() as u8 }))
}

/// Parses an event from its recording-document attribute mapping.
pub fn event_from_message(message: &serde_json::Value) -> Result<ControlEvent, ProtocolError> {
    ControlEvent::deserialize(message).map_err(|e| ProtocolError::malformed(e.to_string()))
}

// ---------------------------------------------------------------------------
// Binary encoding
// ---------------------------------------------------------------------------

/// Packs a normalized pressure into its `u16` wire representation.
fn pack_pressure(pressure: f64) -> u16 {
    if pressure.is_nan() {
        return 0;
    }
    (pressure.clamp(0.0, 1.0) * f64::from(u16::MAX)).round() as u16
}

/// Encodes an event into the bytes sent to the device.
pub fn encode_event(event: &ControlEvent) -> Vec<u8> {
    match event {
        ControlEvent::Touch(touch) => {
            let mut buf = Vec::with_capacity(TOUCH_EVENT_LEN);
            let position = touch.position.unwrap_or(Position {
                point: Point { x: 0, y: 0 },
                screen_size: Size {
                    width: 0,
                    height: 0,
                },
            });
            buf.push(EventKind::Touch as u8);
            buf.push(touch.action.map_or(0, u8::from));
            buf.extend_from_slice(&touch.pointer_id.unwrap_or(0).to_be_bytes());
            buf.extend_from_slice(&position.point.x.to_be_bytes());
            buf.extend_from_slice(&position.point.y.to_be_bytes());
            buf.extend_from_slice(&position.screen_size.width.to_be_bytes());
            buf.extend_from_slice(&position.screen_size.height.to_be_bytes());
            buf.extend_from_slice(&pack_pressure(touch.pressure.unwrap_or(1.0)).to_be_bytes());
            buf.extend_from_slice(&touch.buttons.unwrap_or(0).to_be_bytes());
            buf
        }
        ControlEvent::Bare(kind) => vec![*kind as u8],
    }
}

/// A cursor over a byte slice for sequential big-endian reads.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let end = self.pos + N;
        let bytes: [u8; N] = self
            .data
            .get(self.pos..end)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| ProtocolError::malformed("insufficient data in buffer"))?;
        self.pos = end;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take::<1>()?[0])
    }

    fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.take()?))
    }

    fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.take()?))
    }

    fn read_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.take()?))
    }

    fn read_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_be_bytes(self.take()?))
    }
}

/// Decodes an event from its binary encoding.
///
/// Buffers shorter than the kind's minimum length are rejected before any
/// field is read, so a result is never partially populated.
pub fn decode_event(data: &[u8]) -> Result<ControlEvent, ProtocolError> {
    let mut cur = Cursor::new(data);
    let kind = EventKind::from_u8(cur.read_u8()?)?;
    if data.len() < kind.min_len() {
        return Err(ProtocolError::malformed(format!(
            "{} event needs {} bytes, got {}",
            kind.name(),
            kind.min_len(),
            data.len()
        )));
    }

    match kind {
        EventKind::Touch => {
            let action = MotionAction::from_u8(cur.read_u8()?)?;
            let pointer_id = cur.read_u64()?;
            let x = cur.read_i32()?;
            let y = cur.read_i32()?;
            let width = cur.read_u16()?;
            let height = cur.read_u16()?;
            let pressure = f64::from(cur.read_u16()?) / f64::from(u16::MAX);
            let buttons = cur.read_u32()?;
            Ok(ControlEvent::Touch(TouchEvent {
                action: Some(action),
                pointer_id: Some(pointer_id),
                position: Some(Position::new(Point::new(x, y), Size::new(width, height))),
                pressure: Some(pressure),
                buttons: Some(buttons),
                element_data: None,
            }))
        }
        other => Ok(ControlEvent::Bare(other)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
