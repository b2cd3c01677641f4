//! Shared geometry and UI hierarchy types.
//!
//! This module defines the data structures shared by the wire codec, the
//! hierarchy resolver and the record/replay engine: screen points, reference
//! resolutions, and the UI hierarchy tree produced by a snapshot provider.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A point in device screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// A screen resolution in pixels.
///
/// Used both as the reference resolution a point was captured against and as
/// the resolution active at replay time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Size {
    pub width: u16,
    pub height: u16,
}

impl Size {
    pub fn new(width: u16, height: u16) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A point together with the resolution it was captured against.
///
/// Keeping both in one value means a point can never exist without the
/// reference resolution needed to rescale it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub point: Point,
    pub screen_size: Size,
}

impl Position {
    pub fn new(point: Point, screen_size: Size) -> Self {
        Self { point, screen_size }
    }

    /// Rescales the point from its reference resolution to `target`.
    ///
    /// Each coordinate is mapped with `round(v * target / reference)` and the
    /// screen size is rewritten to `target`. Returns `None` when the reference
    /// resolution has a zero dimension and cannot be scaled from.
    pub fn rescaled(&self, target: Size) -> Option<Position> {
        if self.screen_size.width == 0 || self.screen_size.height == 0 {
            return None;
        }
        let scale = |v: i32, to: u16, from: u16| -> i32 {
            let scaled = (f64::from(v) * f64::from(to) / f64::from(from)).round();
            scaled.clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32
        };
        Some(Position {
            point: Point {
                x: scale(self.point.x, target.width, self.screen_size.width),
                y: scale(self.point.y, target.height, self.screen_size.height),
            },
            screen_size: target,
        })
    }
}

/// An axis-aligned rectangle parsed from a uiautomator `bounds` attribute.
///
/// Both corners are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    /// Parses the `[x1,y1][x2,y2]` notation used by uiautomator dumps.
    ///
    /// Returns `None` for anything that does not match exactly.
    pub fn parse(raw: &str) -> Option<Bounds> {
        let rest = raw.trim().strip_prefix('[')?;
        let (first, rest) = rest.split_once("][")?;
        let second = rest.strip_suffix(']')?;
        let (left, top) = parse_pair(first)?;
        let (right, bottom) = parse_pair(second)?;
        Some(Bounds {
            left,
            top,
            right,
            bottom,
        })
    }

    pub fn contains(&self, point: Point) -> bool {
        self.left <= point.x && point.x <= self.right && self.top <= point.y && point.y <= self.bottom
    }
}

fn parse_pair(raw: &str) -> Option<(i32, i32)> {
    let (a, b) = raw.split_once(',')?;
    Some((parse_coordinate(a)?, parse_coordinate(b)?))
}

fn parse_coordinate(raw: &str) -> Option<i32> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

/// A node of a UI hierarchy snapshot.
///
/// Nodes are produced fresh for every resolution request and are never
/// cached: the on-device UI may have changed between two requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyNode {
    /// The element name as it appears in the snapshot (e.g. `node`).
    pub tag: String,

    /// Element attributes (`bounds`, `class`, `resource-id`, `text`, ...).
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    /// Child nodes in document order.
    #[serde(default)]
    pub children: Vec<HierarchyNode>,
}

impl HierarchyNode {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    /// Builder-style attribute setter, mostly for tests and fixtures.
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Builder-style child appender.
    pub fn with_child(mut self, child: HierarchyNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    /// Returns the attribute value only if it is present and non-empty.
    pub fn non_empty_attr(&self, name: &str) -> Option<&str> {
        self.attr(name).filter(|v| !v.is_empty())
    }

    /// The element type name: the `class` attribute when present, otherwise the tag.
    pub fn element_type(&self) -> Option<&str> {
        self.non_empty_attr("class")
            .or_else(|| Some(self.tag.as_str()).filter(|t| !t.is_empty()))
    }
}
