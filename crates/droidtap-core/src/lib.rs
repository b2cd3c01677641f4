//! # droidtap-core
//!
//! Core library for driving an Android device's touchscreen through a
//! WebSocket tunnel, with element-aware recording and resolution-independent
//! replay.
//!
//! Touch events travel as a fixed-layout binary message. While recording,
//! every touch-down also asks the tunnel which UI element lies under the
//! finger; the tunnel answers from a fresh `uiautomator` snapshot and the
//! answer is attached to the recorded touch as a structural locator.
//!
//! ## Modules
//!
//! - [`protocol`] - Binary control event codec and the recording message form
//! - [`element`] - Points, resolutions, bounds and the UI hierarchy tree
//! - [`hierarchy`] - Deepest-element lookup and locator synthesis
//! - [`uiautomator`] - Reader for `uiautomator dump` XML
//! - [`device`] - Snapshot and port-forward providers (traits plus `adb` implementations)
//! - [`tunnel`] - WebSocket relay server with `getElementData` interception
//! - [`enrichment`] - Enrichment request handling and result correlation
//! - [`recording`] - Recorder and recording documents
//! - [`replay`] - Timed, rescaled replay of recordings
//! - [`session`] - Client-side control session over the tunnel
//! - [`config`] - Persistent configuration and state directories
//!
//! ## External Dependencies
//!
//! The `adb` providers require Android platform-tools on `PATH` (or the path
//! configured in `~/.droidtap/config.json`).
//!
//! ## Example
//!
//! ```no_run
//! use droidtap_core::device::{AdbSnapshotProvider, SnapshotProvider};
//! use droidtap_core::element::Point;
//! use droidtap_core::hierarchy;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = AdbSnapshotProvider::new("adb", Duration::from_secs(15));
//! let root = provider.snapshot("emulator-5554").await?;
//!
//! if let Some(element) = hierarchy::resolve(&root, Point::new(540, 1200)) {
//!     println!("{}", element.xpath);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod element;
pub mod enrichment;
pub mod hierarchy;
pub mod protocol;
pub mod recording;
pub mod replay;
pub mod session;
pub mod tunnel;
pub mod uiautomator;
