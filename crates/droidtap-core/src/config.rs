//! Persistent configuration for droidtap.
//!
//! Stores user settings in `~/.droidtap/config.json`. Every field has a
//! default, so a missing or partial file is never an error.
//!
//! # Example
//!
//! ```no_run
//! use droidtap_core::config::DroidtapConfig;
//!
//! // Load (returns defaults if file doesn't exist)
//! let config = DroidtapConfig::load();
//! println!("tunnel listens on {}", config.listen_addr);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const CONFIG_FILENAME: &str = "config.json";

/// Environment variable that relocates the droidtap state directory.
pub const HOME_ENV: &str = "DROIDTAP_HOME";

/// Returns the droidtap state directory, creating it if needed.
///
/// Defaults to `~/.droidtap`; `DROIDTAP_HOME` overrides it.
pub fn droidtap_dir() -> PathBuf {
    let dir = std::env::var_os(HOME_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(".droidtap")
        });
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Directory for server log files.
pub fn logs_dir() -> PathBuf {
    let dir = droidtap_dir().join("logs");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Directory for saved recordings.
pub fn recordings_dir() -> PathBuf {
    let dir = droidtap_dir().join("recordings");
    std::fs::create_dir_all(&dir).ok();
    dir
}

/// Persistent droidtap configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DroidtapConfig {
    /// Path or name of the `adb` executable.
    pub adb_path: PathBuf,

    /// Address the tunnel server binds to.
    pub listen_addr: String,

    /// Upper bound for port forwarding plus the device WebSocket handshake.
    pub device_connect_timeout_ms: u64,

    /// Upper bound for one hierarchy snapshot.
    pub snapshot_timeout_ms: u64,

    /// Bytes of client frames buffered while the device connects.
    pub max_pending_bytes: usize,

    /// Number of client frames buffered while the device connects.
    pub max_pending_frames: usize,
}

impl Default for DroidtapConfig {
    fn default() -> Self {
        Self {
            adb_path: PathBuf::from("adb"),
            listen_addr: "127.0.0.1:8886".to_string(),
            device_connect_timeout_ms: 10_000,
            snapshot_timeout_ms: 15_000,
            max_pending_bytes: 4 * 1024 * 1024,
            max_pending_frames: 1024,
        }
    }
}

impl DroidtapConfig {
    /// Load config from `~/.droidtap/config.json`.
    ///
    /// Returns [`Default`] if the file does not exist or cannot be parsed.
    pub fn load() -> Self {
        let path = droidtap_dir().join(CONFIG_FILENAME);
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Save config to `~/.droidtap/config.json`.
    pub fn save(&self) -> std::io::Result<()> {
        let path = droidtap_dir().join(CONFIG_FILENAME);
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    pub fn device_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.device_connect_timeout_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DroidtapConfig::default();
        assert_eq!(config.adb_path, PathBuf::from("adb"));
        assert_eq!(config.device_connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.snapshot_timeout(), Duration::from_secs(15));
        assert_eq!(config.max_pending_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn roundtrip_serialization() {
        let config = DroidtapConfig {
            adb_path: PathBuf::from("/opt/android/platform-tools/adb"),
            max_pending_frames: 8,
            ..DroidtapConfig::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let loaded: DroidtapConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let config: DroidtapConfig =
            serde_json::from_str(r#"{"snapshot_timeout_ms": 500}"#).unwrap();
        assert_eq!(config.snapshot_timeout_ms, 500);
        assert_eq!(config.max_pending_frames, 1024);
    }

    #[test]
    fn deserialize_ignores_unknown_fields() {
        let config: DroidtapConfig =
            serde_json::from_str(r#"{"future_field": true}"#).unwrap();
        assert_eq!(config, DroidtapConfig::default());
    }
}
