//! Device-side collaborators of the tunnel: hierarchy snapshots and port forwarding.
//!
//! Both are traits so the tunnel and the enrichment path can run against
//! test doubles; [`AdbSnapshotProvider`] and [`AdbForwarder`] are the
//! production implementations and shell out to `adb`.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::DroidtapConfig;
use crate::element::HierarchyNode;
use crate::uiautomator::{self, ParseError};

/// Errors produced while taking a UI hierarchy snapshot.
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// The device or the dump tool could not be reached.
    #[error("snapshot unavailable: {0}")]
    Unavailable(String),

    #[error("snapshot timed out after {0:?}")]
    Timeout(Duration),

    /// The tool answered but its output is not a hierarchy.
    #[error("malformed snapshot: {0}")]
    Malformed(#[from] ParseError),
}

/// Errors produced while forwarding a device service to a local port.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("port forward failed: {0}")]
    CommandFailed(String),

    #[error("unexpected port forward output: {0:?}")]
    UnexpectedOutput(String),

    #[error("port forward timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Produces a fresh UI hierarchy snapshot for a device.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn snapshot(&self, udid: &str) -> Result<HierarchyNode, SnapshotError>;
}

/// Maps a device-resident service to a local TCP port.
///
/// `remote` is an adb forward spec such as `tcp:8886` or
/// `localabstract:scrcpy`.
#[async_trait]
pub trait PortForwarder: Send + Sync {
    async fn forward(&self, udid: &str, remote: &str) -> Result<u16, ForwardError>;
}

/// Runs `adb`, capturing its output, bounded by `limit`.
async fn run_adb(adb: &Path, args: &[&str], limit: Duration) -> Option<std::io::Result<Output>> {
    debug!(adb = %adb.display(), ?args, "running adb");
    let output = Command::new(adb).args(args).kill_on_drop(true).output();
    tokio::time::timeout(limit, output).await.ok()
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Snapshots via `adb -s <udid> exec-out uiautomator dump /dev/tty`.
#[derive(Debug, Clone)]
pub struct AdbSnapshotProvider {
    adb: PathBuf,
    timeout: Duration,
}

impl AdbSnapshotProvider {
    pub fn new(adb: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            adb: adb.into(),
            timeout,
        }
    }

    pub fn from_config(config: &DroidtapConfig) -> Self {
        Self::new(config.adb_path.clone(), config.snapshot_timeout())
    }
}

#[async_trait]
impl SnapshotProvider for AdbSnapshotProvider {
    async fn snapshot(&self, udid: &str) -> Result<HierarchyNode, SnapshotError> {
        let args = ["-s", udid, "exec-out", "uiautomator", "dump", "/dev/tty"];
        let output = run_adb(&self.adb, &args, self.timeout)
            .await
            .ok_or(SnapshotError::Timeout(self.timeout))?
            .map_err(|e| SnapshotError::Unavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(SnapshotError::Unavailable(stderr_text(&output)));
        }
        let xml = String::from_utf8_lossy(&output.stdout);
        Ok(uiautomator::parse_hierarchy(&xml)?)
    }
}

/// Forwards via `adb -s <udid> forward tcp:0 <remote>`.
#[derive(Debug, Clone)]
pub struct AdbForwarder {
    adb: PathBuf,
    timeout: Duration,
}

impl AdbForwarder {
    pub fn new(adb: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            adb: adb.into(),
            timeout,
        }
    }

    pub fn from_config(config: &DroidtapConfig) -> Self {
        Self::new(config.adb_path.clone(), config.device_connect_timeout())
    }
}

/// Parses the port adb prints after allocating `tcp:0`.
fn parse_forward_output(stdout: &str) -> Result<u16, ForwardError> {
    let trimmed = stdout.trim();
    trimmed
        .parse::<u16>()
        .ok()
        .filter(|port| *port != 0)
        .ok_or_else(|| ForwardError::UnexpectedOutput(trimmed.to_string()))
}

#[async_trait]
impl PortForwarder for AdbForwarder {
    async fn forward(&self, udid: &str, remote: &str) -> Result<u16, ForwardError> {
        let args = ["-s", udid, "forward", "tcp:0", remote];
        let output = run_adb(&self.adb, &args, self.timeout)
            .await
            .ok_or(ForwardError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(ForwardError::CommandFailed(stderr_text(&output)));
        }
        let port = parse_forward_output(&String::from_utf8_lossy(&output.stdout))?;
        debug!(udid, remote, port, "forwarded device service");
        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_allocated_port() {
        assert_eq!(parse_forward_output("38211\n").unwrap(), 38211);
    }

    #[test]
    fn rejects_non_port_output() {
        assert!(matches!(
            parse_forward_output("error: device offline"),
            Err(ForwardError::UnexpectedOutput(_))
        ));
        assert!(parse_forward_output("0").is_err());
        assert!(parse_forward_output("").is_err());
    }

    #[test]
    fn error_display() {
        let err = SnapshotError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "snapshot timed out after 1.5s");
        let err = ForwardError::CommandFailed("no devices/emulators found".into());
        assert_eq!(err.to_string(), "port forward failed: no devices/emulators found");
    }

    #[tokio::test]
    async fn missing_adb_is_unavailable() {
        let provider = AdbSnapshotProvider::new("/nonexistent/droidtap-adb", Duration::from_secs(5));
        let err = provider.snapshot("emulator-5554").await.unwrap_err();
        assert!(matches!(err, SnapshotError::Unavailable(_)));
    }

    #[tokio::test]
    async fn missing_adb_fails_forward() {
        let forwarder = AdbForwarder::new("/nonexistent/droidtap-adb", Duration::from_secs(5));
        let err = forwarder.forward("emulator-5554", "tcp:8886").await.unwrap_err();
        assert!(matches!(err, ForwardError::Io(_)));
    }
}
