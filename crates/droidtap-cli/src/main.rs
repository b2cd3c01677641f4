//! CLI for droidtap: element inspection, taps and recording replay.
//!
//! # Usage
//!
//! ```bash
//! # Which element is at (540, 1200)?
//! droidtap inspect emulator-5554 540 1200
//!
//! # Tap through a running droidtap-server
//! droidtap tap 540 1200 --width 1080 --height 2340 \
//!     --url 'ws://127.0.0.1:8886/?action=proxy-adb&udid=emulator-5554&remote=tcp:8886'
//!
//! # Tap and save the enriched touch as a recording
//! droidtap tap 540 1200 --width 1080 --height 2340 --url ... --record taps.json
//!
//! # Replay a recording on a device with a different resolution
//! droidtap replay taps.json --width 1440 --height 3120 --url ...
//!
//! # JSON output
//! droidtap -f json inspect emulator-5554 540 1200
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use droidtap_core::config::DroidtapConfig;
use droidtap_core::device::{AdbSnapshotProvider, SnapshotProvider};
use droidtap_core::element::{Point, Position, Size};
use droidtap_core::hierarchy;
use droidtap_core::protocol::{ControlEvent, MotionAction, TouchEvent};
use droidtap_core::recording::{
    default_recording_path, load_recording, save_recording, RecordedEntry,
};
use droidtap_core::replay::ReplaySummary;
use droidtap_core::session::{ControlSession, SessionEvent};
use droidtap_core::tunnel::TunnelTarget;
use tracing_subscriber::EnvFilter;

/// CLI for inspecting, tapping and replaying Android touch input.
#[derive(Parser)]
#[command(name = "droidtap")]
#[command(about = "Inspect UI elements, tap and replay recordings on Android devices")]
#[command(version)]
struct Cli {
    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Path to the adb executable
    #[arg(long, env = "DROIDTAP_ADB")]
    adb: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Show the element at a screen point
    Inspect {
        /// Device serial
        udid: String,
        /// X coordinate
        x: i32,
        /// Y coordinate
        y: i32,
    },

    /// Tap at screen coordinates through a tunnel
    Tap {
        /// X coordinate
        x: i32,
        /// Y coordinate
        y: i32,
        /// Tunnel URL (a droidtap-server proxy-adb route)
        #[arg(short, long, env = "DROIDTAP_URL")]
        url: String,
        /// Screen width the coordinates refer to
        #[arg(long)]
        width: u16,
        /// Screen height the coordinates refer to
        #[arg(long)]
        height: u16,
        /// Record the tap, with element data, to FILE (default: a timestamped file)
        #[arg(long, value_name = "FILE", num_args = 0..=1)]
        record: Option<Option<PathBuf>>,
        /// How long to wait for element data when recording
        #[arg(long, default_value = "5000")]
        enrich_timeout_ms: u64,
    },

    /// Replay a recording through a tunnel
    Replay {
        /// Recording file
        file: PathBuf,
        /// Tunnel URL (a droidtap-server proxy-adb route)
        #[arg(short, long, env = "DROIDTAP_URL")]
        url: String,
        /// Current screen width
        #[arg(long)]
        width: u16,
        /// Current screen height
        #[arg(long)]
        height: u16,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

#[derive(Debug)]
enum CliError {
    Connection(String),
    ActionFailed(String),
    Protocol(String),
    InvalidInput(String),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::Connection(_) => ExitCode::from(2),
            CliError::ActionFailed(_) => ExitCode::from(1),
            CliError::Protocol(_) => ExitCode::from(3),
            CliError::InvalidInput(_) => ExitCode::from(4),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Connection(msg) => write!(f, "Connection error: {}", msg),
            CliError::ActionFailed(msg) => write!(f, "Action failed: {}", msg),
            CliError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            CliError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
        }
    }
}

/// Prints a `|time|action|target|duration|` status line unless quiet.
fn status_line(quiet: bool, action: &str, target: &str, elapsed: Duration) {
    if !quiet {
        let now = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3fZ");
        eprintln!("|{}|{}|{}|{}ms|", now, action, target, elapsed.as_millis());
    }
}

/// Extracts the device serial from a tunnel route URL.
fn udid_from_url(url: &str) -> Result<String, CliError> {
    let parsed = url::Url::parse(url).map_err(|e| CliError::InvalidInput(format!("{url}: {e}")))?;
    let route = match parsed.query() {
        Some(query) => format!("{}?{}", parsed.path(), query),
        None => parsed.path().to_string(),
    };
    TunnelTarget::from_uri(&route)
        .map(|target| target.udid)
        .map_err(|e| CliError::InvalidInput(format!("{url}: {e}")))
}

async fn connect(url: &str) -> Result<Arc<ControlSession>, CliError> {
    let udid = udid_from_url(url)?;
    ControlSession::connect(url, udid)
        .await
        .map_err(|e| CliError::Connection(format!("Failed to connect to {url}: {e}")))
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = DroidtapConfig::load();
    if let Some(adb) = &cli.adb {
        config.adb_path = adb.clone();
    }

    match cli.command {
        Command::Inspect { ref udid, x, y } => inspect(&cli, &config, udid, Point::new(x, y)).await,
        Command::Tap {
            x,
            y,
            ref url,
            width,
            height,
            ref record,
            enrich_timeout_ms,
        } => {
            let position = Position::new(Point::new(x, y), Size::new(width, height));
            let record = record
                .as_ref()
                .map(|path| path.clone().unwrap_or_else(default_recording_path));
            tap(&cli, url, position, record, Duration::from_millis(enrich_timeout_ms)).await
        }
        Command::Replay {
            ref file,
            ref url,
            width,
            height,
        } => replay(&cli, file, url, Size::new(width, height)).await,
    }
}

async fn inspect(cli: &Cli, config: &DroidtapConfig, udid: &str, point: Point) -> Result<(), CliError> {
    let started = std::time::Instant::now();
    let provider = AdbSnapshotProvider::from_config(config);
    let root = provider
        .snapshot(udid)
        .await
        .map_err(|e| CliError::ActionFailed(e.to_string()))?;
    let element = hierarchy::resolve(&root, point);
    status_line(cli.quiet, "inspect", &format!("{},{}", point.x, point.y), started.elapsed());

    match cli.format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&element)
                .map_err(|e| CliError::Protocol(e.to_string()))?;
            println!("{}", json);
        }
        OutputFormat::Text => match &element {
            Some(data) => {
                println!("{}", data.xpath);
                for (name, value) in &data.attributes {
                    if !value.is_empty() {
                        println!("  {}: {}", name, value);
                    }
                }
            }
            None => println!("No element at {},{}", point.x, point.y),
        },
    }
    if element.is_none() {
        return Err(CliError::ActionFailed(format!(
            "no element contains {},{}",
            point.x, point.y
        )));
    }
    Ok(())
}

/// Saves a recording; a failed write is an action failure, not bad input.
fn write_recording(path: &Path, entries: &[RecordedEntry]) -> Result<(), CliError> {
    save_recording(path, entries)
        .map_err(|e| CliError::ActionFailed(format!("could not save {}: {}", path.display(), e)))
}

async fn tap(
    cli: &Cli,
    url: &str,
    position: Position,
    record: Option<PathBuf>,
    enrich_timeout: Duration,
) -> Result<(), CliError> {
    let started = std::time::Instant::now();
    let session = connect(url).await?;
    let mut events = session.subscribe();
    if record.is_some() {
        session.start_recording().await;
    }

    for action in [MotionAction::Down, MotionAction::Up] {
        session
            .send_event(&ControlEvent::Touch(TouchEvent::new(action, 0, position)))
            .await
            .map_err(|e| CliError::Connection(e.to_string()))?;
    }
    status_line(
        cli.quiet,
        "tap",
        &format!("{},{}", position.point.x, position.point.y),
        started.elapsed(),
    );

    let mut xpath = None;
    if let Some(path) = &record {
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::ElementResolved { xpath, .. }) => return xpath,
                    Ok(SessionEvent::Disconnected { .. }) | Err(_) => return None,
                    Ok(_) => continue,
                }
            }
        };
        xpath = tokio::time::timeout(enrich_timeout, wait).await.ok().flatten();
        if xpath.is_none() {
            tracing::warn!("no element data arrived; saving the tap without it");
        }
        session.stop_recording().await;
        write_recording(path, &session.recorded_entries().await)?;
    }
    session.close().await;

    match cli.format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "x": position.point.x,
                "y": position.point.y,
                "xpath": xpath,
                "recording": record.as_ref().map(|p| p.display().to_string()),
            });
            println!("{}", output);
        }
        OutputFormat::Text => {
            if let Some(path) = &record {
                println!("Recorded to {}", path.display());
            }
            if let Some(xpath) = &xpath {
                println!("{}", xpath);
            }
        }
    }
    Ok(())
}

fn print_summary(format: OutputFormat, summary: &ReplaySummary) {
    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "dispatched": summary.dispatched,
                "executed": summary.executed,
                "skipped_malformed": summary.skipped_malformed,
                "skipped_locator": summary.skipped_locator,
                "failed": summary.failed,
                "cancelled": summary.cancelled,
            });
            println!("{}", output);
        }
        OutputFormat::Text => {
            println!(
                "Replayed {} events ({} malformed, {} element-targeted skipped, {} failed){}",
                summary.dispatched,
                summary.skipped_malformed,
                summary.skipped_locator,
                summary.failed,
                if summary.cancelled { ", cancelled" } else { "" }
            );
        }
    }
}

async fn replay(cli: &Cli, file: &Path, url: &str, resolution: Size) -> Result<(), CliError> {
    let entries = load_recording(file)
        .map_err(|e| CliError::InvalidInput(format!("{}: {}", file.display(), e)))?;
    let started = std::time::Instant::now();
    let session = connect(url).await?;

    let handle = session.replay(entries, resolution);
    let interrupt = handle.cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted; stopping replay");
            interrupt.cancel();
        }
    });
    let summary = handle.wait().await;
    session.close().await;
    status_line(cli.quiet, "replay", &file.display().to_string(), started.elapsed());

    let summary = summary.ok_or_else(|| CliError::ActionFailed("replay task aborted".into()))?;
    print_summary(cli.format, &summary);
    if summary.failed > 0 {
        return Err(CliError::ActionFailed(format!(
            "{} events could not be delivered",
            summary.failed
        )));
    }
    Ok(())
}
